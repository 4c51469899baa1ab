//! The coding-agent collaborator seam.
//!
//! The orchestration loop treats the agent as an opaque external process:
//! it hands over a [`SessionContext`], waits for the invocation to finish,
//! and interprets the returned [`AgentReport`]. Everything about *how* the
//! agent reasons is out of scope; only the report contract matters here.

pub mod process;

pub use process::ProcessAgent;

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AgentError;
use crate::session::{Feature, Session};

/// Everything the agent receives for one invocation.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    /// Reference to the specification driving the session.
    pub spec: String,
    /// Current feature checklist, in order.
    pub features: Vec<Feature>,
    /// Rendered knowledge block from the resolver; empty when no snippets
    /// apply.
    pub knowledge: String,
}

impl SessionContext {
    pub fn new(session: &Session, knowledge: String) -> Self {
        Self {
            session_id: session.id,
            spec: session.spec.clone(),
            features: session.features.clone(),
            knowledge,
        }
    }

    /// Render the context as the prompt handed to a process-based agent.
    pub fn render_prompt(&self) -> String {
        let checklist: Vec<String> = self
            .features
            .iter()
            .map(|f| {
                format!(
                    "- [{}] {}",
                    if f.passes { "x" } else { " " },
                    f.description
                )
            })
            .collect();

        format!(
            r#"You are working on an autonomous coding session.

## SPECIFICATION
{spec}

{knowledge}## FEATURES
{checklist}

## REPORT
When you finish this invocation, print a single JSON line:
{{"features_passed": [...], "features_discovered": [...], "outcome": "more_work" | "done" | "fatal", "cause": "..."}}
List feature descriptions verbatim. Use "fatal" with a cause only for
unrecoverable conditions.
"#,
            spec = self.spec,
            knowledge = if self.knowledge.is_empty() {
                String::new()
            } else {
                format!("{}\n", self.knowledge)
            },
            checklist = checklist.join("\n"),
        )
    }
}

/// How an invocation ended, from the agent's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "cause", rename_all = "snake_case")]
pub enum AgentOutcome {
    /// Progress was made (or attempted); invoke again.
    MoreWork,
    /// The agent believes the checklist is finished.
    Done,
    /// Unrecoverable condition; the cause string is preserved on the
    /// session record.
    Fatal(String),
}

/// A feature the agent attempted but could not make pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFailure {
    pub description: String,
    pub detail: String,
}

/// The agent's reported outcome for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReport {
    /// Features newly passing, by verbatim description.
    #[serde(default)]
    pub features_passed: Vec<String>,
    /// Features attempted and failed, with detail.
    #[serde(default)]
    pub features_failed: Vec<FeatureFailure>,
    /// Work discovered during execution, appended to the checklist as
    /// pending features.
    #[serde(default)]
    pub features_discovered: Vec<String>,
    #[serde(flatten)]
    pub outcome: AgentOutcome,
}

impl AgentReport {
    pub fn more_work(features_passed: Vec<String>) -> Self {
        Self {
            features_passed,
            features_failed: Vec::new(),
            features_discovered: Vec::new(),
            outcome: AgentOutcome::MoreWork,
        }
    }

    pub fn done(features_passed: Vec<String>) -> Self {
        Self {
            features_passed,
            features_failed: Vec::new(),
            features_discovered: Vec::new(),
            outcome: AgentOutcome::Done,
        }
    }

    pub fn fatal(cause: impl Into<String>) -> Self {
        Self {
            features_passed: Vec::new(),
            features_failed: Vec::new(),
            features_discovered: Vec::new(),
            outcome: AgentOutcome::Fatal(cause.into()),
        }
    }
}

/// External coding agent invoked once per orchestration iteration.
///
/// An invocation is a blocking, long-running call from the loop's
/// perspective and is never interrupted mid-flight.
#[async_trait]
pub trait CodingAgent: Send + Sync {
    async fn run(&self, ctx: &SessionContext) -> Result<AgentReport, AgentError>;
}

/// Replays a prepared queue of reports. Used by tests and dry runs.
#[derive(Default)]
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Result<AgentReport, AgentError>>>,
    invocations: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(reports: impl IntoIterator<Item = AgentReport>) -> Self {
        Self {
            script: Mutex::new(reports.into_iter().map(Ok).collect()),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Queue an infrastructure failure instead of a report.
    pub fn push_error(&self, err: AgentError) {
        self.script
            .lock()
            .expect("scripted agent lock poisoned")
            .push_back(Err(err));
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CodingAgent for ScriptedAgent {
    async fn run(&self, _ctx: &SessionContext) -> Result<AgentReport, AgentError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("scripted agent lock poisoned")
            .pop_front()
            .unwrap_or(Err(AgentError::MissingReport))
    }
}
