//! Session domain model.
//!
//! A [`Session`] is one long-running autonomous coding run: an ordered
//! feature checklist, a lifecycle status, and opaque references to external
//! collaborators (work item, branch). Sessions are owned by the
//! [`store::SessionStore`] and mutated only through
//! [`machine::StateMachine`] transitions.

pub mod machine;
pub mod store;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a session.
///
/// Legal transitions: `created → active → {paused, stopped, completed,
/// error}` and `paused → {active, stopped}`. `stopped`, `completed` and
/// `error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Paused,
    Stopped,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// An action a caller (or the loop) can request against a session.
/// Used for transition validation and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionAction {
    Claim,
    Pause,
    Resume,
    Stop,
    Report,
    Complete,
    Fail,
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Report => "apply a report to",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for SessionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pause/stop request recorded on the session and honored by the
/// orchestration loop at its next checkpoint, between agent invocations;
/// an in-flight invocation is never interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Pause,
    Stop,
}

/// A unit of work tracked within a session.
///
/// Features are appended at creation or discovered by the agent during
/// execution; they are never removed, preserving an auditable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub description: String,
    pub passes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Feature {
    pub fn pending(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            passes: false,
            failure: None,
        }
    }
}

/// One entry in a session's persisted status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: SessionStatus,
    pub at: DateTime<Utc>,
}

/// A single autonomous coding session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// Reference to the specification driving this session.
    pub spec: String,
    pub features: Vec<Feature>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic revision, bumped on every persisted mutation. Doubles as
    /// the progress event sequence number, so event ordering survives
    /// restarts.
    #[serde(default)]
    pub revision: u64,
    /// Pending pause/stop request awaiting the loop's next checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlRequest>,
    /// Human-readable cause, set when the session reaches `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque external work-item reference; persisted for sync processes,
    /// never called out to from the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_item: Option<String>,
    /// Source-control branch reference, same contract as `work_item`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub history: Vec<StatusChange>,
}

impl Session {
    pub fn new(spec: impl Into<String>, features: Vec<Feature>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            spec: spec.into(),
            features,
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
            revision: 0,
            control: None,
            error: None,
            work_item: None,
            branch: None,
            history: vec![StatusChange {
                status: SessionStatus::Created,
                at: now,
            }],
        }
    }

    /// Count of passing features. Always derived by scanning the list;
    /// there is no independently mutable counter to drift.
    pub fn completed_features(&self) -> usize {
        self.features.iter().filter(|f| f.passes).count()
    }

    pub fn total_features(&self) -> usize {
        self.features.len()
    }

    pub fn all_features_pass(&self) -> bool {
        !self.features.is_empty() && self.features.iter().all(|f| f.passes)
    }

    /// Record a status change, appending to the persisted history.
    /// Only the state machine calls this.
    pub(crate) fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.history.push(StatusChange {
            status,
            at: Utc::now(),
        });
    }
}
