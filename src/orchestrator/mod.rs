//! The orchestration loop: drives one session from claim to terminal
//! state.
//!
//! Each driven session gets its own tokio task running
//! [`SessionRunner::drive`]. The loop's safe checkpoint is *between*
//! agent invocations: an in-flight invocation is opaque and never
//! preempted, so pause/stop requests take effect only after its result
//! has been applied.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::agent::{CodingAgent, SessionContext};
use crate::errors::SessionError;
use crate::knowledge::KnowledgeResolver;
use crate::knowledge::resolver::context_block;
use crate::session::machine::StateMachine;
use crate::session::store::SessionStore;
use crate::session::{Session, SessionStatus};

/// Tunables for one runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum agent invocations per drive before the session is parked
    /// in `error`.
    pub max_iterations: u32,
    /// How often a parked runner re-reads the store while paused.
    pub pause_poll: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 32,
            pause_poll: Duration::from_millis(200),
        }
    }
}

/// Drives sessions end-to-end: resolve knowledge, invoke the agent,
/// apply the report through the state machine, repeat.
#[derive(Clone)]
pub struct SessionRunner {
    store: Arc<SessionStore>,
    machine: Arc<StateMachine>,
    resolver: KnowledgeResolver,
    agent: Arc<dyn CodingAgent>,
    config: RunnerConfig,
}

impl SessionRunner {
    pub fn new(
        store: Arc<SessionStore>,
        machine: Arc<StateMachine>,
        resolver: KnowledgeResolver,
        agent: Arc<dyn CodingAgent>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            machine,
            resolver,
            agent,
            config,
        }
    }

    /// Drive the session to a terminal state and return its final
    /// snapshot.
    ///
    /// The initial claim auto-advances `created → active` and refuses a
    /// session some other runner already holds. Agent failures become the
    /// session's `error` state; store failures are re-raised, since the
    /// loop must not proceed on unreliable persistence.
    pub async fn drive(&self, id: Uuid) -> Result<Session, SessionError> {
        let mut session = self.machine.claim(id).await?;
        tracing::info!(id = %id, features = session.total_features(), "session claimed");

        let mut iterations: u32 = 0;
        loop {
            // Safe checkpoint: honor any control request that arrived
            // while no invocation was in flight.
            session = self.machine.checkpoint(id).await?;

            if session.status.is_terminal() {
                tracing::info!(id = %id, status = %session.status, "session reached terminal state");
                return Ok(session);
            }
            if session.status == SessionStatus::Paused {
                tokio::time::sleep(self.config.pause_poll).await;
                session = self.store.get(id).await?;
                continue;
            }

            if iterations >= self.config.max_iterations {
                tracing::warn!(id = %id, iterations, "iteration budget exhausted");
                return self
                    .machine
                    .fail(
                        id,
                        format!(
                            "iteration budget of {} exhausted without completion",
                            self.config.max_iterations
                        ),
                    )
                    .await;
            }
            iterations += 1;

            let knowledge = match self.resolver.resolve() {
                Ok(resolved) => context_block(&resolved),
                Err(err) => {
                    tracing::error!(id = %id, error = %err, "knowledge resolution failed");
                    return self.machine.fail(id, err.to_string()).await;
                }
            };

            let ctx = SessionContext::new(&session, knowledge);
            tracing::debug!(id = %id, iteration = iterations, "invoking agent");
            let report = match self.agent.run(&ctx).await {
                Ok(report) => report,
                Err(err) => {
                    tracing::error!(id = %id, error = %err, "agent invocation failed");
                    return self.machine.fail(id, err.to_string()).await;
                }
            };

            // The invocation's result always lands before any pending
            // pause/stop is honored.
            session = self.machine.apply_report(id, &report).await?;
            tracing::debug!(
                id = %id,
                status = %session.status,
                progress = format!("{}/{}", session.completed_features(), session.total_features()),
                "report applied"
            );
        }
    }
}
