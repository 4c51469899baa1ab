//! Typed error hierarchy for the conductor core.
//!
//! Four top-level enums cover the four subsystems:
//! - `SessionError` — lifecycle and state-machine failures
//! - `StoreError` — session persistence failures
//! - `KnowledgeError` — knowledge tier enumeration and lookup failures
//! - `AgentError` — external agent collaborator failures

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::knowledge::Tier;
use crate::session::{SessionAction, SessionStatus};

/// Errors from the session lifecycle subsystem.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested action is not legal from the session's current state.
    /// Always rejected before any mutation.
    #[error("Cannot {action} a {from} session")]
    InvalidTransition {
        from: SessionStatus,
        action: SessionAction,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the session persistence layer.
///
/// Store failures are non-retryable for the step that hit them: the
/// orchestration loop surfaces them upward rather than guessing at
/// session state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session {id} not found")]
    NotFound { id: Uuid },

    #[error("Session store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session record at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the knowledge subsystem.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// A tier's backing store failed to enumerate. A *missing* tier is
    /// treated as empty and never produces this error.
    #[error("Knowledge tier {tier} failed to enumerate: {source}")]
    TierUnavailable {
        tier: Tier,
        #[source]
        source: std::io::Error,
    },

    #[error("Snippet '{name}' not found in tier {tier}")]
    SnippetNotFound { tier: Tier, name: String },

    #[error("Snippet file {path} has malformed front matter: {source}")]
    BadFrontMatter {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors from invoking the external coding agent.
///
/// These cover infrastructure failures of the collaborator itself; a fatal
/// *outcome* reported by a healthy agent run travels through
/// [`crate::agent::AgentOutcome::Fatal`] instead. Either way the
/// orchestration loop converts the failure into the session's `error`
/// state, preserving the cause string.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Agent exited with non-zero code {code}")]
    NonZeroExit { code: i32 },

    #[error("Agent produced no parseable report")]
    MissingReport,

    #[error("Agent report is malformed: {source}")]
    MalformedReport {
        #[source]
        source: serde_json::Error,
    },

    #[error("Agent I/O failure: {0}")]
    Io(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_state_and_action() {
        let err = SessionError::InvalidTransition {
            from: SessionStatus::Stopped,
            action: SessionAction::Resume,
        };
        assert_eq!(err.to_string(), "Cannot resume a stopped session");
    }

    #[test]
    fn store_not_found_carries_id() {
        let id = Uuid::new_v4();
        let err = StoreError::NotFound { id };
        match &err {
            StoreError::NotFound { id: found } => assert_eq!(*found, id),
            _ => panic!("Expected NotFound variant"),
        }
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn session_error_converts_from_store_error() {
        let id = Uuid::new_v4();
        let err: SessionError = StoreError::NotFound { id }.into();
        assert!(matches!(
            err,
            SessionError::Store(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn tier_unavailable_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = KnowledgeError::TierUnavailable {
            tier: Tier::Org,
            source: io_err,
        };
        match &err {
            KnowledgeError::TierUnavailable { tier, source } => {
                assert_eq!(*tier, Tier::Org);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected TierUnavailable"),
        }
    }

    #[test]
    fn agent_error_non_zero_exit_carries_code() {
        let err = AgentError::NonZeroExit { code: 137 };
        assert!(err.to_string().contains("137"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SessionError::InvalidTransition {
            from: SessionStatus::Completed,
            action: SessionAction::Pause,
        });
        assert_std_error(&StoreError::NotFound { id: Uuid::new_v4() });
        assert_std_error(&KnowledgeError::SnippetNotFound {
            tier: Tier::Local,
            name: "style".into(),
        });
        assert_std_error(&AgentError::MissingReport);
    }
}
