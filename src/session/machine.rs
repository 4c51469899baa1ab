//! The session lifecycle state machine.
//!
//! The only legitimate writer of the Session Store. Every successful
//! transition (a) persists the new snapshot atomically, then (b) emits
//! exactly one progress event, in that order and inside the session's
//! critical section, so a subscriber reacting to an event can always read
//! consistent persisted state.
//!
//! Transition map:
//!
//! ```text
//! created → active → {paused, stopped, completed, error}
//! paused  → {active, stopped}
//! ```
//!
//! `stopped`, `completed` and `error` are terminal. Pause/stop against an
//! `active` session is recorded as a pending [`ControlRequest`] and
//! honored by the orchestration loop at its next checkpoint, because an
//! in-flight agent invocation cannot be preempted.

use std::sync::Arc;

use uuid::Uuid;

use super::store::SessionStore;
use super::{ControlRequest, Feature, Session, SessionAction, SessionStatus};
use crate::agent::{AgentOutcome, AgentReport};
use crate::errors::SessionError;
use crate::progress::{ProgressEvent, ProgressHub};

pub struct StateMachine {
    store: Arc<SessionStore>,
    hub: Arc<ProgressHub>,
}

impl StateMachine {
    pub fn new(store: Arc<SessionStore>, hub: Arc<ProgressHub>) -> Self {
        Self { store, hub }
    }

    /// Run one validated transition: persist, then broadcast.
    async fn transition<F>(&self, id: Uuid, mutate: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError>,
    {
        self.store
            .update(id, mutate, |session| {
                self.hub.publish(ProgressEvent::snapshot(session));
            })
            .await
    }

    /// Create and persist a new session record. The first observable
    /// event is the activation on [`Self::claim`]; a subscriber cannot
    /// exist before the id this returns.
    pub async fn create(
        &self,
        spec: impl Into<String>,
        features: Vec<Feature>,
        work_item: Option<String>,
        branch: Option<String>,
    ) -> Result<Session, SessionError> {
        let mut session = Session::new(spec, features);
        session.work_item = work_item;
        session.branch = branch;
        self.store.create(&session).await?;
        Ok(session)
    }

    /// Claim a session for driving: `created → active`. Refuses a second
    /// claim on an already-active session, which is what guarantees no
    /// session is ever driven by two loops at once.
    pub async fn claim(&self, id: Uuid) -> Result<Session, SessionError> {
        self.transition(id, |s| {
            if s.status != SessionStatus::Created {
                return Err(SessionError::InvalidTransition {
                    from: s.status,
                    action: SessionAction::Claim,
                });
            }
            s.set_status(SessionStatus::Active);
            Ok(())
        })
        .await
    }

    /// Record a pause request against an active session. The loop turns
    /// it into the real `active → paused` transition at its next
    /// checkpoint.
    pub async fn request_pause(&self, id: Uuid) -> Result<Session, SessionError> {
        self.transition(id, |s| {
            if s.status != SessionStatus::Active || s.control.is_some() {
                return Err(SessionError::InvalidTransition {
                    from: s.status,
                    action: SessionAction::Pause,
                });
            }
            s.control = Some(ControlRequest::Pause);
            Ok(())
        })
        .await
    }

    /// `paused → active`, or withdraw a pause request that has not been
    /// honored yet.
    pub async fn resume(&self, id: Uuid) -> Result<Session, SessionError> {
        self.transition(id, |s| match (s.status, s.control) {
            (SessionStatus::Paused, _) => {
                s.control = None;
                s.set_status(SessionStatus::Active);
                Ok(())
            }
            (SessionStatus::Active, Some(ControlRequest::Pause)) => {
                s.control = None;
                Ok(())
            }
            _ => Err(SessionError::InvalidTransition {
                from: s.status,
                action: SessionAction::Resume,
            }),
        })
        .await
    }

    /// Stop a session. Against a `paused` session the transition is
    /// immediate (the loop is parked, nothing is in flight). Against an
    /// `active` session a pending stop is recorded (superseding a pending
    /// pause) and finalized only after the in-flight invocation's result
    /// has been applied.
    pub async fn request_stop(&self, id: Uuid) -> Result<Session, SessionError> {
        self.transition(id, |s| match (s.status, s.control) {
            (SessionStatus::Paused, _) => {
                s.control = None;
                s.set_status(SessionStatus::Stopped);
                Ok(())
            }
            (SessionStatus::Active, Some(ControlRequest::Stop)) => {
                Err(SessionError::InvalidTransition {
                    from: s.status,
                    action: SessionAction::Stop,
                })
            }
            (SessionStatus::Active, _) => {
                s.control = Some(ControlRequest::Stop);
                Ok(())
            }
            _ => Err(SessionError::InvalidTransition {
                from: s.status,
                action: SessionAction::Stop,
            }),
        })
        .await
    }

    /// `active → error`, carrying the human-readable cause reported by the
    /// failing agent invocation (or surfaced store failure).
    pub async fn fail(&self, id: Uuid, cause: impl Into<String>) -> Result<Session, SessionError> {
        let cause = cause.into();
        self.transition(id, move |s| {
            if s.status != SessionStatus::Active {
                return Err(SessionError::InvalidTransition {
                    from: s.status,
                    action: SessionAction::Fail,
                });
            }
            s.error = Some(cause);
            s.control = None;
            s.set_status(SessionStatus::Error);
            Ok(())
        })
        .await
    }

    /// Honor a pending control request outside report application. Called
    /// by the loop at the top of each iteration; a no-op when nothing is
    /// pending.
    pub async fn checkpoint(&self, id: Uuid) -> Result<Session, SessionError> {
        self.transition(id, |s| {
            if s.status == SessionStatus::Active {
                honor_control(s);
            }
            Ok(())
        })
        .await
    }

    /// Apply one agent invocation's results: flip reported features to
    /// passing, record failures, append discovered work, then settle the
    /// status: fatal outcome wins, else completion when every feature
    /// passes (the machine's one autonomous transition), else any pending
    /// control request. Applying a report to a session already in a
    /// terminal state is a no-op, not an error, so re-observing an
    /// all-passing checklist never emits a duplicate completion event.
    pub async fn apply_report(
        &self,
        id: Uuid,
        report: &AgentReport,
    ) -> Result<Session, SessionError> {
        self.transition(id, |s| {
            if s.status.is_terminal() {
                return Ok(());
            }
            if s.status != SessionStatus::Active {
                return Err(SessionError::InvalidTransition {
                    from: s.status,
                    action: SessionAction::Report,
                });
            }

            apply_features(s, report);

            match &report.outcome {
                AgentOutcome::Fatal(cause) => {
                    s.error = Some(cause.clone());
                    s.control = None;
                    s.set_status(SessionStatus::Error);
                }
                outcome => {
                    let empty_and_done =
                        s.features.is_empty() && *outcome == AgentOutcome::Done;
                    if s.all_features_pass() || empty_and_done {
                        s.control = None;
                        s.set_status(SessionStatus::Completed);
                    } else if *outcome == AgentOutcome::Done {
                        // The agent claims the work is finished while the
                        // checklist disagrees; park the inconsistency where
                        // an operator will see it.
                        let unresolved = s.total_features() - s.completed_features();
                        s.error = Some(format!(
                            "agent reported done with {} unresolved feature(s)",
                            unresolved
                        ));
                        s.control = None;
                        s.set_status(SessionStatus::Error);
                    } else {
                        honor_control(s);
                    }
                }
            }
            Ok(())
        })
        .await
    }
}

/// Convert a pending control request into its transition.
fn honor_control(s: &mut Session) {
    match s.control.take() {
        Some(ControlRequest::Pause) => s.set_status(SessionStatus::Paused),
        Some(ControlRequest::Stop) => s.set_status(SessionStatus::Stopped),
        None => {}
    }
}

/// Fold an agent report into the feature checklist. Features are only
/// ever appended or flipped to passing; nothing is removed.
fn apply_features(s: &mut Session, report: &AgentReport) {
    for description in &report.features_passed {
        match s.features.iter_mut().find(|f| &f.description == description) {
            Some(feature) => {
                feature.passes = true;
                feature.failure = None;
            }
            None => {
                tracing::warn!(id = %s.id, feature = %description, "agent reported an unknown feature as passing");
            }
        }
    }
    for failure in &report.features_failed {
        if let Some(feature) = s
            .features
            .iter_mut()
            .find(|f| f.description == failure.description)
        {
            feature.failure = Some(failure.detail.clone());
        }
    }
    for description in &report.features_discovered {
        if !s.features.iter().any(|f| &f.description == description) {
            s.features.push(Feature::pending(description.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FeatureFailure;
    use crate::session::store::SessionFilter;
    use tempfile::tempdir;

    struct Fixture {
        machine: StateMachine,
        store: Arc<SessionStore>,
        hub: Arc<ProgressHub>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        let hub = Arc::new(ProgressHub::default());
        Fixture {
            machine: StateMachine::new(Arc::clone(&store), Arc::clone(&hub)),
            store,
            hub,
            _dir: dir,
        }
    }

    async fn active_session(fx: &Fixture, features: &[&str]) -> Uuid {
        let features = features.iter().map(|f| Feature::pending(*f)).collect();
        let session = fx
            .machine
            .create("spec.md", features, None, None)
            .await
            .unwrap();
        fx.machine.claim(session.id).await.unwrap();
        session.id
    }

    #[tokio::test]
    async fn claim_advances_created_to_active() {
        let fx = fixture();
        let session = fx
            .machine
            .create("spec.md", vec![Feature::pending("a")], None, None)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Created);

        let claimed = fx.machine.claim(session.id).await.unwrap();
        assert_eq!(claimed.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn second_claim_is_rejected() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;

        let err = fx.machine.claim(id).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                from: SessionStatus::Active,
                action: SessionAction::Claim,
            }
        ));
    }

    #[tokio::test]
    async fn resume_on_stopped_fails_and_leaves_record_unchanged() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        fx.machine.request_stop(id).await.unwrap();
        fx.machine
            .apply_report(id, &AgentReport::more_work(vec![]))
            .await
            .unwrap();
        assert_eq!(
            fx.store.get(id).await.unwrap().status,
            SessionStatus::Stopped
        );

        let path = fx.store.root().join(format!("{}.json", id));
        let before = std::fs::read(&path).unwrap();

        let err = fx.machine.resume(id).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                from: SessionStatus::Stopped,
                action: SessionAction::Resume,
            }
        ));
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn pause_request_is_honored_at_checkpoint_not_immediately() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;

        let session = fx.machine.request_pause(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.control, Some(ControlRequest::Pause));

        let session = fx.machine.checkpoint(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        assert_eq!(session.control, None);
    }

    #[tokio::test]
    async fn pause_then_resume_before_checkpoint_withdraws_the_request() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;

        fx.machine.request_pause(id).await.unwrap();
        let session = fx.machine.resume(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.control, None);

        // Nothing pending: the checkpoint leaves the session untouched.
        let session = fx.machine.checkpoint(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn resume_reactivates_a_paused_session() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        fx.machine.request_pause(id).await.unwrap();
        fx.machine.checkpoint(id).await.unwrap();

        let session = fx.machine.resume(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn stop_on_paused_is_immediate() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        fx.machine.request_pause(id).await.unwrap();
        fx.machine.checkpoint(id).await.unwrap();

        let session = fx.machine.request_stop(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_supersedes_a_pending_pause() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        fx.machine.request_pause(id).await.unwrap();
        let session = fx.machine.request_stop(id).await.unwrap();
        assert_eq!(session.control, Some(ControlRequest::Stop));

        let session = fx.machine.checkpoint(id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn report_flips_features_and_keeps_session_active() {
        let fx = fixture();
        let id = active_session(&fx, &["a", "b", "c"]).await;

        let session = fx
            .machine
            .apply_report(id, &AgentReport::more_work(vec!["a".into(), "c".into()]))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.completed_features(), 2);
        assert_eq!(session.total_features(), 3);
    }

    #[tokio::test]
    async fn all_features_passing_completes_the_session() {
        let fx = fixture();
        let id = active_session(&fx, &["a", "b"]).await;

        fx.machine
            .apply_report(id, &AgentReport::more_work(vec!["a".into()]))
            .await
            .unwrap();
        let session = fx
            .machine
            .apply_report(id, &AgentReport::done(vec!["b".into()]))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.all_features_pass());
    }

    #[tokio::test]
    async fn completion_is_emitted_exactly_once() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        let mut sub = fx.hub.subscribe(id);

        let completed = fx
            .machine
            .apply_report(id, &AgentReport::done(vec!["a".into()]))
            .await
            .unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);

        // Re-observing the all-passing checklist is a no-op.
        let again = fx
            .machine
            .apply_report(id, &AgentReport::done(vec!["a".into()]))
            .await
            .unwrap();
        assert_eq!(again.revision, completed.revision);

        let event = sub.recv().await.unwrap();
        assert_eq!(event.status, SessionStatus::Completed);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn fatal_outcome_moves_to_error_with_cause() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;

        let session = fx
            .machine
            .apply_report(id, &AgentReport::fatal("dependency missing"))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.error.as_deref(), Some("dependency missing"));
    }

    #[tokio::test]
    async fn done_on_an_empty_checklist_completes() {
        // A session whose work is discovered dynamically may finish with
        // nothing on the checklist at all.
        let fx = fixture();
        let id = active_session(&fx, &[]).await;

        let session = fx
            .machine
            .apply_report(id, &AgentReport::done(vec![]))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn done_with_unresolved_features_is_an_error() {
        let fx = fixture();
        let id = active_session(&fx, &["a", "b", "c"]).await;

        let session = fx
            .machine
            .apply_report(id, &AgentReport::done(vec!["a".into()]))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(
            session
                .error
                .as_deref()
                .unwrap()
                .contains("2 unresolved feature(s)")
        );
    }

    #[tokio::test]
    async fn pending_pause_is_honored_after_report_application() {
        let fx = fixture();
        let id = active_session(&fx, &["a", "b"]).await;
        fx.machine.request_pause(id).await.unwrap();

        let session = fx
            .machine
            .apply_report(id, &AgentReport::more_work(vec!["a".into()]))
            .await
            .unwrap();
        // The in-flight work landed first, then the pause took effect.
        assert_eq!(session.completed_features(), 1);
        assert_eq!(session.status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn pending_stop_lets_in_flight_work_land_before_stopping() {
        let fx = fixture();
        let id = active_session(&fx, &["a", "b"]).await;
        fx.machine.request_stop(id).await.unwrap();

        let session = fx
            .machine
            .apply_report(id, &AgentReport::more_work(vec!["b".into()]))
            .await
            .unwrap();
        assert_eq!(session.completed_features(), 1);
        assert_eq!(session.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn completion_wins_over_a_pending_stop() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        fx.machine.request_stop(id).await.unwrap();

        let session = fx
            .machine
            .apply_report(id, &AgentReport::done(vec!["a".into()]))
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn discovered_features_are_appended_pending() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;

        let mut report = AgentReport::more_work(vec!["a".into()]);
        report.features_discovered = vec!["handle unicode input".into(), "a".into()];

        let session = fx.machine.apply_report(id, &report).await.unwrap();
        // "a" already exists and is not duplicated; the session cannot
        // complete while discovered work is pending.
        assert_eq!(session.total_features(), 2);
        assert_eq!(session.completed_features(), 1);
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn failed_features_record_detail_without_passing() {
        let fx = fixture();
        let id = active_session(&fx, &["a", "b"]).await;

        let mut report = AgentReport::more_work(vec!["a".into()]);
        report.features_failed = vec![FeatureFailure {
            description: "b".into(),
            detail: "type check fails in module x".into(),
        }];

        let session = fx.machine.apply_report(id, &report).await.unwrap();
        let b = &session.features[1];
        assert!(!b.passes);
        assert_eq!(b.failure.as_deref(), Some("type check fails in module x"));
    }

    #[tokio::test]
    async fn every_transition_emits_exactly_one_ordered_event() {
        let fx = fixture();
        let session = fx
            .machine
            .create(
                "spec.md",
                vec![Feature::pending("a"), Feature::pending("b")],
                None,
                None,
            )
            .await
            .unwrap();
        let mut sub = fx.hub.subscribe(session.id);

        fx.machine.claim(session.id).await.unwrap();
        fx.machine
            .apply_report(session.id, &AgentReport::more_work(vec!["a".into()]))
            .await
            .unwrap();
        fx.machine
            .apply_report(session.id, &AgentReport::done(vec!["b".into()]))
            .await
            .unwrap();

        let mut seqs = Vec::new();
        while let Some(event) = sub.recv().await {
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn invalid_transition_emits_no_event() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        let mut sub = fx.hub.subscribe(id);

        assert!(fx.machine.claim(id).await.is_err());
        assert!(fx.machine.resume(id).await.is_err());

        // The next legal transition is the first event the subscriber sees.
        fx.machine.request_pause(id).await.unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.status, SessionStatus::Active);
        assert_eq!(event.seq, 2);
    }

    #[tokio::test]
    async fn active_sessions_are_a_store_query() {
        let fx = fixture();
        let id = active_session(&fx, &["a"]).await;
        fx.machine
            .create("other.md", vec![Feature::pending("x")], None, None)
            .await
            .unwrap();

        let active = fx
            .store
            .list(SessionFilter::with_status(SessionStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id);
    }
}
