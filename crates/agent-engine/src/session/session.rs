//! Call session implementation
//!
//! Single source of truth for one active call: state, transcript, and the
//! session-scoped cancellation token. State changes go through
//! [`CallSession::transition_to`] so illegal transitions are rejected by
//! construction.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::types::{
    AgentId, CallEndReason, CallId, CallState, CallSummary, ExperimentId, TenantId, Utterance,
    VariantId,
};

/// One active call being orchestrated
#[derive(Debug)]
pub struct CallSession {
    /// Unique session identifier (primary key in the store)
    pub call_id: CallId,
    pub tenant_id: TenantId,
    /// Agent bound by routing; never rebound mid-call
    pub agent_id: AgentId,
    /// Inbound signal this session answers; `start_call` is idempotent per
    /// signal id
    pub signal_id: String,
    /// Experiment variant assigned to this call, if any
    pub variant: Option<(ExperimentId, VariantId)>,
    pub started_at: DateTime<Utc>,

    state: RwLock<CallState>,
    ended_at: RwLock<Option<DateTime<Utc>>>,
    transcript: Mutex<Vec<Utterance>>,
    last_activity: Mutex<Instant>,

    /// Session-scoped cancellation; cancelling it tears down the pipeline
    /// and every in-flight STT/TTS request for this call only
    pub cancel: CancellationToken,
}

impl CallSession {
    pub fn new(
        call_id: CallId,
        tenant_id: TenantId,
        agent_id: AgentId,
        signal_id: impl Into<String>,
        variant: Option<(ExperimentId, VariantId)>,
    ) -> Self {
        Self {
            call_id,
            tenant_id,
            agent_id,
            signal_id: signal_id.into(),
            variant,
            started_at: Utc::now(),
            state: RwLock::new(CallState::Ringing),
            ended_at: RwLock::new(None),
            transcript: Mutex::new(Vec::new()),
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    /// Current state (cloned snapshot)
    pub fn state(&self) -> CallState {
        self.state.read().clone()
    }

    /// Apply a state transition, rejecting illegal ones
    pub fn transition_to(&self, next: CallState) -> Result<()> {
        let mut state = self.state.write();
        if !state.can_transition_to(&next) {
            return Err(EngineError::invalid_state(format!(
                "session {}: illegal transition {} -> {}",
                self.call_id, *state, next
            )));
        }
        tracing::debug!("session {} state: {} -> {}", self.call_id, *state, next);
        if next.is_terminal() {
            *self.ended_at.write() = Some(Utc::now());
        }
        *state = next;
        Ok(())
    }

    /// Fail fast from any non-terminal state
    pub fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.transition_to(CallState::Failed {
            reason: reason.into(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.read().is_terminal()
    }

    /// Append a finalized utterance to the transcript
    ///
    /// Returns `false` (and appends nothing) once the session has been
    /// cancelled, so a result that loses the race with `end_call` is
    /// discarded rather than written after teardown.
    pub fn append_utterance(&self, utterance: Utterance) -> bool {
        if self.cancel.is_cancelled() {
            tracing::debug!(
                "session {}: discarding utterance finalized after cancellation",
                self.call_id
            );
            return false;
        }
        self.transcript.lock().push(utterance);
        true
    }

    /// Snapshot of the transcript in finalization order
    pub fn transcript(&self) -> Vec<Utterance> {
        self.transcript.lock().clone()
    }

    /// Record inbound activity (used for idle bookkeeping)
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.lock().elapsed()
    }

    /// Build the persistence summary for this session
    pub fn summary(&self, end_reason: Option<CallEndReason>) -> CallSummary {
        CallSummary {
            call_id: self.call_id.clone(),
            tenant_id: self.tenant_id.clone(),
            agent_id: self.agent_id.clone(),
            final_state: self.state(),
            end_reason,
            started_at: self.started_at,
            ended_at: self.ended_at.read().unwrap_or_else(Utc::now),
            transcript: self.transcript(),
            variant: self.variant.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Speaker;

    fn test_session() -> CallSession {
        CallSession::new(
            CallId::new("call-1"),
            TenantId::new("tenant-1"),
            AgentId::new("agent-1"),
            "sig-1",
            None,
        )
    }

    #[test]
    fn lifecycle_follows_declared_transitions() {
        let session = test_session();
        assert_eq!(session.state(), CallState::Ringing);

        session.transition_to(CallState::Connecting).unwrap();
        session.transition_to(CallState::InProgress).unwrap();
        session.transition_to(CallState::Completing).unwrap();
        session.transition_to(CallState::Completed).unwrap();
        assert!(session.is_terminal());

        // Terminal is absorbing
        assert!(session.transition_to(CallState::InProgress).is_err());
        assert!(session.fail("late failure").is_err());
    }

    #[test]
    fn fail_fast_from_ringing() {
        let session = test_session();
        session.fail("signaling_timeout").unwrap();
        assert!(matches!(session.state(), CallState::Failed { .. }));
    }

    #[test]
    fn cancelled_session_discards_utterances() {
        let session = test_session();
        assert!(session.append_utterance(Utterance::new(Speaker::Caller, "hello")));
        session.cancel.cancel();
        assert!(!session.append_utterance(Utterance::new(Speaker::Agent, "late reply")));
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].text, "hello");
    }

    #[test]
    fn summary_captures_transcript_order() {
        let session = test_session();
        session.append_utterance(Utterance::new(Speaker::Caller, "first"));
        session.append_utterance(Utterance::new(Speaker::Agent, "second"));
        session.transition_to(CallState::Connecting).unwrap();
        session.transition_to(CallState::InProgress).unwrap();
        session.transition_to(CallState::Completing).unwrap();
        session.transition_to(CallState::Completed).unwrap();

        let summary = session.summary(Some(CallEndReason::CallerHangup));
        assert_eq!(summary.final_state, CallState::Completed);
        assert_eq!(summary.transcript.len(), 2);
        assert_eq!(summary.transcript[0].text, "first");
        assert_eq!(summary.transcript[1].text, "second");
    }
}
