//! Core type definitions shared across the engine
//!
//! Identifiers are newtype strings so that a squad id can never be passed
//! where an agent id is expected. Call state is a tagged enum with an explicit
//! transition guard; terminal states are absorbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Unique identifier of one active call session
    CallId
);
string_id!(
    /// Tenant that owns an agent, squad, experiment, or call
    TenantId
);
string_id!(
    /// Identifier of a configured voice agent
    AgentId
);
string_id!(
    /// Identifier of a squad (pool of interchangeable agents)
    SquadId
);
string_id!(
    /// Identifier of an A/B experiment
    ExperimentId
);
string_id!(
    /// Identifier of one variant inside an experiment
    VariantId
);

impl CallId {
    /// Generate a fresh random call id
    pub fn generate() -> Self {
        Self(format!("call-{}", uuid::Uuid::new_v4()))
    }
}

/// Lifecycle state of a call session
///
/// `Ringing` is the initial state; `Completed` and `Failed` are terminal and
/// absorbing. Any non-terminal state may fail fast to `Failed` on an
/// unrecoverable transport error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Inbound signal received, media path not yet negotiated
    Ringing,
    /// Media path negotiated, waiting for the first audio frame
    Connecting,
    /// Audio streaming pipeline is running
    InProgress,
    /// Teardown in progress: pipeline cancelled, record being flushed
    Completing,
    /// Terminal: call ended and record handed to persistence
    Completed,
    /// Terminal: call ended with an unrecoverable error
    Failed { reason: String },
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed { .. })
    }

    /// Whether a transition from `self` to `next` is legal
    pub fn can_transition_to(&self, next: &CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        // Fail-fast policy: any non-terminal state may fail directly.
        if matches!(next, CallState::Failed { .. }) {
            return true;
        }
        matches!(
            (self, next),
            (CallState::Ringing, CallState::Connecting)
                | (CallState::Connecting, CallState::InProgress)
                | (CallState::InProgress, CallState::Completing)
                | (CallState::Completing, CallState::Completed)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Ringing => write!(f, "ringing"),
            CallState::Connecting => write!(f, "connecting"),
            CallState::InProgress => write!(f, "in_progress"),
            CallState::Completing => write!(f, "completing"),
            CallState::Completed => write!(f, "completed"),
            CallState::Failed { reason } => write!(f, "failed ({})", reason),
        }
    }
}

/// Why a call left `InProgress`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEndReason {
    /// Caller hung up
    CallerHangup,
    /// The agent side (host application) ended the call
    AgentEnded,
    /// Policy-driven maximum call duration reached
    MaxDurationExceeded,
    /// Global engine shutdown drained the call
    Shutdown,
    /// Unrecoverable transport or collaborator error
    Error(String),
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallEndReason::CallerHangup => write!(f, "caller_hangup"),
            CallEndReason::AgentEnded => write!(f, "agent_ended"),
            CallEndReason::MaxDurationExceeded => write!(f, "max_duration_exceeded"),
            CallEndReason::Shutdown => write!(f, "shutdown"),
            CallEndReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// Who produced an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    Caller,
    Agent,
}

/// One finalized utterance in a call transcript
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Utterance {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
            at: Utc::now(),
        }
    }
}

/// Immutable configuration of one voice agent
///
/// Read-shared across sessions; never mutated once bound to a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub tenant_id: TenantId,
    pub display_name: String,
    /// BCP-47 style language tag, e.g. "en" or "hi"
    pub language: String,
    /// Voice used by the TTS collaborator
    pub voice_id: String,
    /// System prompt handed to the dialogue collaborator
    pub system_prompt: String,
    /// Sampling temperature for the dialogue collaborator
    pub temperature: f32,
    /// Optional greeting spoken when the call goes in-progress
    pub greeting: Option<String>,
    /// Free-form tags matched by attribute-match routing (e.g. "sales")
    pub tags: Vec<String>,
    /// Concurrent-call capacity of this agent
    pub max_concurrent_calls: usize,
}

/// Routing policy applied over a squad's members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingPolicy {
    /// Cycle members in fixed order, skipping agents at capacity
    RoundRobin,
    /// Fewest active sessions wins, ties broken by member order
    LeastBusy,
    /// Most matching context attributes wins, ties by least-busy
    AttributeMatch,
}

/// Named pool of interchangeable agent configurations
///
/// Read-mostly; replaced wholesale by the configuration API, never mutated
/// mid-route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Squad {
    pub id: SquadId,
    pub tenant_id: TenantId,
    pub name: String,
    /// Ordered member list; order is the round-robin and tie-break order
    pub members: Vec<AgentId>,
    pub policy: RoutingPolicy,
}

/// Context describing one inbound call before routing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallContext {
    pub tenant_id: TenantId,
    /// Stable identifier of the inbound signal; `start_call` is idempotent
    /// per signal id
    pub signal_id: String,
    pub caller_id: Option<String>,
    pub language: Option<String>,
    /// Caller tags matched by attribute-match routing
    pub caller_tags: Vec<String>,
    /// Explicit squad override; tenant default squad otherwise
    pub squad_id: Option<SquadId>,
}

impl CallContext {
    pub fn new(tenant_id: TenantId, signal_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            signal_id: signal_id.into(),
            caller_id: None,
            language: None,
            caller_tags: Vec::new(),
            squad_id: None,
        }
    }

    /// Stable key used for sticky experiment assignment: caller id when
    /// present, signal id otherwise.
    pub fn stable_key(&self) -> &str {
        self.caller_id.as_deref().unwrap_or(&self.signal_id)
    }
}

/// Outcome of routing one inbound call
///
/// Produced once per call and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub agent_id: AgentId,
    /// Experiment variant assigned to this call, if an experiment was active
    pub variant: Option<(ExperimentId, VariantId)>,
    /// Ordered names of the routing rules that matched
    pub reasons: Vec<String>,
}

/// Summary handed to the persistence collaborator at a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: CallId,
    pub tenant_id: TenantId,
    pub agent_id: AgentId,
    pub final_state: CallState,
    pub end_reason: Option<CallEndReason>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub transcript: Vec<Utterance>,
    pub variant: Option<(ExperimentId, VariantId)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        let completed = CallState::Completed;
        let failed = CallState::Failed {
            reason: "signaling_timeout".to_string(),
        };
        for next in [
            CallState::Ringing,
            CallState::Connecting,
            CallState::InProgress,
            CallState::Completing,
            CallState::Completed,
            CallState::Failed {
                reason: "x".to_string(),
            },
        ] {
            assert!(!completed.can_transition_to(&next));
            assert!(!failed.can_transition_to(&next));
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        assert!(CallState::Ringing.can_transition_to(&CallState::Connecting));
        assert!(CallState::Connecting.can_transition_to(&CallState::InProgress));
        assert!(CallState::InProgress.can_transition_to(&CallState::Completing));
        assert!(CallState::Completing.can_transition_to(&CallState::Completed));
    }

    #[test]
    fn any_live_state_may_fail_fast() {
        let failed = CallState::Failed {
            reason: "transport".to_string(),
        };
        assert!(CallState::Ringing.can_transition_to(&failed));
        assert!(CallState::Connecting.can_transition_to(&failed));
        assert!(CallState::InProgress.can_transition_to(&failed));
        assert!(CallState::Completing.can_transition_to(&failed));
    }

    #[test]
    fn skipping_states_is_rejected() {
        assert!(!CallState::Ringing.can_transition_to(&CallState::InProgress));
        assert!(!CallState::Connecting.can_transition_to(&CallState::Completed));
        assert!(!CallState::InProgress.can_transition_to(&CallState::Completed));
    }

    #[test]
    fn stable_key_prefers_caller_id() {
        let mut ctx = CallContext::new(TenantId::new("t1"), "sig-1");
        assert_eq!(ctx.stable_key(), "sig-1");
        ctx.caller_id = Some("+15550001111".to_string());
        assert_eq!(ctx.stable_key(), "+15550001111");
    }

    #[test]
    fn call_summary_serializes_for_persistence() {
        let now = Utc::now();
        let summary = CallSummary {
            call_id: CallId::new("call-1"),
            tenant_id: TenantId::new("t1"),
            agent_id: AgentId::new("a1"),
            final_state: CallState::Completed,
            end_reason: Some(CallEndReason::CallerHangup),
            started_at: now,
            ended_at: now,
            transcript: vec![Utterance::new(Speaker::Caller, "hello")],
            variant: None,
        };
        let json = serde_json::to_value(&summary).unwrap();
        // Ids flatten to plain strings so persistence layers can index them
        assert_eq!(json["call_id"], "call-1");
        assert_eq!(json["final_state"], "Completed");
        assert_eq!(json["transcript"][0]["text"], "hello");
    }
}
