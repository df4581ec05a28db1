//! Error types for the voice-agent engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the voice-agent engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Media path negotiation did not confirm within the bounded wait
    #[error("signaling not confirmed within {seconds} seconds")]
    SignalingTimeout { seconds: u64 },

    /// Every squad member is at capacity or the squad is empty
    #[error("no agent available in squad {squad_id}")]
    NoAgentAvailable { squad_id: String },

    /// Tenant is not licensed to originate or receive calls
    #[error("tenant {tenant_id} is not licensed for voice calls")]
    NotLicensed { tenant_id: String },

    /// STT/TTS collaborator failed mid-call
    #[error("pipeline aborted in {stage}: {details}")]
    PipelineAborted { stage: String, details: String },

    /// Call record could not be saved
    #[error("persistence failure: {message}")]
    PersistenceFailure { message: String },

    /// Operation against an experiment in the wrong lifecycle state
    #[error("invalid experiment state for {experiment_id}: {message}")]
    InvalidExperimentState {
        experiment_id: String,
        message: String,
    },

    /// Session not found (or already terminal and evicted)
    #[error("session not found: {call_id}")]
    SessionNotFound { call_id: String },

    /// Agent not found
    #[error("agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    /// Squad not found
    #[error("squad not found: {squad_id}")]
    SquadNotFound { squad_id: String },

    /// Experiment not found
    #[error("experiment not found: {experiment_id}")]
    ExperimentNotFound { experiment_id: String },

    /// Telephony transport error
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Invalid state error
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Create a pipeline-aborted error for a given stage ("stt", "tts", ...)
    pub fn pipeline(stage: impl Into<String>, details: impl Into<String>) -> Self {
        Self::PipelineAborted {
            stage: stage.into(),
            details: details.into(),
        }
    }

    /// Create a persistence failure error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceFailure {
            message: message.into(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
