//! # opencall-agent-engine
//!
//! Call orchestration engine for AI voice agents: session registry, squad
//! routing, bidirectional audio streaming with barge-in, and A/B experiment
//! assignment, behind host-provided telephony/speech/dialogue collaborators.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CallOrchestrator                       │
//! │                                                             │
//! │  route_call ──► LicenseGate ──► SquadRouter ──► Experiments │
//! │  start_call ──► SessionStore ──► per-call task              │
//! │                                                             │
//! │  per-call task                                              │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ answer ► media negotiation ► AudioPipeline            │  │
//! │  │                                                       │  │
//! │  │  caller frames ─► STT ─► dialogue ─► TTS ─► caller    │  │
//! │  │          (barge-in cancels outbound playback)         │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                                                             │
//! │  terminal ──► CallRecordStore ──► experiment outcome        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine ships no telephony provider, speech stack, or database; those
//! are the async traits in [`collaborators`]. Everything per-call is scoped
//! to one [`session::CallSession`] and torn down through its cancellation
//! token, so one call's failure never leaks into another.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use opencall_agent_engine::prelude::*;
//! # fn collaborators() -> Collaborators { unimplemented!() }
//!
//! # async fn example() -> Result<()> {
//! let router = Arc::new(SquadRouter::new());
//! let experiments = Arc::new(ExperimentEngine::new());
//! let engine = CallOrchestrator::new(
//!     EngineConfig::default(),
//!     router,
//!     experiments,
//!     collaborators(),
//!     None,
//! );
//!
//! let ctx = CallContext {
//!     tenant_id: TenantId::new("tenant-1"),
//!     signal_id: "sig-abc".to_string(),
//!     caller_id: Some("+15550100".to_string()),
//!     language: None,
//!     caller_tags: vec![],
//!     squad_id: None,
//! };
//! let decision = engine.route_call(&ctx).await?;
//! let _call_id = engine.start_call(ctx, decision)?;
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod experiment;
pub mod orchestrator;
pub mod pipeline;
pub mod routing;
pub mod session;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use orchestrator::{CallOrchestrator, Collaborators};

/// Common imports for hosts embedding the engine
pub mod prelude {
    pub use crate::collaborators::{
        AudioChunkStream, AudioFrame, CallRecordStore, DialogueContext, DialogueEngine,
        LicenseGate, SpeechToText, TelephonyTransport, TextToSpeech, TranscriptEvent,
        TransportEvent,
    };
    pub use crate::config::EngineConfig;
    pub use crate::error::{EngineError, Result};
    pub use crate::experiment::{
        CallOutcome, ExperimentEngine, ExperimentResults, ExperimentStatus, VariantResults,
        VariantSpec,
    };
    pub use crate::orchestrator::{CallOrchestrator, Collaborators};
    pub use crate::pipeline::{AudioPipeline, PipelineEvent};
    pub use crate::routing::SquadRouter;
    pub use crate::session::{CallSession, SessionStore, SessionStoreStats};
    pub use crate::types::{
        AgentConfig, AgentId, CallContext, CallEndReason, CallId, CallState, CallSummary,
        ExperimentId, RoutingDecision, RoutingPolicy, Speaker, Squad, SquadId, TenantId,
        Utterance, VariantId,
    };
}
