//! External collaborator contracts
//!
//! The engine does not ship a telephony provider, a speech stack, or a
//! database. Each of those is an async trait the host application implements;
//! the engine only depends on the narrow contracts below.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::types::{CallId, CallSummary, TenantId, Utterance};

/// One inbound audio frame from the caller side (typically 20 ms)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

/// Inbound signaling and media events delivered by the telephony transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Offer/answer (or provider webhook) confirmed the media path
    MediaNegotiated,
    /// One caller audio frame
    InboundAudio(AudioFrame),
    /// Caller hung up
    Hangup,
    /// Unrecoverable transport error; the call fails fast
    TransportError(String),
}

/// Telephony transport contract
///
/// Retries, busy signals, and voicemail fallback live behind this trait in
/// the provider SDK, not in the engine.
#[async_trait]
pub trait TelephonyTransport: Send + Sync {
    /// Answer the inbound signal for this call
    async fn send_answer(&self, call_id: &CallId) -> Result<()>;

    /// Stream one chunk of synthesized audio to the caller
    async fn send_audio_chunk(&self, call_id: &CallId, chunk: Bytes) -> Result<()>;

    /// Next inbound event for this call; `None` once the transport side
    /// is closed
    async fn next_event(&self, call_id: &CallId) -> Option<TransportEvent>;
}

/// Streaming speech-to-text result
#[derive(Debug, Clone)]
pub enum TranscriptEvent {
    /// Interim hypothesis; surfaced for monitoring, never written to the
    /// transcript
    Partial { text: String },
    /// Finalized utterance
    Final { text: String },
}

/// Streaming speech-to-text collaborator
///
/// Frames are forwarded incrementally; the collaborator emits `Partial`
/// hypotheses and marks utterance boundaries with `Final`.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        call_id: &CallId,
        frame: AudioFrame,
    ) -> Result<Option<TranscriptEvent>>;
}

/// Stream of synthesized audio chunks, emitted in generation order
pub type AudioChunkStream = BoxStream<'static, Result<Bytes>>;

/// Streaming text-to-speech collaborator
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize `text` with the given voice, streaming chunks as they are
    /// produced rather than after full generation
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<AudioChunkStream>;
}

/// Per-call parameters handed to the dialogue collaborator
#[derive(Debug, Clone)]
pub struct DialogueContext {
    pub call_id: CallId,
    pub system_prompt: String,
    pub temperature: f32,
    pub language: String,
}

/// Dialogue/response collaborator (LLM or scripted)
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    /// Produce the agent's next response given the transcript so far
    async fn respond(&self, transcript: &[Utterance], ctx: &DialogueContext) -> Result<String>;
}

/// Persistence collaborator; invoked once per call at a terminal state
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn save_call_record(&self, summary: &CallSummary) -> Result<()>;
}

/// Tenant/licensing collaborator; consulted once before routing
#[async_trait]
pub trait LicenseGate: Send + Sync {
    /// Whether the tenant may originate/receive calls
    async fn check_tenant(&self, tenant_id: &TenantId) -> Result<bool>;
}
