//! Engine configuration
//!
//! Timeouts and buffer sizes for the orchestrator and the audio pipeline,
//! with builder-style setters and sensible telephony defaults (20 ms frames,
//! 30 s signaling wait, 5 s barge-in buffer).

use std::time::Duration;

/// Configuration for the voice-agent engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded wait for media path negotiation before failing the call
    pub signaling_timeout: Duration,

    /// Policy-driven maximum call duration; `None` disables the cutoff
    pub max_call_duration: Option<Duration>,

    /// Duration of one inbound audio frame
    pub frame_duration: Duration,

    /// How much inbound audio is retained while a dialogue turn is in
    /// flight; frames beyond this bound are dropped with a warning
    pub barge_in_buffer: Duration,

    /// How many most recent transcript utterances are handed to the
    /// dialogue collaborator per turn
    pub dialogue_context_turns: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            signaling_timeout: Duration::from_secs(30),
            max_call_duration: Some(Duration::from_secs(3600)),
            frame_duration: Duration::from_millis(20),
            barge_in_buffer: Duration::from_secs(5),
            dialogue_context_turns: 10,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signaling_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_timeout = timeout;
        self
    }

    pub fn with_max_call_duration(mut self, max: Option<Duration>) -> Self {
        self.max_call_duration = max;
        self
    }

    pub fn with_barge_in_buffer(mut self, buffer: Duration) -> Self {
        self.barge_in_buffer = buffer;
        self
    }

    pub fn with_dialogue_context_turns(mut self, turns: usize) -> Self {
        self.dialogue_context_turns = turns;
        self
    }

    /// Ring-buffer capacity in frames implied by the barge-in buffer
    pub fn barge_in_capacity_frames(&self) -> usize {
        let frame_ms = self.frame_duration.as_millis().max(1);
        (self.barge_in_buffer.as_millis() / frame_ms) as usize
    }
}
