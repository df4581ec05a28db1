//! Bidirectional audio streaming pipeline
//!
//! One pipeline per session, two flow directions:
//!
//! ```text
//! inbound:  caller frames -> STT (incremental) -> finalized utterance
//!                                 -> dialogue collaborator -> response text
//! outbound: response text -> per-sentence TTS chunk streams -> transport
//! ```
//!
//! Inbound frames are forwarded to STT as they arrive, never buffered for a
//! whole utterance, so the first partial transcript shows up as early as
//! possible. While a dialogue turn is in flight, inbound audio keeps flowing
//! and a bounded ring of recent frames (default 5 s) absorbs bursts; frames
//! beyond the bound are dropped with a warning rather than blocking.
//!
//! Barge-in: a finalized utterance arriving while a response is playing
//! cancels the playback token immediately and supersedes the pending
//! dialogue turn. Cancellation is structured: every outbound task selects on
//! its token, and a result that loses the race with session teardown is
//! discarded, never appended to the transcript.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::collaborators::{
    AudioFrame, DialogueContext, DialogueEngine, SpeechToText, TelephonyTransport, TextToSpeech,
    TranscriptEvent,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::session::CallSession;
use crate::types::{AgentConfig, Speaker, Utterance};

/// Monitoring events emitted by the pipeline (dashboards, metrics)
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Interim STT hypothesis; never written to the transcript
    InterimTranscript { text: String },
    /// A caller utterance was finalized and appended
    UtteranceFinalized { text: String },
    /// Outbound playback was cancelled by barge-in
    PlaybackInterrupted,
    /// A frame fell out of the bounded barge-in buffer
    FrameDropped { total_dropped: u64 },
}

/// An outbound playback in flight: TTS chunk stream being sent to the caller
struct Playback {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Per-session bidirectional audio pump
pub struct AudioPipeline {
    session: Arc<CallSession>,
    agent: Arc<AgentConfig>,
    transport: Arc<dyn TelephonyTransport>,
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    dialogue: Arc<dyn DialogueEngine>,
    config: EngineConfig,

    /// Child of the session token; cancelling the session tears down both
    /// flow directions and every in-flight collaborator request
    cancel: CancellationToken,
    playback: Mutex<Option<Playback>>,
    respond_task: Mutex<Option<JoinHandle<()>>>,
    /// Recent inbound frames retained while a dialogue turn is in flight
    pending_frames: Mutex<VecDeque<AudioFrame>>,
    responding: AtomicBool,
    dropped_frames: AtomicU64,

    /// Collaborator failures surfaced to the orchestrator (fail-fast)
    failure_tx: mpsc::UnboundedSender<EngineError>,
    monitor: Option<mpsc::UnboundedSender<PipelineEvent>>,
    /// Self-handle for the tasks this pipeline spawns
    weak: Weak<AudioPipeline>,
}

impl AudioPipeline {
    pub fn new(
        session: Arc<CallSession>,
        agent: Arc<AgentConfig>,
        transport: Arc<dyn TelephonyTransport>,
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        dialogue: Arc<dyn DialogueEngine>,
        config: EngineConfig,
        failure_tx: mpsc::UnboundedSender<EngineError>,
        monitor: Option<mpsc::UnboundedSender<PipelineEvent>>,
    ) -> Arc<Self> {
        let cancel = session.cancel.child_token();
        Arc::new_cyclic(|weak| Self {
            session,
            agent,
            transport,
            stt,
            tts,
            dialogue,
            config,
            cancel,
            playback: Mutex::new(None),
            respond_task: Mutex::new(None),
            pending_frames: Mutex::new(VecDeque::new()),
            responding: AtomicBool::new(false),
            dropped_frames: AtomicU64::new(0),
            failure_tx,
            monitor,
            weak: weak.clone(),
        })
    }

    /// Feed one inbound caller frame through STT
    ///
    /// Forwarded incrementally; an STT failure aborts the pipeline and is
    /// returned for the orchestrator's fail-fast handling.
    pub async fn handle_frame(&self, frame: AudioFrame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.session.touch();

        // Hold caller audio while a dialogue turn is in flight; it goes
        // through STT when the turn ends
        if self.responding.load(Ordering::Acquire) {
            self.buffer_frame(frame);
            return Ok(());
        }
        self.transcribe_frame(frame).await
    }

    async fn transcribe_frame(&self, frame: AudioFrame) -> Result<()> {
        let event = self
            .stt
            .transcribe(&self.session.call_id, frame)
            .await
            .map_err(|e| EngineError::pipeline("stt", e.to_string()))?;

        match event {
            Some(TranscriptEvent::Partial { text }) => {
                debug!("session {}: interim transcript: {}", self.session.call_id, text);
                self.emit(PipelineEvent::InterimTranscript { text });
            }
            Some(TranscriptEvent::Final { text }) if !text.trim().is_empty() => {
                self.on_final_utterance(text);
            }
            _ => {}
        }
        Ok(())
    }

    /// Speak a line proactively (greeting) without a caller turn
    pub fn speak(&self, text: &str) {
        if self
            .session
            .append_utterance(Utterance::new(Speaker::Agent, text))
        {
            self.start_playback(text.to_string());
        }
    }

    /// Frames dropped out of the bounded buffer so far
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Cancel both flow directions and abort in-flight collaborator requests
    ///
    /// Results arriving after this point are discarded; nothing is written
    /// to the transcript after cancellation.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.stop_playback();
        self.abort_pending_response();
        self.pending_frames.lock().clear();
    }

    fn on_final_utterance(&self, text: String) {
        // Caller spoke while the previous response was playing or being
        // generated: the new utterance takes priority.
        let interrupted = self.stop_playback();
        self.abort_pending_response();
        if interrupted {
            debug!("session {}: barge-in, playback cancelled", self.session.call_id);
            self.emit(PipelineEvent::PlaybackInterrupted);
        }

        if !self
            .session
            .append_utterance(Utterance::new(Speaker::Caller, text.clone()))
        {
            return;
        }
        self.emit(PipelineEvent::UtteranceFinalized { text });
        self.pending_frames.lock().clear();
        self.spawn_response_turn();
    }

    fn buffer_frame(&self, frame: AudioFrame) {
        let capacity = self.config.barge_in_capacity_frames().max(1);
        let mut pending = self.pending_frames.lock();
        if pending.len() >= capacity {
            pending.pop_front();
            let total = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "session {}: barge-in buffer full, dropping oldest frame ({} dropped so far)",
                self.session.call_id, total
            );
            self.emit(PipelineEvent::FrameDropped {
                total_dropped: total,
            });
        }
        pending.push_back(frame);
    }

    fn spawn_response_turn(&self) {
        let Some(pipeline) = self.weak.upgrade() else {
            return;
        };
        self.responding.store(true, Ordering::Release);
        let handle = tokio::spawn(async move {
            pipeline.run_response_turn().await;
        });
        *self.respond_task.lock() = Some(handle);
    }

    async fn run_response_turn(self: Arc<Self>) {
        let transcript = self.session.transcript();
        let start = transcript
            .len()
            .saturating_sub(self.config.dialogue_context_turns);
        let ctx = DialogueContext {
            call_id: self.session.call_id.clone(),
            system_prompt: self.agent.system_prompt.clone(),
            temperature: self.agent.temperature,
            language: self.agent.language.clone(),
        };

        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("session {}: dialogue turn cancelled", self.session.call_id);
                self.responding.store(false, Ordering::Release);
                return;
            }
            result = self.dialogue.respond(&transcript[start..], &ctx) => result,
        };
        self.responding.store(false, Ordering::Release);
        // This turn is completing on its own; a barge-in raised by the
        // flush below must not abort the flush
        *self.respond_task.lock() = None;

        // Audio held during the turn goes through STT now; if it finalizes
        // a new caller utterance, this turn's response is stale
        let superseded = self.flush_pending().await;

        match response {
            Ok(text) if !text.trim().is_empty() => {
                // The session may have ended while the collaborator was
                // thinking; a late result is discarded, not transcribed.
                if self.cancel.is_cancelled() {
                    debug!(
                        "session {}: discarding dialogue response after cancellation",
                        self.session.call_id
                    );
                    return;
                }
                if superseded {
                    debug!(
                        "session {}: caller spoke during the turn, response discarded",
                        self.session.call_id
                    );
                    return;
                }
                if self
                    .session
                    .append_utterance(Utterance::new(Speaker::Agent, text.clone()))
                {
                    self.start_playback(text);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("session {}: dialogue failed: {}", self.session.call_id, e);
                let _ = self
                    .failure_tx
                    .send(EngineError::pipeline("dialogue", e.to_string()));
            }
        }
    }

    /// Run frames retained during a dialogue turn through STT
    ///
    /// Returns true when the retained audio finalized a new caller
    /// utterance; a fresh turn is already running for it by then.
    async fn flush_pending(&self) -> bool {
        let frames: Vec<AudioFrame> = {
            let mut pending = self.pending_frames.lock();
            pending.drain(..).collect()
        };
        for frame in frames {
            if self.cancel.is_cancelled() {
                return true;
            }
            // A flushed frame may itself start a new turn; frames after it
            // are held for that turn instead
            if self.responding.load(Ordering::Acquire) {
                self.buffer_frame(frame);
                continue;
            }
            if let Err(e) = self.transcribe_frame(frame).await {
                let _ = self.failure_tx.send(e);
                return true;
            }
        }
        self.responding.load(Ordering::Acquire)
    }

    fn start_playback(&self, text: String) {
        let Some(pipeline) = self.weak.upgrade() else {
            return;
        };
        self.stop_playback();
        let token = self.cancel.child_token();
        let playback_token = token.clone();
        let handle = tokio::spawn(async move {
            pipeline.stream_playback(text, playback_token).await;
        });
        *self.playback.lock() = Some(Playback { token, handle });
    }

    /// Stream TTS audio to the caller sentence by sentence
    ///
    /// The response is synthesized one sentence at a time so the first
    /// sentence plays while the rest is still being generated. Chunks for
    /// one response go out in generation order; cancellation stops the
    /// stream immediately and discards the remainder.
    async fn stream_playback(self: Arc<Self>, text: String, token: CancellationToken) {
        for sentence in split_sentences(&text) {
            let stream = tokio::select! {
                _ = token.cancelled() => return,
                result = self.tts.synthesize(sentence, &self.agent.voice_id) => result,
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("session {}: tts failed: {}", self.session.call_id, e);
                    let _ = self
                        .failure_tx
                        .send(EngineError::pipeline("tts", e.to_string()));
                    return;
                }
            };

            loop {
                let chunk = tokio::select! {
                    _ = token.cancelled() => {
                        debug!("session {}: playback cancelled", self.session.call_id);
                        return;
                    }
                    chunk = stream.next() => chunk,
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        if let Err(e) = self
                            .transport
                            .send_audio_chunk(&self.session.call_id, bytes)
                            .await
                        {
                            error!(
                                "session {}: failed to send audio chunk: {}",
                                self.session.call_id, e
                            );
                            let _ = self.failure_tx.send(e);
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        error!("session {}: tts stream failed: {}", self.session.call_id, e);
                        let _ = self
                            .failure_tx
                            .send(EngineError::pipeline("tts", e.to_string()));
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    /// Cancel the in-flight playback, if any; returns whether one was active
    fn stop_playback(&self) -> bool {
        if let Some(playback) = self.playback.lock().take() {
            playback.token.cancel();
            // The task exits at its next select; abort is the backstop.
            playback.handle.abort();
            true
        } else {
            false
        }
    }

    fn abort_pending_response(&self) {
        if let Some(handle) = self.respond_task.lock().take() {
            handle.abort();
        }
        self.responding.store(false, Ordering::Release);
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event);
        }
    }
}

/// Split a response into sentence-sized pieces for incremental synthesis
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?') {
            let end = i + c.len_utf8();
            let piece = text[start..end].trim();
            if !piece.is_empty() {
                sentences.push(piece);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::AudioChunkStream;
    use crate::types::{AgentId, CallId, TenantId};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::time::Duration;

    struct NullTransport {
        sent: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl TelephonyTransport for NullTransport {
        async fn send_answer(&self, _call_id: &CallId) -> Result<()> {
            Ok(())
        }
        async fn send_audio_chunk(&self, _call_id: &CallId, chunk: Bytes) -> Result<()> {
            self.sent.lock().push(chunk);
            Ok(())
        }
        async fn next_event(
            &self,
            _call_id: &CallId,
        ) -> Option<crate::collaborators::TransportEvent> {
            None
        }
    }

    /// Finalizes an utterance on every frame whose payload is non-empty
    struct FrameEchoStt;

    #[async_trait]
    impl SpeechToText for FrameEchoStt {
        async fn transcribe(
            &self,
            _call_id: &CallId,
            frame: AudioFrame,
        ) -> Result<Option<TranscriptEvent>> {
            if frame.data.is_empty() {
                return Ok(None);
            }
            Ok(Some(TranscriptEvent::Final {
                text: format!("utterance-{}", frame.data[0]),
            }))
        }
    }

    struct ChunkedTts;

    #[async_trait]
    impl TextToSpeech for ChunkedTts {
        async fn synthesize(&self, _text: &str, _voice_id: &str) -> Result<AudioChunkStream> {
            let chunks: Vec<Result<Bytes>> = vec![
                Ok(Bytes::from_static(b"chunk-1")),
                Ok(Bytes::from_static(b"chunk-2")),
            ];
            Ok(Box::pin(stream::iter(chunks)))
        }
    }

    /// Responds after a configurable delay so tests can race cancellation
    struct SlowDialogue {
        delay: Duration,
    }

    #[async_trait]
    impl DialogueEngine for SlowDialogue {
        async fn respond(&self, transcript: &[Utterance], _ctx: &DialogueContext) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("reply to: {}", transcript.last().unwrap().text))
        }
    }

    fn test_agent() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            id: AgentId::new("agent-1"),
            tenant_id: TenantId::new("tenant-1"),
            display_name: "Agent".to_string(),
            language: "en".to_string(),
            voice_id: "voice-1".to_string(),
            system_prompt: "Be helpful".to_string(),
            temperature: 0.7,
            greeting: None,
            tags: vec![],
            max_concurrent_calls: 4,
        })
    }

    fn test_pipeline(
        dialogue_delay: Duration,
    ) -> (
        Arc<AudioPipeline>,
        Arc<CallSession>,
        Arc<NullTransport>,
        mpsc::UnboundedReceiver<EngineError>,
    ) {
        let session = Arc::new(CallSession::new(
            CallId::new("call-1"),
            TenantId::new("tenant-1"),
            AgentId::new("agent-1"),
            "sig-1",
            None,
        ));
        let transport = Arc::new(NullTransport {
            sent: Mutex::new(Vec::new()),
        });
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let pipeline = AudioPipeline::new(
            Arc::clone(&session),
            test_agent(),
            Arc::clone(&transport) as Arc<dyn TelephonyTransport>,
            Arc::new(FrameEchoStt),
            Arc::new(ChunkedTts),
            Arc::new(SlowDialogue {
                delay: dialogue_delay,
            }),
            EngineConfig::default(),
            failure_tx,
            None,
        );
        (pipeline, session, transport, failure_rx)
    }

    #[tokio::test]
    async fn finalized_utterance_produces_spoken_reply() {
        let (pipeline, session, transport, _rx) = test_pipeline(Duration::from_millis(10));

        pipeline
            .handle_frame(AudioFrame::new(vec![1u8]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].speaker, Speaker::Caller);
        assert_eq!(transcript[0].text, "utterance-1");
        assert_eq!(transcript[1].speaker, Speaker::Agent);
        assert!(transcript[1].text.starts_with("reply to"));
        // Both TTS chunks reached the transport in order
        let sent = transport.sent.lock().clone();
        assert_eq!(sent, vec![Bytes::from_static(b"chunk-1"), Bytes::from_static(b"chunk-2")]);
    }

    #[tokio::test]
    async fn shutdown_discards_in_flight_dialogue_result() {
        let (pipeline, session, _transport, _rx) = test_pipeline(Duration::from_millis(200));

        pipeline
            .handle_frame(AudioFrame::new(vec![1u8]))
            .await
            .unwrap();
        // Dialogue turn is in flight; end the session before it resolves
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.cancel.cancel();
        pipeline.shutdown();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Only the caller utterance made it; the late reply was discarded
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::Caller);
    }

    #[tokio::test]
    async fn barge_in_supersedes_previous_turn() {
        let (pipeline, session, _transport, _rx) = test_pipeline(Duration::from_millis(150));

        pipeline
            .handle_frame(AudioFrame::new(vec![1u8]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Caller speaks again before the first reply finishes
        pipeline
            .handle_frame(AudioFrame::new(vec![2u8]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let transcript = session.transcript();
        // Two caller utterances; exactly one agent reply (to the second)
        let caller: Vec<_> = transcript
            .iter()
            .filter(|u| u.speaker == Speaker::Caller)
            .collect();
        let agent: Vec<_> = transcript
            .iter()
            .filter(|u| u.speaker == Speaker::Agent)
            .collect();
        assert_eq!(caller.len(), 2);
        assert_eq!(agent.len(), 1);
        assert_eq!(agent[0].text, "reply to: utterance-2");
    }

    #[tokio::test]
    async fn buffer_drops_oldest_beyond_bound() {
        let (pipeline, session, _transport, _rx) = test_pipeline(Duration::from_secs(5));
        let small = EngineConfig::new().with_barge_in_buffer(Duration::from_millis(60));
        // Rebuild with a 3-frame buffer
        let (failure_tx, _rx2) = mpsc::unbounded_channel();
        let pipeline2 = AudioPipeline::new(
            Arc::clone(&session),
            test_agent(),
            Arc::new(NullTransport {
                sent: Mutex::new(Vec::new()),
            }) as Arc<dyn TelephonyTransport>,
            Arc::new(FrameEchoStt),
            Arc::new(ChunkedTts),
            Arc::new(SlowDialogue {
                delay: Duration::from_secs(5),
            }),
            small,
            failure_tx,
            None,
        );
        drop(pipeline);

        // First frame starts a (slow) dialogue turn
        pipeline2
            .handle_frame(AudioFrame::new(vec![1u8]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Empty payloads: buffered but never finalized by the echo STT
        for _ in 0..5 {
            pipeline2
                .handle_frame(AudioFrame::new(Vec::<u8>::new()))
                .await
                .unwrap();
        }
        assert_eq!(pipeline2.dropped_frames(), 2);
        pipeline2.shutdown();
    }

    #[tokio::test]
    async fn frames_held_during_a_turn_are_transcribed_when_it_ends() {
        let (pipeline, session, _transport, _rx) = test_pipeline(Duration::from_millis(100));

        pipeline
            .handle_frame(AudioFrame::new(vec![1u8]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Caller keeps talking while the reply is being generated; both
        // frames are held, the first opens a new turn, the second is held
        // for that one in turn
        pipeline
            .handle_frame(AudioFrame::new(vec![2u8]))
            .await
            .unwrap();
        pipeline
            .handle_frame(AudioFrame::new(vec![3u8]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let transcript = session.transcript();
        let texts: Vec<&str> = transcript.iter().map(|u| u.text.as_str()).collect();
        // Held speech superseded the earlier replies; only the last caller
        // utterance got one
        assert_eq!(
            texts,
            vec![
                "utterance-1",
                "utterance-2",
                "utterance-3",
                "reply to: utterance-3"
            ]
        );
        pipeline.shutdown();
    }

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hello there. How can I help you today? Take your time."),
            vec!["Hello there.", "How can I help you today?", "Take your time."]
        );
        assert_eq!(split_sentences("no punctuation"), vec!["no punctuation"]);
        assert_eq!(split_sentences("  "), Vec::<&str>::new());
    }

    #[tokio::test]
    async fn greeting_is_spoken_and_transcribed() {
        let (pipeline, session, transport, _rx) = test_pipeline(Duration::from_millis(10));
        pipeline.speak("Hello, how can I help you?");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let transcript = session.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::Agent);
        assert!(!transport.sent.lock().is_empty());
    }
}
