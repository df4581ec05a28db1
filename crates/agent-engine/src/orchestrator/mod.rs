//! Call orchestrator
//!
//! Owns the lifecycle of every call from inbound signal to persisted record:
//!
//! ```text
//! signal -> route_call (license, squad, experiment)
//!        -> start_call  (session registered, call task spawned)
//!        -> answer, media negotiation (bounded wait)
//!        -> Ringing -> Connecting -> InProgress   (pipeline + greeting)
//!        -> event loop: inbound audio | hangup | end_call | max duration
//!        -> Completing -> Completed / Failed
//!        -> record persisted, experiment outcome recorded, load released
//! ```
//!
//! One spawned task per call; the orchestrator itself holds no per-call
//! locks across await points. `start_call` is idempotent per signal id, so
//! a provider webhook retry never produces a second session for the same
//! inbound call.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    CallRecordStore, DialogueEngine, LicenseGate, SpeechToText, TelephonyTransport, TextToSpeech,
    TransportEvent,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::experiment::{CallOutcome, ExperimentEngine};
use crate::pipeline::{AudioPipeline, PipelineEvent};
use crate::routing::SquadRouter;
use crate::session::{CallSession, SessionStore};
use crate::types::{
    AgentConfig, CallContext, CallEndReason, CallId, CallState, RoutingDecision, Speaker,
};

/// Host-provided collaborator set, one per engine
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn TelephonyTransport>,
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub dialogue: Arc<dyn DialogueEngine>,
    pub records: Arc<dyn CallRecordStore>,
    pub license: Arc<dyn LicenseGate>,
}

/// Top-level engine: routing, sessions, experiments, and per-call tasks
pub struct CallOrchestrator {
    config: EngineConfig,
    sessions: Arc<SessionStore>,
    router: Arc<SquadRouter>,
    experiments: Arc<ExperimentEngine>,
    collaborators: Collaborators,
    /// Inbound signal id -> session, for idempotent `start_call`
    by_signal: DashMap<String, CallId>,
    /// Reason recorded by `end_call` before the session token fires
    end_reasons: DashMap<CallId, CallEndReason>,
    tasks: DashMap<CallId, JoinHandle<()>>,
    monitor: Option<mpsc::UnboundedSender<PipelineEvent>>,
    /// Self-handle for the per-call tasks this engine spawns
    weak: Weak<CallOrchestrator>,
}

impl CallOrchestrator {
    pub fn new(
        config: EngineConfig,
        router: Arc<SquadRouter>,
        experiments: Arc<ExperimentEngine>,
        collaborators: Collaborators,
        monitor: Option<mpsc::UnboundedSender<PipelineEvent>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            router,
            experiments,
            collaborators,
            by_signal: DashMap::new(),
            end_reasons: DashMap::new(),
            tasks: DashMap::new(),
            monitor,
            weak: weak.clone(),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn router(&self) -> &Arc<SquadRouter> {
        &self.router
    }

    pub fn experiments(&self) -> &Arc<ExperimentEngine> {
        &self.experiments
    }

    /// Resolve an inbound signal to an agent and (optionally) a variant
    ///
    /// Checks the tenant's license, routes through the squad policy, then
    /// consults the experiment engine with the call's stable key.
    pub async fn route_call(&self, ctx: &CallContext) -> Result<RoutingDecision> {
        let licensed = self
            .collaborators
            .license
            .check_tenant(&ctx.tenant_id)
            .await?;
        if !licensed {
            warn!("tenant {} is not licensed for voice calls", ctx.tenant_id);
            return Err(EngineError::NotLicensed {
                tenant_id: ctx.tenant_id.0.clone(),
            });
        }

        let mut decision = self.router.route(ctx)?;
        if let Some((experiment_id, variant_id)) =
            self.experiments.assign(&ctx.tenant_id, ctx.stable_key())
        {
            decision
                .reasons
                .push(format!("experiment:{experiment_id}"));
            decision.variant = Some((experiment_id, variant_id));
        }
        debug!(
            "signal {}: routed to agent {} ({})",
            ctx.signal_id,
            decision.agent_id,
            decision.reasons.join(", ")
        );
        Ok(decision)
    }

    /// Register a session for the signal and spawn its call task
    ///
    /// Idempotent per signal id: a duplicate start returns the existing
    /// call id without touching routing or load.
    pub fn start_call(&self, ctx: CallContext, decision: RoutingDecision) -> Result<CallId> {
        let agent = self
            .router
            .agent(&decision.agent_id)
            .ok_or_else(|| EngineError::AgentNotFound {
                agent_id: decision.agent_id.0.clone(),
            })?;
        let orchestrator = self
            .weak
            .upgrade()
            .ok_or_else(|| EngineError::invalid_state("engine is shutting down"))?;

        // Reserve the signal id atomically so two concurrent deliveries of
        // the same signal cannot both register a session
        let call_id = match self.by_signal.entry(ctx.signal_id.clone()) {
            Entry::Occupied(existing) => {
                debug!(
                    "signal {}: start_call is a duplicate, returning call {}",
                    ctx.signal_id,
                    existing.get()
                );
                return Ok(existing.get().clone());
            }
            Entry::Vacant(slot) => {
                let call_id = CallId::generate();
                slot.insert(call_id.clone());
                call_id
            }
        };

        let session = Arc::new(CallSession::new(
            call_id.clone(),
            ctx.tenant_id.clone(),
            decision.agent_id.clone(),
            ctx.signal_id.clone(),
            decision.variant.clone(),
        ));

        self.router.acquire(&decision.agent_id);
        if let Err(e) = self.sessions.insert(Arc::clone(&session)) {
            self.router.release(&decision.agent_id);
            self.by_signal.remove(&ctx.signal_id);
            return Err(e);
        }
        info!(
            "call {}: starting for signal {} on agent {}",
            call_id, ctx.signal_id, decision.agent_id
        );

        let task_session = Arc::clone(&session);
        let handle = tokio::spawn(async move {
            orchestrator.run_call(task_session, agent).await;
        });
        self.tasks.insert(call_id.clone(), handle);
        Ok(call_id)
    }

    /// End a live call from the agent/host side
    pub fn end_call(&self, call_id: &CallId, reason: CallEndReason) -> Result<()> {
        let session = self
            .sessions
            .get(call_id)
            .ok_or_else(|| EngineError::SessionNotFound {
                call_id: call_id.0.clone(),
            })?;
        info!("call {}: ending ({})", call_id, reason);
        self.end_reasons.insert(call_id.clone(), reason);
        session.cancel.cancel();
        Ok(())
    }

    /// Current lifecycle state of a live call, if any
    pub fn call_state(&self, call_id: &CallId) -> Option<CallState> {
        self.sessions.get(call_id).map(|s| s.state())
    }

    /// Drain every live call and wait for its task to finish
    pub async fn shutdown(&self) {
        let active = self.sessions.active_sessions();
        info!("shutting down, draining {} active call(s)", active.len());
        for session in &active {
            self.end_reasons
                .entry(session.call_id.clone())
                .or_insert(CallEndReason::Shutdown);
            session.cancel.cancel();
        }
        for session in active {
            if let Some((_, handle)) = self.tasks.remove(&session.call_id) {
                let _ = handle.await;
            }
        }
    }

    /// The per-call task: signaling, pipeline wiring, teardown
    async fn run_call(self: Arc<Self>, session: Arc<CallSession>, agent: Arc<AgentConfig>) {
        let call_id = session.call_id.clone();
        let transport = Arc::clone(&self.collaborators.transport);

        if let Err(e) = transport.send_answer(&call_id).await {
            error!("call {}: failed to answer: {}", call_id, e);
            self.finish_call(session, None, CallEndReason::Error(e.to_string()))
                .await;
            return;
        }

        // Bounded wait for the media path before ringing turns into a call;
        // end_call/shutdown during negotiation aborts the wait immediately
        let negotiated = tokio::select! {
            _ = session.cancel.cancelled() => {
                let reason = self.take_end_reason(&call_id);
                self.finish_call(session, None, reason).await;
                return;
            }
            result = self.await_media(&call_id) => result,
        };
        match negotiated {
            Ok(true) => {}
            Ok(false) => {
                self.finish_call(session, None, CallEndReason::CallerHangup)
                    .await;
                return;
            }
            Err(e) => {
                let reason = match e {
                    EngineError::SignalingTimeout { .. } => {
                        CallEndReason::Error("signaling_timeout".to_string())
                    }
                    other => CallEndReason::Error(other.to_string()),
                };
                self.finish_call(session, None, reason).await;
                return;
            }
        }
        if let Err(e) = session.transition_to(CallState::Connecting) {
            // end_call raced the negotiation; tear down with its reason
            debug!("call {}: not connecting: {}", call_id, e);
            let reason = self.take_end_reason(&call_id);
            self.finish_call(session, None, reason).await;
            return;
        }

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<EngineError>();
        let mut pipeline: Option<Arc<AudioPipeline>> = None;

        let max_duration = async {
            match self.config.max_call_duration {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(max_duration);

        let end_reason = loop {
            tokio::select! {
                _ = session.cancel.cancelled() => {
                    break self.take_end_reason(&call_id);
                }
                _ = &mut max_duration => {
                    info!("call {}: maximum duration reached", call_id);
                    break CallEndReason::MaxDurationExceeded;
                }
                failure = failure_rx.recv() => {
                    let e = failure.map(|e| e.to_string()).unwrap_or_else(|| {
                        "pipeline failure channel closed".to_string()
                    });
                    break CallEndReason::Error(e);
                }
                event = transport.next_event(&call_id) => {
                    match event {
                        Some(TransportEvent::InboundAudio(frame)) => {
                            if pipeline.is_none() {
                                match self.open_pipeline(&session, &agent, failure_tx.clone()) {
                                    Ok(p) => pipeline = Some(p),
                                    Err(e) => break CallEndReason::Error(e.to_string()),
                                }
                            }
                            if let Some(p) = &pipeline {
                                if let Err(e) = p.handle_frame(frame).await {
                                    error!("call {}: pipeline aborted: {}", call_id, e);
                                    break CallEndReason::Error(e.to_string());
                                }
                            }
                        }
                        Some(TransportEvent::Hangup) => {
                            info!("call {}: caller hung up", call_id);
                            break CallEndReason::CallerHangup;
                        }
                        Some(TransportEvent::TransportError(msg)) => {
                            error!("call {}: transport error: {}", call_id, msg);
                            break CallEndReason::Error(msg);
                        }
                        Some(TransportEvent::MediaNegotiated) => {
                            // Duplicate negotiation notice; already connected
                        }
                        None => {
                            break CallEndReason::Error("transport closed".to_string());
                        }
                    }
                }
            }
        };

        self.finish_call(session, pipeline, end_reason).await;
    }

    /// Wait for `MediaNegotiated` within the signaling timeout
    ///
    /// `Ok(false)` means the caller hung up before the media path came up.
    async fn await_media(&self, call_id: &CallId) -> Result<bool> {
        let transport = &self.collaborators.transport;
        let wait = async {
            loop {
                match transport.next_event(call_id).await {
                    Some(TransportEvent::MediaNegotiated) => return Ok(true),
                    Some(TransportEvent::Hangup) => return Ok(false),
                    Some(TransportEvent::TransportError(msg)) => {
                        return Err(EngineError::transport(msg));
                    }
                    Some(TransportEvent::InboundAudio(_)) => {
                        // Early media before negotiation confirms; skip
                        continue;
                    }
                    None => return Err(EngineError::transport("transport closed")),
                }
            }
        };
        match tokio::time::timeout(self.config.signaling_timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "call {}: media negotiation timed out after {:?}",
                    call_id, self.config.signaling_timeout
                );
                Err(EngineError::SignalingTimeout {
                    seconds: self.config.signaling_timeout.as_secs(),
                })
            }
        }
    }

    /// First inbound audio: the call is in progress, wire up the pipeline
    /// and speak the configured greeting
    fn open_pipeline(
        &self,
        session: &Arc<CallSession>,
        agent: &Arc<AgentConfig>,
        failure_tx: mpsc::UnboundedSender<EngineError>,
    ) -> Result<Arc<AudioPipeline>> {
        session.transition_to(CallState::InProgress)?;
        let pipeline = AudioPipeline::new(
            Arc::clone(session),
            Arc::clone(agent),
            Arc::clone(&self.collaborators.transport),
            Arc::clone(&self.collaborators.stt),
            Arc::clone(&self.collaborators.tts),
            Arc::clone(&self.collaborators.dialogue),
            self.config.clone(),
            failure_tx,
            self.monitor.clone(),
        );
        if let Some(greeting) = &agent.greeting {
            pipeline.speak(greeting);
        }
        Ok(pipeline)
    }

    fn take_end_reason(&self, call_id: &CallId) -> CallEndReason {
        self.end_reasons
            .remove(call_id)
            .map(|(_, reason)| reason)
            .unwrap_or(CallEndReason::Shutdown)
    }

    /// Terminal bookkeeping: state transitions, persistence, experiment
    /// outcome, load release, registry cleanup
    async fn finish_call(
        &self,
        session: Arc<CallSession>,
        pipeline: Option<Arc<AudioPipeline>>,
        end_reason: CallEndReason,
    ) {
        let call_id = session.call_id.clone();
        if let Some(pipeline) = &pipeline {
            pipeline.shutdown();
        }

        let graceful = !matches!(end_reason, CallEndReason::Error(_))
            && session.state() == CallState::InProgress;
        let outcome_state = if graceful {
            // InProgress -> Completing -> Completed; transitions from a
            // non-terminal state cannot fail here
            let _ = session.transition_to(CallState::Completing);
            let _ = session.transition_to(CallState::Completed);
            CallState::Completed
        } else if session.is_terminal() {
            session.state()
        } else {
            let reason = match &end_reason {
                CallEndReason::Error(msg) => msg.clone(),
                other => format!("ended before established: {other}"),
            };
            let _ = session.fail(reason);
            session.state()
        };
        info!("call {}: finished as {} ({})", call_id, outcome_state, end_reason);

        let summary = session.summary(Some(end_reason));
        if let Err(e) = self.collaborators.records.save_call_record(&summary).await {
            // The call outcome stands even when the record doesn't land
            error!("call {}: failed to persist call record: {}", call_id, e);
        }

        if let Some((experiment_id, variant_id)) = &session.variant {
            let completed = outcome_state == CallState::Completed;
            // A conversation with both sides speaking counts as a success
            let success = completed
                && summary.transcript.iter().any(|u| u.speaker == Speaker::Caller)
                && summary.transcript.iter().any(|u| u.speaker == Speaker::Agent);
            if let Err(e) = self.experiments.record_outcome(
                experiment_id,
                variant_id,
                CallOutcome { completed, success },
            ) {
                debug!("call {}: experiment outcome not recorded: {}", call_id, e);
            }
        }

        self.router.release(&session.agent_id);
        self.sessions.remove(&call_id);
        self.by_signal.remove(&session.signal_id);
        self.end_reasons.remove(&call_id);
        self.tasks.remove(&call_id);
    }
}
