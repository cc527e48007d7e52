//! Voice Session - lifecycle of one live conversation
//!
//! `start()` acquires the microphone and the output context, opens a model
//! connection through the failover connector and spawns the run loop. The run loop
//! is the only task that touches the playback scheduler and the turn tracker; the
//! caller observes it through a snapshot watch and an event channel.
//!
//! Teardown always runs the same steps in the same order, whichever path got us
//! there: close transport, disconnect capture, stop microphone tracks, close capture
//! context, close playback context, cancel playback buffers, clear the turn, publish
//! the final status.

use crate::codec::{decode_pcm16, AudioFrame, FrameEncoder};
use crate::config::EngineConfig;
use crate::devices::{CaptureDevice, CaptureStream, PlaybackDevice, PlaybackId, PlaybackOutput};
use crate::error::{DeviceError, RealtimeResult, SessionError};
use crate::failover::FailoverConnector;
use crate::outbound::{Delivery, Outbound};
use crate::playback::{EndedOutcome, PlaybackScheduler};
use crate::tools::{dispatch, ToolCall, ToolRegistry, ToolResult};
use crate::transport::{Connector, EndpointRole, ServerMessage, TransportEvent};
use crate::turn::{BargeIn, CompletedTurn, TurnTracker};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle status of the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Idle,
    Connecting,
    Active,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Error => write!(f, "error"),
        }
    }
}

/// The endpoint a live session is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveEndpoint {
    pub role: EndpointRole,
    pub name: String,
}

/// Everything a UI needs to render the session, published on every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub status: SessionStatus,
    pub endpoint: Option<ActiveEndpoint>,
    pub input_transcript: String,
    pub output_transcript: String,
    pub speaking: bool,
    pub error: Option<String>,
}

/// Events emitted by the session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(SessionStatus),
    TranscriptUpdated { input: String, output: String },
    TurnCompleted(CompletedTurn),
    SpeakingChanged(bool),
    /// User speech cut the assistant off.
    BargeIn { cancelled_buffers: usize },
    /// The primary endpoint failed and the backup took over.
    FailedOver { primary_error: String, endpoint: String },
    ToolResolved(ToolResult),
    Error(String),
}

/// Snapshot publisher and event sink shared by the handle and the run loop.
struct Shared {
    snapshot: watch::Sender<SessionSnapshot>,
    events: Mutex<EventSink>,
}

#[derive(Default)]
struct EventSink {
    taken: bool,
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Shared {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        Self {
            snapshot,
            events: Mutex::new(EventSink::default()),
        }
    }

    fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    fn emit(&self, event: SessionEvent) {
        let mut sink = self.events.lock();
        if let Some(tx) = &sink.tx {
            if tx.send(event).is_err() {
                debug!("event receiver dropped");
                sink.tx = None;
            }
        }
    }

    fn update<F: FnOnce(&mut SessionSnapshot)>(&self, f: F) {
        self.snapshot.send_modify(f);
    }

    fn set_status(&self, status: SessionStatus) {
        let changed = self.snapshot.send_if_modified(|s| {
            if s.status == status {
                return false;
            }
            s.status = status;
            true
        });
        if changed {
            info!("📶 Session status: {}", status);
            self.emit(SessionEvent::StatusChanged(status));
        }
    }

    fn begin(&self, session_id: Uuid) {
        self.update(|s| {
            *s = SessionSnapshot {
                session_id: Some(session_id),
                ..SessionSnapshot::default()
            }
        });
        self.set_status(SessionStatus::Connecting);
    }

    fn fail(&self, message: String) {
        error!("❌ Session error: {}", message);
        self.update(|s| {
            s.error = Some(message.clone());
            s.endpoint = None;
            s.input_transcript.clear();
            s.output_transcript.clear();
            s.speaking = false;
        });
        self.emit(SessionEvent::Error(message));
        self.set_status(SessionStatus::Error);
    }

    fn reset_idle(&self) {
        let previous = self.status();
        self.update(|s| *s = SessionSnapshot::default());
        if previous != SessionStatus::Idle {
            info!("📶 Session status: {}", SessionStatus::Idle);
            self.emit(SessionEvent::StatusChanged(SessionStatus::Idle));
        }
    }
}

/// Device handles held from acquisition until teardown.
struct Devices {
    capture: Box<dyn CaptureStream>,
    output: Box<dyn PlaybackOutput>,
    frames: mpsc::UnboundedReceiver<AudioFrame>,
    ended: mpsc::UnboundedReceiver<PlaybackId>,
}

impl Devices {
    /// Teardown steps 2 to 5. Every step runs even if an earlier one fails.
    fn release(&mut self) {
        self.capture.disconnect();
        self.capture.stop_tracks();
        if let Err(e) = self.capture.close() {
            warn!("Failed to close capture context: {}", e);
        }
        if let Err(e) = self.output.close() {
            warn!("Failed to close playback context: {}", e);
        }
    }
}

struct ActiveSession {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

enum Phase {
    Idle,
    Connecting { id: Uuid, devices: Devices },
    Active(ActiveSession),
}

/// A caller-owned conversational session.
///
/// One instance drives at most one live session at a time. `start()` and `stop()`
/// serialize on an internal lock that is never held across the connect.
pub struct VoiceSession {
    config: EngineConfig,
    capture: Arc<dyn CaptureDevice>,
    playback: Arc<dyn PlaybackDevice>,
    failover: FailoverConnector,
    tools: Arc<ToolRegistry>,
    control: tokio::sync::Mutex<Phase>,
    shared: Arc<Shared>,
}

impl VoiceSession {
    pub fn new(
        config: EngineConfig,
        capture: Arc<dyn CaptureDevice>,
        playback: Arc<dyn PlaybackDevice>,
        connector: Arc<dyn Connector>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        let failover = FailoverConnector::new(
            connector,
            config.primary.clone(),
            config.backup.clone(),
            config.connection.connect_timeout(),
        );
        info!("🎭 Voice session ready ({} tool(s) registered)", tools.len());
        Self {
            config,
            capture,
            playback,
            failover,
            tools,
            control: tokio::sync::Mutex::new(Phase::Idle),
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Watch the session snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.snapshot.subscribe()
    }

    /// Take the event receiver. Only the first call returns it; events emitted before
    /// it is taken are not buffered.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        let mut sink = self.shared.events.lock();
        if sink.taken {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        sink.taken = true;
        sink.tx = Some(tx);
        Some(rx)
    }

    /// Start a session.
    pub async fn start(&self) -> RealtimeResult<()> {
        let session_id = {
            let mut phase = self.control.lock().await;
            let status = self.shared.status();
            if !matches!(status, SessionStatus::Idle | SessionStatus::Error) {
                return Err(SessionError::InvalidState(status));
            }
            // A run loop that ended on its own has already torn down; reap it.
            if let Phase::Active(previous) = std::mem::replace(&mut *phase, Phase::Idle) {
                if let Err(e) = previous.task.await {
                    warn!("Previous session task ended abnormally: {}", e);
                }
            }

            let session_id = Uuid::new_v4();
            info!("🚀 Starting voice session {}", session_id);
            self.shared.begin(session_id);

            let devices = match self.open_devices() {
                Ok(devices) => devices,
                Err(e) => {
                    self.shared.fail(e.to_string());
                    return Err(e.into());
                }
            };
            *phase = Phase::Connecting {
                id: session_id,
                devices,
            };
            session_id
        };

        let setup = self.config.session_setup(self.tools.declarations());
        let connected = self.failover.connect(&setup).await;

        let mut phase = self.control.lock().await;
        let devices = match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Connecting { id, devices } if id == session_id => devices,
            other => {
                // stop() ran while we were connecting (and perhaps a new start after it).
                *phase = other;
                if let Ok(mut outcome) = connected {
                    if let Err(e) = outcome.connection.transport.close().await {
                        warn!("Failed to close superseded connection: {}", e);
                    }
                }
                info!("Session {} was stopped while connecting", session_id);
                return Err(SessionError::Cancelled);
            }
        };

        let outcome = match connected {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut devices = devices;
                devices.release();
                self.shared.fail(e.to_string());
                return Err(e.into());
            }
        };

        if let Some(primary_error) = &outcome.primary_failure {
            self.shared.emit(SessionEvent::FailedOver {
                primary_error: primary_error.clone(),
                endpoint: outcome.endpoint.clone(),
            });
        }

        let endpoint = ActiveEndpoint {
            role: outcome.role,
            name: outcome.endpoint.clone(),
        };
        self.shared.update(|s| s.endpoint = Some(endpoint));
        self.shared.set_status(SessionStatus::Active);

        let (stop_tx, stop_rx) = oneshot::channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let run_loop = RunLoop {
            session_id,
            shared: Arc::clone(&self.shared),
            outbound: Outbound::spawn(outcome.connection.transport),
            events: outcome.connection.events,
            close_timeout: self.config.connection.connect_timeout(),
            devices,
            encoder: FrameEncoder::new(self.config.audio.wire_sample_rate),
            scheduler: PlaybackScheduler::new(),
            turns: TurnTracker::new(self.config.barge_in.clone()),
            settle_delay: self.config.playback.settle_delay(),
            playback_channels: self.config.playback.channels,
            tools: Arc::clone(&self.tools),
            tool_tx,
            tool_rx,
            pending_tools: HashSet::new(),
            settle_at: None,
        };
        let task = tokio::spawn(run_loop.run(stop_rx));
        *phase = Phase::Active(ActiveSession { stop_tx, task });

        info!(
            "✅ Voice session {} active on {} endpoint '{}'",
            session_id, outcome.role, outcome.endpoint
        );
        Ok(())
    }

    /// Stop the session from any state. Idempotent; always ends `Idle`.
    pub async fn stop(&self) {
        let mut phase = self.control.lock().await;
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Connecting { id, mut devices } => {
                info!("🛑 Stopping session {} while connecting", id);
                devices.release();
            }
            Phase::Active(active) => {
                info!("🛑 Stopping voice session");
                // Fails only if the loop already exited on its own.
                let _ = active.stop_tx.send(());
                if let Err(e) = active.task.await {
                    warn!("Session task ended abnormally: {}", e);
                }
            }
        }
        self.shared.reset_idle();
    }

    fn open_devices(&self) -> Result<Devices, DeviceError> {
        let (frame_tx, frames) = mpsc::unbounded_channel();
        let mut capture = self.capture.open(frame_tx)?;

        let (ended_tx, ended) = mpsc::unbounded_channel();
        let output = match self.playback.open(self.config.playback.sample_rate, ended_tx) {
            Ok(output) => output,
            Err(e) => {
                capture.disconnect();
                capture.stop_tracks();
                if let Err(close_err) = capture.close() {
                    warn!("Failed to close capture context: {}", close_err);
                }
                return Err(e);
            }
        };

        debug!(capture_rate = capture.sample_rate(), "🎤 Audio devices acquired");
        Ok(Devices {
            capture,
            output,
            frames,
            ended,
        })
    }
}

/// A finished tool call, tagged with the session that issued it.
struct ToolCompletion {
    session_id: Uuid,
    result: ToolResult,
}

enum Exit {
    Stopped,
    Failed(String),
}

struct RunLoop {
    session_id: Uuid,
    shared: Arc<Shared>,

    // Connection
    outbound: Outbound,
    events: mpsc::Receiver<TransportEvent>,
    close_timeout: Duration,

    // Audio
    devices: Devices,
    encoder: FrameEncoder,
    scheduler: PlaybackScheduler,
    settle_delay: Duration,
    settle_at: Option<Instant>,
    playback_channels: u16,

    // Conversation
    turns: TurnTracker,
    tools: Arc<ToolRegistry>,
    tool_tx: mpsc::UnboundedSender<ToolCompletion>,
    tool_rx: mpsc::UnboundedReceiver<ToolCompletion>,
    pending_tools: HashSet<String>,
}

impl RunLoop {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        info!("🔄 Session run loop started");

        let exit = loop {
            let settle_deadline = self.settle_at.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                _ = &mut stop_rx => break Exit::Stopped,

                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Some(exit) = self.on_transport_event(event) {
                            break exit;
                        }
                    }
                    None => break Exit::Failed("Connection event stream ended".to_string()),
                },

                Some(id) = self.devices.ended.recv() => self.on_playback_ended(id),

                _ = tokio::time::sleep_until(settle_deadline), if self.settle_at.is_some() => {
                    self.on_settle();
                }

                Some(delivery) = self.outbound.delivery() => match delivery {
                    Delivery::ToolResult(result) => {
                        self.shared.emit(SessionEvent::ToolResolved(result));
                    }
                    Delivery::Failed(message) => break Exit::Failed(message),
                },

                Some(done) = self.tool_rx.recv() => self.on_tool_completed(done),

                frame = self.devices.frames.recv() => match frame {
                    Some(frame) => self.on_capture_frame(frame),
                    None => break Exit::Failed("Microphone capture ended".to_string()),
                },
            }
        };

        self.shutdown().await;

        match exit {
            Exit::Stopped => info!("🛑 Session run loop stopped"),
            Exit::Failed(message) => self.shared.fail(message),
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Option<Exit> {
        match event {
            TransportEvent::Message(message) => {
                self.on_server_message(message);
                None
            }
            TransportEvent::Error(message) => Some(Exit::Failed(format!("Transport error: {}", message))),
            TransportEvent::Closed { reason } => Some(Exit::Failed(format!(
                "Connection closed by remote: {}",
                reason.as_deref().unwrap_or("no reason given")
            ))),
        }
    }

    fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::InputTranscript(text) => {
                let playing = self.scheduler.active_count() > 0;
                if let BargeIn::Interrupt { .. } = self.turns.push_input(&text, playing) {
                    self.cancel_playback();
                }
                self.publish_transcripts();
            }
            ServerMessage::OutputTranscript(text) => {
                self.turns.push_output(&text);
                self.publish_transcripts();
            }
            ServerMessage::Audio {
                data,
                sample_rate,
                channels,
            } => self.on_audio(&data, sample_rate, channels),
            ServerMessage::ToolCall(call) => self.on_tool_call(call),
            ServerMessage::TurnComplete => {
                let turn = self.turns.complete();
                self.publish_transcripts();
                self.shared.emit(SessionEvent::TurnCompleted(turn));
            }
            ServerMessage::Interrupted => {
                let playing = self.scheduler.active_count() > 0;
                if self.turns.model_interrupted(playing) {
                    self.cancel_playback();
                }
            }
        }
    }

    fn on_audio(&mut self, data: &[u8], sample_rate: u32, channels: u16) {
        let channels = if channels == 0 {
            self.playback_channels
        } else {
            channels
        };
        let audio = match decode_pcm16(data, sample_rate, channels) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("Dropping undecodable audio chunk ({} bytes): {}", data.len(), e);
                return;
            }
        };
        if audio.frames() == 0 {
            return;
        }

        match self.scheduler.schedule(self.devices.output.as_mut(), &audio) {
            Ok(_) => {
                self.settle_at = None;
                self.sync_speaking();
            }
            Err(e) => warn!("Failed to schedule playback: {}", e),
        }
    }

    fn on_tool_call(&mut self, call: ToolCall) {
        if !self.pending_tools.insert(call.correlation_id.clone()) {
            warn!(
                correlation_id = %call.correlation_id,
                "Ignoring duplicate tool call already in flight"
            );
            return;
        }
        info!("🔧 Tool call: {} ({})", call.name, call.correlation_id);

        let tools = Arc::clone(&self.tools);
        let tx = self.tool_tx.clone();
        let session_id = self.session_id;
        tokio::spawn(async move {
            let result = dispatch(call, &tools).await;
            // The run loop may be gone; late results are dropped.
            let _ = tx.send(ToolCompletion { session_id, result });
        });
    }

    fn on_tool_completed(&mut self, done: ToolCompletion) {
        if done.session_id != self.session_id {
            debug!("Discarding tool result from session {}", done.session_id);
            return;
        }
        if !self.pending_tools.remove(&done.result.correlation_id) {
            warn!(
                correlation_id = %done.result.correlation_id,
                "Discarding tool result with no pending call"
            );
            return;
        }
        self.outbound.send_tool_result(done.result);
    }

    fn on_capture_frame(&mut self, frame: AudioFrame) {
        if frame.samples.is_empty() {
            return;
        }
        self.outbound.send_audio(self.encoder.encode(&frame));
    }

    fn on_playback_ended(&mut self, id: PlaybackId) {
        if self.scheduler.finished(id) == EndedOutcome::Drained {
            self.settle_at = Some(Instant::now() + self.settle_delay);
        }
    }

    fn on_settle(&mut self) {
        self.settle_at = None;
        if self.scheduler.settle() {
            debug!("🔇 Assistant finished speaking");
            self.sync_speaking();
        }
    }

    fn cancel_playback(&mut self) {
        let cancelled = self.scheduler.cancel_all(self.devices.output.as_mut());
        self.settle_at = None;
        self.shared.emit(SessionEvent::BargeIn {
            cancelled_buffers: cancelled,
        });
        self.sync_speaking();
    }

    fn sync_speaking(&self) {
        let speaking = self.scheduler.is_speaking();
        let changed = self.shared.snapshot.send_if_modified(|s| {
            if s.speaking == speaking {
                return false;
            }
            s.speaking = speaking;
            true
        });
        if changed {
            self.shared.emit(SessionEvent::SpeakingChanged(speaking));
        }
    }

    fn publish_transcripts(&self) {
        let input = self.turns.input_transcript().to_string();
        let output = self.turns.output_transcript().to_string();
        self.shared.update(|s| {
            s.input_transcript = input.clone();
            s.output_transcript = output.clone();
        });
        self.shared
            .emit(SessionEvent::TranscriptUpdated { input, output });
    }

    /// Fixed-order teardown. Status is published by the caller.
    async fn shutdown(&mut self) {
        // 1. transport, abandoning any send still in flight
        self.outbound.close(self.close_timeout).await;
        // 2-5. capture processing, microphone tracks, capture context, playback context
        self.devices.release();
        // 6. in-flight playback
        self.scheduler.cancel_all(self.devices.output.as_mut());
        self.settle_at = None;
        // 7. turn state
        self.turns.reset();
        self.pending_tools.clear();
        self.sync_speaking();
        info!("🧹 Session {} torn down", self.session_id);
    }
}
