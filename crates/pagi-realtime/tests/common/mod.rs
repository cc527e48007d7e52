//! In-memory devices and transport shared by the integration tests.
//!
//! Every fake writes into one [`Ledger`], so a test can assert open handle counts,
//! the exact teardown order and what reached the wire.

#![allow(dead_code)]

use async_trait::async_trait;
use pagi_realtime::{
    AudioFrame, CaptureDevice, CaptureStream, Connection, Connector, DecodedAudio, DeviceError,
    Endpoint, EngineConfig, FrameSender, PlaybackDevice, PlaybackEndedSender, PlaybackId,
    PlaybackOutput, ServerMessage, SessionSetup, SessionSnapshot, SessionStatus, ToolResult,
    Transport, TransportError, TransportEvent, WireAudio,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pagi_realtime=debug")),
        )
        .try_init();
}

#[derive(Default)]
pub struct Ledger {
    pub open_captures: AtomicUsize,
    pub open_outputs: AtomicUsize,
    pub open_connections: AtomicUsize,
    /// Teardown-relevant calls in the order they happened
    pub calls: Mutex<Vec<&'static str>>,
    /// (id, scheduled start, duration)
    pub started: Mutex<Vec<(PlaybackId, f64, f64)>>,
    pub stopped: Mutex<Vec<PlaybackId>>,
    pub clock: Mutex<f64>,
    pub sent_audio: Mutex<Vec<WireAudio>>,
    pub tool_results: Mutex<Vec<ToolResult>>,
    pub fail_sends: AtomicBool,
    /// Sends never resolve, like a socket stuck on back-pressure.
    pub stall_sends: AtomicBool,
    /// Sends currently parked by `stall_sends`
    pub stalled: AtomicUsize,
    frame_tx: Mutex<Option<FrameSender>>,
    ended_tx: Mutex<Option<PlaybackEndedSender>>,
    server_tx: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl Ledger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn open_handles(&self) -> usize {
        self.open_captures.load(Ordering::SeqCst)
            + self.open_outputs.load(Ordering::SeqCst)
            + self.open_connections.load(Ordering::SeqCst)
    }

    pub fn set_clock(&self, seconds: f64) {
        *self.clock.lock() = seconds;
    }

    /// Push a microphone frame as the capture callback would.
    pub fn capture(&self, frame: AudioFrame) -> bool {
        match self.frame_tx.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Report a playback buffer as finished on its own.
    pub fn finish_playback(&self, id: PlaybackId) {
        if let Some(tx) = self.ended_tx.lock().as_ref() {
            let _ = tx.send(id);
        }
    }

    /// Deliver an event from the model side of the live connection.
    pub async fn server_send(&self, event: TransportEvent) {
        let tx = self.server_tx.lock().clone().expect("no live connection");
        tx.send(event).await.expect("session dropped the connection");
    }

    pub async fn server_message(&self, message: ServerMessage) {
        self.server_send(TransportEvent::Message(message)).await;
    }
}

pub struct FakeCapture {
    pub ledger: Arc<Ledger>,
    pub fail: Option<DeviceError>,
    pub sample_rate: u32,
}

impl CaptureDevice for FakeCapture {
    fn open(&self, frames: FrameSender) -> Result<Box<dyn CaptureStream>, DeviceError> {
        if let Some(e) = &self.fail {
            return Err(e.clone());
        }
        self.ledger.open_captures.fetch_add(1, Ordering::SeqCst);
        *self.ledger.frame_tx.lock() = Some(frames);
        Ok(Box::new(FakeCaptureStream {
            ledger: Arc::clone(&self.ledger),
            sample_rate: self.sample_rate,
            closed: false,
        }))
    }
}

struct FakeCaptureStream {
    ledger: Arc<Ledger>,
    sample_rate: u32,
    closed: bool,
}

impl CaptureStream for FakeCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn disconnect(&mut self) {
        self.ledger.record("capture.disconnect");
        *self.ledger.frame_tx.lock() = None;
    }

    fn stop_tracks(&mut self) {
        self.ledger.record("capture.stop_tracks");
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.ledger.record("capture.close");
        if !std::mem::replace(&mut self.closed, true) {
            self.ledger.open_captures.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct FakePlayback {
    pub ledger: Arc<Ledger>,
    pub fail: Option<DeviceError>,
}

impl PlaybackDevice for FakePlayback {
    fn open(
        &self,
        _sample_rate: u32,
        ended: PlaybackEndedSender,
    ) -> Result<Box<dyn PlaybackOutput>, DeviceError> {
        if let Some(e) = &self.fail {
            return Err(e.clone());
        }
        self.ledger.open_outputs.fetch_add(1, Ordering::SeqCst);
        *self.ledger.ended_tx.lock() = Some(ended);
        Ok(Box::new(FakeOutput {
            ledger: Arc::clone(&self.ledger),
            closed: false,
        }))
    }
}

struct FakeOutput {
    ledger: Arc<Ledger>,
    closed: bool,
}

impl PlaybackOutput for FakeOutput {
    fn now(&self) -> f64 {
        *self.ledger.clock.lock()
    }

    fn start(&mut self, id: PlaybackId, audio: &DecodedAudio, at: f64) -> Result<(), DeviceError> {
        self.ledger.started.lock().push((id, at, audio.duration()));
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) -> Result<(), DeviceError> {
        self.ledger.stopped.lock().push(id);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.ledger.record("playback.close");
        if !std::mem::replace(&mut self.closed, true) {
            self.ledger.open_outputs.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct FakeTransport {
    ledger: Arc<Ledger>,
    closed: bool,
}

impl FakeTransport {
    async fn maybe_stall(&self) {
        if self.ledger.stall_sends.load(Ordering::SeqCst) {
            self.ledger.stalled.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_audio(&mut self, audio: WireAudio) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        self.maybe_stall().await;
        if self.ledger.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("socket reset".to_string()));
        }
        self.ledger.sent_audio.lock().push(audio);
        Ok(())
    }

    async fn send_tool_result(&mut self, result: ToolResult) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotConnected);
        }
        self.maybe_stall().await;
        self.ledger.tool_results.lock().push(result);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.ledger.record("transport.close");
        if !std::mem::replace(&mut self.closed, true) {
            self.ledger.open_connections.fetch_sub(1, Ordering::SeqCst);
            *self.ledger.server_tx.lock() = None;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub enum Script {
    Accept,
    Refuse(&'static str),
    /// Wait for the notify, then accept.
    Block(Arc<Notify>),
}

/// Connector whose behaviour is scripted per endpoint name.
pub struct FakeConnector {
    ledger: Arc<Ledger>,
    scripts: Mutex<HashMap<String, Script>>,
    pub attempts: Mutex<Vec<(String, SessionSetup)>>,
}

impl FakeConnector {
    pub fn new(ledger: Arc<Ledger>) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn script(&self, endpoint: &str, script: Script) {
        self.scripts.lock().insert(endpoint.to_string(), script);
    }

    fn open(&self) -> Connection {
        let (tx, events) = mpsc::channel(64);
        *self.ledger.server_tx.lock() = Some(tx);
        self.ledger.open_connections.fetch_add(1, Ordering::SeqCst);
        Connection {
            transport: Box::new(FakeTransport {
                ledger: Arc::clone(&self.ledger),
                closed: false,
            }),
            events,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        setup: &SessionSetup,
    ) -> Result<Connection, TransportError> {
        self.attempts.lock().push((endpoint.name.clone(), setup.clone()));
        let script = self.scripts.lock().get(&endpoint.name).cloned();
        match script {
            Some(Script::Accept) => Ok(self.open()),
            Some(Script::Refuse(reason)) => Err(TransportError::ConnectionFailed(reason.to_string())),
            Some(Script::Block(notify)) => {
                notify.notified().await;
                Ok(self.open())
            }
            None => Err(TransportError::ConnectionFailed("unscripted endpoint".to_string())),
        }
    }
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.primary = Endpoint::new("primary", "wss://primary.test/live");
    config.backup = Some(Endpoint::new("backup", "wss://backup.test/live"));
    config
}

/// Mono PCM16 chunk of `seconds` at `rate`, every sample at `level`.
pub fn speech_chunk(seconds: f64, rate: u32, level: f32) -> ServerMessage {
    let samples = (seconds * rate as f64).round() as usize;
    let value = (level * 32767.0) as i16;
    let data = std::iter::repeat(value.to_le_bytes())
        .take(samples)
        .flatten()
        .collect();
    ServerMessage::Audio {
        data,
        sample_rate: rate,
        channels: 1,
    }
}

pub async fn wait_for_status(
    rx: &mut watch::Receiver<SessionSnapshot>,
    status: SessionStatus,
) -> SessionSnapshot {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.status == status))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", status))
        .expect("session dropped")
        .clone()
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
