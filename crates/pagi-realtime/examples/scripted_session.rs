//! Example: Scripted Voice Session
//!
//! Runs a full session against a scripted model connection. The primary endpoint is
//! down, so the session fails over to the backup, which then plays one canned turn:
//! a user question, a tool call, spoken audio and turn completion.
//!
//! ```bash
//! RUST_LOG=pagi_realtime=debug cargo run -p pagi-realtime --example scripted_session
//! # real microphone and speakers:
//! PAGI_REALTIME_NATIVE=1 cargo run -p pagi-realtime --features native-audio --example scripted_session
//! ```

use async_trait::async_trait;
use pagi_realtime::tools::WEB_SEARCH;
use pagi_realtime::{
    tool_fn, AudioFrame, CaptureDevice, CaptureStream, Connection, Connector, DecodedAudio,
    DeviceError, Endpoint, EngineConfig, FrameSender, PlaybackDevice, PlaybackEndedSender,
    PlaybackId, PlaybackOutput, ServerMessage, SessionEvent, SessionSetup, ToolCall, ToolRegistry,
    ToolRequest, ToolResult, Transport, TransportError, TransportEvent, VoiceSession, WireAudio,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const MIC_RATE: u32 = 48_000;
const MODEL_RATE: u32 = 24_000;

/// Quiet 220 Hz tone standing in for a microphone.
struct ToneCapture;

struct ToneStream {
    attached: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureDevice for ToneCapture {
    fn open(&self, frames: FrameSender) -> Result<Box<dyn CaptureStream>, DeviceError> {
        let attached = Arc::new(AtomicBool::new(true));
        let running = Arc::new(AtomicBool::new(true));
        let (a, r) = (Arc::clone(&attached), Arc::clone(&running));
        let thread = thread::spawn(move || {
            let frame_len = (MIC_RATE / 10) as usize;
            let mut phase = 0.0f32;
            while r.load(Ordering::SeqCst) {
                let samples = (0..frame_len)
                    .map(|_| {
                        phase += 220.0 * std::f32::consts::TAU / MIC_RATE as f32;
                        phase.sin() * 0.05
                    })
                    .collect();
                if a.load(Ordering::SeqCst) {
                    let _ = frames.send(AudioFrame {
                        samples,
                        source_sample_rate: MIC_RATE,
                    });
                }
                thread::sleep(Duration::from_millis(100));
            }
        });
        Ok(Box::new(ToneStream {
            attached,
            running,
            thread: Some(thread),
        }))
    }
}

impl CaptureStream for ToneStream {
    fn sample_rate(&self) -> u32 {
        MIC_RATE
    }

    fn disconnect(&mut self) {
        self.attached.store(false, Ordering::SeqCst);
    }

    fn stop_tracks(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| DeviceError::Other("tone thread panicked".to_string()))?;
        }
        Ok(())
    }
}

/// Output that only keeps time and reports buffers as they would finish.
struct TimedPlayback;

struct TimedOutput {
    epoch: Instant,
    ended: PlaybackEndedSender,
    cancelled: Arc<Mutex<HashSet<PlaybackId>>>,
}

impl PlaybackDevice for TimedPlayback {
    fn open(
        &self,
        _sample_rate: u32,
        ended: PlaybackEndedSender,
    ) -> Result<Box<dyn PlaybackOutput>, DeviceError> {
        Ok(Box::new(TimedOutput {
            epoch: Instant::now(),
            ended,
            cancelled: Arc::new(Mutex::new(HashSet::new())),
        }))
    }
}

impl PlaybackOutput for TimedOutput {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn start(&mut self, id: PlaybackId, audio: &DecodedAudio, at: f64) -> Result<(), DeviceError> {
        let finish = Duration::from_secs_f64((at - self.now()).max(0.0) + audio.duration());
        let ended = self.ended.clone();
        let cancelled = Arc::clone(&self.cancelled);
        info!("🔊 Buffer {} plays at {:.2}s for {:.2}s", id, at, audio.duration());
        tokio::spawn(async move {
            tokio::time::sleep(finish).await;
            if !cancelled.lock().remove(&id) {
                let _ = ended.send(id);
            }
        });
        Ok(())
    }

    fn stop(&mut self, id: PlaybackId) -> Result<(), DeviceError> {
        self.cancelled.lock().insert(id);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

struct ScriptedTransport {
    audio_bytes: usize,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send_audio(&mut self, audio: WireAudio) -> Result<(), TransportError> {
        self.audio_bytes += audio.data.len();
        debug!("📤 {} bytes of {} ({} total)", audio.data.len(), audio.mime_type, self.audio_bytes);
        Ok(())
    }

    async fn send_tool_result(&mut self, result: ToolResult) -> Result<(), TransportError> {
        info!("📤 Tool result {}: {}", result.correlation_id, result.payload);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        info!("📴 Scripted connection closed after {} audio bytes", self.audio_bytes);
        Ok(())
    }
}

/// Refuses `fail://` endpoints and plays a canned turn on anything else.
struct ScriptedConnector;

fn tone_chunk(seconds: f64) -> ServerMessage {
    let samples = (seconds * MODEL_RATE as f64) as usize;
    let data = (0..samples)
        .flat_map(|i| {
            let t = i as f32 / MODEL_RATE as f32;
            let v = ((t * 330.0 * std::f32::consts::TAU).sin() * 0.2 * 32767.0) as i16;
            v.to_le_bytes()
        })
        .collect();
    ServerMessage::Audio {
        data,
        sample_rate: MODEL_RATE,
        channels: 1,
    }
}

async fn play_script(events: mpsc::Sender<TransportEvent>) {
    let script = vec![
        ServerMessage::InputTranscript("what's new ".to_string()),
        ServerMessage::InputTranscript("in rust".to_string()),
        ServerMessage::ToolCall(ToolCall::from_json_arguments(
            "call-1",
            WEB_SEARCH,
            r#"{"query":"rust release notes"}"#,
        )),
        ServerMessage::OutputTranscript("A new Rust release ".to_string()),
        tone_chunk(0.5),
        ServerMessage::OutputTranscript("shipped this week.".to_string()),
        tone_chunk(0.3),
        ServerMessage::TurnComplete,
    ];
    for message in script {
        tokio::time::sleep(Duration::from_millis(150)).await;
        if events.send(TransportEvent::Message(message)).await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        setup: &SessionSetup,
    ) -> Result<Connection, TransportError> {
        if endpoint.url.starts_with("fail://") {
            return Err(TransportError::ConnectionFailed(format!(
                "{} is unreachable",
                endpoint.url
            )));
        }
        info!(
            "🤝 Negotiated {} Hz in / {} Hz out with {} tool(s)",
            setup.input_sample_rate,
            setup.output_sample_rate,
            setup.tool_declarations.len()
        );
        let (tx, events) = mpsc::channel(32);
        tokio::spawn(play_script(tx));
        Ok(Connection {
            transport: Box::new(ScriptedTransport { audio_bytes: 0 }),
            events,
        })
    }
}

fn load_config() -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let path = EngineConfig::default_path();
    if path.exists() {
        return Ok(EngineConfig::load_from_path(&path)?);
    }
    let mut config = EngineConfig::default();
    config.primary = Endpoint::new("primary", "fail://primary.voice.example");
    config.backup = Some(Endpoint::new("backup", "scripted://backup.voice.example"));
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "native-audio")]
fn native_devices() -> Option<(Arc<dyn CaptureDevice>, Arc<dyn PlaybackDevice>)> {
    std::env::var("PAGI_REALTIME_NATIVE").ok()?;
    info!("🎧 Using native microphone and speakers");
    Some((
        Arc::new(pagi_realtime::CpalCaptureDevice::default()),
        Arc::new(pagi_realtime::RodioPlaybackDevice),
    ))
}

#[cfg(not(feature = "native-audio"))]
fn native_devices() -> Option<(Arc<dyn CaptureDevice>, Arc<dyn PlaybackDevice>)> {
    None
}

fn devices() -> (Arc<dyn CaptureDevice>, Arc<dyn PlaybackDevice>) {
    native_devices().unwrap_or_else(|| (Arc::new(ToneCapture), Arc::new(TimedPlayback)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🎙️ PAGI Realtime scripted session");

    let config = load_config()?;
    let mut tools = ToolRegistry::new();
    tools.register(tool_fn(WEB_SEARCH, |req| async move {
        match req {
            ToolRequest::WebSearch(args) => Ok(format!("3 results for '{}'", args.query)),
            other => Ok(format!("unexpected request {:?}", other)),
        }
    }));
    pagi_realtime::tools::register_webhook_tools(&mut tools, &config.tools)?;

    let (capture, playback) = devices();
    let session = VoiceSession::new(config, capture, playback, Arc::new(ScriptedConnector), Arc::new(tools));
    let mut events = session
        .take_event_receiver()
        .ok_or("event receiver already taken")?;

    session.start().await?;

    let run = async {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::FailedOver { primary_error, endpoint } => {
                    warn!("🔁 Failed over to '{}': {}", endpoint, primary_error);
                }
                SessionEvent::TranscriptUpdated { input, output } => {
                    info!("📝 user: {:?} | assistant: {:?}", input, output);
                }
                SessionEvent::SpeakingChanged(speaking) => {
                    info!("🗣️ Assistant speaking: {}", speaking);
                }
                SessionEvent::ToolResolved(result) => {
                    info!("🔧 {} → {}", result.name, result.payload);
                }
                SessionEvent::TurnCompleted(turn) => {
                    info!("✅ Turn completed at {}", turn.timestamp);
                    info!("   User: {}", turn.input_transcript);
                    info!("   Assistant: {}", turn.output_transcript);
                    // Let the last buffer finish and settle.
                    tokio::time::sleep(Duration::from_millis(1200)).await;
                    break;
                }
                SessionEvent::Error(message) => {
                    warn!("Session error: {}", message);
                    break;
                }
                other => debug!("{:?}", other),
            }
        }
    };

    tokio::select! {
        _ = run => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    session.stop().await;
    info!("👋 Session stopped ({})", session.status());
    Ok(())
}
