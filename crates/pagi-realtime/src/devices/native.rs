//! Audio capture and playback using CPAL and Rodio
//!
//! cpal and rodio streams are not `Send`, so each handle owns a dedicated thread that
//! keeps the stream alive and takes commands over a std channel. The session only
//! ever holds the `Send` side.

use super::{
    classify_device_message, CaptureDevice, CaptureStream, FrameSender, PlaybackDevice,
    PlaybackEndedSender, PlaybackId, PlaybackOutput,
};
use crate::codec::{AudioFrame, DecodedAudio};
use crate::error::DeviceError;
use crate::resample::{downmix_to_mono, resample};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStream, Sink, Source};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Samples per delivered frame (≈85ms at 48kHz).
const DEFAULT_FRAME_SIZE: usize = 4096;

fn build_stream_error(err: cpal::BuildStreamError) -> DeviceError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            DeviceError::NotFound("input device no longer available".to_string())
        }
        other => classify_device_message(other.to_string()),
    }
}

fn default_config_error(err: cpal::DefaultStreamConfigError) -> DeviceError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            DeviceError::NotFound("input device no longer available".to_string())
        }
        other => classify_device_message(other.to_string()),
    }
}

fn play_stream_error(err: cpal::PlayStreamError) -> DeviceError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            DeviceError::Busy("input device could not be started".to_string())
        }
        other => classify_device_message(other.to_string()),
    }
}

/// Microphone capture on the default cpal input device.
#[derive(Debug, Clone)]
pub struct CpalCaptureDevice {
    frame_size: usize,
}

impl CpalCaptureDevice {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
        }
    }

    /// List available input devices
    pub fn list_input_devices() -> Result<Vec<String>, DeviceError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| classify_device_message(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Default for CpalCaptureDevice {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_SIZE)
    }
}

enum CaptureCommand {
    Pause,
    Close,
}

/// Build and start the input stream. Frames are downmixed to mono and accumulated to
/// `frame_size` before being sent.
fn build_capture_stream(
    frames: FrameSender,
    attached: Arc<AtomicBool>,
    frame_size: usize,
) -> Result<(Stream, u32), DeviceError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| DeviceError::NotFound("No input device available".to_string()))?;

    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let config = device.default_input_config().map_err(default_config_error)?;
    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let stream_config: StreamConfig = config.clone().into();

    let mut pending: Vec<f32> = Vec::with_capacity(frame_size);
    let mut push = move |interleaved: &[f32]| {
        if !attached.load(Ordering::Acquire) {
            return;
        }
        pending.extend(downmix_to_mono(interleaved, channels));
        while pending.len() >= frame_size {
            let samples: Vec<f32> = pending.drain(..frame_size).collect();
            let frame = AudioFrame {
                samples,
                source_sample_rate: sample_rate,
            };
            if frames.send(frame).is_err() {
                debug!("capture receiver dropped; discarding frame");
                pending.clear();
                return;
            }
        }
    };

    let stream = match config.sample_format() {
        SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| push(data),
                move |err| warn!("Audio stream error: {}", err),
                None,
            )
            .map_err(build_stream_error)?,
        SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    push(&converted)
                },
                move |err| warn!("Audio stream error: {}", err),
                None,
            )
            .map_err(build_stream_error)?,
        other => {
            return Err(DeviceError::Other(format!(
                "Unsupported sample format {:?} (need F32 or I16)",
                other
            )))
        }
    };

    stream.play().map_err(play_stream_error)?;
    Ok((stream, sample_rate))
}

impl CaptureDevice for CpalCaptureDevice {
    fn open(&self, frames: FrameSender) -> Result<Box<dyn CaptureStream>, DeviceError> {
        info!("🎤 Opening microphone");

        let attached = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, DeviceError>>();
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<CaptureCommand>();
        let frame_size = self.frame_size;
        let thread_attached = Arc::clone(&attached);

        let handle = thread::Builder::new()
            .name("pagi-capture".to_string())
            .spawn(move || {
                let stream = match build_capture_stream(frames, thread_attached, frame_size) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(cmd) = cmd_rx.recv() {
                    match cmd {
                        CaptureCommand::Pause => {
                            if let Err(e) = stream.pause() {
                                warn!("Failed to pause capture stream: {}", e);
                            }
                        }
                        CaptureCommand::Close => break,
                    }
                }
                drop(stream);
            })
            .map_err(|e| DeviceError::Other(format!("capture thread: {}", e)))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| DeviceError::Other("capture thread exited before start".to_string()))??;

        info!("✅ Audio capture started ({}Hz)", sample_rate);

        Ok(Box::new(CpalCaptureStream {
            sample_rate,
            attached,
            commands: Some(cmd_tx),
            thread: Some(handle),
        }))
    }
}

struct CpalCaptureStream {
    sample_rate: u32,
    attached: Arc<AtomicBool>,
    commands: Option<std_mpsc::Sender<CaptureCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureStream for CpalCaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn disconnect(&mut self) {
        self.attached.store(false, Ordering::Release);
    }

    fn stop_tracks(&mut self) {
        if let Some(tx) = &self.commands {
            let _ = tx.send(CaptureCommand::Pause);
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(CaptureCommand::Close);
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| DeviceError::Other("capture thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(CaptureCommand::Close);
        }
    }
}

/// Speaker output on the default rodio device, one `Sink` per scheduled buffer.
#[derive(Debug, Clone, Default)]
pub struct RodioPlaybackDevice;

enum PlaybackCommand {
    Start {
        id: PlaybackId,
        samples: Vec<f32>,
        channels: u16,
        sample_rate: u32,
        delay: Duration,
    },
    Stop(PlaybackId),
    Close,
}

fn stream_error(err: rodio::StreamError) -> DeviceError {
    match err {
        rodio::StreamError::NoDevice => {
            DeviceError::NotFound("No output device available".to_string())
        }
        other => classify_device_message(other.to_string()),
    }
}

fn run_playback_thread(
    ready: std_mpsc::Sender<Result<(), DeviceError>>,
    commands: std_mpsc::Receiver<PlaybackCommand>,
    ended: PlaybackEndedSender,
) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(stream_error(e)));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut sinks: HashMap<PlaybackId, Sink> = HashMap::new();
    while let Ok(cmd) = commands.recv() {
        sinks.retain(|_, sink| !sink.empty());
        match cmd {
            PlaybackCommand::Start {
                id,
                samples,
                channels,
                sample_rate,
                delay,
            } => match Sink::try_new(&handle) {
                Ok(sink) => {
                    sink.append(SamplesBuffer::new(channels, sample_rate, samples).delay(delay));
                    let ended = ended.clone();
                    sink.append(EmptyCallback::<f32>::new(Box::new(move || {
                        let _ = ended.send(id);
                    })));
                    sinks.insert(id, sink);
                }
                Err(e) => warn!(playback_id = id, "Failed to create sink: {}", e),
            },
            PlaybackCommand::Stop(id) => {
                if let Some(sink) = sinks.remove(&id) {
                    sink.stop();
                }
            }
            PlaybackCommand::Close => break,
        }
    }

    for (_, sink) in sinks.drain() {
        sink.stop();
    }
    info!("⏹️ Audio playback closed");
}

impl PlaybackDevice for RodioPlaybackDevice {
    fn open(
        &self,
        sample_rate: u32,
        ended: PlaybackEndedSender,
    ) -> Result<Box<dyn PlaybackOutput>, DeviceError> {
        info!("🔊 Initializing audio playback ({}Hz)", sample_rate);

        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let handle = thread::Builder::new()
            .name("pagi-playback".to_string())
            .spawn(move || run_playback_thread(ready_tx, cmd_rx, ended))
            .map_err(|e| DeviceError::Other(format!("playback thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| DeviceError::Other("playback thread exited before start".to_string()))??;

        info!("✅ Audio playback initialized");

        Ok(Box::new(RodioPlaybackOutput {
            sample_rate,
            epoch: Instant::now(),
            commands: Some(cmd_tx),
            thread: Some(handle),
        }))
    }
}

/// Interleaved samples at the context rate. Chunks at another rate are resampled per
/// channel so every buffer on this output runs at one clock rate.
fn conform_to_rate(audio: &DecodedAudio, context_rate: u32) -> Vec<f32> {
    if audio.sample_rate == context_rate {
        return audio.interleaved();
    }
    debug!(
        "Resampling playback chunk {}Hz -> {}Hz",
        audio.sample_rate, context_rate
    );
    DecodedAudio {
        channels: audio
            .channels
            .iter()
            .map(|ch| resample(ch, audio.sample_rate, context_rate))
            .collect(),
        sample_rate: context_rate,
    }
    .interleaved()
}

struct RodioPlaybackOutput {
    sample_rate: u32,
    epoch: Instant,
    commands: Option<std_mpsc::Sender<PlaybackCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RodioPlaybackOutput {
    fn send(&self, cmd: PlaybackCommand) -> Result<(), DeviceError> {
        self.commands
            .as_ref()
            .ok_or_else(|| DeviceError::Other("playback context closed".to_string()))?
            .send(cmd)
            .map_err(|_| DeviceError::Other("playback thread stopped".to_string()))
    }
}

impl PlaybackOutput for RodioPlaybackOutput {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn start(&mut self, id: PlaybackId, audio: &DecodedAudio, at: f64) -> Result<(), DeviceError> {
        let delay = Duration::from_secs_f64((at - self.now()).max(0.0));
        self.send(PlaybackCommand::Start {
            id,
            samples: conform_to_rate(audio, self.sample_rate),
            channels: audio.channels.len() as u16,
            sample_rate: self.sample_rate,
            delay,
        })
    }

    fn stop(&mut self, id: PlaybackId) -> Result<(), DeviceError> {
        if self.commands.is_none() {
            return Ok(());
        }
        self.send(PlaybackCommand::Stop(id))
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(PlaybackCommand::Close);
        }
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| DeviceError::Other("playback thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for RodioPlaybackOutput {
    fn drop(&mut self) {
        if let Some(tx) = self.commands.take() {
            let _ = tx.send(PlaybackCommand::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_never_zero() {
        let device = CpalCaptureDevice::new(0);
        assert_eq!(device.frame_size, 1);
    }

    #[test]
    fn test_chunks_play_at_context_rate() {
        let audio = DecodedAudio {
            channels: vec![vec![0.5; 480], vec![-0.5; 480]],
            sample_rate: 48_000,
        };
        assert_eq!(conform_to_rate(&audio, 48_000), audio.interleaved());

        let samples = conform_to_rate(&audio, 24_000);
        assert_eq!(samples.len(), 240 * 2);
        assert_eq!(&samples[..2], &[0.5, -0.5]);
    }

    #[test]
    fn test_list_devices() {
        // This might fail in CI environments without audio devices
        if let Ok(devices) = CpalCaptureDevice::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}
