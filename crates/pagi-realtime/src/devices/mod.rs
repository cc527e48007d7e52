//! Audio device seams: microphone capture and scheduled playback.
//!
//! The session never talks to hardware directly. It opens a [`CaptureDevice`] and a
//! [`PlaybackDevice`], receives frames and ended notifications over channels, and
//! closes the handles in a fixed order on teardown. Real backends live in
//! [`native`] behind the `native-audio` feature; tests use in-memory fakes.

use crate::codec::{AudioFrame, DecodedAudio};
use crate::error::DeviceError;
use tokio::sync::mpsc;

#[cfg(feature = "native-audio")]
pub mod native;

/// Identifier the playback scheduler assigns to each scheduled buffer.
pub type PlaybackId = u64;

/// Sender the capture backend pushes frames into. Sending never blocks.
pub type FrameSender = mpsc::UnboundedSender<AudioFrame>;

/// Sender the playback backend notifies when a buffer has finished playing.
pub type PlaybackEndedSender = mpsc::UnboundedSender<PlaybackId>;

/// Acquires the microphone together with its capture context.
pub trait CaptureDevice: Send + Sync {
    fn open(&self, frames: FrameSender) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// A live microphone stream.
///
/// Teardown calls `disconnect`, `stop_tracks` and `close` in that order.
pub trait CaptureStream: Send {
    /// Native rate of the frames this stream delivers.
    fn sample_rate(&self) -> u32;

    /// Detach the processing callback so no further frames are delivered.
    fn disconnect(&mut self);

    /// Stop the underlying microphone tracks.
    fn stop_tracks(&mut self);

    /// Release the capture context.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Acquires an output context running at `sample_rate`.
pub trait PlaybackDevice: Send + Sync {
    fn open(
        &self,
        sample_rate: u32,
        ended: PlaybackEndedSender,
    ) -> Result<Box<dyn PlaybackOutput>, DeviceError>;
}

/// An output context with its own monotonic clock.
pub trait PlaybackOutput: Send {
    /// Current device time in seconds.
    fn now(&self) -> f64;

    /// Start `audio` at device time `at`. The backend must send `id` on its ended
    /// channel once the buffer finishes on its own (not when stopped).
    fn start(&mut self, id: PlaybackId, audio: &DecodedAudio, at: f64) -> Result<(), DeviceError>;

    /// Stop a buffer immediately. A no-op once the context is closed.
    fn stop(&mut self, id: PlaybackId) -> Result<(), DeviceError>;

    /// Release the output context.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Map a free-form backend message onto the device error classes.
///
/// Backends that only surface strings (browser bridges, OS errors) use this to pick
/// the closest class; anything unrecognised stays `Other`.
pub fn classify_device_message(message: impl Into<String>) -> DeviceError {
    let message = message.into();
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("not allowed") || lower.contains("denied") {
        DeviceError::PermissionDenied(message)
    } else if lower.contains("not found")
        || lower.contains("no device")
        || lower.contains("not available")
        || lower.contains("no input device")
        || lower.contains("no output device")
    {
        DeviceError::NotFound(message)
    } else if lower.contains("busy") || lower.contains("in use") || lower.contains("not readable") {
        DeviceError::Busy(message)
    } else {
        DeviceError::Other(message)
    }
}
