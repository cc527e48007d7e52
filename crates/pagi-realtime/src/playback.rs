//! Gapless playback scheduling against the output device clock.
//!
//! Buffers are placed back-to-back on a monotonically advancing cursor:
//! `start = max(now, next_start)`, then `next_start = start + duration`. The active
//! set tracks what is still audible so barge-in can silence everything at once.

use crate::codec::DecodedAudio;
use crate::devices::{PlaybackId, PlaybackOutput};
use crate::error::DeviceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

fn default_settle_delay_ms() -> u64 {
    200
}

fn default_output_sample_rate() -> u32 {
    24_000
}

fn default_output_channels() -> u16 {
    1
}

/// Configuration for model speech playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Grace period after the last buffer ends before "speaking" drops (default: 200ms)
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Rate of the PCM the model streams back (default: 24000 Hz)
    #[serde(default = "default_output_sample_rate")]
    pub sample_rate: u32,

    /// Interleaved channels in model audio (default: 1)
    #[serde(default = "default_output_channels")]
    pub channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            sample_rate: default_output_sample_rate(),
            channels: default_output_channels(),
        }
    }
}

impl PlaybackConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// A buffer handed to the device and not yet finished.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackItem {
    pub id: PlaybackId,
    pub scheduled_start: f64,
    pub duration: f64,
}

impl PlaybackItem {
    pub fn end(&self) -> f64 {
        self.scheduled_start + self.duration
    }
}

/// What happened when an ended notification arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndedOutcome {
    /// The id was not active (already cancelled or unknown).
    Stale,
    /// Other buffers are still playing.
    StillPlaying,
    /// The active set just became empty; arm the settle timer.
    Drained,
}

/// Owns the `next_start` cursor and the set of in-flight buffers.
pub struct PlaybackScheduler {
    next_start: f64,
    next_id: PlaybackId,
    active: BTreeMap<PlaybackId, PlaybackItem>,
    speaking: watch::Sender<bool>,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        let (speaking, _) = watch::channel(false);
        Self {
            next_start: 0.0,
            next_id: 0,
            active: BTreeMap::new(),
            speaking,
        }
    }

    /// Observe the "is speaking" flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_items(&self) -> impl Iterator<Item = &PlaybackItem> {
        self.active.values()
    }

    /// Schedule `audio` right after everything already queued, or now if the queue
    /// has drained.
    pub fn schedule(
        &mut self,
        output: &mut dyn PlaybackOutput,
        audio: &DecodedAudio,
    ) -> Result<PlaybackItem, DeviceError> {
        let start = output.now().max(self.next_start);
        let id = self.next_id;
        self.next_id += 1;

        output.start(id, audio, start)?;

        let item = PlaybackItem {
            id,
            scheduled_start: start,
            duration: audio.duration(),
        };
        self.next_start = item.end();
        self.active.insert(id, item);
        self.set_speaking(true);

        debug!(
            playback_id = id,
            start = item.scheduled_start,
            duration = item.duration,
            "scheduled playback buffer"
        );
        Ok(item)
    }

    /// Handle the device's ended notification for `id`.
    pub fn finished(&mut self, id: PlaybackId) -> EndedOutcome {
        if self.active.remove(&id).is_none() {
            return EndedOutcome::Stale;
        }
        if self.active.is_empty() {
            EndedOutcome::Drained
        } else {
            EndedOutcome::StillPlaying
        }
    }

    /// Settle timer fired. Drops "speaking" only if nothing new was scheduled since.
    /// Returns true when the flag changed.
    pub fn settle(&mut self) -> bool {
        if self.active.is_empty() && self.is_speaking() {
            self.set_speaking(false);
            return true;
        }
        false
    }

    /// Stop every active buffer, clear the set and rewind the cursor.
    ///
    /// Device errors are logged; the scheduler state is reset regardless.
    pub fn cancel_all(&mut self, output: &mut dyn PlaybackOutput) -> usize {
        let cancelled = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            if let Err(e) = output.stop(id) {
                warn!(playback_id = id, "Failed to stop playback buffer: {}", e);
            }
        }
        self.next_start = 0.0;
        self.set_speaking(false);
        if cancelled > 0 {
            info!("⏹️ Cancelled {} playback buffer(s)", cancelled);
        }
        cancelled
    }

    fn set_speaking(&self, speaking: bool) {
        self.speaking.send_if_modified(|current| {
            if *current == speaking {
                false
            } else {
                *current = speaking;
                true
            }
        });
    }
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}
