//! PCM wire framing: f32 capture buffers to 16-bit LE frames and back.

use crate::error::CodecError;
use crate::resample::resample;
use serde::{Deserialize, Serialize};

/// Sample rate the voice model expects for microphone input.
pub const DEFAULT_WIRE_SAMPLE_RATE: u32 = 16_000;

/// One buffer of captured microphone audio, mono f32 in [-1.0, 1.0].
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub source_sample_rate: u32,
}

/// Encoded PCM ready for `Transport::send_audio`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAudio {
    /// 16-bit signed little-endian samples.
    pub data: Vec<u8>,
    pub sample_rate: u32,
    /// Transport tag, e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
}

/// Decoded model speech, one planar buffer per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub channels: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Interleave channels for devices that take a single sample stream.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for i in 0..frames {
            for ch in &self.channels {
                out.push(ch[i]);
            }
        }
        out
    }
}

/// Resamples and packs capture frames at a fixed wire rate.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    target_rate: u32,
    mime_type: String,
}

impl FrameEncoder {
    pub fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            mime_type: format!("audio/pcm;rate={}", target_rate),
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    /// Resample `frame` to the wire rate and serialize it as PCM16.
    pub fn encode(&self, frame: &AudioFrame) -> WireAudio {
        let samples = resample(&frame.samples, frame.source_sample_rate, self.target_rate);
        WireAudio {
            data: encode_pcm16(&samples),
            sample_rate: self.target_rate,
            mime_type: self.mime_type.clone(),
        }
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_WIRE_SAMPLE_RATE)
    }
}

/// Clamp to [-1, 1], scale by 32767 and write little-endian i16.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Rebuild planar f32 channels from interleaved little-endian PCM16.
pub fn decode_pcm16(
    payload: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<DecodedAudio, CodecError> {
    if channels == 0 {
        return Err(CodecError::ZeroChannels);
    }
    if payload.len() % 2 != 0 {
        return Err(CodecError::OddByteLength(payload.len()));
    }
    let samples = payload.len() / 2;
    if samples % channels as usize != 0 {
        return Err(CodecError::ChannelMismatch { samples, channels });
    }

    let frames = samples / channels as usize;
    let mut planar = vec![Vec::with_capacity(frames); channels as usize];
    for (i, pair) in payload.chunks_exact(2).enumerate() {
        let v = i16::from_le_bytes([pair[0], pair[1]]);
        planar[i % channels as usize].push(v as f32 / 32768.0);
    }

    Ok(DecodedAudio {
        channels: planar,
        sample_rate,
    })
}
