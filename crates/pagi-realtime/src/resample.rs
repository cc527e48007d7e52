//! Sample-rate conversion for captured PCM.
//!
//! Linear interpolation is cheap enough to run inside the capture callback budget
//! and is what the transport's 16 kHz input needs from 44.1/48 kHz microphones.

/// Convert `input` from `input_rate` to `output_rate` using linear interpolation.
///
/// Output length is `floor(input.len() * output_rate / input_rate)`. Equal rates return
/// a copy of the input. A zero rate on either side yields an empty buffer.
pub fn resample(input: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input_rate == output_rate {
        return input.to_vec();
    }
    if input.is_empty() || input_rate == 0 || output_rate == 0 {
        return Vec::new();
    }

    let out_len = (input.len() as u64 * output_rate as u64 / input_rate as u64) as usize;
    let ratio = input_rate as f64 / output_rate as f64;
    let last = input.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let lo = (pos.floor() as usize).min(last);
        let hi = (pos.ceil() as usize).min(last);
        let frac = (pos - pos.floor()) as f32;
        out.push(input[lo] + (input[hi] - input[lo]) * frac);
    }
    out
}

/// Average interleaved multi-channel samples down to mono.
///
/// Trailing samples that do not form a whole frame are dropped.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => interleaved.to_vec(),
        n => interleaved
            .chunks_exact(n)
            .map(|frame| frame.iter().sum::<f32>() / n as f32)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_rates_match() {
        let x = vec![0.1, -0.4, 0.9, 0.0, -1.0];
        for rate in [8000, 16000, 44100, 48000] {
            assert_eq!(resample(&x, rate, rate), x);
        }
    }

    #[test]
    fn output_length_is_floored() {
        let x = vec![0.0f32; 1001];
        assert_eq!(resample(&x, 48000, 16000).len(), 333);
        assert_eq!(resample(&x, 16000, 48000).len(), 3003);
        assert_eq!(resample(&x, 44100, 16000).len(), (1001u64 * 16000 / 44100) as usize);
    }

    #[test]
    fn empty_in_empty_out() {
        assert!(resample(&[], 48000, 16000).is_empty());
        assert!(resample(&[], 16000, 48000).is_empty());
    }

    #[test]
    fn upsampling_interpolates_between_neighbours() {
        let out = resample(&[0.0, 1.0], 1, 2);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
        // Past the end the ceiling neighbour is clamped to the last sample.
        assert!((out[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn downsampling_by_three_picks_every_third_sample() {
        let x: Vec<f32> = (0..9).map(|i| i as f32).collect();
        assert_eq!(resample(&x, 48000, 16000), vec![0.0, 3.0, 6.0]);
    }

    #[test]
    fn zero_rate_yields_empty() {
        assert!(resample(&[0.5; 10], 0, 16000).is_empty());
        assert!(resample(&[0.5; 10], 16000, 0).is_empty());
    }

    #[test]
    fn stereo_downmix_averages_frames() {
        let mono = downmix_to_mono(&[1.0, 0.0, -0.5, 0.5, 0.25], 2);
        assert_eq!(mono, vec![0.5, 0.0]);
        assert!(downmix_to_mono(&[1.0], 0).is_empty());
    }
}
