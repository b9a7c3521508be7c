//! Decoded clip storage, compression modes and decoders.

mod decoder;
mod resampler;
mod symphonia_decoder;

use crate::error::{Result, UnAudioError};
pub use decoder::ClipDecoder;
pub use resampler::AudioResampler;
use std::time::Duration;
pub use symphonia_decoder::SymphoniaDecoder;

/// How a clip's encoded bytes are treated when loaded.
///
/// Decoding is not real-time safe, so every mode decodes to PCM on the
/// loading thread; the mode is kept as part of the clip's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CompressionMode {
    CompressedInMemory = 0,
    DecompressOnLoad = 1,
    Streaming = 2,
}

impl CompressionMode {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::CompressedInMemory),
            1 => Ok(Self::DecompressOnLoad),
            2 => Ok(Self::Streaming),
            other => Err(UnAudioError::invalid(format!(
                "unknown compression mode {}",
                other
            ))),
        }
    }
}

/// Metadata describing a loaded clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipInfo {
    /// Sample rate of the encoded source
    pub sample_rate: u32,
    pub channels: u16,
    /// Bit depth of the encoded source, 0 when the codec does not report one
    pub bits_per_sample: u16,
    pub length_seconds: f32,
    /// Length in playback frames at the engine sample rate (the unit of seek
    /// and playback position)
    pub total_frames: i64,
    pub compression_mode: CompressionMode,
}

/// Decoded, interleaved f32 PCM shared read-only by the voices that play it.
///
/// Samples are stored interleaved: `[L0, R0, L1, R1, ...]` for stereo.
#[derive(Debug)]
pub struct PcmClip {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    total_frames: usize,
}

impl PcmClip {
    /// Wraps interleaved samples. A trailing partial frame is discarded.
    pub fn new(
        mut samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
        bits_per_sample: u16,
    ) -> Result<Self> {
        if sample_rate == 0 {
            return Err(UnAudioError::DecodeFailed("sample rate is zero".into()));
        }
        if channels == 0 {
            return Err(UnAudioError::DecodeFailed("channel count is zero".into()));
        }
        let total_frames = samples.len() / channels as usize;
        samples.truncate(total_frames * channels as usize);
        Ok(Self {
            samples,
            sample_rate,
            channels,
            bits_per_sample,
            total_frames,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.total_frames == 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.total_frames as f64 / self.sample_rate as f64)
    }

    /// Bytes held by the decoded samples.
    pub fn decoded_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }

    /// Interleaved samples of frames `[start, start + count)`.
    pub fn frames(&self, start: usize, count: usize) -> &[f32] {
        let channels = self.channels as usize;
        let start = start.min(self.total_frames);
        let end = (start + count).min(self.total_frames);
        &self.samples[start * channels..end * channels]
    }

    /// Resample to a different sample rate using rubato
    pub fn resample(&self, target_sample_rate: u32) -> Result<Self> {
        if target_sample_rate == self.sample_rate {
            return Self::new(
                self.samples.clone(),
                self.sample_rate,
                self.channels,
                self.bits_per_sample,
            );
        }

        let resampler = AudioResampler::new(
            self.sample_rate,
            target_sample_rate,
            self.channels,
            Some(1024),
        )?;
        let resampled = resampler.resample_interleaved(&self.samples)?;
        Self::new(
            resampled,
            target_sample_rate,
            self.channels,
            self.bits_per_sample,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_trailing_frame_is_dropped() {
        let clip = PcmClip::new(vec![0.1, 0.2, 0.3, 0.4, 0.5], 48000, 2, 16).unwrap();
        assert_eq!(clip.total_frames(), 2);
        assert_eq!(clip.samples().len(), 4);
        assert_eq!(clip.decoded_bytes(), 16);
    }

    #[test]
    fn frame_ranges_are_clamped() {
        let clip = PcmClip::new((0..8).map(|v| v as f32).collect(), 48000, 2, 32).unwrap();
        assert_eq!(clip.frames(1, 2), &[2.0, 3.0, 4.0, 5.0]);
        assert_eq!(clip.frames(3, 10), &[6.0, 7.0]);
        assert!(clip.frames(9, 1).is_empty());
    }

    #[test]
    fn zero_channels_is_rejected() {
        assert!(PcmClip::new(vec![0.0; 4], 48000, 0, 16).is_err());
        assert!(PcmClip::new(vec![0.0; 4], 0, 1, 16).is_err());
    }

    #[test]
    fn compression_mode_codes() {
        assert_eq!(
            CompressionMode::from_raw(1).unwrap(),
            CompressionMode::DecompressOnLoad
        );
        assert!(CompressionMode::from_raw(7).is_err());
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let clip = PcmClip::new(vec![0.25; 44100], 44100, 1, 16).unwrap();
        let resampled = clip.resample(48000).unwrap();
        assert_eq!(resampled.sample_rate(), 48000);
        assert_eq!(resampled.channels(), 1);
        assert_eq!(resampled.total_frames(), 48000);
    }
}
