//! Configuration for UnAudio

use crate::budget::MemoryBudgetConfig;
use crate::error::{Result, UnAudioError};

/// Largest voice pool the handle encoding can address.
pub const MAX_VOICE_SLOTS: usize = 1 << 16;

/// Output stream and engine resource configuration.
///
/// The configuration is fixed while the engine is running. Only the buffer
/// size can change afterwards, through
/// [`UnAudioEngine::set_buffer_size`](crate::UnAudioEngine::set_buffer_size),
/// which restarts the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct UnAudioConfig {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Number of interleaved output channels
    pub channels: u16,
    /// Frames rendered per callback
    pub buffer_size_frames: u32,
    /// Number of buffers queued by the device (double/triple buffering)
    pub buffer_count: u32,
    /// Request exclusive device access where the host supports it
    pub exclusive_mode: bool,
    /// Capacity of the voice pool
    pub max_voices: usize,
    /// Capacity of the event queue (rounded up to a power of two)
    pub event_queue_capacity: usize,
    /// Memory limits for loaded clips
    pub memory_budget: MemoryBudgetConfig,
}

impl Default for UnAudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            buffer_size_frames: 256,
            buffer_count: 2,
            exclusive_mode: false,
            max_voices: 256,
            event_queue_capacity: 512,
            memory_budget: MemoryBudgetConfig::default(),
        }
    }
}

impl UnAudioConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn buffer_size_frames(mut self, frames: u32) -> Self {
        self.buffer_size_frames = frames;
        self
    }

    pub fn buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    pub fn exclusive_mode(mut self, exclusive: bool) -> Self {
        self.exclusive_mode = exclusive;
        self
    }

    pub fn max_voices(mut self, max: usize) -> Self {
        self.max_voices = max;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    pub fn memory_budget(mut self, budget: MemoryBudgetConfig) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Builds a configuration from the signed values used at the flat API
    /// boundary, rejecting anything that is not strictly positive.
    pub fn from_raw(
        sample_rate: i32,
        channels: i32,
        buffer_size: i32,
        buffer_count: i32,
        exclusive_mode: bool,
    ) -> Result<Self> {
        let positive = |name: &str, value: i32| -> Result<u32> {
            if value <= 0 {
                Err(UnAudioError::invalid(format!("{} must be > 0, got {}", name, value)))
            } else {
                Ok(value as u32)
            }
        };

        let channels = positive("channels", channels)?;
        if channels > u16::MAX as u32 {
            return Err(UnAudioError::invalid(format!(
                "channels out of range: {}",
                channels
            )));
        }

        let config = Self {
            sample_rate: positive("sample_rate", sample_rate)?,
            channels: channels as u16,
            buffer_size_frames: positive("buffer_size", buffer_size)?,
            buffer_count: positive("buffer_count", buffer_count)?,
            exclusive_mode,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(UnAudioError::invalid("sample_rate must be > 0"));
        }
        if self.channels == 0 {
            return Err(UnAudioError::invalid("channels must be > 0"));
        }
        if self.buffer_size_frames == 0 {
            return Err(UnAudioError::invalid("buffer_size_frames must be > 0"));
        }
        if self.buffer_count == 0 {
            return Err(UnAudioError::invalid("buffer_count must be > 0"));
        }
        if self.max_voices == 0 || self.max_voices > MAX_VOICE_SLOTS {
            return Err(UnAudioError::invalid(format!(
                "max_voices must be in 1..={}, got {}",
                MAX_VOICE_SLOTS, self.max_voices
            )));
        }
        if self.event_queue_capacity == 0 {
            return Err(UnAudioError::invalid("event_queue_capacity must be > 0"));
        }
        Ok(())
    }

    /// Duration of one callback period in seconds.
    pub fn period_seconds(&self) -> f64 {
        self.buffer_size_frames as f64 / self.sample_rate as f64
    }

    /// Estimated output latency: every queued buffer must drain before a
    /// newly rendered sample is heard.
    pub fn latency_ms(&self) -> f32 {
        (self.buffer_size_frames as f64 * self.buffer_count as f64 / self.sample_rate as f64
            * 1000.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(UnAudioConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected() {
        assert!(UnAudioConfig::new().sample_rate(0).validate().is_err());
        assert!(UnAudioConfig::new().channels(0).validate().is_err());
        assert!(UnAudioConfig::new().buffer_size_frames(0).validate().is_err());
        assert!(UnAudioConfig::new().buffer_count(0).validate().is_err());
        assert!(UnAudioConfig::new().max_voices(0).validate().is_err());
        assert!(
            UnAudioConfig::new()
                .max_voices(MAX_VOICE_SLOTS + 1)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn raw_negative_values_are_invalid_parameter() {
        let err = UnAudioConfig::from_raw(-48000, 2, 256, 2, false).unwrap_err();
        assert!(matches!(err, UnAudioError::InvalidParameter(_)));
        assert!(UnAudioConfig::from_raw(48000, 0, 256, 2, false).is_err());
        assert!(UnAudioConfig::from_raw(48000, 2, -1, 2, false).is_err());

        let config = UnAudioConfig::from_raw(44100, 1, 128, 3, true).unwrap();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 1);
        assert_eq!(config.buffer_size_frames, 128);
        assert_eq!(config.buffer_count, 3);
        assert!(config.exclusive_mode);
    }

    #[test]
    fn latency_is_derived_from_buffering() {
        let config = UnAudioConfig::new()
            .sample_rate(48000)
            .buffer_size_frames(480)
            .buffer_count(2);
        assert!((config.latency_ms() - 20.0).abs() < 1e-4);
        assert!((config.period_seconds() - 0.01).abs() < 1e-9);
    }
}
