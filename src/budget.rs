//! Memory budget tracking for loaded clips.
//!
//! Counters are atomic so usage can be queried from any thread while loads
//! and unloads happen elsewhere.

use crate::error::{Result, UnAudioError};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Limits applied to clip memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudgetConfig {
    /// Maximum bytes of encoded input accepted across all loaded clips
    pub max_compressed_bytes: usize,
    /// Maximum bytes of decoded PCM held across all loaded clips
    pub max_decoded_bytes: usize,
    /// Fraction of either budget above which [`MemoryBudget::is_warning`] reports true
    pub warning_threshold: f32,
}

impl Default for MemoryBudgetConfig {
    fn default() -> Self {
        Self {
            max_compressed_bytes: 64 * 1024 * 1024,
            max_decoded_bytes: 256 * 1024 * 1024,
            warning_threshold: 0.85,
        }
    }
}

/// Snapshot of clip memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemoryUsage {
    pub compressed_bytes: usize,
    pub decoded_bytes: usize,
    pub total_bytes: usize,
    pub compressed_percent: f32,
    pub decoded_percent: f32,
}

#[derive(Debug, Default)]
pub struct MemoryBudget {
    config: MemoryBudgetConfig,
    compressed: AtomicUsize,
    decoded: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(config: MemoryBudgetConfig) -> Self {
        Self {
            config,
            compressed: AtomicUsize::new(0),
            decoded: AtomicUsize::new(0),
        }
    }

    /// Reserves memory for one clip, all or nothing.
    pub fn try_reserve(&self, compressed: usize, decoded: usize) -> Result<()> {
        Self::try_add(&self.compressed, compressed, self.config.max_compressed_bytes)?;
        if let Err(e) = Self::try_add(&self.decoded, decoded, self.config.max_decoded_bytes) {
            self.compressed.fetch_sub(compressed, Ordering::Relaxed);
            return Err(e);
        }
        Ok(())
    }

    pub fn release(&self, compressed: usize, decoded: usize) {
        self.compressed.fetch_sub(compressed, Ordering::Relaxed);
        self.decoded.fetch_sub(decoded, Ordering::Relaxed);
    }

    fn try_add(counter: &AtomicUsize, bytes: usize, limit: usize) -> Result<()> {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_add(bytes).filter(|desired| *desired <= limit)
            })
            .map(|_| ())
            .map_err(|current| UnAudioError::OutOfMemory {
                requested: bytes,
                available: limit.saturating_sub(current),
            })
    }

    pub fn usage(&self) -> MemoryUsage {
        let compressed_bytes = self.compressed.load(Ordering::Relaxed);
        let decoded_bytes = self.decoded.load(Ordering::Relaxed);
        let percent = |used: usize, max: usize| {
            if max > 0 {
                used as f32 / max as f32
            } else {
                0.0
            }
        };
        MemoryUsage {
            compressed_bytes,
            decoded_bytes,
            total_bytes: compressed_bytes + decoded_bytes,
            compressed_percent: percent(compressed_bytes, self.config.max_compressed_bytes),
            decoded_percent: percent(decoded_bytes, self.config.max_decoded_bytes),
        }
    }

    pub fn is_warning(&self) -> bool {
        let usage = self.usage();
        usage.compressed_percent >= self.config.warning_threshold
            || usage.decoded_percent >= self.config.warning_threshold
    }

    pub fn config(&self) -> &MemoryBudgetConfig {
        &self.config
    }
}
