//! UnAudio: a low-latency audio playback engine with handle-based voices.
//!
//! Clips are decoded once at load time and bound to a voice in a fixed-size
//! pool. Application threads drive voices through [`UnAudioEngine`] while
//! the output backend renders on a real-time thread that never locks or
//! allocates. Render-side notifications (voice finished, looped, buffer
//! underrun, device change) arrive through a lock-free event queue.
//!
//! ```no_run
//! use unaudio::{CompressionMode, UnAudioConfig, UnAudioEngine};
//!
//! # fn main() -> unaudio::error::Result<()> {
//! let engine = UnAudioEngine::new();
//! engine.initialize(UnAudioConfig::default())?;
//!
//! let bytes = std::fs::read("click.wav").unwrap_or_default();
//! let voice = engine.load_audio(&bytes, CompressionMode::DecompressOnLoad)?;
//! engine.set_volume(voice, 0.8)?;
//! engine.play(voice)?;
//!
//! while let Some(event) = engine.poll_event() {
//!     println!("{:?}", event);
//! }
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod audio_data;
pub mod budget;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_queue;
pub mod events;
pub mod mixer;
pub mod output;
mod pool;
pub mod voice;

pub use audio_data::{ClipDecoder, ClipInfo, CompressionMode, PcmClip, SymphoniaDecoder};
pub use budget::{MemoryBudgetConfig, MemoryUsage};
pub use config::UnAudioConfig;
pub use engine::{EngineState, UnAudioEngine};
pub use error::UnAudioError;
pub use events::{EventKind, UnAudioEvent};
pub use mixer::{DeviceMonitor, Mixer};
pub use output::{AudioOutput, CpalOutput, OfflineOutput};
pub use voice::{PlaybackState, VoiceHandle};
