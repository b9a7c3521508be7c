//! Flat function interface over one process-wide engine.
//!
//! Every call returns a plain value: `0` or a negative
//! [`UnAudioError::code`] for operations, a negative code in place of a
//! handle when loading fails. This is the surface host-language bindings
//! wrap.

use crate::audio_data::{ClipInfo, CompressionMode};
use crate::budget::MemoryUsage;
use crate::config::UnAudioConfig;
use crate::engine::{EngineState, UnAudioEngine};
use crate::error::{Result, UnAudioError, result_code};
use crate::voice::VoiceHandle;
use std::sync::LazyLock;

static ENGINE: LazyLock<UnAudioEngine> = LazyLock::new(UnAudioEngine::new);

/// The engine behind this module.
pub fn engine() -> &'static UnAudioEngine {
    &ENGINE
}

fn code_of<T>(result: Result<T>) -> i32 {
    result_code(&result.map(|_| ()))
}

fn handle(raw: i32) -> VoiceHandle {
    VoiceHandle::from_raw(raw)
}

pub fn initialize(
    sample_rate: i32,
    channels: i32,
    buffer_size: i32,
    buffer_count: i32,
    exclusive_mode: bool,
) -> i32 {
    if ENGINE.state() != EngineState::Uninitialized {
        return UnAudioError::AlreadyInitialized.code();
    }
    let result = UnAudioConfig::from_raw(
        sample_rate,
        channels,
        buffer_size,
        buffer_count,
        exclusive_mode,
    )
    .and_then(|config| ENGINE.initialize(config));
    code_of(result)
}

pub fn shutdown() {
    ENGINE.shutdown();
}

pub fn is_initialized() -> bool {
    ENGINE.is_initialized()
}

/// Returns a non-negative handle, or a negative result code.
pub fn load_audio(bytes: &[u8], compression_mode: i32) -> i32 {
    let result = CompressionMode::from_raw(compression_mode)
        .and_then(|mode| ENGINE.load_audio(bytes, mode));
    match result {
        Ok(voice) => voice.raw(),
        Err(e) => e.code(),
    }
}

pub fn unload_audio(voice: i32) -> i32 {
    code_of(ENGINE.unload_audio(handle(voice)))
}

pub fn play(voice: i32) -> i32 {
    code_of(ENGINE.play(handle(voice)))
}

pub fn pause(voice: i32) -> i32 {
    code_of(ENGINE.pause(handle(voice)))
}

pub fn stop(voice: i32) -> i32 {
    code_of(ENGINE.stop(handle(voice)))
}

pub fn seek(voice: i32, frame: i64) -> i32 {
    code_of(ENGINE.seek(handle(voice), frame))
}

pub fn set_volume(voice: i32, volume: f32) -> i32 {
    code_of(ENGINE.set_volume(handle(voice), volume))
}

/// 0.0 for unknown voices.
pub fn get_volume(voice: i32) -> f32 {
    ENGINE.volume(handle(voice)).unwrap_or(0.0)
}

pub fn set_pan(voice: i32, pan: f32) -> i32 {
    code_of(ENGINE.set_pan(handle(voice), pan))
}

pub fn get_pan(voice: i32) -> f32 {
    ENGINE.pan(handle(voice)).unwrap_or(0.0)
}

pub fn set_loop(voice: i32, looping: bool) -> i32 {
    code_of(ENGINE.set_loop(handle(voice), looping))
}

pub fn get_loop(voice: i32) -> bool {
    ENGINE.is_looping(handle(voice)).unwrap_or(false)
}

/// The voice's [`PlaybackState`](crate::PlaybackState) code, or a negative
/// result code.
pub fn get_state(voice: i32) -> i32 {
    match ENGINE.voice_state(handle(voice)) {
        Ok(state) => state.code(),
        Err(e) => e.code(),
    }
}

/// Frame position, or a negative result code.
pub fn get_playback_frame(voice: i32) -> i64 {
    match ENGINE.playback_frame(handle(voice)) {
        Ok(frame) => frame,
        Err(e) => e.code() as i64,
    }
}

/// Position in seconds, 0.0 for unknown voices.
pub fn get_playback_time(voice: i32) -> f64 {
    ENGINE.playback_time(handle(voice)).unwrap_or(0.0)
}

pub fn get_clip_info(voice: i32) -> std::result::Result<ClipInfo, i32> {
    ENGINE.clip_info(handle(voice)).map_err(|e| e.code())
}

pub fn set_master_volume(volume: f32) {
    ENGINE.set_master_volume(volume);
}

pub fn get_master_volume() -> f32 {
    ENGINE.master_volume()
}

pub fn set_buffer_size(frames: i32) -> i32 {
    if frames <= 0 {
        return UnAudioError::invalid(format!("buffer size must be > 0, got {}", frames)).code();
    }
    code_of(ENGINE.set_buffer_size(frames as u32))
}

pub fn get_current_latency() -> f32 {
    ENGINE.current_latency_ms()
}

pub fn get_peak_level() -> f32 {
    ENGINE.peak_level()
}

pub fn get_dsp_time() -> f64 {
    ENGINE.dsp_time()
}

pub fn get_memory_usage() -> MemoryUsage {
    ENGINE.memory_usage()
}

/// `(delivered, kind, voice, param)`. Never blocks; `delivered` is false
/// when no event is pending.
pub fn poll_event() -> (bool, i32, i32, i32) {
    match ENGINE.poll_event() {
        Some(event) => {
            let raw = event.to_raw();
            (true, raw.kind as i32, raw.voice_id, raw.param)
        }
        None => (false, 0, VoiceHandle::INVALID.raw(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The shared engine is never initialized here: these paths must not touch
    // an audio device.

    #[test]
    fn calls_before_initialize_report_not_initialized() {
        let not_initialized = UnAudioError::NotInitialized.code();
        assert!(!is_initialized());
        assert_eq!(play(0), not_initialized);
        assert_eq!(seek(0, 10), not_initialized);
        assert_eq!(get_state(0), not_initialized);
        assert_eq!(get_playback_frame(0), not_initialized as i64);
        assert_eq!(get_clip_info(0).unwrap_err(), not_initialized);
        assert_eq!(set_buffer_size(512), not_initialized);
        assert_eq!(get_current_latency(), 0.0);
    }

    #[test]
    fn load_failures_are_negative_handles() {
        assert!(load_audio(&[], 1) < 0);
        assert_eq!(
            load_audio(&[1, 2, 3], 9),
            UnAudioError::invalid("").code()
        );
    }

    #[test]
    fn invalid_config_is_rejected_before_touching_the_device() {
        let invalid = UnAudioError::invalid("").code();
        assert_eq!(initialize(48000, 0, 256, 2, false), invalid);
        assert_eq!(initialize(-1, 2, 256, 2, false), invalid);
        assert_eq!(initialize(48000, 2, 0, 2, false), invalid);
        assert!(!is_initialized());
        assert_eq!(set_buffer_size(-4), invalid);
    }

    #[test]
    fn empty_queue_polls_undelivered() {
        for _ in 0..10 {
            let (delivered, _, voice, _) = poll_event();
            assert!(!delivered);
            assert_eq!(voice, -1);
        }
    }

    #[test]
    fn shutdown_without_initialize_is_a_no_op() {
        shutdown();
        assert!(!is_initialized());
    }
}
