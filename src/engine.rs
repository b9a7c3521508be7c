use crate::audio_data::{ClipDecoder, ClipInfo, CompressionMode, PcmClip, SymphoniaDecoder};
use crate::budget::{MemoryBudget, MemoryUsage};
use crate::config::UnAudioConfig;
use crate::error::{Result, UnAudioError};
use crate::events::UnAudioEvent;
use crate::mixer::{DeviceMonitor, SharedState};
use crate::output::{AudioOutput, CpalOutput};
use crate::pool::VoicePool;
use crate::voice::{
    AtomicF32, GENERATION_MASK, PlaybackState, Transport, VoiceHandle, VoiceSlot, clamp_pan,
    clamp_volume,
};
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

/// Lifecycle state of an [`UnAudioEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Uninitialized = 0,
    Initializing = 1,
    Running = 2,
    ShuttingDown = 3,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Initializing,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            _ => Self::Uninitialized,
        }
    }
}

/// Everything that exists only while the engine is running.
struct Runtime {
    config: UnAudioConfig,
    shared: Arc<SharedState>,
    pool: VoicePool,
    buffer_size_frames: AtomicU32,
}

struct Lifecycle {
    output: Box<dyn AudioOutput>,
    config: Option<UnAudioConfig>,
}

/// The playback engine.
///
/// `UnAudioEngine` is `Sync`: any number of application threads may load
/// clips, drive voices and poll events concurrently while the output
/// backend renders on its own real-time thread.
///
/// # Threads
///
/// - **Control threads**: everything on this type. Lifecycle calls
///   (`initialize`, `shutdown`, `set_buffer_size`) are serialized by an
///   internal lock; voice calls resolve their handle without locking.
/// - **Render thread**: owned by the [`AudioOutput`]. Reads voice state
///   through atomics, never takes a lock, and reports through the event
///   queue polled with [`poll_event`](Self::poll_event).
///
/// A control-plane write is visible to the render thread no later than the
/// next period after the call returns. Position and state reads may be up to
/// one period stale.
pub struct UnAudioEngine {
    state: AtomicU8,
    lifecycle: Mutex<Lifecycle>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    master_volume: Arc<AtomicF32>,
    sessions: AtomicU32,
    decoder: RwLock<Arc<dyn ClipDecoder>>,
}

impl Default for UnAudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl UnAudioEngine {
    /// Engine playing through the default cpal device.
    pub fn new() -> Self {
        Self::with_output(Box::new(CpalOutput::new()))
    }

    pub fn with_output(output: Box<dyn AudioOutput>) -> Self {
        Self {
            state: AtomicU8::new(EngineState::Uninitialized as u8),
            lifecycle: Mutex::new(Lifecycle {
                output,
                config: None,
            }),
            runtime: RwLock::new(None),
            master_volume: Arc::new(AtomicF32::new(1.0)),
            sessions: AtomicU32::new(0),
            decoder: RwLock::new(Arc::new(SymphoniaDecoder::new())),
        }
    }

    /// Replaces the decoder used by [`load_audio`](Self::load_audio).
    pub fn set_decoder(&self, decoder: Arc<dyn ClipDecoder>) {
        *self
            .decoder
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = decoder;
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(UnAudioError::NotInitialized)
    }

    fn take_runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Allocates the voice pool and event queue, then opens the output stream.
    ///
    /// # Errors
    ///
    /// - `AlreadyInitialized` unless the engine is uninitialized; the running
    ///   stream is left untouched
    /// - `InvalidParameter` for a zero sample rate, channel count, buffer
    ///   size or buffer count
    /// - `DeviceNotFound` / `Platform` when the output cannot be opened
    pub fn initialize(&self, config: UnAudioConfig) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        if self.state() != EngineState::Uninitialized {
            return Err(UnAudioError::AlreadyInitialized);
        }
        config.validate()?;

        self.set_state(EngineState::Initializing);
        log::info!(
            "Initializing engine: {} Hz, {} ch, {} frames x {} buffers",
            config.sample_rate,
            config.channels,
            config.buffer_size_frames,
            config.buffer_count
        );

        let session = self.sessions.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let seed = session.wrapping_mul(0x2F1) & GENERATION_MASK;
        let shared = Arc::new(SharedState::new(&config, seed, self.master_volume.clone()));
        let release_wait = Duration::from_secs_f64(config.period_seconds() * 4.0)
            + Duration::from_millis(50);
        let runtime = Arc::new(Runtime {
            pool: VoicePool::new(
                shared.clone(),
                MemoryBudget::new(config.memory_budget),
                release_wait,
            ),
            shared,
            buffer_size_frames: AtomicU32::new(config.buffer_size_frames),
            config: config.clone(),
        });

        if let Err(e) = start_stream(lifecycle.output.as_mut(), &config, &runtime) {
            log::error!("Failed to open output stream: {}", e);
            self.set_state(EngineState::Uninitialized);
            return Err(e);
        }

        *self
            .runtime
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(runtime);
        lifecycle.config = Some(config);
        self.set_state(EngineState::Running);
        log::info!("Engine running");
        Ok(())
    }

    /// Stops the stream, waits for the render thread to quiesce and releases
    /// every voice. A no-op unless running.
    pub fn shutdown(&self) {
        let mut lifecycle = self.lock_lifecycle();
        if self.state() != EngineState::Running {
            return;
        }
        self.set_state(EngineState::ShuttingDown);

        if let Some(runtime) = self.take_runtime() {
            stop_stream(lifecycle.output.as_mut(), &runtime);
            log::info!(
                "Engine shut down after {} callbacks ({} underruns, {} dropped events)",
                runtime.shared.callbacks.load(Ordering::Relaxed),
                runtime.shared.underruns.load(Ordering::Relaxed),
                runtime.shared.events.dropped()
            );
        }

        lifecycle.config = None;
        self.set_state(EngineState::Uninitialized);
    }

    /// Current configuration, `None` unless running.
    pub fn config(&self) -> Option<UnAudioConfig> {
        self.lock_lifecycle().config.clone()
    }

    pub fn device_name(&self) -> Option<String> {
        self.lock_lifecycle().output.device_name()
    }

    /// Restarts the stream with a new period size. Loaded voices keep their
    /// state and position.
    ///
    /// If the device rejects the new size the previous configuration is
    /// restored and the error returned. If even that fails the engine shuts
    /// down.
    pub fn set_buffer_size(&self, frames: u32) -> Result<()> {
        if frames == 0 {
            return Err(UnAudioError::invalid("buffer size must be > 0"));
        }

        let mut lifecycle = self.lock_lifecycle();
        let runtime = self.runtime()?;
        let previous = lifecycle
            .config
            .clone()
            .ok_or(UnAudioError::NotInitialized)?;
        if previous.buffer_size_frames == frames {
            return Ok(());
        }
        let requested = previous.clone().buffer_size_frames(frames);

        log::info!(
            "Restarting stream: buffer size {} -> {} frames",
            previous.buffer_size_frames,
            frames
        );
        stop_stream(lifecycle.output.as_mut(), &runtime);

        let error = match start_stream(lifecycle.output.as_mut(), &requested, &runtime) {
            Ok(()) => {
                runtime.buffer_size_frames.store(frames, Ordering::Release);
                runtime.shared.clock.set_buffer_size(frames);
                lifecycle.config = Some(requested);
                return Ok(());
            }
            Err(e) => e,
        };

        log::warn!("Buffer size {} rejected ({}), restoring previous", frames, error);
        if start_stream(lifecycle.output.as_mut(), &previous, &runtime).is_ok() {
            return Err(error);
        }

        log::error!("Could not restore the output stream, shutting down");
        self.set_state(EngineState::ShuttingDown);
        drop(self.take_runtime());
        lifecycle.config = None;
        self.set_state(EngineState::Uninitialized);
        Err(error)
    }

    /// Estimated output latency in milliseconds, 0 when not running.
    pub fn current_latency_ms(&self) -> f32 {
        self.runtime()
            .map(|runtime| {
                UnAudioConfig {
                    buffer_size_frames: runtime.buffer_size_frames.load(Ordering::Acquire),
                    ..runtime.config.clone()
                }
                .latency_ms()
            })
            .unwrap_or(0.0)
    }

    /// Decodes `bytes` and binds the clip to a free voice in the Stopped state.
    ///
    /// Decoding and resampling to the engine rate happen on the calling
    /// thread. Nothing is allocated in the pool when decoding fails.
    pub fn load_audio(&self, bytes: &[u8], mode: CompressionMode) -> Result<VoiceHandle> {
        let runtime = self.runtime()?;
        if bytes.is_empty() {
            return Err(UnAudioError::invalid("audio data is empty"));
        }

        let decoder = self
            .decoder
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let decoded = decoder.decode(bytes)?;
        if decoded.is_empty() {
            return Err(UnAudioError::DecodeFailed("no audio frames decoded".into()));
        }

        let source_rate = decoded.sample_rate();
        let length_seconds = decoded.duration().as_secs_f32();
        let channels = decoded.channels();
        let bits_per_sample = decoded.bits_per_sample();

        let clip: PcmClip = if source_rate != runtime.shared.sample_rate {
            log::debug!(
                "Resampling clip from {} Hz to {} Hz",
                source_rate,
                runtime.shared.sample_rate
            );
            decoded.resample(runtime.shared.sample_rate)?
        } else {
            decoded
        };

        let info = ClipInfo {
            sample_rate: source_rate,
            channels,
            bits_per_sample,
            length_seconds,
            total_frames: clip.total_frames() as i64,
            compression_mode: mode,
        };

        let handle = runtime.pool.load(Arc::new(clip), info, bytes.len())?;
        log::debug!(
            "Loaded {}: {} frames, {} ch, {:?}",
            handle,
            info.total_frames,
            channels,
            mode
        );
        if runtime.pool.is_memory_warning() {
            log::warn!("Clip memory above warning threshold: {:?}", runtime.pool.memory_usage());
        }
        Ok(handle)
    }

    /// Releases a voice. Unknown or already released handles are ignored.
    pub fn unload_audio(&self, handle: VoiceHandle) -> Result<()> {
        let runtime = self.runtime()?;
        if runtime.pool.unload(handle) {
            log::debug!("Unloaded {}", handle);
        }
        Ok(())
    }

    fn with_voice<T>(&self, handle: VoiceHandle, f: impl FnOnce(&VoiceSlot) -> T) -> Result<T> {
        let runtime = self.runtime()?;
        let slot = runtime.pool.resolve(handle)?;
        Ok(f(slot))
    }

    /// Starts or resumes a voice. Already playing voices are left as they are;
    /// a finished voice restarts from the top unless it was seeked since.
    pub fn play(&self, handle: VoiceHandle) -> Result<()> {
        self.with_voice(handle, |slot| {
            let length = slot.total_frames();
            slot.update_transport(|t| match t.state {
                PlaybackState::Playing => None,
                PlaybackState::Finished if t.frame >= length => {
                    Some(Transport::new(PlaybackState::Playing, 0))
                }
                _ => Some(Transport::new(PlaybackState::Playing, t.frame)),
            });
        })
    }

    /// Pauses a playing voice, keeping its position. No-op in other states.
    pub fn pause(&self, handle: VoiceHandle) -> Result<()> {
        self.with_voice(handle, |slot| {
            slot.update_transport(|t| {
                (t.state == PlaybackState::Playing)
                    .then(|| Transport::new(PlaybackState::Paused, t.frame))
            });
        })
    }

    /// Stops a voice from any state and rewinds it to frame 0.
    pub fn stop(&self, handle: VoiceHandle) -> Result<()> {
        self.with_voice(handle, |slot| {
            slot.update_transport(|_| Some(Transport::new(PlaybackState::Stopped, 0)));
        })
    }

    /// Moves the playback position. Takes effect on the next period.
    ///
    /// `frame` must lie in `[0, length]`; with looping enabled any
    /// non-negative frame is accepted and wrapped.
    pub fn seek(&self, handle: VoiceHandle, frame: i64) -> Result<()> {
        if frame < 0 {
            return Err(UnAudioError::invalid(format!("negative seek frame {}", frame)));
        }
        let frame = frame as u64;
        let runtime = self.runtime()?;
        let slot = runtime.pool.resolve(handle)?;

        let length = slot.total_frames();
        let target = if slot.looping() && length > 0 {
            frame % length
        } else if frame > length {
            return Err(UnAudioError::invalid(format!(
                "seek frame {} beyond length {}",
                frame, length
            )));
        } else {
            frame
        };
        slot.update_transport(|t| Some(Transport::new(t.state, target)));
        Ok(())
    }

    /// Stores the volume clamped to [0, 1].
    pub fn set_volume(&self, handle: VoiceHandle, volume: f32) -> Result<()> {
        self.with_voice(handle, |slot| slot.set_volume(clamp_volume(volume)))
    }

    pub fn volume(&self, handle: VoiceHandle) -> Result<f32> {
        self.with_voice(handle, |slot| slot.volume())
    }

    /// Stores the pan clamped to [-1, 1] (-1 = left).
    pub fn set_pan(&self, handle: VoiceHandle, pan: f32) -> Result<()> {
        self.with_voice(handle, |slot| slot.set_pan(clamp_pan(pan)))
    }

    pub fn pan(&self, handle: VoiceHandle) -> Result<f32> {
        self.with_voice(handle, |slot| slot.pan())
    }

    pub fn set_loop(&self, handle: VoiceHandle, looping: bool) -> Result<()> {
        self.with_voice(handle, |slot| slot.set_looping(looping))
    }

    pub fn is_looping(&self, handle: VoiceHandle) -> Result<bool> {
        self.with_voice(handle, |slot| slot.looping())
    }

    pub fn voice_state(&self, handle: VoiceHandle) -> Result<PlaybackState> {
        self.with_voice(handle, |slot| slot.transport().state)
    }

    /// Position in engine-rate frames.
    pub fn playback_frame(&self, handle: VoiceHandle) -> Result<i64> {
        self.with_voice(handle, |slot| slot.transport().frame as i64)
    }

    /// Position in seconds.
    pub fn playback_time(&self, handle: VoiceHandle) -> Result<f64> {
        let runtime = self.runtime()?;
        let slot = runtime.pool.resolve(handle)?;
        Ok(slot.transport().frame as f64 / runtime.shared.sample_rate as f64)
    }

    pub fn clip_info(&self, handle: VoiceHandle) -> Result<ClipInfo> {
        self.runtime()?.pool.clip_info(handle)
    }

    /// Number of loaded voices.
    pub fn voice_count(&self) -> usize {
        self.runtime().map(|r| r.pool.active()).unwrap_or(0)
    }

    /// Capacity of the voice pool, 0 when not running.
    pub fn max_voices(&self) -> usize {
        self.runtime().map(|r| r.pool.capacity()).unwrap_or(0)
    }

    /// Sets the gain applied after mixing, clamped to [0, 1]. Kept across
    /// sessions.
    pub fn set_master_volume(&self, volume: f32) {
        self.master_volume
            .store(clamp_volume(volume), Ordering::Release);
    }

    pub fn master_volume(&self) -> f32 {
        self.master_volume.load(Ordering::Acquire)
    }

    /// Peak absolute sample of the last rendered period.
    pub fn peak_level(&self) -> f32 {
        self.runtime()
            .map(|r| r.shared.peak_level.load(Ordering::Acquire))
            .unwrap_or(0.0)
    }

    /// Seconds of audio rendered this session, interpolated between periods.
    pub fn dsp_time(&self) -> f64 {
        self.runtime()
            .map(|r| r.shared.clock.time_seconds())
            .unwrap_or(0.0)
    }

    /// Render periods that overran their deadline.
    pub fn underrun_count(&self) -> u64 {
        self.runtime()
            .map(|r| r.shared.underruns.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.runtime()
            .map(|r| {
                r.pool.collect();
                r.pool.memory_usage()
            })
            .unwrap_or_default()
    }

    /// Takes the oldest pending event without blocking.
    pub fn poll_event(&self) -> Option<UnAudioEvent> {
        let runtime = self.runtime().ok()?;
        runtime.shared.events.pop().or_else(|| {
            // A device can die with no render calls left to report it.
            runtime
                .shared
                .device_lost
                .swap(false, Ordering::AcqRel)
                .then_some(UnAudioEvent::DeviceChanged)
        })
    }

    /// Drains every pending event.
    pub fn poll_events(&self) -> Vec<UnAudioEvent> {
        std::iter::from_fn(|| self.poll_event()).collect()
    }

    /// Events discarded because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.runtime()
            .map(|r| r.shared.events.dropped())
            .unwrap_or(0)
    }
}

impl Drop for UnAudioEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_stream(output: &mut dyn AudioOutput, config: &UnAudioConfig, runtime: &Runtime) -> Result<()> {
    let mixer = runtime.pool.build_mixer();
    runtime.shared.stream_live.store(true, Ordering::SeqCst);
    let monitor = DeviceMonitor::new(runtime.shared.clone());
    output.open(config, mixer, monitor).inspect_err(|_| {
        runtime.shared.stream_live.store(false, Ordering::SeqCst);
    })
}

fn stop_stream(output: &mut dyn AudioOutput, runtime: &Runtime) {
    runtime.shared.stream_live.store(false, Ordering::SeqCst);
    output.close();
    runtime.shared.wait_quiescent();
}
