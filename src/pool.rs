//! Voice pool: the control-side registry of loaded clips and the handle
//! table.
//!
//! Slots are addressed by [`VoiceHandle`]s carrying the slot's generation.
//! Unloading bumps the generation, so stale handles stop resolving at once,
//! but the slot only returns to the free list after the mixer has handed its
//! clip back. A slot is therefore never reassigned while a render call may
//! still read the previous occupant.

use crate::audio_data::{ClipInfo, PcmClip};
use crate::budget::{MemoryBudget, MemoryUsage};
use crate::error::{Result, UnAudioError};
use crate::mixer::{Mixer, MixerCommand, Retired, SharedState};
use crate::voice::{Occupancy, PlaybackState, Transport, VoiceHandle, VoiceSlot};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct SlotRecord {
    clip: Arc<PcmClip>,
    info: ClipInfo,
    compressed_bytes: usize,
}

struct Registry {
    free: VecDeque<usize>,
    records: Vec<Option<SlotRecord>>,
    /// Slots waiting for the mixer's hand-back
    releasing: usize,
}

pub(crate) struct VoicePool {
    shared: Arc<SharedState>,
    budget: MemoryBudget,
    registry: Mutex<Registry>,
    commands: Sender<MixerCommand>,
    command_rx: Receiver<MixerCommand>,
    retired: Receiver<Retired>,
    retired_tx: Sender<Retired>,
    /// How long a load waits for a pending release when the pool is full
    release_wait: Duration,
}

impl VoicePool {
    pub fn new(shared: Arc<SharedState>, budget: MemoryBudget, release_wait: Duration) -> Self {
        let capacity = shared.slots.len();
        // Each slot has at most one Attach and one Detach in flight.
        let (commands, command_rx) = bounded(capacity * 2);
        let (retired_tx, retired) = bounded(capacity);
        Self {
            registry: Mutex::new(Registry {
                free: (0..capacity).collect(),
                records: (0..capacity).map(|_| None).collect(),
                releasing: 0,
            }),
            shared,
            budget,
            commands,
            command_rx,
            retired,
            retired_tx,
            release_wait,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Number of slots holding a loaded clip.
    pub fn active(&self) -> usize {
        let registry = self.lock();
        registry.records.iter().filter(|r| r.is_some()).count()
    }

    /// Looks up a live slot. Lock-free; used by every transport and
    /// property call.
    pub fn resolve(&self, handle: VoiceHandle) -> Result<&VoiceSlot> {
        if !handle.is_valid() {
            return Err(UnAudioError::invalid(format!("invalid handle {}", handle.raw())));
        }
        let slot = self
            .shared
            .slots
            .get(handle.slot())
            .ok_or_else(|| UnAudioError::invalid(format!("handle {} out of range", handle)))?;
        if slot.occupancy() != Occupancy::Live || slot.generation() != handle.generation() {
            return Err(UnAudioError::invalid(format!("stale handle {}", handle)));
        }
        Ok(slot)
    }

    /// Takes a free slot for `clip` and publishes it to the mixer.
    pub fn load(&self, clip: Arc<PcmClip>, info: ClipInfo, compressed_bytes: usize) -> Result<VoiceHandle> {
        let decoded_bytes = clip.decoded_bytes();
        self.budget.try_reserve(compressed_bytes, decoded_bytes)?;

        let (mut registry, index) = self.take_free_slot();
        let Some(index) = index else {
            self.budget.release(compressed_bytes, decoded_bytes);
            return Err(UnAudioError::OutOfHandles);
        };

        let slot = &self.shared.slots[index];
        slot.reset_for_load(clip.total_frames() as u64);
        let generation = slot.generation();
        slot.set_occupancy(Occupancy::Live);

        let attach = MixerCommand::Attach {
            slot: index,
            generation,
            clip: clip.clone(),
        };
        if self.commands.try_send(attach).is_err() {
            slot.set_occupancy(Occupancy::Free);
            registry.free.push_front(index);
            self.budget.release(compressed_bytes, decoded_bytes);
            return Err(UnAudioError::Platform("mixer command queue is full".into()));
        }

        registry.records[index] = Some(SlotRecord {
            clip,
            info,
            compressed_bytes,
        });
        Ok(VoiceHandle::new(index, generation))
    }

    /// Releases a voice. Unknown or stale handles are ignored.
    pub fn unload(&self, handle: VoiceHandle) -> bool {
        let mut registry = self.lock();
        self.collect_retired(&mut registry);

        let Ok(slot) = self.resolve(handle) else {
            return false;
        };
        let index = handle.slot();

        slot.set_occupancy(Occupancy::Releasing);
        slot.retire_generation();
        slot.update_transport(|_| Some(Transport::new(PlaybackState::Stopped, 0)));
        registry.releasing += 1;

        if let Some(record) = registry.records[index].take() {
            self.budget
                .release(record.compressed_bytes, record.clip.decoded_bytes());
        }

        if self.commands.try_send(MixerCommand::Detach { slot: index }).is_err() {
            // Rebuilding the mixer on the next restart frees the slot.
            log::warn!("Mixer command queue full, {} stays reserved", handle);
        }
        true
    }

    pub fn clip_info(&self, handle: VoiceHandle) -> Result<ClipInfo> {
        let registry = self.lock();
        self.resolve(handle)?;
        registry.records[handle.slot()]
            .as_ref()
            .map(|record| record.info)
            .ok_or_else(|| UnAudioError::invalid(format!("stale handle {}", handle)))
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.budget.usage()
    }

    pub fn is_memory_warning(&self) -> bool {
        self.budget.is_warning()
    }

    /// Frees slots whose clips the mixer has handed back.
    pub fn collect(&self) {
        let mut registry = self.lock();
        self.collect_retired(&mut registry);
    }

    fn collect_retired(&self, registry: &mut Registry) {
        while let Ok(retired) = self.retired.try_recv() {
            self.finish_release(registry, retired);
        }
    }

    fn finish_release(&self, registry: &mut Registry, retired: Retired) {
        let slot = &self.shared.slots[retired.slot];
        // Hand-backs for slots that were re-attached are only clip drops.
        if slot.occupancy() == Occupancy::Releasing {
            slot.set_occupancy(Occupancy::Free);
            registry.free.push_back(retired.slot);
            registry.releasing = registry.releasing.saturating_sub(1);
        }
    }

    /// Pops a free slot. When the pool is full but a release is in flight,
    /// waits up to `release_wait` for the mixer's hand-back. The registry is
    /// unlocked while waiting so other control calls are not held up.
    fn take_free_slot(&self) -> (MutexGuard<'_, Registry>, Option<usize>) {
        let mut registry = self.lock();
        self.collect_retired(&mut registry);
        if let Some(index) = registry.free.pop_front() {
            return (registry, Some(index));
        }

        let deadline = Instant::now() + self.release_wait;
        while registry.releasing > 0 {
            let timeout = deadline.saturating_duration_since(Instant::now());
            drop(registry);
            let received = self.retired.recv_timeout(timeout);
            registry = self.lock();
            match received {
                Ok(retired) => self.finish_release(&mut registry, retired),
                // Another thread may have collected the hand-back meanwhile.
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    let index = registry.free.pop_front();
                    return (registry, index);
                }
            }
            if let Some(index) = registry.free.pop_front() {
                return (registry, Some(index));
            }
        }
        (registry, None)
    }

    /// Builds a mixer for a new stream, pre-loaded with every live clip.
    ///
    /// Must only be called while no render call can run (before the first
    /// stream is opened, or after the previous one was closed and quiesced).
    /// Pending commands are settled here directly: the new table is built
    /// from the registry and every release in flight is completed.
    pub fn build_mixer(&self) -> Mixer {
        let mut registry = self.lock();
        self.collect_retired(&mut registry);
        while self.command_rx.try_recv().is_ok() {}

        for (index, slot) in self.shared.slots.iter().enumerate() {
            if slot.occupancy() == Occupancy::Releasing {
                slot.set_occupancy(Occupancy::Free);
                registry.free.push_back(index);
            }
        }
        registry.releasing = 0;

        let clips: Vec<(usize, u32, Arc<PcmClip>)> = registry
            .records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                record
                    .as_ref()
                    .map(|r| (index, self.shared.slots[index].generation(), r.clip.clone()))
            })
            .collect();

        Mixer::new(
            self.shared.clone(),
            self.command_rx.clone(),
            self.retired_tx.clone(),
            clips,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_data::CompressionMode;
    use crate::budget::MemoryBudgetConfig;
    use crate::config::UnAudioConfig;
    use crate::voice::AtomicF32;
    use std::sync::atomic::Ordering;

    fn pool(max_voices: usize) -> (VoicePool, Mixer) {
        let config = UnAudioConfig::new().max_voices(max_voices);
        let shared = Arc::new(SharedState::new(&config, 3, Arc::new(AtomicF32::new(1.0))));
        shared.stream_live.store(true, Ordering::SeqCst);
        let pool = VoicePool::new(
            shared,
            MemoryBudget::new(MemoryBudgetConfig::default()),
            Duration::from_millis(5),
        );
        let mixer = pool.build_mixer();
        (pool, mixer)
    }

    fn clip(frames: usize) -> (Arc<PcmClip>, ClipInfo) {
        let clip = Arc::new(PcmClip::new(vec![0.5; frames], 48000, 1, 16).unwrap());
        let info = ClipInfo {
            sample_rate: 48000,
            channels: 1,
            bits_per_sample: 16,
            length_seconds: frames as f32 / 48000.0,
            total_frames: frames as i64,
            compression_mode: CompressionMode::DecompressOnLoad,
        };
        (clip, info)
    }

    fn render(mixer: &mut Mixer) {
        let mut out = vec![0.0f32; 64];
        mixer.render(&mut out);
    }

    #[test]
    fn load_resolves_and_unload_invalidates() {
        let (pool, _mixer) = pool(4);
        let (c, info) = clip(100);
        let handle = pool.load(c, info, 10).unwrap();

        assert!(pool.resolve(handle).is_ok());
        assert_eq!(pool.clip_info(handle).unwrap().total_frames, 100);
        assert_eq!(pool.active(), 1);
        assert_eq!(pool.memory_usage().compressed_bytes, 10);

        assert!(pool.unload(handle));
        assert!(pool.resolve(handle).is_err());
        assert!(!pool.unload(handle));
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.memory_usage().total_bytes, 0);
    }

    #[test]
    fn invalid_handles_are_rejected() {
        let (pool, _mixer) = pool(2);
        assert!(pool.resolve(VoiceHandle::INVALID).is_err());
        assert!(pool.resolve(VoiceHandle::new(1, 3)).is_err());
        assert!(pool.resolve(VoiceHandle::new(9, 3)).is_err());
    }

    #[test]
    fn slot_is_reused_only_after_mixer_acknowledges() {
        let (pool, mut mixer) = pool(1);
        let (c, info) = clip(100);
        let first = pool.load(c.clone(), info, 0).unwrap();
        render(&mut mixer);

        pool.unload(first);
        // The mixer has not seen the detach yet.
        assert_eq!(pool.load(c.clone(), info, 0), Err(UnAudioError::OutOfHandles));

        render(&mut mixer);
        let second = pool.load(c, info, 0).unwrap();
        assert_eq!(second.slot(), first.slot());
        assert_ne!(second.generation(), first.generation());
        assert!(pool.resolve(first).is_err());
    }

    #[test]
    fn waiting_load_leaves_the_registry_unlocked() {
        let config = UnAudioConfig::new().max_voices(1);
        let shared = Arc::new(SharedState::new(&config, 3, Arc::new(AtomicF32::new(1.0))));
        shared.stream_live.store(true, Ordering::SeqCst);
        let pool = VoicePool::new(
            shared,
            MemoryBudget::new(MemoryBudgetConfig::default()),
            Duration::from_secs(5),
        );
        let mut mixer = pool.build_mixer();
        let (c, info) = clip(100);
        let first = pool.load(c.clone(), info, 0).unwrap();
        render(&mut mixer);
        pool.unload(first);

        std::thread::scope(|scope| {
            let waiting = scope.spawn(|| pool.load(c.clone(), info, 0));
            std::thread::sleep(Duration::from_millis(50));

            let started = Instant::now();
            assert_eq!(pool.active(), 0);
            assert!(pool.clip_info(first).is_err());
            assert!(started.elapsed() < Duration::from_secs(1));

            render(&mut mixer);
            let second = waiting.join().unwrap().unwrap();
            assert_eq!(second.slot(), first.slot());
            assert!(pool.resolve(second).is_ok());
        });
    }

    #[test]
    fn rebuilt_mixer_settles_pending_releases() {
        let (pool, mixer) = pool(2);
        let (c, info) = clip(10);
        let kept = pool.load(c.clone(), info, 0).unwrap();
        let dropped = pool.load(c.clone(), info, 0).unwrap();
        pool.unload(dropped);

        // Stream restart: the old mixer never processed its commands.
        drop(mixer);
        let mut mixer = pool.build_mixer();
        assert!(pool.load(c, info, 0).is_ok());
        assert!(pool.resolve(kept).is_ok());

        pool.resolve(kept)
            .unwrap()
            .update_transport(|t| Some(Transport::new(PlaybackState::Playing, t.frame)));
        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out);
        assert!(out.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn over_budget_load_takes_no_slot() {
        let config = UnAudioConfig::new().max_voices(2);
        let shared = Arc::new(SharedState::new(&config, 0, Arc::new(AtomicF32::new(1.0))));
        let pool = VoicePool::new(
            shared,
            MemoryBudget::new(MemoryBudgetConfig {
                max_compressed_bytes: 100,
                max_decoded_bytes: 100,
                warning_threshold: 0.9,
            }),
            Duration::ZERO,
        );
        let (c, info) = clip(1000);
        assert!(matches!(
            pool.load(c, info, 10),
            Err(UnAudioError::OutOfMemory { .. })
        ));
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.memory_usage().total_bytes, 0);
    }
}
