//! Voice handles, playback state and the per-slot state shared with the
//! render callback.
//!
//! - [`VoiceHandle`]: opaque handle returned by `load_audio`
//! - [`PlaybackState`]: Stopped / Playing / Paused / Finished
//! - [`Transport`]: the `(state, frame)` pair published as one atomic word
//! - [`VoiceSlot`]: lock-free fields read by the mixer every callback

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Lightweight handle identifying a voice in the pool.
///
/// The low 16 bits hold the slot index, the next 15 bits the slot generation.
/// Valid handles are always non-negative; [`VoiceHandle::INVALID`] is `-1`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoiceHandle(i32);

const SLOT_BITS: u32 = 16;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;
pub(crate) const GENERATION_MASK: u32 = 0x7FFF;

impl VoiceHandle {
    pub const INVALID: VoiceHandle = VoiceHandle(-1);

    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        let raw = ((generation & GENERATION_MASK) << SLOT_BITS) | (slot as u32 & SLOT_MASK);
        Self(raw as i32)
    }

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    pub(crate) fn slot(&self) -> usize {
        (self.0 as u32 & SLOT_MASK) as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        (self.0 as u32 >> SLOT_BITS) & GENERATION_MASK
    }
}

impl std::fmt::Display for VoiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "Voice({}:{})", self.slot(), self.generation())
        } else {
            write!(f, "Voice(invalid)")
        }
    }
}

/// Playback state of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    /// Not playing, cursor at the start
    Stopped = 0,
    /// Advanced by the render callback
    Playing = 1,
    /// Not playing, cursor retained
    Paused = 2,
    /// Reached the end of a non-looping source; only Stop or Play leave it
    Finished = 3,
}

impl PlaybackState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Playing,
            2 => Self::Paused,
            3 => Self::Finished,
            _ => Self::Stopped,
        }
    }

    pub fn code(&self) -> i32 {
        *self as i32
    }
}

/// `(state, frame)` pair packed into one 64-bit word so both are always
/// observed together. The state occupies the top byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transport {
    pub state: PlaybackState,
    pub frame: u64,
}

const FRAME_MASK: u64 = (1 << 56) - 1;

impl Transport {
    pub fn new(state: PlaybackState, frame: u64) -> Self {
        Self { state, frame }
    }

    pub fn pack(self) -> u64 {
        ((self.state as u64) << 56) | (self.frame & FRAME_MASK)
    }

    pub fn unpack(word: u64) -> Self {
        Self {
            state: PlaybackState::from_u8((word >> 56) as u8),
            frame: word & FRAME_MASK,
        }
    }
}

/// `f32` stored as its bit pattern in an `AtomicU32`.
#[derive(Debug, Default)]
pub(crate) struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f32 {
        f32::from_bits(self.0.load(order))
    }

    pub fn store(&self, value: f32, order: Ordering) {
        self.0.store(value.to_bits(), order);
    }
}

/// Slot occupancy as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Occupancy {
    Free = 0,
    Live = 1,
    /// Detach sent, waiting for the mixer to hand the clip back
    Releasing = 2,
}

/// Per-voice state shared between control threads and the render callback.
///
/// Every field is an atomic so the callback never takes a lock. Control
/// threads publish with `Release` stores and the callback reads with
/// `Acquire` loads, so a write is visible no later than the next callback.
#[derive(Debug)]
pub(crate) struct VoiceSlot {
    generation: AtomicU32,
    occupancy: AtomicU8,
    transport: AtomicU64,
    volume: AtomicF32,
    pan: AtomicF32,
    looping: AtomicBool,
    total_frames: AtomicU64,
}

impl VoiceSlot {
    pub fn new(generation: u32) -> Self {
        Self {
            generation: AtomicU32::new(generation & GENERATION_MASK),
            occupancy: AtomicU8::new(Occupancy::Free as u8),
            transport: AtomicU64::new(Transport::new(PlaybackState::Stopped, 0).pack()),
            volume: AtomicF32::new(1.0),
            pan: AtomicF32::new(0.0),
            looping: AtomicBool::new(false),
            total_frames: AtomicU64::new(0),
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn occupancy(&self) -> Occupancy {
        match self.occupancy.load(Ordering::Acquire) {
            1 => Occupancy::Live,
            2 => Occupancy::Releasing,
            _ => Occupancy::Free,
        }
    }

    pub fn set_occupancy(&self, occupancy: Occupancy) {
        self.occupancy.store(occupancy as u8, Ordering::Release);
    }

    /// Resets every field for a freshly loaded clip. Called before the slot
    /// is marked live, while the mixer holds no clip for it.
    pub fn reset_for_load(&self, total_frames: u64) {
        self.transport.store(
            Transport::new(PlaybackState::Stopped, 0).pack(),
            Ordering::Release,
        );
        self.volume.store(1.0, Ordering::Release);
        self.pan.store(0.0, Ordering::Release);
        self.looping.store(false, Ordering::Release);
        self.total_frames.store(total_frames, Ordering::Release);
    }

    /// Advances the generation so outstanding handles stop resolving.
    pub fn retire_generation(&self) {
        let next = (self.generation.load(Ordering::Acquire) + 1) & GENERATION_MASK;
        self.generation.store(next, Ordering::Release);
    }

    pub fn transport(&self) -> Transport {
        Transport::unpack(self.transport.load(Ordering::Acquire))
    }

    pub fn transport_word(&self) -> u64 {
        self.transport.load(Ordering::Acquire)
    }

    /// Publishes the mixer's advance, unless the control plane changed the
    /// transport since `observed` was read.
    pub fn publish_advance(&self, observed: u64, next: Transport) -> bool {
        self.transport
            .compare_exchange(observed, next.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Applies a control-plane transition. `f` returns `None` to leave the
    /// transport untouched. Returns the transport that was replaced.
    pub fn update_transport<F>(&self, mut f: F) -> Transport
    where
        F: FnMut(Transport) -> Option<Transport>,
    {
        let previous = self
            .transport
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                f(Transport::unpack(word)).map(Transport::pack)
            });
        match previous {
            Ok(word) | Err(word) => Transport::unpack(word),
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume, Ordering::Release);
    }

    pub fn pan(&self) -> f32 {
        self.pan.load(Ordering::Acquire)
    }

    pub fn set_pan(&self, pan: f32) {
        self.pan.store(pan, Ordering::Release);
    }

    pub fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Release);
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames.load(Ordering::Acquire)
    }
}

/// Clamps to [0, 1]; NaN becomes silence.
pub(crate) fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Clamps to [-1, 1]; NaN becomes center.
pub(crate) fn clamp_pan(pan: f32) -> f32 {
    if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) }
}
