//! Real-time render callback.
//!
//! A [`Mixer`] is handed to the output backend and called once per device
//! period. It never locks, allocates or logs. Control threads reach it
//! through the per-voice atomics in [`SharedState`] and a bounded command
//! channel; it answers through the event queue and the retire channel.

use crate::audio_data::PcmClip;
use crate::clock::DspClock;
use crate::config::UnAudioConfig;
use crate::event_queue::EventQueue;
use crate::events::{FAULT_EMPTY_SOURCE, UnAudioEvent};
use crate::voice::{AtomicF32, PlaybackState, Transport, VoiceHandle, VoiceSlot, clamp_volume};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// State shared by the control plane and the render callback for one
/// engine session. Survives stream restarts.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub slots: Box<[VoiceSlot]>,
    pub events: EventQueue,
    pub clock: DspClock,
    pub master_volume: Arc<AtomicF32>,
    pub peak_level: AtomicF32,
    pub callbacks: AtomicU64,
    pub underruns: AtomicU64,
    /// Set for the duration of every render call
    pub in_callback: AtomicBool,
    /// Cleared before a stream is closed; render calls then output silence
    pub stream_live: AtomicBool,
    /// Raised by the backend's error callback
    pub device_lost: AtomicBool,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SharedState {
    pub fn new(config: &UnAudioConfig, generation_seed: u32, master_volume: Arc<AtomicF32>) -> Self {
        Self {
            slots: (0..config.max_voices)
                .map(|_| VoiceSlot::new(generation_seed))
                .collect(),
            events: EventQueue::new(config.event_queue_capacity),
            clock: DspClock::new(config.sample_rate, config.buffer_size_frames),
            master_volume,
            peak_level: AtomicF32::new(0.0),
            callbacks: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            in_callback: AtomicBool::new(false),
            stream_live: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            sample_rate: config.sample_rate,
            channels: config.channels,
        }
    }

    /// Spins until no render call is in progress. `stream_live` must already
    /// be cleared, so any later call returns before touching voice state.
    pub fn wait_quiescent(&self) {
        while self.in_callback.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
    }
}

/// Messages from the voice pool to the mixer.
pub(crate) enum MixerCommand {
    /// Bind a freshly loaded clip to a slot
    Attach {
        slot: usize,
        generation: u32,
        clip: Arc<PcmClip>,
    },
    /// Drop the slot's clip and hand it back over the retire channel
    Detach { slot: usize },
}

/// Acknowledgement that the render thread no longer reads a slot, carrying
/// the slot's clip (if it had one) so it is freed off the render thread.
pub(crate) struct Retired {
    pub slot: usize,
    pub clip: Option<Arc<PcmClip>>,
}

struct Attached {
    generation: u32,
    clip: Arc<PcmClip>,
}

/// The render callback of one stream.
///
/// Backends call [`render`](Mixer::render) with an interleaved buffer of
/// `frames * channels` samples. A new mixer is built every time the stream
/// is (re)opened.
pub struct Mixer {
    shared: Arc<SharedState>,
    commands: Receiver<MixerCommand>,
    retired: Sender<Retired>,
    table: Vec<Option<Attached>>,
    /// Hand-backs that did not fit in the retire channel, retried next period
    backlog: Vec<Retired>,
}

impl Mixer {
    /// `clips` pre-populates the table, used when a stream is restarted with
    /// voices already loaded.
    pub(crate) fn new(
        shared: Arc<SharedState>,
        commands: Receiver<MixerCommand>,
        retired: Sender<Retired>,
        clips: impl IntoIterator<Item = (usize, u32, Arc<PcmClip>)>,
    ) -> Self {
        let slots = shared.slots.len();
        let mut table: Vec<Option<Attached>> = (0..slots).map(|_| None).collect();
        for (slot, generation, clip) in clips {
            if let Some(entry) = table.get_mut(slot) {
                *entry = Some(Attached { generation, clip });
            }
        }
        Self {
            shared,
            commands,
            retired,
            table,
            backlog: Vec::with_capacity(slots),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.shared.channels
    }

    /// Renders one period into `out` (interleaved, `channels()` wide).
    pub fn render(&mut self, out: &mut [f32]) {
        let started = Instant::now();
        self.shared.in_callback.store(true, Ordering::SeqCst);
        out.fill(0.0);

        if !self.shared.stream_live.load(Ordering::SeqCst) {
            self.shared.in_callback.store(false, Ordering::SeqCst);
            return;
        }

        self.apply_commands();
        self.flush_backlog();

        let shared = &*self.shared;
        let channels = shared.channels as usize;
        let frames = out.len() / channels;
        let out = &mut out[..frames * channels];

        for (index, entry) in self.table.iter().enumerate() {
            if let Some(attached) = entry {
                render_voice(shared, index, attached, out, channels, frames);
            }
        }

        let master = clamp_volume(shared.master_volume.load(Ordering::Acquire));
        let mut peak = 0.0f32;
        for sample in out.iter_mut() {
            *sample *= master;
            peak = peak.max(sample.abs());
        }
        shared.peak_level.store(peak, Ordering::Release);

        if shared.device_lost.swap(false, Ordering::AcqRel) {
            shared.events.push(UnAudioEvent::DeviceChanged);
        }

        shared.clock.advance(frames as u64);
        shared.callbacks.fetch_add(1, Ordering::Relaxed);

        if frames > 0 {
            let deadline = frames as f64 / shared.sample_rate as f64;
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > deadline {
                shared.underruns.fetch_add(1, Ordering::Relaxed);
                let overrun_us = ((elapsed - deadline) * 1e6).min(u32::MAX as f64) as u32;
                shared.events.push(UnAudioEvent::BufferUnderrun { overrun_us });
            }
        }

        shared.in_callback.store(false, Ordering::SeqCst);
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                MixerCommand::Attach {
                    slot,
                    generation,
                    clip,
                } => {
                    let replaced = self
                        .table
                        .get_mut(slot)
                        .and_then(|entry| entry.replace(Attached { generation, clip }));
                    if let Some(previous) = replaced {
                        self.retire(Retired {
                            slot,
                            clip: Some(previous.clip),
                        });
                    }
                }
                MixerCommand::Detach { slot } => {
                    let clip = self
                        .table
                        .get_mut(slot)
                        .and_then(Option::take)
                        .map(|previous| previous.clip);
                    self.retire(Retired { slot, clip });
                }
            }
        }
    }

    fn retire(&mut self, retired: Retired) {
        if let Err(e) = self.retired.try_send(retired) {
            self.backlog.push(e.into_inner());
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(retired) = self.backlog.pop() {
            if let Err(e) = self.retired.try_send(retired) {
                self.backlog.push(e.into_inner());
                break;
            }
        }
    }
}

/// Lets an output backend report device loss from its error callback.
#[derive(Clone)]
pub struct DeviceMonitor {
    shared: Arc<SharedState>,
}

impl DeviceMonitor {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        Self { shared }
    }

    /// Surfaces as a `DeviceChanged` event on the next render call or poll.
    pub fn report_device_lost(&self) {
        self.shared.device_lost.store(true, Ordering::Release);
    }
}

fn render_voice(
    shared: &SharedState,
    index: usize,
    attached: &Attached,
    out: &mut [f32],
    out_channels: usize,
    frames: usize,
) {
    let slot = &shared.slots[index];
    // Released; the detach has not arrived yet
    if slot.generation() != attached.generation {
        return;
    }

    let observed = slot.transport_word();
    let transport = Transport::unpack(observed);
    if transport.state != PlaybackState::Playing {
        return;
    }

    let voice = VoiceHandle::new(index, attached.generation);
    let clip = &*attached.clip;
    let length = clip.total_frames() as u64;
    if length == 0 {
        if slot.publish_advance(observed, Transport::new(PlaybackState::Stopped, 0)) {
            shared.events.push(UnAudioEvent::VoiceFault {
                voice,
                code: FAULT_EMPTY_SOURCE,
            });
        }
        return;
    }

    let gain = clamp_volume(slot.volume());
    let (left, right) = pan_gains(slot.pan());
    let looping = slot.looping();
    let src_channels = clip.channels() as usize;

    let mut position = if looping {
        transport.frame % length
    } else {
        transport.frame
    };
    let mut wraps = 0u32;
    let mut written = 0usize;

    while written < frames {
        if position >= length {
            if !looping {
                break;
            }
            position = 0;
            wraps += 1;
        }
        let count = (frames - written).min((length - position) as usize);
        mix_into(
            &mut out[written * out_channels..(written + count) * out_channels],
            clip.frames(position as usize, count),
            src_channels,
            out_channels,
            gain,
            left,
            right,
        );
        written += count;
        position += count as u64;
    }

    let next = if position >= length {
        if looping {
            wraps += 1;
            Transport::new(PlaybackState::Playing, 0)
        } else {
            Transport::new(PlaybackState::Finished, length)
        }
    } else {
        Transport::new(PlaybackState::Playing, position)
    };

    // Lost to a concurrent Stop/Pause/Seek: that write wins.
    if !slot.publish_advance(observed, next) {
        return;
    }
    if wraps > 0 {
        shared.events.push(UnAudioEvent::VoiceLooped { voice, wraps });
    }
    if next.state == PlaybackState::Finished {
        shared.events.push(UnAudioEvent::VoiceFinished { voice });
    }
}

/// Linear balance: the far side is attenuated, the near side stays at unity.
fn pan_gains(pan: f32) -> (f32, f32) {
    ((1.0 - pan).min(1.0), (1.0 + pan).min(1.0))
}

fn mix_into(
    dst: &mut [f32],
    src: &[f32],
    src_channels: usize,
    out_channels: usize,
    gain: f32,
    left: f32,
    right: f32,
) {
    let frames = dst
        .chunks_exact_mut(out_channels)
        .zip(src.chunks_exact(src_channels));

    if out_channels == 1 {
        let scale = gain / src_channels as f32;
        for (out_frame, in_frame) in frames {
            out_frame[0] += in_frame.iter().sum::<f32>() * scale;
        }
    } else if src_channels == 1 {
        for (out_frame, in_frame) in frames {
            let sample = in_frame[0] * gain;
            out_frame[0] += sample * left;
            out_frame[1] += sample * right;
        }
    } else if src_channels == 2 {
        for (out_frame, in_frame) in frames {
            out_frame[0] += in_frame[0] * gain * left;
            out_frame[1] += in_frame[1] * gain * right;
        }
    } else {
        for (out_frame, in_frame) in frames {
            for (o, i) in out_frame.iter_mut().zip(in_frame) {
                *o += i * gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    struct Rig {
        shared: Arc<SharedState>,
        commands: Sender<MixerCommand>,
        retired: Receiver<Retired>,
        mixer: Mixer,
    }

    fn rig(channels: u16) -> Rig {
        rig_with(
            UnAudioConfig::new()
                .channels(channels)
                .max_voices(4)
                .event_queue_capacity(16),
        )
    }

    fn rig_with(config: UnAudioConfig) -> Rig {
        let shared = Arc::new(SharedState::new(&config, 0, Arc::new(AtomicF32::new(1.0))));
        shared.stream_live.store(true, Ordering::SeqCst);
        let (commands, command_rx) = bounded(8);
        let (retired_tx, retired) = bounded(4);
        let mixer = Mixer::new(shared.clone(), command_rx, retired_tx, Vec::new());
        Rig {
            shared,
            commands,
            retired,
            mixer,
        }
    }

    fn ramp(frames: usize, channels: u16) -> Arc<PcmClip> {
        let samples = (0..frames * channels as usize)
            .map(|i| (i / channels as usize + 1) as f32 / 100.0)
            .collect();
        Arc::new(PcmClip::new(samples, 48000, channels, 32).unwrap())
    }

    impl Rig {
        fn attach(&self, slot: usize, clip: Arc<PcmClip>) -> VoiceHandle {
            let voice = &self.shared.slots[slot];
            voice.reset_for_load(clip.total_frames() as u64);
            let generation = voice.generation();
            self.commands
                .send(MixerCommand::Attach {
                    slot,
                    generation,
                    clip,
                })
                .unwrap();
            VoiceHandle::new(slot, generation)
        }

        fn play(&self, slot: usize) {
            self.shared.slots[slot]
                .update_transport(|t| Some(Transport::new(PlaybackState::Playing, t.frame)));
        }

        /// Drained events, ignoring underruns from a slow test host.
        fn events(&self) -> Vec<UnAudioEvent> {
            std::iter::from_fn(|| self.shared.events.pop())
                .filter(|e| !matches!(e, UnAudioEvent::BufferUnderrun { .. }))
                .collect()
        }
    }

    #[test]
    fn mono_source_feeds_both_channels_at_center() {
        let mut rig = rig(2);
        rig.attach(0, ramp(100, 1));
        rig.play(0);

        let mut out = vec![0.0f32; 8];
        rig.mixer.render(&mut out);
        assert_eq!(out, vec![0.01, 0.01, 0.02, 0.02, 0.03, 0.03, 0.04, 0.04]);
        assert_eq!(rig.shared.slots[0].transport().frame, 4);
        assert_eq!(rig.shared.clock.frames(), 4);
    }

    #[test]
    fn hard_left_pan_silences_right() {
        let mut rig = rig(2);
        rig.attach(0, ramp(100, 2));
        rig.shared.slots[0].set_pan(-1.0);
        rig.shared.slots[0].set_volume(0.5);
        rig.play(0);

        let mut out = vec![0.0f32; 4];
        rig.mixer.render(&mut out);
        assert_eq!(out, vec![0.005, 0.0, 0.01, 0.0]);
    }

    #[test]
    fn stopped_voices_are_silent() {
        let mut rig = rig(2);
        rig.attach(0, ramp(100, 1));

        let mut out = vec![1.0f32; 8];
        rig.mixer.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(rig.shared.slots[0].transport().frame, 0);
    }

    #[test]
    fn loop_wraps_without_gap() {
        let mut rig = rig(1);
        let voice = rig.attach(0, ramp(10, 1));
        rig.shared.slots[0].set_looping(true);
        rig.play(0);

        let mut out = vec![0.0f32; 16];
        rig.mixer.render(&mut out);
        assert!((out[9] - 0.10).abs() < 1e-6);
        assert!((out[10] - 0.01).abs() < 1e-6);
        assert!((out[15] - 0.06).abs() < 1e-6);

        let transport = rig.shared.slots[0].transport();
        assert_eq!(transport, Transport::new(PlaybackState::Playing, 6));
        assert_eq!(
            rig.events(),
            vec![UnAudioEvent::VoiceLooped { voice, wraps: 1 }]
        );
    }

    #[test]
    fn loop_ending_on_boundary_wraps_to_zero() {
        let mut rig = rig(1);
        rig.attach(0, ramp(8, 1));
        rig.shared.slots[0].set_looping(true);
        rig.play(0);

        let mut out = vec![0.0f32; 8];
        rig.mixer.render(&mut out);
        assert_eq!(rig.shared.slots[0].transport().frame, 0);
        assert!(!rig.events().iter().any(|e| matches!(e, UnAudioEvent::VoiceFinished { .. })));
    }

    #[test]
    fn exhausted_voice_finishes_once() {
        let mut rig = rig(1);
        let voice = rig.attach(0, ramp(10, 1));
        rig.play(0);

        let mut out = vec![0.0f32; 16];
        rig.mixer.render(&mut out);
        assert!(out[10..].iter().all(|s| *s == 0.0));
        assert_eq!(
            rig.shared.slots[0].transport(),
            Transport::new(PlaybackState::Finished, 10)
        );

        rig.mixer.render(&mut out);
        assert_eq!(rig.events(), vec![UnAudioEvent::VoiceFinished { voice }]);
    }

    #[test]
    fn master_volume_and_peak() {
        let mut rig = rig(1);
        rig.attach(0, ramp(100, 1));
        rig.play(0);
        rig.shared.master_volume.store(0.5, Ordering::Release);

        let mut out = vec![0.0f32; 4];
        rig.mixer.render(&mut out);
        assert!((out[3] - 0.02).abs() < 1e-6);
        assert!((rig.shared.peak_level.load(Ordering::Acquire) - 0.02).abs() < 1e-6);
    }

    #[test]
    fn detach_hands_clip_back() {
        let mut rig = rig(1);
        rig.attach(2, ramp(4, 1));
        let mut out = vec![0.0f32; 4];
        rig.mixer.render(&mut out);
        assert!(rig.retired.try_recv().is_err());

        rig.commands.send(MixerCommand::Detach { slot: 2 }).unwrap();
        rig.mixer.render(&mut out);
        let retired = rig.retired.try_recv().unwrap();
        assert_eq!(retired.slot, 2);
        assert_eq!(retired.clip.map(|c| c.total_frames()), Some(4));
    }

    #[test]
    fn released_slot_is_not_rendered() {
        let mut rig = rig(1);
        rig.attach(0, ramp(100, 1));
        rig.play(0);
        rig.shared.slots[0].retire_generation();

        let mut out = vec![0.0f32; 4];
        rig.mixer.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn empty_source_faults_and_stops() {
        let mut rig = rig(1);
        let clip = Arc::new(PcmClip::new(Vec::new(), 48000, 1, 16).unwrap());
        let voice = rig.attach(1, clip);
        rig.play(1);

        let mut out = vec![0.0f32; 4];
        rig.mixer.render(&mut out);
        rig.mixer.render(&mut out);
        assert_eq!(
            rig.events(),
            vec![UnAudioEvent::VoiceFault {
                voice,
                code: FAULT_EMPTY_SOURCE
            }]
        );
        assert_eq!(rig.shared.slots[1].transport().state, PlaybackState::Stopped);
    }

    #[test]
    fn closed_stream_renders_silence_without_advancing() {
        let mut rig = rig(1);
        rig.attach(0, ramp(100, 1));
        rig.play(0);
        rig.shared.stream_live.store(false, Ordering::SeqCst);

        let mut out = vec![1.0f32; 4];
        rig.mixer.render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(rig.shared.clock.frames(), 0);
        assert!(!rig.shared.in_callback.load(Ordering::SeqCst));
    }

    #[test]
    fn device_loss_becomes_one_event() {
        let mut rig = rig(2);
        DeviceMonitor::new(rig.shared.clone()).report_device_lost();

        let mut out = vec![0.0f32; 4];
        rig.mixer.render(&mut out);
        rig.mixer.render(&mut out);
        assert_eq!(rig.events(), vec![UnAudioEvent::DeviceChanged]);
    }

    #[test]
    fn missed_deadline_reports_one_underrun_per_period() {
        // A single frame at ~4.29 GHz has a sub-nanosecond deadline.
        let mut rig = rig_with(
            UnAudioConfig::new()
                .sample_rate(u32::MAX)
                .channels(2)
                .max_voices(4)
                .event_queue_capacity(16),
        );

        let mut out = vec![0.0f32; 2];
        for _ in 0..3 {
            rig.mixer.render(&mut out);
        }

        let events: Vec<_> = std::iter::from_fn(|| rig.shared.events.pop()).collect();
        assert_eq!(events.len(), 3);
        assert!(
            events
                .iter()
                .all(|e| matches!(e, UnAudioEvent::BufferUnderrun { .. }))
        );
        assert_eq!(rig.shared.underruns.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn empty_render_never_counts_as_underrun() {
        let mut rig = rig_with(UnAudioConfig::new().sample_rate(u32::MAX).channels(2));
        rig.mixer.render(&mut []);
        assert!(rig.shared.events.pop().is_none());
        assert_eq!(rig.shared.underruns.load(Ordering::Relaxed), 0);
    }
}
