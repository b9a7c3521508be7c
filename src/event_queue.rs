//! Lock-free event ring: render callback -> application threads.
//!
//! One producer (the render callback) and any number of consumers. The
//! producer owns the write index; consumers claim entries by advancing the
//! read index with a compare-and-swap. Entries are stored in atomics, so a
//! consumer that loses the race may read a half-overwritten entry, but it
//! discards it because its CAS fails.
//!
//! When full, the producer drops the new event and bumps a counter. It never
//! waits, and it never overwrites an entry that has not been consumed.

use crate::events::{RawEvent, UnAudioEvent};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Entry {
    /// kind in bits 32..40, voice id in bits 0..32
    header: AtomicU64,
    param: AtomicU32,
}

#[derive(Debug)]
pub struct EventQueue {
    entries: Box<[Entry]>,
    mask: usize,
    /// Next index to write; only the producer stores it
    head: AtomicUsize,
    /// Next index to read; consumers advance it by CAS
    tail: AtomicUsize,
    dropped: AtomicU64,
}

impl EventQueue {
    /// Creates a queue holding at least `capacity` events (rounded up to a power of two).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let entries = (0..capacity).map(|_| Entry::default()).collect();
        Self {
            entries,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Producer side. Wait-free; returns `false` and counts a drop when full.
    ///
    /// Only one thread may push at a time.
    pub fn push(&self, event: UnAudioEvent) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head.wrapping_sub(tail) >= self.entries.len() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let raw = event.to_raw();
        let entry = &self.entries[head & self.mask];
        entry
            .header
            .store(((raw.kind as u64) << 32) | raw.voice_id as u32 as u64, Ordering::Relaxed);
        entry.param.store(raw.param as u32, Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side. Non-blocking; `None` when the queue is empty.
    pub fn pop(&self) -> Option<UnAudioEvent> {
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            if tail == head {
                return None;
            }

            let entry = &self.entries[tail & self.mask];
            let header = entry.header.load(Ordering::Relaxed);
            let param = entry.param.load(Ordering::Relaxed);

            if self
                .tail
                .compare_exchange_weak(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let raw = RawEvent {
                    kind: (header >> 32) as u8,
                    voice_id: header as u32 as i32,
                    param: param as i32,
                };
                if let Some(event) = UnAudioEvent::from_raw(raw) {
                    return Some(event);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail).min(self.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::VoiceHandle;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn finished(slot: usize) -> UnAudioEvent {
        UnAudioEvent::VoiceFinished {
            voice: VoiceHandle::new(slot, 1),
        }
    }

    #[test]
    fn empty_queue_never_delivers() {
        let queue = EventQueue::new(8);
        for _ in 0..100 {
            assert_eq!(queue.pop(), None);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn fifo_order() {
        let queue = EventQueue::new(4);
        assert!(queue.push(finished(0)));
        assert!(queue.push(UnAudioEvent::BufferUnderrun { overrun_us: 42 }));
        assert!(queue.push(UnAudioEvent::DeviceChanged));

        assert_eq!(queue.pop(), Some(finished(0)));
        assert_eq!(
            queue.pop(),
            Some(UnAudioEvent::BufferUnderrun { overrun_us: 42 })
        );
        assert_eq!(queue.pop(), Some(UnAudioEvent::DeviceChanged));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(EventQueue::new(5).capacity(), 8);
        assert_eq!(EventQueue::new(0).capacity(), 1);
    }

    #[test]
    fn overflow_drops_newest() {
        let queue = EventQueue::new(2);
        assert!(queue.push(finished(0)));
        assert!(queue.push(finished(1)));
        assert!(!queue.push(finished(2)));
        assert_eq!(queue.dropped(), 1);

        // The unread events survived the overflow.
        assert_eq!(queue.pop(), Some(finished(0)));
        assert_eq!(queue.pop(), Some(finished(1)));
        assert_eq!(queue.pop(), None);

        // Space freed by consumers is reusable.
        assert!(queue.push(finished(3)));
        assert_eq!(queue.pop(), Some(finished(3)));
    }

    #[test]
    fn concurrent_consumers_see_each_event_once() {
        const TOTAL: usize = 20_000;
        let queue = Arc::new(EventQueue::new(64));
        let done = Arc::new(AtomicBool::new(false));

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match queue.pop() {
                            Some(event) => seen.push(event.voice().unwrap().slot()),
                            None if done.load(Ordering::Acquire) && queue.is_empty() => break,
                            None => std::thread::yield_now(),
                        }
                    }
                    seen
                })
            })
            .collect();

        let mut sent = 0;
        while sent < TOTAL {
            if queue.push(finished(sent % 60_000)) {
                sent += 1;
            } else {
                std::thread::yield_now();
            }
        }
        done.store(true, Ordering::Release);

        let mut all: Vec<usize> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<usize> = (0..TOTAL).collect();
        assert_eq!(all, expected);
    }
}
