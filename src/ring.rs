//! SPSC snapshot ring with staged handoff.
//!
//! Exactly one producer thread calls `begin_write`/`publish` and exactly one
//! consumer thread calls `begin_read_staged`/`end_read`. The reader always
//! receives the *previous* publication: publishing snapshot N is what
//! releases snapshot N-1 to readers, so the slot being read is never the one
//! being rewritten. Slot payloads are guarded by the slot state machine, not
//! by the per-slot locks.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::error::{EcsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Writing,
    Published,
    Reading,
}

struct SlotRecord {
    state: SlotState,
    write_epoch: u64,
    read_epoch: u64,
}

/// Fixed-slot snapshot ring. `N >= 2` is required for the staged contract.
pub struct SnapshotRing<T, const N: usize> {
    slots: [UnsafeCell<T>; N],
    meta: [Mutex<SlotRecord>; N],
    published_epoch: AtomicU64,
    published_slot: AtomicI32,
    previous_published_slot: AtomicI32,
    next_write_slot: AtomicU32,
    /// Free-event counter + condvar; waiters re-probe when it moves.
    free_events: Mutex<u64>,
    free_cv: Condvar,
    reset_epoch: AtomicU64,
}

// Payload access is handed out by slot-state ownership: a Writing slot
// belongs to the single producer, a Reading slot to the single consumer.
unsafe impl<T: Send + Sync, const N: usize> Send for SnapshotRing<T, N> {}
unsafe impl<T: Send + Sync, const N: usize> Sync for SnapshotRing<T, N> {}

/// Exclusive handle to a slot being written. Dropping without `publish`
/// returns the slot to `Free`.
pub struct WriteTicket<'a, T, const N: usize> {
    ring: &'a SnapshotRing<T, N>,
    slot: usize,
    write_epoch: u64,
    consumed: bool,
}

impl<T, const N: usize> WriteTicket<'_, T, N> {
    pub fn write_epoch(&self) -> u64 {
        self.write_epoch
    }

    pub fn slot_index(&self) -> usize {
        self.slot
    }
}

impl<T, const N: usize> std::ops::Deref for WriteTicket<'_, T, N> {
    type Target = T;
    fn deref(&self) -> &T {
        // Slot is in Writing and owned by this ticket.
        unsafe { &*self.ring.slots[self.slot].get() }
    }
}

impl<T, const N: usize> std::ops::DerefMut for WriteTicket<'_, T, N> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.ring.slots[self.slot].get() }
    }
}

impl<T, const N: usize> Drop for WriteTicket<'_, T, N> {
    fn drop(&mut self) {
        if !self.consumed {
            self.ring.release_slot(self.slot);
        }
    }
}

/// Shared handle to a slot being read. Dropping without `end_read` frees it.
pub struct ReadTicket<'a, T, const N: usize> {
    ring: &'a SnapshotRing<T, N>,
    slot: usize,
    read_epoch: u64,
    consumed: bool,
}

impl<T, const N: usize> ReadTicket<'_, T, N> {
    pub fn read_epoch(&self) -> u64 {
        self.read_epoch
    }

    pub fn slot_index(&self) -> usize {
        self.slot
    }
}

impl<T, const N: usize> std::ops::Deref for ReadTicket<'_, T, N> {
    type Target = T;
    fn deref(&self) -> &T {
        // Slot is in Reading and owned by this ticket.
        unsafe { &*self.ring.slots[self.slot].get() }
    }
}

impl<T, const N: usize> Drop for ReadTicket<'_, T, N> {
    fn drop(&mut self) {
        if !self.consumed {
            self.ring.release_slot(self.slot);
        }
    }
}

impl<T: Default, const N: usize> SnapshotRing<T, N> {
    pub fn new() -> Self {
        assert!(N >= 2, "staged handoff requires at least two slots");
        Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(T::default())),
            meta: std::array::from_fn(|_| {
                Mutex::new(SlotRecord {
                    state: SlotState::Free,
                    write_epoch: 0,
                    read_epoch: 0,
                })
            }),
            published_epoch: AtomicU64::new(0),
            published_slot: AtomicI32::new(-1),
            previous_published_slot: AtomicI32::new(-1),
            next_write_slot: AtomicU32::new(0),
            free_events: Mutex::new(0),
            free_cv: Condvar::new(),
            reset_epoch: AtomicU64::new(0),
        }
    }
}

impl<T, const N: usize> SnapshotRing<T, N> {
    /// Acquire a free slot for writing, blocking while the ring is full.
    /// A concurrent `reset()` releases the waiter with `RingReset`.
    pub fn begin_write(&self) -> Result<WriteTicket<'_, T, N>> {
        let reset_at_entry = self.reset_epoch.load(Ordering::Acquire);
        loop {
            let observed_events = *self.free_events.lock();

            for _ in 0..N {
                let slot = self.next_write_slot.load(Ordering::Relaxed) as usize % N;
                self.next_write_slot
                    .store((slot as u32 + 1) % N as u32, Ordering::Relaxed);

                let mut record = self.meta[slot].lock();
                if record.state == SlotState::Free {
                    record.state = SlotState::Writing;
                    let write_epoch = self.published_epoch.load(Ordering::Acquire) + 1;
                    record.write_epoch = write_epoch;
                    return Ok(WriteTicket {
                        ring: self,
                        slot,
                        write_epoch,
                        consumed: false,
                    });
                }
            }

            let mut events = self.free_events.lock();
            if self.reset_epoch.load(Ordering::Acquire) != reset_at_entry {
                return Err(EcsError::RingReset);
            }
            if *events == observed_events {
                self.free_cv.wait(&mut events);
            }
            if self.reset_epoch.load(Ordering::Acquire) != reset_at_entry {
                return Err(EcsError::RingReset);
            }
        }
    }

    /// Publish a written slot. The previously published slot becomes the
    /// staged read target; the slot staged before that returns to `Free`.
    pub fn publish(&self, mut ticket: WriteTicket<'_, T, N>) {
        ticket.consumed = true;
        let slot = ticket.slot;
        let write_epoch = ticket.write_epoch;

        {
            let mut record = self.meta[slot].lock();
            record.state = SlotState::Published;
            record.write_epoch = write_epoch;
        }

        let previous_current = self
            .published_slot
            .swap(slot as i32, Ordering::AcqRel);
        let stale_previous = self
            .previous_published_slot
            .swap(previous_current, Ordering::AcqRel);
        self.published_epoch.store(write_epoch, Ordering::Release);

        if stale_previous >= 0 && stale_previous != previous_current {
            let mut record = self.meta[stale_previous as usize].lock();
            if record.state == SlotState::Published {
                record.state = SlotState::Free;
                drop(record);
                self.notify_free();
            }
        }
    }

    /// Staged read: returns the second-most-recent publication, or `None`
    /// until the ring has seen two publishes since reset.
    pub fn begin_read_staged(&self) -> Option<ReadTicket<'_, T, N>> {
        let read_slot = self.previous_published_slot.load(Ordering::Acquire);
        if read_slot < 0 {
            return None;
        }

        let slot = read_slot as usize;
        let mut record = self.meta[slot].lock();
        if record.state != SlotState::Published {
            return None;
        }

        record.state = SlotState::Reading;
        record.read_epoch = record.write_epoch;
        Some(ReadTicket {
            ring: self,
            slot,
            read_epoch: record.read_epoch,
            consumed: false,
        })
    }

    pub fn end_read(&self, mut ticket: ReadTicket<'_, T, N>) {
        ticket.consumed = true;
        self.release_slot(ticket.slot);
    }

    /// Free every slot, zero the epochs, and wake (and fail) any waiter.
    /// The producer must not be mid-write when this runs.
    pub fn reset(&self) {
        for meta in &self.meta {
            let mut record = meta.lock();
            record.state = SlotState::Free;
            record.write_epoch = 0;
            record.read_epoch = 0;
        }
        self.published_epoch.store(0, Ordering::Release);
        self.published_slot.store(-1, Ordering::Release);
        self.previous_published_slot.store(-1, Ordering::Release);
        self.next_write_slot.store(0, Ordering::Release);
        self.reset_epoch.fetch_add(1, Ordering::AcqRel);
        self.notify_free();
        tracing::debug!("snapshot ring reset");
    }

    pub fn published_epoch(&self) -> u64 {
        self.published_epoch.load(Ordering::Acquire)
    }

    fn release_slot(&self, slot: usize) {
        {
            let mut record = self.meta[slot].lock();
            record.state = SlotState::Free;
        }
        self.notify_free();
    }

    fn notify_free(&self) {
        {
            let mut events = self.free_events.lock();
            *events = events.wrapping_add(1);
        }
        self.free_cv.notify_all();
    }
}

impl<T: Default, const N: usize> Default for SnapshotRing<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Frame {
        index: u64,
    }

    #[test]
    fn staged_read_lags_one_publication() {
        let ring: SnapshotRing<Frame, 3> = SnapshotRing::new();

        let mut w1 = ring.begin_write().unwrap();
        w1.index = 1;
        ring.publish(w1);
        assert!(ring.begin_read_staged().is_none());

        let mut w2 = ring.begin_write().unwrap();
        w2.index = 2;
        ring.publish(w2);

        let r = ring.begin_read_staged().unwrap();
        assert_eq!(r.read_epoch(), 1);
        assert_eq!(r.index, 1);
        ring.end_read(r);

        let mut w3 = ring.begin_write().unwrap();
        w3.index = 3;
        ring.publish(w3);

        let r = ring.begin_read_staged().unwrap();
        assert_eq!(r.read_epoch(), 2);
        assert_eq!(r.index, 2);
        ring.end_read(r);
    }

    #[test]
    fn write_epochs_strictly_increase() {
        let ring: SnapshotRing<Frame, 3> = SnapshotRing::new();
        let mut last = 0;
        for _ in 0..6 {
            let w = ring.begin_write().unwrap();
            assert!(w.write_epoch() > last);
            last = w.write_epoch();
            ring.publish(w);
        }
    }

    #[test]
    fn abandoned_write_ticket_frees_its_slot() {
        let ring: SnapshotRing<Frame, 2> = SnapshotRing::new();
        {
            let _w = ring.begin_write().unwrap();
            // dropped without publish
        }
        // Both slots must still be acquirable.
        let w1 = ring.begin_write().unwrap();
        let w2 = ring.begin_write().unwrap();
        ring.publish(w1);
        ring.publish(w2);
    }

    #[test]
    fn reset_restores_warm_up_contract() {
        let ring: SnapshotRing<Frame, 3> = SnapshotRing::new();
        for i in 0..3 {
            let mut w = ring.begin_write().unwrap();
            w.index = i;
            ring.publish(w);
        }
        assert!(ring.begin_read_staged().is_some());

        ring.reset();
        assert!(ring.begin_read_staged().is_none());

        let mut w = ring.begin_write().unwrap();
        w.index = 10;
        assert_eq!(w.write_epoch(), 1);
        ring.publish(w);
        assert!(ring.begin_read_staged().is_none());

        let mut w = ring.begin_write().unwrap();
        w.index = 11;
        assert_eq!(w.write_epoch(), 2);
        ring.publish(w);

        let r = ring.begin_read_staged().unwrap();
        assert_eq!(r.read_epoch(), 1);
        assert_eq!(r.index, 10);
        ring.end_read(r);
    }

    #[test]
    fn reset_releases_a_blocked_producer() {
        use std::sync::Arc;

        // Ring of 2 with both non-free: producer must block in begin_write.
        let ring: Arc<SnapshotRing<Frame, 2>> = Arc::new(SnapshotRing::new());
        let w1 = ring.begin_write().unwrap();
        ring.publish(w1);
        let w2 = ring.begin_write().unwrap();
        ring.publish(w2);
        // Slot states now: one Published (current), one Published (staged).
        let _reader = ring.begin_read_staged().unwrap();

        let blocked = {
            let ring = ring.clone();
            std::thread::spawn(move || ring.begin_write().map(|_| ()))
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        ring.reset();

        let result = blocked.join().unwrap();
        assert!(matches!(result, Err(EcsError::RingReset)));
    }
}
