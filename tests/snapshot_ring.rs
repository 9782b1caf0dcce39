//! Cross-thread snapshot ring: one producer, one consumer, staged reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use simframe::SnapshotRing;

#[derive(Default)]
struct Frame {
    value: u64,
}

#[test]
fn producer_consumer_staged_handoff() {
    const FRAMES: u64 = 200;

    let ring: Arc<SnapshotRing<Frame, 3>> = Arc::new(SnapshotRing::new());
    let done = Arc::new(AtomicBool::new(false));

    let producer = {
        let ring = ring.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            for i in 1..=FRAMES {
                let mut ticket = ring.begin_write().expect("producer interrupted");
                assert_eq!(ticket.write_epoch(), i);
                ticket.value = ticket.write_epoch();
                ring.publish(ticket);
            }
            done.store(true, Ordering::Release);
        })
    };

    let consumer = {
        let ring = ring.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut last_epoch = 0u64;
            let mut reads = 0u64;
            loop {
                if let Some(ticket) = ring.begin_read_staged() {
                    // Payload matches the epoch it was written under, and
                    // staged reads never go backwards.
                    assert_eq!(ticket.value, ticket.read_epoch());
                    assert!(ticket.read_epoch() >= last_epoch);
                    last_epoch = ticket.read_epoch();
                    reads += 1;
                    ring.end_read(ticket);
                } else if done.load(Ordering::Acquire) {
                    break;
                } else {
                    std::thread::yield_now();
                }
            }
            (last_epoch, reads)
        })
    };

    producer.join().unwrap();
    let (last_epoch, reads) = consumer.join().unwrap();

    assert!(reads > 0);
    // The staged contract: the reader can never observe the newest epoch.
    assert!(last_epoch <= FRAMES - 1);
    assert_eq!(ring.published_epoch(), FRAMES);
}

#[test]
fn consumer_holding_a_slot_backpressures_the_producer() {
    let ring: Arc<SnapshotRing<Frame, 3>> = Arc::new(SnapshotRing::new());

    for i in 1..=2 {
        let mut w = ring.begin_write().unwrap();
        w.value = i;
        ring.publish(w);
    }
    let reader = ring.begin_read_staged().unwrap();
    assert_eq!(reader.value, 1);

    // Slots: staged(read), current(published), one free. Two more writes
    // exhaust the ring; the third must block until the read ends.
    let mut w = ring.begin_write().unwrap();
    w.value = 3;
    ring.publish(w);

    let blocked = {
        let ring = ring.clone();
        std::thread::spawn(move || {
            let mut w = ring.begin_write().expect("producer interrupted");
            w.value = 4;
            ring.publish(w);
        })
    };

    std::thread::sleep(Duration::from_millis(50));
    assert!(!blocked.is_finished());

    ring.end_read(reader);
    blocked.join().unwrap();
    assert_eq!(ring.published_epoch(), 4);
}
