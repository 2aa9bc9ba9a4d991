//! Outbound packet queue
//!
//! Producers (packet handlers on other clients' reader threads, the broadcast
//! thread) append encoded frames; the owning client's writer thread drains
//! them in FIFO order. The queue is unbounded.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct OutboundQueue {
    packets: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: Vec<u8>) {
        self.packets.lock().push_back(packet);
        self.available.notify_one();
    }

    /// Takes every queued packet, oldest first
    ///
    /// Waits up to `timeout` for the first packet when the queue is empty and
    /// returns an empty `Vec` if none arrives in time.
    pub fn drain(&self, timeout: Duration) -> Vec<Vec<u8>> {
        let mut packets = self.packets.lock();
        if packets.is_empty() && !timeout.is_zero() {
            let _ = self.available.wait_for(&mut packets, timeout);
        }
        packets.drain(..).collect()
    }

    /// Wakes a writer blocked in [`OutboundQueue::drain`]
    pub fn wake(&self) {
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let queue = OutboundQueue::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        queue.push(vec![3]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(Duration::ZERO), vec![vec![1], vec![2], vec![3]]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_empty_times_out() {
        let queue = OutboundQueue::new();
        let start = Instant::now();
        assert!(queue.drain(Duration::from_millis(20)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_drain_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new());

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.push(b"hello".to_vec());
            })
        };

        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while received.is_empty() && Instant::now() < deadline {
            received = queue.drain(Duration::from_secs(1));
        }
        producer.join().unwrap();

        assert_eq!(received, vec![b"hello".to_vec()]);
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let queue = Arc::new(OutboundQueue::new());
        let handles: Vec<_> = (0..4u8)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..100u8 {
                        queue.push(vec![producer, seq]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let packets = queue.drain(Duration::ZERO);
        assert_eq!(packets.len(), 400);
        for producer in 0..4u8 {
            let seqs: Vec<u8> = packets
                .iter()
                .filter(|p| p[0] == producer)
                .map(|p| p[1])
                .collect();
            assert_eq!(seqs, (0..100u8).collect::<Vec<_>>());
        }
    }
}
