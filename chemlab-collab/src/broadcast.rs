//! Per-room fan-out with backpressure.
//!
//! Each room owns one tokio broadcast channel; every connected session
//! subscribes once and receives pre-encoded frames wrapped in an
//! [`Envelope`]. The frame is serialized once per broadcast and shared
//! via `Arc` across all receivers. Sender exclusion is carried in the
//! envelope and applied by each connection task, since only it knows
//! which sid it serves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::Sid;

/// A broadcast frame plus its routing metadata.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Session that caused this broadcast.
    pub origin: Sid,
    /// When set, the connection serving `origin` must not deliver the
    /// frame back to it (cursor, lab and molecule relays).
    pub exclude_origin: bool,
    /// Pre-encoded JSON frame, shared across receivers.
    pub frame: Arc<String>,
}

/// Statistics snapshot for monitoring fanout health.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

/// Lock-free counters, updated on the hot path without locks.
struct AtomicFanoutStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out group for a single room.
///
/// Subscribers that lag behind `capacity` buffered messages start
/// dropping the oldest ones (`RecvError::Lagged`).
pub struct FanoutGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    stats: Arc<AtomicFanoutStats>,
}

impl FanoutGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: Arc::new(AtomicFanoutStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe a session to this room's broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Broadcast a pre-encoded frame to every subscriber.
    ///
    /// Returns the number of receivers the frame was handed to; zero
    /// when nobody is subscribed (which is not an error).
    pub fn send(&self, origin: Sid, exclude_origin: bool, frame: String) -> usize {
        let envelope = Envelope {
            origin,
            exclude_origin,
            frame: Arc::new(frame),
        };
        let count = self.sender.send(envelope).unwrap_or(0);
        if count == 0 {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Number of currently-subscribed sessions.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_fanout_reaches_all_subscribers() {
        let group = FanoutGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        let origin = Uuid::new_v4();
        let count = group.send(origin, false, "{\"event\":\"x\"}".into());
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(envelope.origin, origin);
            assert!(!envelope.exclude_origin);
            assert_eq!(*envelope.frame, "{\"event\":\"x\"}");
        }
    }

    #[tokio::test]
    async fn test_exclusion_flag_carried() {
        let group = FanoutGroup::new(16);
        let mut rx = group.subscribe();

        let origin = Uuid::new_v4();
        group.send(origin, true, "{}".into());

        let envelope = rx.recv().await.unwrap();
        assert!(envelope.exclude_origin);
    }

    #[tokio::test]
    async fn test_send_without_subscribers_counts_dropped() {
        let group = FanoutGroup::new(16);
        let count = group.send(Uuid::new_v4(), false, "{}".into());
        assert_eq!(count, 0);

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_stats_track_sends() {
        let group = FanoutGroup::new(16);
        let _rx = group.subscribe();

        let origin = Uuid::new_v4();
        group.send(origin, false, "{}".into());
        group.send(origin, false, "{}".into());

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.receivers, 1);
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let group = FanoutGroup::new(64);
        let mut rx = group.subscribe();
        let origin = Uuid::new_v4();

        for i in 0..10 {
            group.send(origin, false, format!("{{\"seq\":{i}}}"));
        }
        for i in 0..10 {
            let envelope = rx.recv().await.unwrap();
            assert_eq!(*envelope.frame, format!("{{\"seq\":{i}}}"));
        }
    }

    #[test]
    fn test_capacity_reported() {
        let group = FanoutGroup::new(32);
        assert_eq!(group.capacity(), 32);
    }
}
