//! Fan-out of text frames to every other member of a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames; a member that falls further behind loses frames, which the
//! sessions' periodic anti-entropy sync repairs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A frame tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: u64,
    pub text: Arc<str>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub members: usize,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    members: AtomicUsize,
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new group; `capacity` frames are buffered per member.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            members: AtomicUsize::new(0),
            frames_sent: AtomicU64::new(0),
            frames_lagged: AtomicU64::new(0),
        }
    }

    /// Add a member; the returned receiver yields frames from everyone.
    pub fn join(&self) -> broadcast::Receiver<Frame> {
        self.members.fetch_add(1, Ordering::Relaxed);
        self.sender.subscribe()
    }

    pub fn leave(&self) {
        let _ = self
            .members
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Send a frame to every member. Returns the receiver count.
    pub fn broadcast(&self, origin: u64, text: impl Into<Arc<str>>) -> usize {
        let count = self
            .sender
            .send(Frame { origin, text: text.into() })
            .unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Receive the next frame not sent by `me`.
    ///
    /// Returns `None` once the group is gone. Lag is logged and counted,
    /// then receiving continues with the oldest frame still buffered.
    pub async fn recv_for(&self, me: u64, rx: &mut broadcast::Receiver<Frame>) -> Option<Frame> {
        loop {
            match rx.recv().await {
                Ok(frame) if frame.origin == me => continue,
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Connection {me} lagged, {skipped} frames dropped");
                    self.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.frames_lagged.load(Ordering::Relaxed),
            members: self.member_count(),
        }
    }
}

/// One broadcast group per room name.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    capacity: usize,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Get or create the group for `room`.
    pub async fn room(&self, room: &str) -> Arc<BroadcastGroup> {
        if let Some(group) = self.rooms.read().await.get(room) {
            return group.clone();
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity)))
            .clone()
    }

    /// Drop the room if nobody is left in it.
    pub async fn release(&self, room: &str) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room).is_some_and(|g| g.member_count() == 0) {
            rooms.remove(room);
            log::debug!("Room {room} closed");
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_skips_origin() {
        let group = BroadcastGroup::new(16);
        let mut rx_a = group.join();
        let mut rx_b = group.join();

        group.broadcast(1, "from a");
        group.broadcast(2, "from b");

        let got_a = group.recv_for(1, &mut rx_a).await.unwrap();
        assert_eq!(&*got_a.text, "from b");

        let got_b = group.recv_for(2, &mut rx_b).await.unwrap();
        assert_eq!(&*got_b.text, "from a");
    }

    #[tokio::test]
    async fn test_lagging_member_continues() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.join();
        for i in 0..5 {
            group.broadcast(9, format!("frame {i}"));
        }

        let frame = group.recv_for(1, &mut rx).await.unwrap();
        assert_eq!(&*frame.text, "frame 3");
        assert_eq!(group.stats().frames_lagged, 3);
    }

    #[tokio::test]
    async fn test_member_count() {
        let group = BroadcastGroup::new(4);
        let _a = group.join();
        let _b = group.join();
        assert_eq!(group.member_count(), 2);
        group.leave();
        group.leave();
        group.leave();
        assert_eq!(group.member_count(), 0);
    }

    #[tokio::test]
    async fn test_room_manager_reuses_and_releases() {
        let rooms = RoomManager::new(8);
        let a = rooms.room("doc").await;
        let b = rooms.room("doc").await;
        assert!(Arc::ptr_eq(&a, &b));

        let _rx = a.join();
        rooms.release("doc").await;
        assert_eq!(rooms.room_count().await, 1);

        a.leave();
        rooms.release("doc").await;
        assert_eq!(rooms.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_without_members() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(1, "nobody"), 0);
        assert_eq!(group.stats().frames_sent, 1);
    }
}
