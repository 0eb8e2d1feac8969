//! Deferred NPC respawns
//!
//! Combat pushes a request when a respawning NPC dies; the scheduler drains
//! due requests on its own tick and re-enters them through the normal spawn
//! path. Producers never block: a full queue drops the request with a warning.

use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::util::position::RegionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RespawnRequest {
    pub def_id: u16,
    pub region: RegionId,
    /// Earliest time the NPC may come back
    pub due: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RespawnQueueError {
    #[error("Respawn queue full")]
    Full,
    #[error("Respawn queue disconnected")]
    Disconnected,
}

pub struct RespawnQueue {
    sender: Sender<RespawnRequest>,
    receiver: Receiver<RespawnRequest>,
    /// Drained but not yet due (consumer side only)
    waiting: Mutex<Vec<RespawnRequest>>,
    capacity: usize,
}

impl RespawnQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            waiting: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Queue a respawn (non-blocking)
    pub fn push(&self, request: RespawnRequest) -> Result<(), RespawnQueueError> {
        self.sender.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => RespawnQueueError::Full,
            TrySendError::Disconnected(_) => RespawnQueueError::Disconnected,
        })
    }

    /// Take every request whose due time has passed, oldest first
    pub fn drain_due(&self, now: Instant) -> Vec<RespawnRequest> {
        let mut waiting = self.waiting.lock();
        waiting.extend(self.receiver.try_iter());
        let (due, later): (Vec<_>, Vec<_>) = waiting.drain(..).partition(|r| r.due <= now);
        *waiting = later;
        due
    }

    /// Requests not yet respawned
    pub fn pending_count(&self) -> usize {
        self.receiver.len() + self.waiting.lock().len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RespawnQueue {
    fn default() -> Self {
        Self::new(crate::game::constants::spawn::RESPAWN_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(def_id: u16, due: Instant) -> RespawnRequest {
        RespawnRequest {
            def_id,
            region: 1,
            due,
        }
    }

    #[test]
    fn test_drain_due_keeps_future_requests() {
        let queue = RespawnQueue::new(8);
        let now = Instant::now();
        queue.push(request(1, now)).unwrap();
        queue.push(request(2, now + Duration::from_secs(10))).unwrap();
        queue.push(request(3, now)).unwrap();

        let due: Vec<_> = queue.drain_due(now).iter().map(|r| r.def_id).collect();
        assert_eq!(due, vec![1, 3]);
        assert_eq!(queue.pending_count(), 1);

        let later = queue.drain_due(now + Duration::from_secs(10));
        assert_eq!(later.len(), 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_backpressure() {
        let queue = RespawnQueue::new(2);
        let now = Instant::now();
        assert!(queue.push(request(1, now)).is_ok());
        assert!(queue.push(request(2, now)).is_ok());
        assert_eq!(queue.push(request(3, now)), Err(RespawnQueueError::Full));

        queue.drain_due(now);
        assert!(queue.push(request(3, now)).is_ok());
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(RespawnQueue::default().capacity(), 4096);
    }
}
