//! Priority-based device locking.
//!
//! A device is held by zero or more holders, all on the same channel:
//! - **Sharing**: any priority may join holders that are on the same channel
//! - **Preemption**: a request for another channel wins only with a strictly
//!   higher priority than every current holder, which evicts them all

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// Lock-related errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// Device is held on a different channel at an equal or higher priority.
    #[error("Device is locked on channel {channel} at priority {held}")]
    Busy { channel: u32, held: i32 },

    /// Holder id is not (or no longer) registered.
    #[error("Unknown lock holder {0}")]
    UnknownHolder(u64),
}

/// Result of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    /// Id to release the lock with.
    pub id: u64,
    /// Holders evicted by this acquisition.
    pub preempted: Vec<u64>,
}

#[derive(Debug, Default)]
struct LockState {
    channel: Option<u32>,
    holders: Vec<(u64, i32)>,
}

impl LockState {
    fn max_priority(&self) -> Option<i32> {
        self.holders.iter().map(|&(_, p)| p).max()
    }

    fn check(&self, channel_uid: u32, priority: i32) -> Result<(), LockError> {
        match (self.channel, self.max_priority()) {
            (Some(current), Some(held)) if current != channel_uid && priority <= held => Err(LockError::Busy {
                channel: current,
                held,
            }),
            _ => Ok(()),
        }
    }
}

/// Device lock manager.
pub struct PriorityLock {
    state: Mutex<LockState>,
    next_id: AtomicU64,
}

impl PriorityLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Whether [`acquire`](Self::acquire) would currently succeed.
    pub fn check(&self, channel_uid: u32, priority: i32) -> Result<(), LockError> {
        self.state.lock().check(channel_uid, priority)
    }

    /// Take the lock for `channel_uid`.
    ///
    /// Joining holders on the same channel never evicts anyone. Switching the
    /// channel evicts all current holders, whose ids are returned so the
    /// caller can detach their receivers.
    pub fn acquire(&self, channel_uid: u32, priority: i32) -> Result<LockGrant, LockError> {
        let mut state = self.state.lock();
        state.check(channel_uid, priority)?;

        let preempted = if state.channel == Some(channel_uid) {
            Vec::new()
        } else {
            state.holders.drain(..).map(|(id, _)| id).collect()
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        state.channel = Some(channel_uid);
        state.holders.push((id, priority));

        Ok(LockGrant { id, preempted })
    }

    /// Release a holder. The channel is forgotten once nobody holds the lock.
    pub fn release(&self, id: u64) -> Result<(), LockError> {
        let mut state = self.state.lock();
        let before = state.holders.len();
        state.holders.retain(|&(holder, _)| holder != id);
        if state.holders.len() == before {
            return Err(LockError::UnknownHolder(id));
        }
        if state.holders.is_empty() {
            state.channel = None;
        }
        Ok(())
    }

    /// Channel the lock is currently held on.
    pub fn channel(&self) -> Option<u32> {
        self.state.lock().channel
    }

    /// Highest priority among current holders.
    pub fn max_priority(&self) -> Option<i32> {
        self.state.lock().max_priority()
    }

    pub fn holder_count(&self) -> usize {
        self.state.lock().holders.len()
    }
}

impl Default for PriorityLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_same_channel() {
        let lock = PriorityLock::new();
        let a = lock.acquire(1, 50).unwrap();
        let b = lock.acquire(1, 10).unwrap();
        assert!(a.preempted.is_empty());
        assert!(b.preempted.is_empty());
        assert_eq!(lock.holder_count(), 2);
        assert_eq!(lock.max_priority(), Some(50));
    }

    #[test]
    fn test_channel_mismatch() {
        let lock = PriorityLock::new();
        lock.acquire(1, 50).unwrap();
        assert_eq!(lock.check(2, 50), Err(LockError::Busy { channel: 1, held: 50 }));
        assert!(lock.acquire(2, 10).is_err());
        assert_eq!(lock.channel(), Some(1));
    }

    #[test]
    fn test_preemption() {
        let lock = PriorityLock::new();
        let a = lock.acquire(1, 10).unwrap();
        let b = lock.acquire(1, 20).unwrap();
        let c = lock.acquire(2, 30).unwrap();
        assert_eq!(c.preempted, vec![a.id, b.id]);
        assert_eq!(lock.channel(), Some(2));
        assert_eq!(lock.holder_count(), 1);
        assert_eq!(lock.release(a.id), Err(LockError::UnknownHolder(a.id)));
    }

    #[test]
    fn test_release_forgets_channel() {
        let lock = PriorityLock::new();
        let a = lock.acquire(1, 50).unwrap();
        lock.release(a.id).unwrap();
        assert_eq!(lock.channel(), None);
        assert!(lock.acquire(2, 0).is_ok());
    }
}
