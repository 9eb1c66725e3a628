//! Per-conversation busy flag.
//!
//! At most one generation may stream for a conversation at a time. Later
//! requests are rejected, not queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SessionError;

#[derive(Debug, Clone, Default)]
pub struct BusyFlag {
    inner: Arc<AtomicBool>,
}

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag. The returned guard releases it on drop.
    pub fn try_acquire(&self) -> Result<BusyGuard, SessionError> {
        self.inner
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SessionError::Busy)?;
        Ok(BusyGuard {
            inner: self.inner.clone(),
        })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}

/// Holds the busy flag until dropped.
#[derive(Debug)]
pub struct BusyGuard {
    inner: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.inner.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected() {
        let flag = BusyFlag::new();
        let guard = flag.try_acquire().unwrap();
        assert!(flag.is_busy());
        assert_eq!(flag.try_acquire().unwrap_err(), SessionError::Busy);
        drop(guard);
        assert!(!flag.is_busy());
        assert!(flag.try_acquire().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let flag = BusyFlag::new();
        let other = flag.clone();
        let _guard = flag.try_acquire().unwrap();
        assert!(other.is_busy());
    }
}
