//! Per-deal write serialization
//!
//! Every mutation of a deal runs its whole validate-commit-record sequence
//! under that deal's guard. Different deals proceed in parallel. A lock is
//! freed when its last guard drops and nobody else waits on it.

use dashmap::DashMap;
use dealflow_model::DealId;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per deal, created on first use
#[derive(Debug, Default)]
pub struct DealLocks {
    locks: DashMap<DealId, Arc<Mutex<()>>>,
}

impl DealLocks {
    /// No locks yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to a deal
    pub async fn lock(&self, id: DealId) -> DealGuard<'_> {
        let lock = self.locks.entry(id).or_default().clone();
        DealGuard {
            locks: self,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Drop the lock of a deal nobody holds or waits on
    fn release_idle(&self, id: DealId) {
        // Holders and waiters each keep a clone; the map holds the last one
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Deals with a lock allocated
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// No locks allocated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one deal; frees the lock entry on drop when idle
#[derive(Debug)]
pub struct DealGuard<'a> {
    locks: &'a DealLocks,
    id: DealId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DealGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release_idle(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_deal_is_exclusive() {
        let locks = Arc::new(DealLocks::new());
        let id = DealId::new();
        let guard = locks.lock(id).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn different_deals_do_not_block() {
        let locks = DealLocks::new();
        let _a = locks.lock(DealId::new()).await;
        let _b = locks.lock(DealId::new()).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn lock_entry_freed_when_last_guard_drops() {
        let locks = Arc::new(DealLocks::new());
        let id = DealId::new();
        let guard = locks.lock(id).await;
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
