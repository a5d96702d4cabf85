// SPDX-License-Identifier: MIT OR Apache-2.0

//! Distributed advisory locks.
//!
//! In production the lock lives in the shared relational store (advisory
//! locks); [`MemoryLockService`] provides the same semantics in-process for
//! tests and single-node deployments. Locks are non-reentrant and
//! non-blocking: `try_lock` either acquires or reports contention.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

/// Named advisory locks shared across scheduler (and other) replicas.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Attempt to acquire the named lock. Returns `false` on contention.
    async fn try_lock(&self, name: &str) -> bool;

    /// Release the named lock. Releasing an unheld lock is a no-op.
    async fn unlock(&self, name: &str);
}

/// In-process [`LockService`].
///
/// Cloning shares the lock table, which is how multiple replicas in a test
/// contend for the same named lock.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    held: Mutex<HashSet<String>>,
}

impl MemoryLockService {
    /// Create a service with no locks held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the named lock is currently held.
    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().expect("lock table poisoned").contains(name)
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn try_lock(&self, name: &str) -> bool {
        self.held
            .lock()
            .expect("lock table poisoned")
            .insert(name.to_string())
    }

    async fn unlock(&self, name: &str) {
        self.held.lock().expect("lock table poisoned").remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn lock_excludes_second_acquirer() {
        let locks = MemoryLockService::new();
        assert!(locks.try_lock("tick").await);
        assert!(!locks.try_lock("tick").await);
        locks.unlock("tick").await;
        assert!(locks.try_lock("tick").await);
    }

    #[tokio::test]
    async fn locks_are_independent_by_name() {
        let locks = MemoryLockService::new();
        assert!(locks.try_lock("a").await);
        assert!(locks.try_lock("b").await);
    }

    #[tokio::test]
    async fn unlock_of_unheld_lock_is_noop() {
        let locks = MemoryLockService::new();
        locks.unlock("never-held").await;
        assert!(locks.try_lock("never-held").await);
    }

    #[tokio::test]
    async fn contention_across_shared_handles() {
        let locks = Arc::new(MemoryLockService::new());
        let a = Arc::clone(&locks);
        let b = Arc::clone(&locks);
        let (ra, rb) = tokio::join!(a.try_lock("tick"), b.try_lock("tick"));
        assert!(ra ^ rb, "exactly one replica wins the lock");
    }
}
