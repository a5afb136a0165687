//! Per-connection mutual exclusion.
//!
//! Two kinds of lock exist for every connection:
//!
//! - the *connection lock*, an async mutex that serializes every mutation of
//!   the stored [`crate::models::IntegrationConnection`] (token refresh,
//!   config and mapping updates, deactivation). Callers wait for it.
//! - the *run flag*, claimed for the whole duration of a sync run. Claiming
//!   it never waits: a second claim fails immediately.
//!
//! Connections are independent of each other.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Registry of connection locks and run flags, keyed by connection id.
#[derive(Default, Clone)]
pub struct ConnectionLocks {
    mutexes: Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>,
    running: Arc<Mutex<HashSet<i64>>>,
}

impl ConnectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the connection lock of `connection_id`.
    pub async fn lock(&self, connection_id: i64) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = recover(&self.mutexes);
            map.entry(connection_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Claim the run flag for `connection_id`, or `None` if a run holds it.
    pub fn try_begin_run(&self, connection_id: i64) -> Option<RunGuard> {
        let mut running = recover(&self.running);
        if !running.insert(connection_id) {
            return None;
        }
        debug!(connection_id, "sync run flag claimed");
        Some(RunGuard {
            running: self.running.clone(),
            connection_id,
        })
    }

    pub fn is_running(&self, connection_id: i64) -> bool {
        recover(&self.running).contains(&connection_id)
    }
}

/// Drop guard that clears the run flag, even if the run panics.
pub struct RunGuard {
    running: Arc<Mutex<HashSet<i64>>>,
    connection_id: i64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        recover(&self.running).remove(&self.connection_id);
        debug!(connection_id = self.connection_id, "sync run flag released");
    }
}

fn recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_run_flag_is_exclusive_per_connection() {
        let locks = ConnectionLocks::new();
        let guard = locks.try_begin_run(1).unwrap();
        assert!(locks.try_begin_run(1).is_none());
        assert!(locks.is_running(1));

        // Other connections are independent.
        let other = locks.try_begin_run(2);
        assert!(other.is_some());

        drop(guard);
        assert!(!locks.is_running(1));
        assert!(locks.try_begin_run(1).is_some());
    }

    #[tokio::test]
    async fn test_connection_lock_serializes() {
        let locks = ConnectionLocks::new();
        let guard = locks.lock(7).await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = contender.lock(7).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_locks_are_independent() {
        let locks = ConnectionLocks::new();
        let _a = locks.lock(1).await;
        tokio::time::timeout(Duration::from_millis(100), locks.lock(2))
            .await
            .unwrap();
    }
}
