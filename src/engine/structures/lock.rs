// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    fmt::{self, Debug},
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockTable = HashMap<String, Arc<AsyncMutex<()>>>;

/// A set of exclusive locks keyed by name. Entries exist only while a lock
/// is held or awaited, so the table does not grow with the number of names
/// ever locked.
#[derive(Clone, Default)]
pub struct NameLocks {
    table: Arc<Mutex<LockTable>>,
}

impl Debug for NameLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = lock_table(&self.table).keys().cloned().collect::<Vec<_>>();
        names.sort();
        f.debug_struct("NameLocks").field("held", &names).finish()
    }
}

fn lock_table(table: &Mutex<LockTable>) -> MutexGuard<'_, LockTable> {
    // The table is only mutated while the guard is held and no operation on
    // it can panic, so a poisoned table is still consistent.
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drop entries that only the table references. A waiter that is cancelled
/// after the holder released leaves such an entry behind.
fn prune(table: &mut LockTable) {
    table.retain(|_, m| Arc::strong_count(m) > 1);
}

impl NameLocks {
    /// Acquire the lock for name, waiting for any current holder to release
    /// it.
    pub async fn lock(&self, name: &str) -> NameLockGuard {
        let mutex = {
            let mut table = lock_table(&self.table);
            prune(&mut table);
            Arc::clone(
                table
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        trace!("Acquiring lock on {name}");
        let guard = mutex.lock_owned().await;
        trace!("Acquired lock on {name}");
        NameLockGuard {
            name: name.to_string(),
            table: Arc::clone(&self.table),
            _guard: guard,
        }
    }

    /// Acquire the lock for name only if nobody holds it.
    pub fn try_lock(&self, name: &str) -> Option<NameLockGuard> {
        let mut table = lock_table(&self.table);
        prune(&mut table);
        let mutex = Arc::clone(
            table
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        );
        match mutex.try_lock_owned() {
            Ok(guard) => {
                trace!("Acquired lock on {name}");
                Some(NameLockGuard {
                    name: name.to_string(),
                    table: Arc::clone(&self.table),
                    _guard: guard,
                })
            }
            Err(_) => {
                trace!("Lock on {name} is held");
                None
            }
        }
    }

    /// Whether any task holds or awaits the lock for name.
    pub fn is_locked(&self, name: &str) -> bool {
        lock_table(&self.table)
            .get(name)
            .is_some_and(|m| Arc::strong_count(m) > 1)
    }
}

pub struct NameLockGuard {
    name: String,
    table: Arc<Mutex<LockTable>>,
    _guard: OwnedMutexGuard<()>,
}

impl NameLockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for NameLockGuard {
    fn drop(&mut self) {
        trace!("Dropping lock on {}", self.name);
        let mut table = lock_table(&self.table);
        // One reference is held by the table and one by this guard; any
        // other reference belongs to a waiter.
        if table
            .get(&self.name)
            .map(|m| Arc::strong_count(m) <= 2)
            .unwrap_or(false)
        {
            table.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive_per_name() {
        let locks = NameLocks::default();
        let guard = locks.lock("pvc-1").await;
        assert!(locks.try_lock("pvc-1").is_none());
        assert!(locks.try_lock("pvc-2").is_some());
        assert!(timeout(Duration::from_millis(50), locks.lock("pvc-1"))
            .await
            .is_err());
        drop(guard);
        assert!(timeout(Duration::from_millis(50), locks.lock("pvc-1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_released_entries_are_removed() {
        let locks = NameLocks::default();
        {
            let guard = locks.lock("pvc-1").await;
            assert_eq!(guard.name(), "pvc-1");
            assert!(locks.is_locked("pvc-1"));
        }
        assert!(!locks.is_locked("pvc-1"));
    }

    #[tokio::test]
    async fn test_waiter_keeps_entry() {
        let locks = NameLocks::default();
        let guard = locks.lock("pvc-1").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("pvc-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.is_ok());
        assert!(!locks.is_locked("pvc-1"));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_entry() {
        let locks = NameLocks::default();
        let guard = locks.lock("pvc-1").await;
        let mut waiter = Box::pin(locks.lock("pvc-1"));
        assert!(futures::poll!(&mut waiter).is_pending());
        drop(guard);
        drop(waiter);
        assert!(!locks.is_locked("pvc-1"));

        let _guard = locks.lock("pvc-2").await;
        assert!(!format!("{locks:?}").contains("pvc-1"));
        assert!(locks.try_lock("pvc-1").is_some());
    }
}
