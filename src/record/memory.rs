// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A RecordStore kept in process memory. Every write is assigned the next
//! resource version of the store and is published to watchers in that
//! order. A watcher that falls behind the broadcast channel catches up from
//! a bounded history of recent events.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::{
    engine::DeleteAction,
    lvmcsi::{LvmCsiError, LvmCsiResult},
    record::{
        store::{RecordStore, RecordWatch, WatchEvent},
        types::LogicalVolumeRecord,
    },
};

const WATCH_CHANNEL_CAPACITY: usize = 256;
const WATCH_HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
struct StoreEvent {
    version: u64,
    event: WatchEvent,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, LogicalVolumeRecord>,
    version: u64,
    history: VecDeque<StoreEvent>,
    read_failures: usize,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn publish(&mut self, sender: &broadcast::Sender<StoreEvent>, event: WatchEvent) {
        let event = StoreEvent {
            version: event.record().metadata.resource_version,
            event,
        };
        self.history.push_back(event.clone());
        if self.history.len() > WATCH_HISTORY_LIMIT {
            self.history.pop_front();
        }
        if sender.send(event).is_err() {
            trace!("No record watchers to notify");
        }
    }

    fn check_readable(&mut self) -> LvmCsiResult<()> {
        if self.read_failures > 0 {
            self.read_failures -= 1;
            return Err(LvmCsiError::unavailable("record store is unavailable"));
        }
        Ok(())
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    // Every mutation of Inner completes before the guard is released.
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    sender: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        MemoryStore {
            inner: Arc::new(Mutex::new(Inner::default())),
            sender,
        }
    }

    /// Make the next n reads fail as if the store were unreachable.
    pub fn fail_reads(&self, n: usize) {
        lock_inner(&self.inner).read_failures = n;
    }
}

struct WatchState {
    receiver: broadcast::Receiver<StoreEvent>,
    inner: Arc<Mutex<Inner>>,
    backlog: VecDeque<StoreEvent>,
    last_version: u64,
}

impl WatchState {
    fn refill_backlog(&mut self) {
        let inner = lock_inner(&self.inner);
        let oldest = inner.history.front().map(|e| e.version).unwrap_or(0);
        if oldest > self.last_version + 1 {
            warn!(
                "Record watcher missed events {} to {}",
                self.last_version + 1,
                oldest - 1
            );
        }
        self.backlog.extend(
            inner
                .history
                .iter()
                .filter(|e| e.version > self.last_version)
                .cloned(),
        );
    }

    async fn next(&mut self) -> Option<WatchEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_version = event.version;
            return Some(event.event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.version <= self.last_version {
                        continue;
                    }
                    self.last_version = event.version;
                    return Some(event.event);
                }
                Err(RecvError::Lagged(_)) => {
                    self.refill_backlog();
                    if let Some(event) = self.backlog.pop_front() {
                        self.last_version = event.version;
                        return Some(event.event);
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create(&self, mut record: LogicalVolumeRecord) -> LvmCsiResult<LogicalVolumeRecord> {
        let mut inner = lock_inner(&self.inner);
        if inner.records.contains_key(record.name()) {
            return Err(LvmCsiError::already_exists(format!(
                "record {} already exists",
                record.name()
            )));
        }
        record.metadata.uid = Uuid::new_v4().to_string();
        record.metadata.resource_version = inner.next_version();
        record.metadata.generation = 1;
        record.metadata.creation_timestamp = Some(Utc::now());
        record.metadata.deletion_timestamp = None;
        inner
            .records
            .insert(record.name().to_string(), record.clone());
        inner.publish(&self.sender, WatchEvent::Added(record.clone()));
        Ok(record)
    }

    async fn get(&self, name: &str) -> LvmCsiResult<LogicalVolumeRecord> {
        let mut inner = lock_inner(&self.inner);
        inner.check_readable()?;
        inner
            .records
            .get(name)
            .cloned()
            .ok_or_else(|| LvmCsiError::not_found(format!("record {name} not found")))
    }

    async fn list(&self) -> LvmCsiResult<Vec<LogicalVolumeRecord>> {
        let mut inner = lock_inner(&self.inner);
        inner.check_readable()?;
        Ok(inner.records.values().cloned().collect())
    }

    async fn update(&self, mut record: LogicalVolumeRecord) -> LvmCsiResult<LogicalVolumeRecord> {
        let mut inner = lock_inner(&self.inner);
        let current = inner
            .records
            .get(record.name())
            .ok_or_else(|| LvmCsiError::not_found(format!("record {} not found", record.name())))?;
        if current.metadata.resource_version != record.metadata.resource_version {
            return Err(LvmCsiError::conflict(format!(
                "record {} was modified: resource version is {}, not {}",
                record.name(),
                current.metadata.resource_version,
                record.metadata.resource_version
            )));
        }

        record.metadata.uid = current.metadata.uid.clone();
        record.metadata.creation_timestamp = current.metadata.creation_timestamp;
        record.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        record.metadata.generation = if current.spec == record.spec {
            current.metadata.generation
        } else {
            current.metadata.generation + 1
        };
        record.metadata.resource_version = inner.next_version();

        if record.is_deleting() && record.metadata.finalizers.is_empty() {
            inner.records.remove(record.name());
            debug!("Record {} removed after its last finalizer", record.name());
            inner.publish(&self.sender, WatchEvent::Deleted(record.clone()));
        } else {
            inner
                .records
                .insert(record.name().to_string(), record.clone());
            inner.publish(&self.sender, WatchEvent::Modified(record.clone()));
        }
        Ok(record)
    }

    async fn delete(&self, name: &str) -> LvmCsiResult<DeleteAction<String>> {
        let mut inner = lock_inner(&self.inner);
        let mut record = match inner.records.get(name) {
            Some(record) if record.is_deleting() => return Ok(DeleteAction::Identity),
            Some(record) => record.clone(),
            None => return Ok(DeleteAction::Identity),
        };
        record.metadata.resource_version = inner.next_version();
        record.metadata.deletion_timestamp = Some(Utc::now());
        if record.metadata.finalizers.is_empty() {
            inner.records.remove(name);
            inner.publish(&self.sender, WatchEvent::Deleted(record));
        } else {
            inner.records.insert(name.to_string(), record.clone());
            inner.publish(&self.sender, WatchEvent::Modified(record));
        }
        Ok(DeleteAction::Deleted(name.to_string()))
    }

    async fn watch(&self) -> LvmCsiResult<RecordWatch> {
        let inner = lock_inner(&self.inner);
        let state = WatchState {
            receiver: self.sender.subscribe(),
            inner: Arc::clone(&self.inner),
            backlog: VecDeque::new(),
            last_version: inner.version,
        };
        drop(inner);
        Ok(RecordWatch::new(futures::stream::unfold(
            state,
            |mut state| async move { state.next().await.map(|event| (event, state)) },
        )))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::record::{
        store::update_with_retry,
        types::{LogicalVolumeSpec, FINALIZER},
    };

    use super::*;

    fn record(name: &str) -> LogicalVolumeRecord {
        LogicalVolumeRecord::new(
            name,
            LogicalVolumeSpec {
                name: name.to_string(),
                node_name: "node1".to_string(),
                device_class: String::new(),
                size: 1 << 30,
                source: None,
                access_type: None,
            },
        )
    }

    #[tokio::test]
    async fn test_create_assigns_metadata() {
        let store = MemoryStore::new();
        let created = store.create(record("pvc-1")).await.expect("create");
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert!(created.metadata.creation_timestamp.is_some());
        assert_matches!(
            store.create(record("pvc-1")).await,
            Err(e) if e.code() == crate::lvmcsi::ErrorCode::AlreadyExists
        );
        assert_eq!(store.get("pvc-1").await.ok(), Some(created));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(record("pvc-1")).await.expect("create");
        let mut first = created.clone();
        first.status.message = "first".to_string();
        let first = store.update(first).await.expect("update");
        assert!(first.metadata.resource_version > created.metadata.resource_version);
        assert_eq!(first.metadata.generation, 1);

        let mut stale = created;
        stale.status.message = "stale".to_string();
        assert_matches!(store.update(stale).await, Err(e) if e.is_conflict());

        let mut grown = first;
        grown.spec.size = 2 << 30;
        assert_eq!(store.update(grown).await.map(|r| r.metadata.generation).ok(), Some(2));
    }

    #[tokio::test]
    async fn test_finalizer_gates_removal() {
        let store = MemoryStore::new();
        let mut r = record("pvc-1");
        r.metadata.finalizers.push(FINALIZER.to_string());
        store.create(r).await.expect("create");

        assert_matches!(store.delete("pvc-1").await, Ok(DeleteAction::Deleted(_)));
        assert_matches!(store.delete("pvc-1").await, Ok(DeleteAction::Identity));
        let marked = store.get("pvc-1").await.expect("still present");
        assert!(marked.is_deleting());

        update_with_retry(&store, "pvc-1", |r| r.remove_finalizer())
            .await
            .expect("update");
        assert_matches!(store.get("pvc-1").await, Err(e) if e.is_not_found());
        assert_matches!(store.delete("pvc-1").await, Ok(DeleteAction::Identity));
    }

    #[tokio::test]
    async fn test_watch_sees_changes_in_order() {
        let store = MemoryStore::new();
        let mut watch = store.watch().await.expect("watch");
        store.create(record("pvc-1")).await.expect("create");
        store.delete("pvc-1").await.expect("delete");
        assert_matches!(watch.next().await, Some(WatchEvent::Added(r)) if r.name() == "pvc-1");
        assert_matches!(watch.next().await, Some(WatchEvent::Deleted(r)) if r.name() == "pvc-1");
    }

    #[tokio::test]
    async fn test_lagging_watcher_catches_up() {
        let store = MemoryStore::new();
        let mut watch = store.watch().await.expect("watch");
        store.create(record("pvc-1")).await.expect("create");
        let updates = WATCH_CHANNEL_CAPACITY + 10;
        for i in 0..updates {
            update_with_retry(&store, "pvc-1", |r| {
                r.status.message = i.to_string();
                true
            })
            .await
            .expect("update");
        }
        let mut last = 0;
        for _ in 0..=updates {
            let event = watch.next().await.expect("event");
            let version = event.record().metadata.resource_version;
            assert!(version > last);
            last = version;
        }
        assert_eq!(last, store.get("pvc-1").await.expect("get").metadata.resource_version);
    }

    #[tokio::test]
    async fn test_read_failures() {
        let store = MemoryStore::new();
        store.create(record("pvc-1")).await.expect("create");
        store.fail_reads(1);
        assert_matches!(
            store.get("pvc-1").await,
            Err(e) if e.code() == crate::lvmcsi::ErrorCode::Unavailable
        );
        assert!(store.get("pvc-1").await.is_ok());
    }
}
