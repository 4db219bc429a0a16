// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, pin::Pin};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use retry::delay::Exponential;

use crate::{
    engine::DeleteAction,
    lvmcsi::{LvmCsiError, LvmCsiResult},
    record::types::LogicalVolumeRecord,
};

/// Initial delay, in milliseconds, before retrying a conflicting update.
const CONFLICT_BACKOFF_MS: u64 = 10;
const CONFLICT_RETRIES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(LogicalVolumeRecord),
    Modified(LogicalVolumeRecord),
    Deleted(LogicalVolumeRecord),
}

impl WatchEvent {
    pub fn record(&self) -> &LogicalVolumeRecord {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }

    pub fn into_record(self) -> LogicalVolumeRecord {
        match self {
            WatchEvent::Added(r) | WatchEvent::Modified(r) | WatchEvent::Deleted(r) => r,
        }
    }
}

/// A stream of changes to the records of a store, in the order in which
/// they were applied.
pub struct RecordWatch(Pin<Box<dyn Stream<Item = WatchEvent> + Send>>);

impl RecordWatch {
    pub fn new<S>(stream: S) -> RecordWatch
    where
        S: Stream<Item = WatchEvent> + Send + 'static,
    {
        RecordWatch(Box::pin(stream))
    }

    /// The next change, or None once the store has gone away.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.0.next().await
    }
}

impl fmt::Debug for RecordWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecordWatch")
    }
}

/// A watchable store of LogicalVolume records with optimistic concurrency.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a new record. The store assigns its uid, resource version,
    /// generation and creation time. Fails with AlreadyExists if a record of
    /// the same name exists.
    async fn create(&self, record: LogicalVolumeRecord) -> LvmCsiResult<LogicalVolumeRecord>;

    /// Fails with NotFound if there is no record of that name.
    async fn get(&self, name: &str) -> LvmCsiResult<LogicalVolumeRecord>;

    async fn list(&self) -> LvmCsiResult<Vec<LogicalVolumeRecord>>;

    /// Replace a record. Fails with Aborted unless the resource version of
    /// record is the current one. A record that is being deleted and has no
    /// finalizers left is removed from the store.
    async fn update(&self, record: LogicalVolumeRecord) -> LvmCsiResult<LogicalVolumeRecord>;

    /// Request deletion of a record. A record with finalizers only gets a
    /// deletion time; it is removed once its last finalizer is dropped.
    async fn delete(&self, name: &str) -> LvmCsiResult<DeleteAction<String>>;

    async fn watch(&self) -> LvmCsiResult<RecordWatch>;

    /// Find the record whose status carries volume_id.
    async fn get_by_volume_id(
        &self,
        volume_id: &str,
    ) -> LvmCsiResult<Option<LogicalVolumeRecord>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| r.status.volume_id == volume_id))
    }
}

/// Apply mutate to the current version of the named record and write it
/// back, re-reading and retrying with exponential backoff when a concurrent
/// writer got there first. mutate returns false when the record needs no
/// change, in which case nothing is written.
pub async fn update_with_retry<F>(
    store: &dyn RecordStore,
    name: &str,
    mut mutate: F,
) -> LvmCsiResult<LogicalVolumeRecord>
where
    F: FnMut(&mut LogicalVolumeRecord) -> bool + Send,
{
    let mut delays = Exponential::from_millis(CONFLICT_BACKOFF_MS).take(CONFLICT_RETRIES);
    loop {
        let mut record = store.get(name).await?;
        if !mutate(&mut record) {
            return Ok(record);
        }
        match store.update(record).await {
            Err(e) if e.is_conflict() => match delays.next() {
                Some(delay) => {
                    debug!("Update of record {name} conflicted; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    return Err(LvmCsiError::Chained(
                        format!(
                            "Gave up updating record {name} after {CONFLICT_RETRIES} conflicts"
                        ),
                        Box::new(e),
                    ))
                }
            },
            result => return result,
        }
    }
}
