// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The controller side of provisioning. Requests become changes to
//! LogicalVolume records; the caller is then held until the node that owns
//! the record reports an outcome in its status, or until the caller's
//! deadline passes. A deadline never cancels work already handed to the
//! node.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use retry::delay::Exponential;
use tokio::{
    select,
    time::{sleep, sleep_until, timeout_at, Instant},
};

use crate::{
    engine::{gib_to_bytes, AccessType, DeleteAction, NameLockGuard, NameLocks},
    lvmcsi::{ErrorCode, LvmCsiError, LvmCsiResult},
    record::{
        update_with_retry, LogicalVolumeRecord, LogicalVolumeSpec, RecordStore, RecordWatch,
        RESIZE_REQUESTED_AT_ANNOTATION,
    },
};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How often a waiting request re-reads its record when no change has
    /// been observed on the watch.
    pub poll_interval: Duration,
    /// Initial delay, in milliseconds, before retrying a transient read.
    pub read_backoff_ms: u64,
    pub read_retries: usize,
}

impl Default for ControllerConfig {
    fn default() -> ControllerConfig {
        ControllerConfig {
            poll_interval: Duration::from_secs(1),
            read_backoff_ms: 100,
            read_retries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub node_name: String,
    pub device_class: String,
    pub size_gb: u64,
    /// Name of the record whose volume the new one is restored from.
    pub source: Option<String>,
    pub access_type: Option<AccessType>,
}

impl CreateVolumeRequest {
    fn spec(&self) -> LogicalVolumeSpec {
        LogicalVolumeSpec {
            name: self.name.clone(),
            node_name: self.node_name.clone(),
            device_class: self.device_class.clone(),
            size: gib_to_bytes(self.size_gb),
            source: self.source.clone(),
            access_type: self.access_type,
        }
    }

    fn validate(&self) -> LvmCsiResult<()> {
        if self.name.is_empty() {
            return Err(LvmCsiError::invalid("volume name is required"));
        }
        if self.node_name.is_empty() {
            return Err(LvmCsiError::invalid(format!(
                "no node given for volume {}",
                self.name
            )));
        }
        if self.size_gb == 0 {
            return Err(LvmCsiError::invalid(format!(
                "volume {} must be at least 1 GiB",
                self.name
            )));
        }
        Ok(())
    }
}

/// A provisioned volume as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub volume_id: String,
    pub node_name: String,
    pub size: u64,
}

impl From<&LogicalVolumeRecord> for Volume {
    fn from(record: &LogicalVolumeRecord) -> Volume {
        Volume {
            volume_id: record.status.volume_id.clone(),
            node_name: record.spec.node_name.clone(),
            size: record.status.current_size.unwrap_or(record.spec.size),
        }
    }
}

fn is_transient(e: &LvmCsiError) -> bool {
    matches!(e.code(), ErrorCode::Unavailable | ErrorCode::Aborted)
}

fn deadline_exceeded(what: String) -> LvmCsiError {
    LvmCsiError::Code(ErrorCode::DeadlineExceeded, what)
}

fn status_error(record: &LogicalVolumeRecord) -> LvmCsiError {
    LvmCsiError::Code(record.status.code, record.status.message.clone())
}

/// Wait for the next change to the named record. Once the watch has ended
/// this never completes and the caller is left with its poll timer.
async fn next_change(watch: &mut Option<RecordWatch>, name: &str) {
    loop {
        let event = match watch.as_mut() {
            Some(watch) => watch.next().await,
            None => return std::future::pending().await,
        };
        match event {
            Some(event) if event.record().name() == name => return,
            Some(_) => (),
            None => {
                debug!("Record watch ended; falling back to polling");
                *watch = None;
            }
        }
    }
}

pub struct LogicalVolumeService {
    store: Arc<dyn RecordStore>,
    locks: NameLocks,
    config: ControllerConfig,
}

impl LogicalVolumeService {
    pub fn new(store: Arc<dyn RecordStore>, config: ControllerConfig) -> LogicalVolumeService {
        LogicalVolumeService {
            store,
            locks: NameLocks::default(),
            config,
        }
    }

    /// Run a store read, retrying transient failures with exponential
    /// backoff for a bounded number of attempts.
    async fn read<T, F, Fut>(&self, what: &str, mut f: F) -> LvmCsiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LvmCsiResult<T>>,
    {
        let mut delays =
            Exponential::from_millis(self.config.read_backoff_ms).take(self.config.read_retries);
        loop {
            match f().await {
                Err(e) if is_transient(&e) => match delays.next() {
                    Some(delay) => {
                        warn!("Failed to read {what}: {e}; retrying in {delay:?}");
                        sleep(delay).await;
                    }
                    None => {
                        return Err(LvmCsiError::Chained(
                            format!(
                                "Failed to read {what} after {} retries",
                                self.config.read_retries
                            ),
                            Box::new(e),
                        ))
                    }
                },
                result => return result,
            }
        }
    }

    async fn get(&self, name: &str) -> LvmCsiResult<LogicalVolumeRecord> {
        self.read(&format!("record {name}"), || self.store.get(name))
            .await
    }

    async fn find_by_volume_id(
        &self,
        volume_id: &str,
    ) -> LvmCsiResult<Option<LogicalVolumeRecord>> {
        self.read(&format!("record of volume {volume_id}"), || {
            self.store.get_by_volume_id(volume_id)
        })
        .await
    }

    /// Take the per-name lock, giving up when deadline passes first.
    async fn lock_until(&self, name: &str, deadline: Instant) -> LvmCsiResult<NameLockGuard> {
        timeout_at(deadline, self.locks.lock(name)).await.map_err(|_| {
            deadline_exceeded(format!("timed out waiting for another request on volume {name}"))
        })
    }

    /// Re-read the named record until done accepts it or fails, waking on
    /// either a change observed on the watch or the poll timer.
    async fn wait_for<F>(
        &self,
        name: &str,
        watch: RecordWatch,
        deadline: Instant,
        mut done: F,
    ) -> LvmCsiResult<LogicalVolumeRecord>
    where
        F: FnMut(&LogicalVolumeRecord) -> LvmCsiResult<bool>,
    {
        let mut watch = Some(watch);
        loop {
            let record = timeout_at(deadline, self.get(name))
                .await
                .map_err(|_| deadline_exceeded(format!("timed out reading record {name}")))??;
            if done(&record)? {
                return Ok(record);
            }

            select! {
                _ = sleep_until(deadline) => {
                    return Err(deadline_exceeded(format!("timed out waiting for record {name}")));
                }
                _ = sleep(self.config.poll_interval) => (),
                _ = next_change(&mut watch, name) => (),
            }
        }
    }

    /// Create a volume, or pick up a previous request for the same name,
    /// and wait until it is provisioned.
    pub async fn create_volume(
        &self,
        request: CreateVolumeRequest,
        timeout: Duration,
    ) -> LvmCsiResult<Volume> {
        let deadline = Instant::now() + timeout;
        request.validate()?;
        let name = request.name.as_str();
        let _guard = self.lock_until(name, deadline).await?;

        let watch = self.store.watch().await?;
        let existing = match self.get(name).await {
            Ok(record) => Some(record),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        match existing {
            Some(record) => {
                let wanted = request.spec();
                if record.spec.size != wanted.size
                    || record.spec.source != wanted.source
                    || record.spec.node_name != wanted.node_name
                    || record.spec.device_class != wanted.device_class
                {
                    return Err(LvmCsiError::already_exists(format!(
                        "volume {name} exists with different parameters"
                    )));
                }
                if record.is_deleting() {
                    return Err(LvmCsiError::conflict(format!(
                        "volume {name} is being deleted"
                    )));
                }
                debug!("Volume {name} was already requested; waiting for it");
            }
            None => {
                self.store
                    .create(LogicalVolumeRecord::new(name, request.spec()))
                    .await?;
                info!(
                    "Requested volume {name} of {} GiB on node {}",
                    request.size_gb, request.node_name
                );
            }
        }

        let result = self
            .wait_for(name, watch, deadline, |r| {
                if r.is_provisioned() {
                    Ok(true)
                } else if r.status.code.is_terminal() {
                    Err(status_error(r))
                } else {
                    Ok(false)
                }
            })
            .await;

        match result {
            Ok(record) => {
                info!(
                    "Volume {name} provisioned as {}",
                    record.status.volume_id
                );
                Ok(Volume::from(&record))
            }
            Err(e) if e.code().is_terminal() => {
                warn!("Failed to provision volume {name}: {e}; removing its record");
                if let Err(err) = self.store.delete(name).await {
                    warn!("Failed to remove record {name}: {err}");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Request deletion of a volume. Returns once the record is marked for
    /// deletion; the node removes the volume afterwards.
    pub async fn delete_volume(&self, volume_id: &str) -> LvmCsiResult<DeleteAction<String>> {
        let record = match self.find_by_volume_id(volume_id).await? {
            Some(record) => record,
            None => {
                debug!("No record for volume {volume_id}; nothing to delete");
                return Ok(DeleteAction::Identity);
            }
        };
        let name = record.name();
        let _guard = self.locks.lock(name).await;
        let action = self.store.delete(name).await?;
        info!("Volume {volume_id} of record {name}: {action}");
        Ok(action)
    }

    /// Grow a volume to at least size_gb and wait until the node reports
    /// the new size.
    pub async fn expand_volume(
        &self,
        volume_id: &str,
        size_gb: u64,
        timeout: Duration,
    ) -> LvmCsiResult<Volume> {
        let deadline = Instant::now() + timeout;
        let record = self
            .find_by_volume_id(volume_id)
            .await?
            .ok_or_else(|| LvmCsiError::not_found(format!("volume {volume_id} not found")))?;
        let name = record.name().to_string();
        let _guard = self.lock_until(&name, deadline).await?;

        let requested = gib_to_bytes(size_gb);
        let watch = self.store.watch().await?;
        let record = self.get(&name).await?;
        if record.is_deleting() {
            return Err(LvmCsiError::not_found(format!(
                "volume {volume_id} is being deleted"
            )));
        }
        if record.status.current_size.unwrap_or(0) >= requested {
            debug!("Volume {volume_id} is already at least {size_gb} GiB");
            return Ok(Volume::from(&record));
        }

        let requested_at = Utc::now().to_rfc3339();
        update_with_retry(&*self.store, &name, |r| {
            r.spec.size = requested;
            r.metadata.annotations.insert(
                RESIZE_REQUESTED_AT_ANNOTATION.to_string(),
                requested_at.clone(),
            );
            true
        })
        .await?;
        info!("Requested expansion of volume {volume_id} to {size_gb} GiB");

        let record = self
            .wait_for(&name, watch, deadline, |r| {
                if r.status.current_size.unwrap_or(0) >= requested {
                    Ok(true)
                } else if !r.resize_requested() && r.status.code.is_terminal() {
                    Err(status_error(r))
                } else {
                    Ok(false)
                }
            })
            .await?;
        Ok(Volume::from(&record))
    }
}
