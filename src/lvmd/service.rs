// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The node-local volume service. It turns volume requests for a device
//! class into LVM operations, enforces the capacity rules of the class, and
//! tells watchers about capacity changes.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, Mutex,
};

use crate::{
    engine::{
        find_volume_group, gib_to_bytes, list_volume_groups, snapshot_cow_size, DeleteAction,
        DeviceClass, DeviceClassManager, GrowAction, LogicalVolume, LvmExecutor, ThinPool,
        ThinPoolUsage, VolumeGroup,
    },
    lvmcsi::{LvmCsiError, LvmCsiResult},
    lvmd::interface::{
        CreateLvRequest, CreateLvSnapshotRequest, LogicalVolumeInfo, RemoveLvRequest,
        ResizeLvRequest, ThinPoolItem, WatchItem, WatchResponse,
    },
};

const NOTIFY_BUFFER: usize = 16;
const WATCH_BUFFER: usize = 4;

#[async_trait]
pub trait LvService: Send + Sync {
    /// Create an LV, or return the LV of that name if it already exists.
    async fn create_lv(&self, request: CreateLvRequest) -> LvmCsiResult<LogicalVolumeInfo>;

    /// Create a snapshot of an existing LV, or return the snapshot of that
    /// name if it already exists.
    async fn create_lv_snapshot(
        &self,
        request: CreateLvSnapshotRequest,
    ) -> LvmCsiResult<LogicalVolumeInfo>;

    /// Grow an LV. Shrinking is rejected.
    async fn resize_lv(&self, request: ResizeLvRequest) -> LvmCsiResult<GrowAction<u64>>;

    /// Remove an LV. An absent LV is not an error.
    async fn remove_lv(&self, request: RemoveLvRequest) -> LvmCsiResult<DeleteAction<String>>;

    async fn get_lv_list(&self, device_class: &str) -> LvmCsiResult<Vec<LogicalVolumeInfo>>;

    async fn get_free_bytes(&self, device_class: &str) -> LvmCsiResult<u64>;

    /// Subscribe to capacity changes. The current capacity is sent at once,
    /// and again after every completed mutation.
    async fn watch(&self) -> LvmCsiResult<mpsc::Receiver<WatchResponse>>;
}

/// Virtual bytes that may still be allocated from a thin pool whose virtual
/// size may reach ratio times its physical size.
pub fn thin_pool_free_bytes(usage: &ThinPoolUsage, ratio: f64) -> u64 {
    // Float to integer casts saturate.
    let budget = (usage.size as f64 * ratio) as u64;
    budget.saturating_sub(usage.virtual_bytes)
}

/// Bytes of a volume group that may still be allocated by a thick class.
pub fn thick_free_bytes(vg: &VolumeGroup, class: &DeviceClass) -> u64 {
    vg.free().saturating_sub(class.spare_bytes())
}

fn class_pool(vg: &VolumeGroup, class: &DeviceClass) -> LvmCsiResult<ThinPool> {
    let config = class.thin_pool()?;
    vg.find_pool(&config.name).ok_or_else(|| {
        LvmCsiError::not_found(format!(
            "thin pool {}/{} of device class {} not found",
            vg.name(),
            config.name,
            class.name
        ))
    })
}

fn find_class_volume(
    vg: &VolumeGroup,
    class: &DeviceClass,
    name: &str,
) -> LvmCsiResult<Option<LogicalVolume>> {
    if class.is_thin() {
        Ok(class_pool(vg, class)?.find_volume(name).cloned())
    } else {
        Ok(vg.find_volume(name).filter(|lv| !lv.is_thin()).cloned())
    }
}

fn class_free_bytes(vg: &VolumeGroup, class: &DeviceClass) -> LvmCsiResult<u64> {
    if class.is_thin() {
        let ratio = class.thin_pool()?.overprovision_ratio;
        Ok(thin_pool_free_bytes(&class_pool(vg, class)?.usage(), ratio))
    } else {
        Ok(thick_free_bytes(vg, class))
    }
}

fn check_capacity(
    vg: &VolumeGroup,
    class: &DeviceClass,
    name: &str,
    requested: u64,
) -> LvmCsiResult<()> {
    let free = class_free_bytes(vg, class)?;
    if requested > free {
        return Err(LvmCsiError::exhausted(format!(
            "{requested} bytes are required for {name} but only {free} bytes are available in device class {}",
            class.name
        )));
    }
    Ok(())
}

fn create_lv(
    manager: &DeviceClassManager,
    exec: &Arc<dyn LvmExecutor>,
    request: &CreateLvRequest,
) -> LvmCsiResult<(LogicalVolumeInfo, bool)> {
    let class = manager.device_class(&request.device_class)?;
    let mut vg = find_volume_group(exec, &class.volume_group)?;
    if let Some(lv) = find_class_volume(&vg, class, &request.name)? {
        debug!("Logical volume {} already exists", lv.full_name());
        return Ok((LogicalVolumeInfo::from(&lv), false));
    }

    let requested = gib_to_bytes(request.size_gb);
    check_capacity(&vg, class, &request.name, requested)?;

    let stripe_size = class.stripe_size.as_deref();
    let lv = if class.is_thin() {
        class_pool(&vg, class)?.create_volume(
            &request.name,
            requested,
            &request.tags,
            class.stripe,
            stripe_size,
            &class.lvcreate_options,
        )?
    } else {
        vg.create_volume(
            &request.name,
            requested,
            &request.tags,
            class.stripe,
            stripe_size,
            &class.lvcreate_options,
        )?
    };
    Ok((LogicalVolumeInfo::from(&lv), true))
}

fn create_lv_snapshot(
    manager: &DeviceClassManager,
    exec: &Arc<dyn LvmExecutor>,
    request: &CreateLvSnapshotRequest,
) -> LvmCsiResult<(LogicalVolumeInfo, bool)> {
    let class = manager.device_class(&request.device_class)?;
    let vg = find_volume_group(exec, &class.volume_group)?;
    if let Some(lv) = find_class_volume(&vg, class, &request.name)? {
        debug!("Snapshot {} already exists", lv.full_name());
        return Ok((LogicalVolumeInfo::from(&lv), false));
    }

    let source = find_class_volume(&vg, class, &request.source_volume)?.ok_or_else(|| {
        LvmCsiError::not_found(format!(
            "source volume {} not found in device class {}",
            request.source_volume, class.name
        ))
    })?;
    let requested = gib_to_bytes(request.size_gb);
    if requested < source.size() {
        return Err(LvmCsiError::invalid(format!(
            "snapshot {} of {requested} bytes is smaller than its source of {} bytes",
            request.name,
            source.size()
        )));
    }

    let mut snapshot = if class.is_thin() {
        check_capacity(&vg, class, &request.name, requested)?;
        source.snapshot(&request.name, None, &request.tags)?
    } else {
        if requested > source.size() {
            return Err(LvmCsiError::invalid(format!(
                "snapshot {} of a thick volume can not be larger than its source",
                request.name
            )));
        }
        let cow_size = snapshot_cow_size(source.size());
        check_capacity(&vg, class, &request.name, cow_size)?;
        source.snapshot(&request.name, Some(cow_size), &request.tags)?
    };

    snapshot.activate(request.access_type.as_ref())?;
    if requested > snapshot.size() {
        snapshot.resize(requested)?;
    }
    Ok((LogicalVolumeInfo::from(&snapshot), true))
}

fn resize_lv(
    manager: &DeviceClassManager,
    exec: &Arc<dyn LvmExecutor>,
    request: &ResizeLvRequest,
) -> LvmCsiResult<GrowAction<u64>> {
    let class = manager.device_class(&request.device_class)?;
    let vg = find_volume_group(exec, &class.volume_group)?;
    let mut lv = find_class_volume(&vg, class, &request.name)?.ok_or_else(|| {
        LvmCsiError::not_found(format!(
            "logical volume {} not found in device class {}",
            request.name, class.name
        ))
    })?;

    let requested = gib_to_bytes(request.size_gb);
    if requested < lv.size() {
        return Err(LvmCsiError::invalid(format!(
            "shrinking {} from {} to {requested} bytes is not supported",
            lv.full_name(),
            lv.size()
        )));
    }
    if requested == lv.size() {
        return Ok(GrowAction::Identity);
    }
    check_capacity(&vg, class, &request.name, requested - lv.size())?;
    lv.resize(requested)
}

fn remove_lv(
    manager: &DeviceClassManager,
    exec: &Arc<dyn LvmExecutor>,
    request: &RemoveLvRequest,
) -> LvmCsiResult<DeleteAction<String>> {
    let class = manager.device_class(&request.device_class)?;
    let vg = find_volume_group(exec, &class.volume_group)?;
    match find_class_volume(&vg, class, &request.name)? {
        Some(lv) => {
            let full_name = lv.full_name().to_string();
            lv.remove()?;
            Ok(DeleteAction::Deleted(full_name))
        }
        None => Ok(DeleteAction::Identity),
    }
}

fn get_lv_list(
    manager: &DeviceClassManager,
    exec: &Arc<dyn LvmExecutor>,
    device_class: &str,
) -> LvmCsiResult<Vec<LogicalVolumeInfo>> {
    let class = manager.device_class(device_class)?;
    let vg = find_volume_group(exec, &class.volume_group)?;
    if class.is_thin() {
        Ok(class_pool(&vg, class)?
            .list_volumes()
            .into_iter()
            .map(LogicalVolumeInfo::from)
            .collect())
    } else {
        Ok(vg
            .list_volumes()
            .into_iter()
            .filter(|lv| !lv.is_thin())
            .map(LogicalVolumeInfo::from)
            .collect())
    }
}

fn get_free_bytes(
    manager: &DeviceClassManager,
    exec: &Arc<dyn LvmExecutor>,
    device_class: &str,
) -> LvmCsiResult<u64> {
    let class = manager.device_class(device_class)?;
    class_free_bytes(&find_volume_group(exec, &class.volume_group)?, class)
}

fn capacity(
    manager: &DeviceClassManager,
    exec: &Arc<dyn LvmExecutor>,
) -> LvmCsiResult<WatchResponse> {
    let vgs = list_volume_groups(exec)?;
    let mut response = WatchResponse::default();
    for class in manager.device_classes() {
        let vg = match vgs.iter().find(|vg| vg.name() == class.volume_group) {
            Some(vg) => vg,
            None => {
                warn!(
                    "Volume group {} of device class {} not found",
                    class.volume_group, class.name
                );
                continue;
            }
        };

        let item = if class.is_thin() {
            let pool = match class_pool(vg, class) {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("{e}");
                    continue;
                }
            };
            let usage = pool.usage();
            let free = thin_pool_free_bytes(&usage, class.thin_pool()?.overprovision_ratio);
            WatchItem {
                device_class: class.name.clone(),
                free_bytes: free,
                size_bytes: usage.size,
                thin_pool: Some(ThinPoolItem {
                    data_percent: usage.data_percent,
                    metadata_percent: usage.metadata_percent,
                    size_bytes: usage.size,
                    overprovision_bytes: free,
                }),
            }
        } else {
            WatchItem {
                device_class: class.name.clone(),
                free_bytes: thick_free_bytes(vg, class),
                size_bytes: vg.size(),
                thin_pool: None,
            }
        };
        if class.default {
            response.free_bytes = item.free_bytes;
        }
        response.items.push(item);
    }
    Ok(response)
}

/// The volume service backed by an LVM executor. Every operation runs on
/// the blocking pool while holding the service's mutex, so LVM commands
/// issued by one service never overlap.
#[derive(Debug, Clone)]
pub struct LvmdService {
    manager: Arc<DeviceClassManager>,
    exec: Arc<dyn LvmExecutor>,
    lock: Arc<Mutex<()>>,
    notifier: broadcast::Sender<()>,
}

impl LvmdService {
    pub fn new(manager: DeviceClassManager, exec: Arc<dyn LvmExecutor>) -> LvmdService {
        let (notifier, _) = broadcast::channel(NOTIFY_BUFFER);
        LvmdService {
            manager: Arc::new(manager),
            exec,
            lock: Arc::new(Mutex::new(())),
            notifier,
        }
    }

    pub fn device_class_manager(&self) -> &DeviceClassManager {
        &self.manager
    }

    async fn locked<T, F>(&self, f: F) -> LvmCsiResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceClassManager, &Arc<dyn LvmExecutor>) -> LvmCsiResult<T>
            + Send
            + 'static,
    {
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let manager = Arc::clone(&self.manager);
        let exec = Arc::clone(&self.exec);
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            f(&manager, &exec)
        })
        .await?
    }

    fn notify(&self) {
        if self.notifier.send(()).is_err() {
            trace!("No capacity watchers to notify");
        }
    }
}

#[async_trait]
impl LvService for LvmdService {
    async fn create_lv(&self, request: CreateLvRequest) -> LvmCsiResult<LogicalVolumeInfo> {
        let (info, created) = self
            .locked(move |manager, exec| create_lv(manager, exec, &request))
            .await?;
        if created {
            info!("Created logical volume {} of {} bytes", info.name, info.size_bytes);
            self.notify();
        }
        Ok(info)
    }

    async fn create_lv_snapshot(
        &self,
        request: CreateLvSnapshotRequest,
    ) -> LvmCsiResult<LogicalVolumeInfo> {
        let (info, created) = self
            .locked(move |manager, exec| create_lv_snapshot(manager, exec, &request))
            .await?;
        if created {
            info!("Created snapshot {} of {} bytes", info.name, info.size_bytes);
            self.notify();
        }
        Ok(info)
    }

    async fn resize_lv(&self, request: ResizeLvRequest) -> LvmCsiResult<GrowAction<u64>> {
        let name = request.name.clone();
        let action = self
            .locked(move |manager, exec| resize_lv(manager, exec, &request))
            .await?;
        if let GrowAction::Grown(size) = action {
            info!("Resized logical volume {name} to {size} bytes");
            self.notify();
        }
        Ok(action)
    }

    async fn remove_lv(&self, request: RemoveLvRequest) -> LvmCsiResult<DeleteAction<String>> {
        let action = self
            .locked(move |manager, exec| remove_lv(manager, exec, &request))
            .await?;
        info!("{action}");
        if matches!(action, DeleteAction::Deleted(_)) {
            self.notify();
        }
        Ok(action)
    }

    async fn get_lv_list(&self, device_class: &str) -> LvmCsiResult<Vec<LogicalVolumeInfo>> {
        let device_class = device_class.to_string();
        self.locked(move |manager, exec| get_lv_list(manager, exec, &device_class))
            .await
    }

    async fn get_free_bytes(&self, device_class: &str) -> LvmCsiResult<u64> {
        let device_class = device_class.to_string();
        self.locked(move |manager, exec| get_free_bytes(manager, exec, &device_class))
            .await
    }

    async fn watch(&self) -> LvmCsiResult<mpsc::Receiver<WatchResponse>> {
        let mut notifications = self.notifier.subscribe();
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match service.locked(capacity).await {
                    Ok(response) => {
                        if sender.send(response).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to compute capacity for watchers: {e}"),
                }
                tokio::select! {
                    _ = sender.closed() => break,
                    notification = notifications.recv() => match notification {
                        Ok(()) => (),
                        Err(RecvError::Lagged(n)) => trace!("Coalesced {n} capacity notifications"),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Capacity watcher went away");
        });
        Ok(receiver)
    }
}
