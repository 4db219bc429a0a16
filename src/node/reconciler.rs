// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The node side of provisioning. Records pinned to this node are driven
//! towards their spec through lvmd, and the outcome of every attempt is
//! written back to the record status for the controller to observe.
//!
//! The LV backing a record is named after the record UID, which is also the
//! volume id published once the LV exists.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::{select, sync::mpsc};

use crate::{
    engine::{gib_to_bytes, AccessType, GrowAction},
    lvmcsi::{ErrorCode, LvmCsiError, LvmCsiResult},
    lvmd::{
        CreateLvRequest, CreateLvSnapshotRequest, LogicalVolumeInfo, LvService, RemoveLvRequest,
        ResizeLvRequest,
    },
    record::{
        update_with_retry, ConditionStatus, LogicalVolumeRecord, RecordStore, WatchEvent,
        RESIZE_REQUESTED_AT_ANNOTATION, VOLUME_REMOVED_CONDITION,
    },
};

const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Only records whose spec names this node are acted on.
    pub node_name: String,
    /// Delay before a record whose reconciliation failed transiently is
    /// looked at again.
    pub requeue_interval: Duration,
}

impl NodeConfig {
    pub fn new(node_name: &str) -> NodeConfig {
        NodeConfig {
            node_name: node_name.to_string(),
            ..NodeConfig::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            node_name: String::new(),
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileResult {
    Done,
    Requeue(Duration),
}

pub struct NodeReconciler {
    config: NodeConfig,
    store: Arc<dyn RecordStore>,
    lvmd: Arc<dyn LvService>,
}

impl NodeReconciler {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn RecordStore>,
        lvmd: Arc<dyn LvService>,
    ) -> NodeReconciler {
        NodeReconciler {
            config,
            store,
            lvmd,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    fn owns(&self, record: &LogicalVolumeRecord) -> bool {
        record.spec.node_name == self.config.node_name
    }

    fn requeue(&self) -> ReconcileResult {
        ReconcileResult::Requeue(self.config.requeue_interval)
    }

    /// Bring the named record one step closer to its spec.
    pub async fn reconcile(&self, name: &str) -> LvmCsiResult<ReconcileResult> {
        let record = match self.store.get(name).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(ReconcileResult::Done),
            Err(e) => return Err(e),
        };
        if !self.owns(&record) {
            return Ok(ReconcileResult::Done);
        }

        if record.is_deleting() {
            return self.finalize(record).await;
        }

        let record = if record.has_finalizer() {
            record
        } else {
            update_with_retry(&*self.store, name, |r| r.add_finalizer()).await?
        };

        if !record.is_provisioned() {
            return self.provision(record).await;
        }

        // A growth that already failed terminally waits for a new request.
        if record.resize_requested()
            || (record.status.code.is_ok()
                && record
                    .status
                    .current_size
                    .is_some_and(|current| record.spec.size > current))
        {
            return self.expand(record).await;
        }

        Ok(ReconcileResult::Done)
    }

    async fn finalize(&self, record: LogicalVolumeRecord) -> LvmCsiResult<ReconcileResult> {
        if !record.has_finalizer() {
            return Ok(ReconcileResult::Done);
        }
        let name = record.name().to_string();
        let request = RemoveLvRequest {
            name: record.metadata.uid.clone(),
            device_class: record.spec.device_class.clone(),
        };

        match self.lvmd.remove_lv(request).await {
            Ok(action) => info!("Volume of record {name}: {action}"),
            Err(e) if e.is_not_found() => {
                info!("Volume of record {name} has nothing left to remove: {e}")
            }
            Err(e) => {
                warn!("Failed to remove the volume of record {name}: {e}");
                let (code, message) = (e.code(), e.message());
                update_with_retry(&*self.store, &name, |r| {
                    if r.condition(VOLUME_REMOVED_CONDITION).is_some_and(|c| {
                        c.status == ConditionStatus::False
                            && c.reason == code.as_ref()
                            && c.message == message
                    }) {
                        return false;
                    }
                    r.set_condition(
                        VOLUME_REMOVED_CONDITION,
                        ConditionStatus::False,
                        code.as_ref(),
                        &message,
                    );
                    true
                })
                .await?;
                return Ok(self.requeue());
            }
        }

        match update_with_retry(&*self.store, &name, |r| r.remove_finalizer()).await {
            Ok(_) => Ok(ReconcileResult::Done),
            Err(e) if e.is_not_found() => Ok(ReconcileResult::Done),
            Err(e) => Err(e),
        }
    }

    /// Look for an LV left behind by an earlier attempt whose status write
    /// never landed.
    async fn find_existing(
        &self,
        record: &LogicalVolumeRecord,
    ) -> LvmCsiResult<Option<LogicalVolumeInfo>> {
        Ok(self
            .lvmd
            .get_lv_list(&record.spec.device_class)
            .await?
            .into_iter()
            .find(|lv| lv.name == record.metadata.uid))
    }

    async fn create(&self, record: &LogicalVolumeRecord) -> LvmCsiResult<LogicalVolumeInfo> {
        if let Some(lv) = self.find_existing(record).await? {
            info!(
                "Adopting existing volume {} for record {}",
                lv.name,
                record.name()
            );
            return Ok(lv);
        }

        let source = match record.spec.source {
            Some(ref source) => source,
            None => {
                return self
                    .lvmd
                    .create_lv(CreateLvRequest {
                        name: record.metadata.uid.clone(),
                        device_class: record.spec.device_class.clone(),
                        size_gb: record.spec.size_gb(),
                        tags: Vec::new(),
                    })
                    .await;
            }
        };

        let source = self.store.get(source).await.map_err(|e| {
            LvmCsiError::Chained(
                format!("Failed to look up source record {source}"),
                Box::new(e),
            )
        })?;
        if !source.is_provisioned() {
            return Err(LvmCsiError::unavailable(format!(
                "source record {} is not provisioned yet",
                source.name()
            )));
        }
        if !self.owns(&source) || source.spec.device_class != record.spec.device_class {
            return Err(LvmCsiError::invalid(format!(
                "source record {} is on node {} with device class \"{}\"",
                source.name(),
                source.spec.node_name,
                source.spec.device_class
            )));
        }

        self.lvmd
            .create_lv_snapshot(CreateLvSnapshotRequest {
                name: record.metadata.uid.clone(),
                device_class: record.spec.device_class.clone(),
                source_volume: source.status.volume_id,
                size_gb: record.spec.size_gb(),
                access_type: record.spec.access_type.unwrap_or(AccessType::ReadWrite),
                tags: Vec::new(),
            })
            .await
    }

    async fn provision(&self, record: LogicalVolumeRecord) -> LvmCsiResult<ReconcileResult> {
        let name = record.name().to_string();
        match self.create(&record).await {
            Ok(lv) => {
                info!("Provisioned volume {} for record {name}", lv.name);
                update_with_retry(&*self.store, &name, |r| {
                    if r.status.volume_id.is_empty() {
                        r.status.volume_id = lv.name.clone();
                    }
                    r.status.current_size = Some(lv.size_bytes);
                    r.status.code = ErrorCode::Ok;
                    r.status.message.clear();
                    true
                })
                .await?;
                Ok(ReconcileResult::Done)
            }
            Err(e) => {
                let code = e.code();
                warn!("Failed to provision record {name}: {e}");
                self.write_failure(&name, code, e.message(), false).await?;
                Ok(if code.is_terminal() {
                    ReconcileResult::Done
                } else {
                    self.requeue()
                })
            }
        }
    }

    async fn expand(&self, record: LogicalVolumeRecord) -> LvmCsiResult<ReconcileResult> {
        let name = record.name().to_string();
        let current = match record.status.current_size {
            Some(current) => current,
            None => return Ok(ReconcileResult::Done),
        };

        if record.spec.size <= current {
            // Nothing to grow; shrink requests are dropped.
            if record.spec.size < current {
                debug!(
                    "Ignoring request to shrink record {name} from {current} to {} bytes",
                    record.spec.size
                );
            }
            self.clear_resize_request(&name).await?;
            return Ok(ReconcileResult::Done);
        }

        let request = ResizeLvRequest {
            name: record.metadata.uid.clone(),
            device_class: record.spec.device_class.clone(),
            size_gb: record.spec.size_gb(),
        };
        match self.lvmd.resize_lv(request).await {
            Ok(action) => {
                let size = match action {
                    GrowAction::Grown(size) => size,
                    GrowAction::Identity => gib_to_bytes(record.spec.size_gb()),
                };
                info!("Volume of record {name} is now {size} bytes");
                update_with_retry(&*self.store, &name, |r| {
                    let before = (r.status.clone(), r.metadata.annotations.clone());
                    r.status.current_size = Some(r.status.current_size.unwrap_or(0).max(size));
                    r.status.code = ErrorCode::Ok;
                    r.status.message.clear();
                    r.metadata
                        .annotations
                        .remove(RESIZE_REQUESTED_AT_ANNOTATION);
                    before != (r.status.clone(), r.metadata.annotations.clone())
                })
                .await?;
                Ok(ReconcileResult::Done)
            }
            Err(e) => {
                let code = e.code();
                warn!("Failed to expand record {name}: {e}");
                self.write_failure(&name, code, e.message(), code.is_terminal())
                    .await?;
                Ok(if code.is_terminal() {
                    ReconcileResult::Done
                } else {
                    self.requeue()
                })
            }
        }
    }

    async fn write_failure(
        &self,
        name: &str,
        code: ErrorCode,
        message: String,
        resolve_resize: bool,
    ) -> LvmCsiResult<()> {
        update_with_retry(&*self.store, name, |r| {
            let mut changed = false;
            if r.status.code != code || r.status.message != message {
                r.status.code = code;
                r.status.message = message.clone();
                changed = true;
            }
            if resolve_resize
                && r.metadata
                    .annotations
                    .remove(RESIZE_REQUESTED_AT_ANNOTATION)
                    .is_some()
            {
                changed = true;
            }
            changed
        })
        .await
        .map(|_| ())
    }

    async fn clear_resize_request(&self, name: &str) -> LvmCsiResult<()> {
        update_with_retry(&*self.store, name, |r| {
            r.metadata
                .annotations
                .remove(RESIZE_REQUESTED_AT_ANNOTATION)
                .is_some()
        })
        .await
        .map(|_| ())
    }

    /// Reconcile name and, if it has to be looked at again, arm a timer
    /// for it. A name has at most one armed timer; later requeues of a name
    /// that is already pending are absorbed by it.
    async fn handle(
        &self,
        name: String,
        pending: &mut HashSet<String>,
        requeue: &mpsc::UnboundedSender<String>,
    ) {
        let delay = match self.reconcile(&name).await {
            Ok(ReconcileResult::Done) => return,
            Ok(ReconcileResult::Requeue(delay)) => delay,
            Err(e) => {
                error!("Failed to reconcile record {name}: {e}");
                self.config.requeue_interval
            }
        };
        if !pending.insert(name.clone()) {
            trace!("Record {name} is already queued");
            return;
        }
        debug!("Requeueing record {name} in {delay:?}");
        let requeue = requeue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if requeue.send(name).is_err() {
                trace!("Reconciler exited before a requeued record came due");
            }
        });
    }

    /// Reconcile every record of this node, then every change to one, until
    /// the store's watch ends.
    pub async fn run(self: Arc<Self>) -> LvmCsiResult<()> {
        let mut watch = self.store.watch().await?;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut pending = HashSet::new();

        info!("Node reconciler for {} started", self.node_name());
        for record in self.store.list().await? {
            if self.owns(&record) {
                self.handle(record.metadata.name, &mut pending, &sender).await;
            }
        }

        loop {
            select! {
                event = watch.next() => match event {
                    Some(WatchEvent::Deleted(_)) => (),
                    Some(event) => {
                        if self.owns(event.record()) {
                            self.handle(event.into_record().metadata.name, &mut pending, &sender)
                                .await;
                        }
                    }
                    None => {
                        info!("Record watch closed; node reconciler exiting");
                        return Ok(());
                    }
                },
                Some(name) = receiver.recv() => {
                    pending.remove(&name);
                    self.handle(name, &mut pending, &sender).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use crate::{
        engine::{
            find_volume_group, DeleteAction, DeviceClass, DeviceClassManager, DeviceType,
            LvmExecutor, SimLvm, GIB,
        },
        lvmd::{LvmdService, WatchResponse},
        record::{LogicalVolumeSpec, MemoryStore},
    };

    use super::*;

    fn lvmd_down() -> LvmCsiError {
        LvmCsiError::unavailable("lvmd is not reachable")
    }

    /// An lvmd that reports no volumes and answers every create with reply,
    /// or with Unavailable if there is none.
    #[derive(Default)]
    struct ScriptedLvmd {
        creates: AtomicUsize,
        reply: Option<LogicalVolumeInfo>,
    }

    impl ScriptedLvmd {
        fn creates(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LvService for ScriptedLvmd {
        async fn create_lv(&self, _request: CreateLvRequest) -> LvmCsiResult<LogicalVolumeInfo> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().ok_or_else(lvmd_down)
        }

        async fn create_lv_snapshot(
            &self,
            _request: CreateLvSnapshotRequest,
        ) -> LvmCsiResult<LogicalVolumeInfo> {
            Err(lvmd_down())
        }

        async fn resize_lv(&self, _request: ResizeLvRequest) -> LvmCsiResult<GrowAction<u64>> {
            Err(lvmd_down())
        }

        async fn remove_lv(
            &self,
            _request: RemoveLvRequest,
        ) -> LvmCsiResult<DeleteAction<String>> {
            Err(lvmd_down())
        }

        async fn get_lv_list(&self, _device_class: &str) -> LvmCsiResult<Vec<LogicalVolumeInfo>> {
            Ok(Vec::new())
        }

        async fn get_free_bytes(&self, _device_class: &str) -> LvmCsiResult<u64> {
            Err(lvmd_down())
        }

        async fn watch(&self) -> LvmCsiResult<mpsc::Receiver<WatchResponse>> {
            Err(lvmd_down())
        }
    }

    struct Fixture {
        sim: Arc<SimLvm>,
        store: Arc<MemoryStore>,
        lvmd: Arc<LvmdService>,
        reconciler: NodeReconciler,
    }

    fn fixture() -> Fixture {
        let sim = Arc::new(SimLvm::default());
        sim.add_volume_group("vg1", 12 * GIB);
        let exec: Arc<dyn LvmExecutor> = sim.clone();
        let manager = DeviceClassManager::new(vec![DeviceClass {
            name: "ssd".to_string(),
            volume_group: "vg1".to_string(),
            default: true,
            device_type: DeviceType::Thick,
            thin_pool: None,
            spare_gb: Some(0),
            stripe: None,
            stripe_size: None,
            lvcreate_options: Vec::new(),
        }])
        .expect("valid classes");
        let store = Arc::new(MemoryStore::new());
        let lvmd = Arc::new(LvmdService::new(manager, exec));
        let reconciler = NodeReconciler::new(
            NodeConfig::new("node1"),
            store.clone(),
            lvmd.clone(),
        );
        Fixture {
            sim,
            store,
            lvmd,
            reconciler,
        }
    }

    fn spec(node: &str, size_gb: u64) -> LogicalVolumeSpec {
        LogicalVolumeSpec {
            name: "pvc-1".to_string(),
            node_name: node.to_string(),
            device_class: "ssd".to_string(),
            size: size_gb * GIB,
            source: None,
            access_type: None,
        }
    }

    async fn create_record(f: &Fixture, size_gb: u64) -> LogicalVolumeRecord {
        f.store
            .create(LogicalVolumeRecord::new("pvc-1", spec("node1", size_gb)))
            .await
            .expect("create")
    }

    #[tokio::test]
    async fn test_provision() {
        let f = fixture();
        let created = create_record(&f, 3).await;
        assert_eq!(
            f.reconciler.reconcile("pvc-1").await.ok(),
            Some(ReconcileResult::Done)
        );
        let record = f.store.get("pvc-1").await.expect("get");
        assert!(record.has_finalizer());
        assert_eq!(record.status.volume_id, created.metadata.uid);
        assert_eq!(record.status.current_size, Some(3 * GIB));
        assert_eq!(record.status.code, ErrorCode::Ok);

        // A second pass changes nothing.
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        assert_eq!(f.sim.call_count("lvcreate"), 1);
    }

    #[tokio::test]
    async fn test_other_nodes_ignored() {
        let f = fixture();
        f.store
            .create(LogicalVolumeRecord::new("pvc-1", spec("node2", 3)))
            .await
            .expect("create");
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        assert_eq!(f.sim.mutation_count(), 0);
        assert!(!f.store.get("pvc-1").await.expect("get").has_finalizer());
    }

    #[tokio::test]
    async fn test_adopts_existing_volume() {
        let f = fixture();
        let created = create_record(&f, 3).await;
        f.lvmd
            .create_lv(CreateLvRequest {
                name: created.metadata.uid.clone(),
                device_class: "ssd".to_string(),
                size_gb: 3,
                tags: Vec::new(),
            })
            .await
            .expect("create lv");

        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        let record = f.store.get("pvc-1").await.expect("get");
        assert_eq!(record.status.volume_id, created.metadata.uid);
        assert_eq!(f.sim.call_count("lvcreate"), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_terminal() {
        let f = fixture();
        create_record(&f, 13).await;
        assert_eq!(
            f.reconciler.reconcile("pvc-1").await.ok(),
            Some(ReconcileResult::Done)
        );
        let record = f.store.get("pvc-1").await.expect("get");
        assert!(!record.is_provisioned());
        assert_eq!(record.status.code, ErrorCode::ResourceExhausted);
        assert_eq!(f.sim.call_count("lvcreate"), 0);
    }

    #[tokio::test]
    async fn test_lvm_failure_writes_status() {
        let f = fixture();
        create_record(&f, 3).await;
        f.sim.fail_next("lvcreate");
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        let record = f.store.get("pvc-1").await.expect("get");
        assert_eq!(record.status.code, ErrorCode::Internal);
        assert!(!record.status.message.is_empty());
    }

    #[tokio::test]
    async fn test_expand_and_ignore_shrink() {
        let f = fixture();
        create_record(&f, 3).await;
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");

        update_with_retry(&*f.store, "pvc-1", |r| {
            r.spec.size = 5 * GIB;
            r.metadata
                .annotations
                .insert(RESIZE_REQUESTED_AT_ANNOTATION.to_string(), "now".to_string());
            true
        })
        .await
        .expect("update");
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        let record = f.store.get("pvc-1").await.expect("get");
        assert_eq!(record.status.current_size, Some(5 * GIB));
        assert!(!record.resize_requested());

        update_with_retry(&*f.store, "pvc-1", |r| {
            r.spec.size = 4 * GIB;
            true
        })
        .await
        .expect("update");
        let mutations = f.sim.mutation_count();
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        let record = f.store.get("pvc-1").await.expect("get");
        assert_eq!(record.status.current_size, Some(5 * GIB));
        assert_eq!(f.sim.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn test_delete_removes_volume_then_finalizer() {
        let f = fixture();
        create_record(&f, 3).await;
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        f.store.delete("pvc-1").await.expect("delete");

        f.sim.fail_next("lvremove");
        assert_eq!(
            f.reconciler.reconcile("pvc-1").await.ok(),
            Some(ReconcileResult::Requeue(DEFAULT_REQUEUE_INTERVAL))
        );
        let record = f.store.get("pvc-1").await.expect("still present");
        assert_matches!(
            record.condition(VOLUME_REMOVED_CONDITION),
            Some(c) if c.status == ConditionStatus::False
        );

        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        assert_matches!(f.store.get("pvc-1").await, Err(e) if e.is_not_found());
        assert_eq!(f.lvmd.get_free_bytes("ssd").await.ok(), Some(12 * GIB));
    }

    #[tokio::test]
    async fn test_volume_id_is_set_once() {
        let f = fixture();
        let created = create_record(&f, 3).await;
        f.reconciler.reconcile("pvc-1").await.expect("reconcile");
        let record = f.store.get("pvc-1").await.expect("get");
        assert_eq!(record.status.volume_id, created.metadata.uid);

        // Another provisioning pass that gets a different volume back must
        // not replace the published id.
        let lvmd = Arc::new(ScriptedLvmd {
            reply: Some(LogicalVolumeInfo {
                name: "other".to_string(),
                size_bytes: 3 * GIB,
                dev_major: 253,
                dev_minor: 9,
                tags: Vec::new(),
            }),
            ..ScriptedLvmd::default()
        });
        let other = NodeReconciler::new(NodeConfig::new("node1"), f.store.clone(), lvmd.clone());
        assert_eq!(other.provision(record).await.ok(), Some(ReconcileResult::Done));
        assert_eq!(lvmd.creates(), 1);
        let record = f.store.get("pvc-1").await.expect("get");
        assert_eq!(record.status.volume_id, created.metadata.uid);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failing_record_is_retried_once_per_interval() {
        let store = Arc::new(MemoryStore::new());
        let lvmd = Arc::new(ScriptedLvmd::default());
        let reconciler = Arc::new(NodeReconciler::new(
            NodeConfig {
                node_name: "node1".to_string(),
                requeue_interval: Duration::from_millis(100),
            },
            store.clone(),
            lvmd.clone(),
        ));
        store
            .create(LogicalVolumeRecord::new("pvc-1", spec("node1", 1)))
            .await
            .expect("create");
        let node = tokio::spawn(reconciler.run());
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Unrelated changes each trigger a pass but must not add timers.
        for i in 0..20 {
            update_with_retry(&*store, "pvc-1", |r| {
                r.metadata
                    .annotations
                    .insert("example.com/touched".to_string(), i.to_string());
                true
            })
            .await
            .expect("update");
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let before = lvmd.creates();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let attempts = lvmd.creates() - before;
        node.abort();
        assert!(
            (5..=15).contains(&attempts),
            "{attempts} attempts in one second"
        );
        let record = store.get("pvc-1").await.expect("get");
        assert_eq!(record.status.code, ErrorCode::Unavailable);
    }
}
