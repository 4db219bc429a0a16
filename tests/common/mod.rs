// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

pub mod logger;

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use lvmcsi::{
    controller::{ControllerConfig, CreateVolumeRequest, LogicalVolumeService},
    engine::{
        find_volume_group, DeviceClass, DeviceClassManager, DeviceType, LvmExecutor, SimLvm,
        ThinPoolConfig, GIB,
    },
    lvmd::{LvService, LvmdService},
    node::{NodeConfig, NodeReconciler},
    record::MemoryStore,
};

pub const NODE: &str = "node1";
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn thick_class(vg: &str) -> DeviceClass {
    DeviceClass {
        name: "ssd".to_string(),
        volume_group: vg.to_string(),
        default: true,
        device_type: DeviceType::Thick,
        thin_pool: None,
        spare_gb: Some(0),
        stripe: None,
        stripe_size: None,
        lvcreate_options: Vec::new(),
    }
}

pub fn thin_class(vg: &str, pool: &str, ratio: f64) -> DeviceClass {
    DeviceClass {
        name: "thin".to_string(),
        volume_group: vg.to_string(),
        default: false,
        device_type: DeviceType::Thin,
        thin_pool: Some(ThinPoolConfig {
            name: pool.to_string(),
            overprovision_ratio: ratio,
        }),
        spare_gb: Some(0),
        stripe: None,
        stripe_size: None,
        lvcreate_options: Vec::new(),
    }
}

pub fn request(name: &str, device_class: &str, size_gb: u64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_string(),
        node_name: NODE.to_string(),
        device_class: device_class.to_string(),
        size_gb,
        source: None,
        access_type: None,
    }
}

/// A controller and a single node sharing an in-memory record store, with
/// the node's lvmd backed by simulated lvm.
pub struct Cluster {
    pub sim: Arc<SimLvm>,
    pub store: Arc<MemoryStore>,
    pub lvmd: Arc<dyn LvService>,
    pub controller: LogicalVolumeService,
    node: JoinHandle<()>,
}

impl Cluster {
    /// A 10 GiB volume group vg1 holding a thin pool pool0 of pool_gb, with
    /// a thick class "ssd" and a thin class "thin" of the given ratio.
    pub fn new(pool_gb: u64, ratio: f64) -> Cluster {
        logger::init_logger();
        let sim = Arc::new(SimLvm::default());
        sim.add_volume_group("vg1", 10 * GIB);
        let exec: Arc<dyn LvmExecutor> = sim.clone();
        if pool_gb > 0 {
            find_volume_group(&exec, "vg1")
                .and_then(|mut vg| vg.create_pool("pool0", pool_gb * GIB))
                .expect("pool");
        }
        let manager =
            DeviceClassManager::new(vec![thick_class("vg1"), thin_class("vg1", "pool0", ratio)])
                .expect("valid classes");
        let lvmd: Arc<dyn LvService> = Arc::new(LvmdService::new(manager, exec));
        Cluster::with_lvmd(sim, lvmd)
    }

    pub fn with_lvmd(sim: Arc<SimLvm>, lvmd: Arc<dyn LvService>) -> Cluster {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Arc::new(NodeReconciler::new(
            NodeConfig {
                node_name: NODE.to_string(),
                requeue_interval: Duration::from_millis(50),
            },
            store.clone(),
            lvmd.clone(),
        ));
        let node = tokio::spawn(async move {
            if let Err(e) = reconciler.run().await {
                panic!("node reconciler failed: {e}");
            }
        });
        let controller = LogicalVolumeService::new(
            store.clone(),
            ControllerConfig {
                poll_interval: Duration::from_millis(20),
                ..ControllerConfig::default()
            },
        );
        Cluster {
            sim,
            store,
            lvmd,
            controller,
            node,
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.node.abort();
    }
}
