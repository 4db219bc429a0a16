// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Main loop of lvmd

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tokio::{runtime::Builder, select, signal};

use crate::{
    engine::{
        create_volume_group, find_volume_group, gib_to_bytes, DeviceClassManager, LvmBinary,
        LvmExecutor, SimLvm,
    },
    lvmcsi::{errors::LvmCsiResult, lvmcsi::VERSION},
    lvmd::{run_server, LvmdConfig, LvmdService, SIM_VG_SIZE_GB},
};

/// An in-memory lvm holding every volume group and thin pool the device
/// classes refer to. Each volume group gets SIM_VG_SIZE_GB and each thin
/// pool half of its volume group.
pub fn sim_executor(manager: &DeviceClassManager) -> LvmCsiResult<Arc<dyn LvmExecutor>> {
    let sim = Arc::new(SimLvm::default());
    let exec: Arc<dyn LvmExecutor> = sim.clone();
    let vg_size = gib_to_bytes(SIM_VG_SIZE_GB);

    for class in manager.device_classes() {
        let mut vg = match find_volume_group(&exec, &class.volume_group) {
            Ok(vg) => vg,
            Err(e) if e.is_not_found() => {
                let device = PathBuf::from(format!("/dev/sim/{}", class.volume_group));
                sim.add_device(&device.display().to_string(), vg_size);
                create_volume_group(&exec, &class.volume_group, &device)?
            }
            Err(e) => return Err(e),
        };
        if let Some(ref pool) = class.thin_pool {
            if vg.find_pool(&pool.name).is_none() {
                vg.create_pool(&pool.name, vg_size / 2)?;
            }
        }
    }
    Ok(exec)
}

/// Load the configuration at config_path, then serve lvmd on its socket
/// until SIGINT is received or the server fails.
/// If sim is true, volumes live in memory rather than in lvm.
pub fn run(config_path: &Path, sim: bool) -> LvmCsiResult<()> {
    let config = LvmdConfig::load(config_path)?;
    let manager = config.device_class_manager()?;

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("lvmd-wt-{id}")
        })
        .on_thread_start(|| debug!("lvmd worker thread started"))
        .on_thread_stop(|| debug!("lvmd worker thread finished"))
        .build()?;

    runtime.block_on(async move {
        info!("lvmd version {VERSION} started");
        let exec = if sim {
            info!("Using simulated lvm");
            sim_executor(&manager)?
        } else {
            info!("Using lvm");
            let exec: Arc<dyn LvmExecutor> = Arc::new(LvmBinary::new(config.containerized)?);
            exec
        };
        for class in manager.device_classes() {
            if let Err(e) = find_volume_group(&exec, &class.volume_group) {
                error!(
                    "Volume group {} of device class {} is unusable: {e}",
                    class.volume_group, class.name
                );
                return Err(e);
            }
        }

        let service = Arc::new(LvmdService::new(manager, exec));
        select! {
            res = run_server(service, &config.socket_name) => {
                if let Err(ref e) = res {
                    error!("The lvmd server exited with an error: {e}; shutting down...");
                }
                res
            }
            res = signal::ctrl_c() => {
                match res {
                    Ok(()) => info!("Caught SIGINT; exiting..."),
                    Err(ref e) => error!("Failure while listening for signals: {e}"),
                }
                Ok(())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::engine::{DeviceClass, DeviceType, ThinPoolConfig};

    use super::*;

    #[test]
    fn test_sim_executor_provides_volume_groups() {
        let manager = DeviceClassManager::new(vec![
            DeviceClass {
                name: "ssd".to_string(),
                volume_group: "vg1".to_string(),
                default: true,
                device_type: DeviceType::Thick,
                thin_pool: None,
                spare_gb: None,
                stripe: None,
                stripe_size: None,
                lvcreate_options: Vec::new(),
            },
            DeviceClass {
                name: "thin".to_string(),
                volume_group: "vg1".to_string(),
                default: false,
                device_type: DeviceType::Thin,
                thin_pool: Some(ThinPoolConfig {
                    name: "pool0".to_string(),
                    overprovision_ratio: 5.0,
                }),
                spare_gb: None,
                stripe: None,
                stripe_size: None,
                lvcreate_options: Vec::new(),
            },
        ])
        .expect("valid classes");
        let exec = sim_executor(&manager).expect("sim");
        let vg = find_volume_group(&exec, "vg1").expect("vg1");
        assert_eq!(vg.size(), gib_to_bytes(SIM_VG_SIZE_GB));
        assert_eq!(
            vg.find_pool("pool0").map(|p| p.size()),
            Some(gib_to_bytes(SIM_VG_SIZE_GB / 2))
        );
    }
}
