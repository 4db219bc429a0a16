// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    deviceclass::{DeviceClass, DeviceClassManager, DeviceType, ThinPoolConfig, DEFAULT_SPARE_GB},
    lvm::{
        create_volume_group, find_volume_group, list_volume_groups, snapshot_cow_size,
        LogicalVolume, LvmBinary, LvmExecutor, ThinPool, ThinPoolUsage, VolumeGroup,
    },
    sim_lvm::SimLvm,
    structures::{NameLockGuard, NameLocks},
    types::{
        gib_to_bytes, round_up_to_gib, AccessType, DeleteAction, EngineAction, GrowAction,
        RenameAction, GIB,
    },
};

mod deviceclass;
pub mod lvm;
mod sim_lvm;
mod structures;
mod types;
