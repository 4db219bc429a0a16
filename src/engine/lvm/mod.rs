// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod cmd;
mod report;
mod volume;

pub use self::{
    cmd::{LvmBinary, LvmExecutor},
    report::{fullreport_args, FullReport, LvRecord, VgRecord, VgReport},
    volume::{
        create_volume_group, find_volume_group, list_volume_groups, snapshot_cow_size,
        LogicalVolume, ThinPool, ThinPoolUsage, VolumeGroup,
    },
};
