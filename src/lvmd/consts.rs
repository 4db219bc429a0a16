// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub const DEFAULT_SOCKET_NAME: &str = "/run/lvmd/lvmd.socket";

/// Prefix of the node annotations that publish free bytes per device class.
pub const CAPACITY_KEY_PREFIX: &str = "capacity.lvmcsi.io/";

/// Capacity of every volume group created in simulation mode, in GiB.
pub const SIM_VG_SIZE_GB: u64 = 1024;
