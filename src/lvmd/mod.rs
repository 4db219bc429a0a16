// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod client;
mod config;
mod consts;
mod interface;
mod server;
mod service;

pub use self::{
    client::LvmdClient,
    config::LvmdConfig,
    consts::{CAPACITY_KEY_PREFIX, DEFAULT_SOCKET_NAME, SIM_VG_SIZE_GB},
    interface::{
        CreateLvRequest, CreateLvSnapshotRequest, LogicalVolumeInfo, LvmdParams, LvmdRet,
        RemoveLvRequest, ResizeLvRequest, ThinPoolItem, WatchItem, WatchResponse,
    },
    server::{run_server, LvmdServer},
    service::{thick_free_bytes, thin_pool_free_bytes, LvService, LvmdService},
};
