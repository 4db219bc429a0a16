// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    engine::{AccessType, LogicalVolume},
    lvmcsi::{ErrorCode, LvmCsiError, LvmCsiResult},
    lvmd::consts::CAPACITY_KEY_PREFIX,
};

/// A logical volume as reported by lvmd.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolumeInfo {
    pub name: String,
    pub size_bytes: u64,
    pub dev_major: i32,
    pub dev_minor: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl From<&LogicalVolume> for LogicalVolumeInfo {
    fn from(lv: &LogicalVolume) -> LogicalVolumeInfo {
        LogicalVolumeInfo {
            name: lv.name().to_string(),
            size_bytes: lv.size(),
            dev_major: lv.major(),
            dev_minor: lv.minor(),
            tags: lv.tags().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLvRequest {
    pub name: String,
    #[serde(default)]
    pub device_class: String,
    pub size_gb: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLvSnapshotRequest {
    pub name: String,
    #[serde(default)]
    pub device_class: String,
    pub source_volume: String,
    pub size_gb: u64,
    pub access_type: AccessType,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeLvRequest {
    pub name: String,
    #[serde(default)]
    pub device_class: String,
    pub size_gb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLvRequest {
    pub name: String,
    #[serde(default)]
    pub device_class: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThinPoolItem {
    pub data_percent: f64,
    pub metadata_percent: f64,
    pub size_bytes: u64,
    /// Virtual bytes that may still be handed out under the overprovision
    /// ratio.
    pub overprovision_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchItem {
    pub device_class: String,
    pub free_bytes: u64,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_pool: Option<ThinPoolItem>,
}

/// Capacity of every device class, sent once on subscription and again
/// after every completed mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchResponse {
    /// Free bytes of the default device class.
    pub free_bytes: u64,
    pub items: Vec<WatchItem>,
}

impl WatchResponse {
    /// Node annotations that publish the free bytes of each device class.
    pub fn capacity_annotations(&self) -> BTreeMap<String, String> {
        self.items
            .iter()
            .map(|item| {
                (
                    format!("{CAPACITY_KEY_PREFIX}{}", item.device_class),
                    item.free_bytes.to_string(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LvmdParams {
    CreateLV(CreateLvRequest),
    CreateLVSnapshot(CreateLvSnapshotRequest),
    ResizeLV(ResizeLvRequest),
    RemoveLV(RemoveLvRequest),
    GetLVList(String),
    GetFreeBytes(String),
    Watch,
}

/// Every response carries a value, a result code and a message. The value
/// is meaningless unless the code is OK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LvmdRet {
    CreateLV(Option<LogicalVolumeInfo>, ErrorCode, String),
    CreateLVSnapshot(Option<LogicalVolumeInfo>, ErrorCode, String),
    /// The new size, if the LV was grown.
    ResizeLV(Option<u64>, ErrorCode, String),
    /// The full name of the removed LV, if it existed.
    RemoveLV(Option<String>, ErrorCode, String),
    GetLVList(Vec<LogicalVolumeInfo>, ErrorCode, String),
    GetFreeBytes(u64, ErrorCode, String),
    Watch(Option<WatchResponse>, ErrorCode, String),
}

pub fn lvmcsi_result_to_return<T>(
    result: LvmCsiResult<T>,
    default_value: T,
) -> (T, ErrorCode, String) {
    match result {
        Ok(r) => (r, ErrorCode::Ok, ErrorCode::Ok.to_string()),
        Err(e) => {
            let code = e.code();
            (default_value, code, e.message())
        }
    }
}

pub fn return_to_lvmcsi_result<T>(value: T, code: ErrorCode, msg: String) -> LvmCsiResult<T> {
    if code.is_ok() {
        Ok(value)
    } else {
        Err(LvmCsiError::Code(code, msg))
    }
}
