// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Parsing of `lvm fullreport` JSON output.
//!
//! Every VG and LV is retrieved with a single invocation. LVM reports every
//! field as a string; with `--units b --nosuffix` sizes are plain byte counts.
//! Fields that do not apply to an LV, e.g. `origin` of a non-snapshot, are
//! reported as the empty string.

use serde::{Deserialize, Serialize};

use crate::lvmcsi::{LvmCsiError, LvmCsiResult};

pub const VG_FIELDS: &str = "vg_name,vg_uuid,vg_size,vg_free";
pub const LV_FIELDS: &str = "lv_uuid,lv_name,lv_full_name,lv_path,lv_size,lv_kernel_major,\
lv_kernel_minor,origin,origin_size,pool_lv,lv_tags,lv_attr,vg_name,data_percent,metadata_percent";

/// The argument vector of the fullreport invocation.
pub fn fullreport_args(vg_name: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "fullreport",
        "--reportformat",
        "json",
        "--units",
        "b",
        "--nosuffix",
        "--configreport",
        "vg",
        "-o",
        VG_FIELDS,
        "--configreport",
        "lv",
        "-o",
        LV_FIELDS,
        "--configreport",
        "pv",
        "-o,",
        "--configreport",
        "pvseg",
        "-o,",
        "--configreport",
        "seg",
        "-o,",
    ]
    .into_iter()
    .map(|s| s.to_string())
    .collect::<Vec<_>>();
    if let Some(vg_name) = vg_name {
        args.push(vg_name.to_string());
    }
    args
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FullReport {
    pub report: Vec<VgReport>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VgReport {
    #[serde(default)]
    pub vg: Vec<VgRecord>,
    #[serde(default)]
    pub lv: Vec<LvRecord>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct VgRecord {
    pub vg_name: String,
    pub vg_uuid: String,
    pub vg_size: String,
    pub vg_free: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LvRecord {
    pub lv_uuid: String,
    pub lv_name: String,
    pub lv_full_name: String,
    pub lv_path: String,
    pub lv_size: String,
    pub lv_kernel_major: String,
    pub lv_kernel_minor: String,
    pub origin: String,
    pub origin_size: String,
    pub pool_lv: String,
    pub lv_tags: String,
    pub lv_attr: String,
    pub vg_name: String,
    pub data_percent: String,
    pub metadata_percent: String,
}

/// A volume group as reported, together with all of its LVs.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedVolumeGroup {
    pub name: String,
    pub uuid: String,
    pub size: u64,
    pub free: u64,
    pub lvs: Vec<ParsedLogicalVolume>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLogicalVolume {
    pub uuid: String,
    pub name: String,
    pub full_name: String,
    pub path: String,
    pub size: u64,
    pub major: i32,
    pub minor: i32,
    pub origin: Option<String>,
    pub origin_size: Option<u64>,
    pub pool: Option<String>,
    pub tags: Vec<String>,
    pub attr: String,
    pub vg_name: String,
    pub data_percent: Option<f64>,
    pub metadata_percent: Option<f64>,
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn parse_size(field: &str, value: &str) -> LvmCsiResult<u64> {
    value.trim().parse::<u64>().map_err(|e| {
        LvmCsiError::Chained(
            format!("Failed to parse {field} value \"{value}\" reported by lvm"),
            Box::new(LvmCsiError::ParseInt(e)),
        )
    })
}

fn parse_opt_size(field: &str, value: &str) -> LvmCsiResult<Option<u64>> {
    non_empty(value).map(|v| parse_size(field, v)).transpose()
}

fn parse_percent(value: &str) -> Option<f64> {
    non_empty(value).and_then(|v| v.parse::<f64>().ok())
}

fn parse_device_number(value: &str) -> i32 {
    non_empty(value)
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(-1)
}

impl TryFrom<LvRecord> for ParsedLogicalVolume {
    type Error = LvmCsiError;

    fn try_from(lv: LvRecord) -> LvmCsiResult<ParsedLogicalVolume> {
        Ok(ParsedLogicalVolume {
            size: parse_size("lv_size", &lv.lv_size)?,
            origin_size: parse_opt_size("origin_size", &lv.origin_size)?,
            major: parse_device_number(&lv.lv_kernel_major),
            minor: parse_device_number(&lv.lv_kernel_minor),
            origin: non_empty(&lv.origin).map(|s| s.to_string()),
            pool: non_empty(&lv.pool_lv).map(|s| s.to_string()),
            tags: lv
                .lv_tags
                .split(',')
                .filter_map(non_empty)
                .map(|s| s.to_string())
                .collect(),
            data_percent: parse_percent(&lv.data_percent),
            metadata_percent: parse_percent(&lv.metadata_percent),
            uuid: lv.lv_uuid,
            name: lv.lv_name,
            full_name: lv.lv_full_name,
            path: lv.lv_path,
            attr: lv.lv_attr,
            vg_name: lv.vg_name,
        })
    }
}

/// Parse the JSON document produced by `lvm fullreport`.
pub fn parse_fullreport(output: &[u8]) -> LvmCsiResult<Vec<ParsedVolumeGroup>> {
    let report: FullReport = serde_json::from_slice(output).map_err(|e| {
        LvmCsiError::Chained(
            "Failed to parse the output of lvm fullreport".to_string(),
            Box::new(LvmCsiError::Serde(e)),
        )
    })?;

    let mut vgs = Vec::new();
    for entry in report.report {
        for vg in entry.vg {
            let lvs = entry
                .lv
                .iter()
                .filter(|lv| lv.vg_name == vg.vg_name)
                .cloned()
                .map(ParsedLogicalVolume::try_from)
                .collect::<LvmCsiResult<Vec<_>>>()?;
            vgs.push(ParsedVolumeGroup {
                size: parse_size("vg_size", &vg.vg_size)?,
                free: parse_size("vg_free", &vg.vg_free)?,
                name: vg.vg_name,
                uuid: vg.vg_uuid,
                lvs,
            });
        }
    }
    Ok(vgs)
}
