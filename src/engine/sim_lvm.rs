// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! An in-memory stand-in for the lvm binary.
//!
//! SimLvm interprets the argument vectors produced by the command layer and
//! keeps volume groups and logical volumes in memory. Failures are reported
//! the way lvm reports them, as a command error with exit code 5.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Mutex,
};

use uuid::Uuid;

use crate::{
    engine::lvm::{fullreport_args, FullReport, LvRecord, LvmExecutor, VgRecord, VgReport},
    lvmcsi::{LvmCsiError, LvmCsiResult},
};

const LVM_FAILURE: i32 = 5;
const INVALID_COMMAND: i32 = 3;
const DM_MAJOR: i32 = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimLvKind {
    Thick,
    Pool,
    Thin,
    Snapshot,
}

#[derive(Debug, Clone)]
struct SimLv {
    uuid: String,
    name: String,
    kind: SimLvKind,
    size: u64,
    /// Space taken from the VG. Zero for thin volumes.
    allocated: u64,
    origin: Option<String>,
    pool: Option<String>,
    tags: Vec<String>,
    read_only: bool,
    minor: i32,
}

impl SimLv {
    fn attr(&self) -> String {
        let mut attr = match self.kind {
            SimLvKind::Thick => "-wi-a-----",
            SimLvKind::Pool => "twi-aotz--",
            SimLvKind::Thin if self.origin.is_some() => "Vwi-a-tz-k",
            SimLvKind::Thin => "Vwi-a-tz--",
            SimLvKind::Snapshot => "swi-a-s---",
        }
        .to_string();
        if self.read_only {
            attr.replace_range(1..2, "r");
        }
        attr
    }
}

#[derive(Debug, Clone)]
struct SimVg {
    uuid: String,
    size: u64,
    lvs: Vec<SimLv>,
}

impl SimVg {
    fn free(&self) -> u64 {
        self.size
            .saturating_sub(self.lvs.iter().map(|lv| lv.allocated).sum::<u64>())
    }

    fn find(&self, name: &str) -> Option<&SimLv> {
        self.lvs.iter().find(|lv| lv.name == name)
    }
}

#[derive(Debug, Default)]
struct SimState {
    vgs: BTreeMap<String, SimVg>,
    devices: HashMap<String, u64>,
    calls: HashMap<String, usize>,
    failures: HashSet<String>,
    next_minor: i32,
}

/// The parsed flags of an lvcreate invocation.
#[derive(Debug, Default)]
struct LvCreateArgs {
    name: Option<String>,
    size: Option<u64>,
    virtual_size: Option<u64>,
    thin_target: Option<String>,
    snapshot: bool,
    tags: Vec<String>,
    positional: Option<String>,
}

fn failure(cmd: &str, stderr: impl Into<String>) -> LvmCsiError {
    LvmCsiError::Command {
        cmd: format!("lvm {cmd}"),
        exit_code: Some(LVM_FAILURE),
        stderr: stderr.into(),
    }
}

fn parse_bytes(value: &str) -> Option<u64> {
    value.strip_suffix('b').unwrap_or(value).parse().ok()
}

fn split_full_name<'a>(cmd: &str, full_name: &'a str) -> LvmCsiResult<(&'a str, &'a str)> {
    full_name
        .split_once('/')
        .ok_or_else(|| failure(cmd, format!("Invalid logical volume name {full_name}")))
}

fn parse_lvcreate(args: &[String]) -> LvmCsiResult<LvCreateArgs> {
    let mut parsed = LvCreateArgs::default();
    let mut iter = args.iter().skip(1);
    let value = |v: Option<&String>, flag: &str| {
        v.cloned()
            .ok_or_else(|| failure("lvcreate", format!("Option {flag} requires an argument")))
    };
    let bytes = |v: String| {
        parse_bytes(&v).ok_or_else(|| failure("lvcreate", format!("Invalid size {v}")))
    };
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-n" => parsed.name = Some(value(iter.next(), arg.as_str())?),
            "-L" | "--size" => parsed.size = Some(bytes(value(iter.next(), arg.as_str())?)?),
            "-V" => parsed.virtual_size = Some(bytes(value(iter.next(), arg.as_str())?)?),
            "-T" => parsed.thin_target = Some(value(iter.next(), arg.as_str())?),
            "--addtag" => parsed.tags.push(value(iter.next(), arg.as_str())?),
            "-s" => parsed.snapshot = true,
            "-W" | "-k" | "-i" | "-I" => {
                value(iter.next(), arg.as_str())?;
            }
            "-y" => {}
            a if a.starts_with('-') => {}
            a => parsed.positional = Some(a.to_string()),
        }
    }
    Ok(parsed)
}

/// An in-memory lvm.
#[derive(Debug, Default)]
pub struct SimLvm {
    state: Mutex<SimState>,
}

impl SimLvm {
    /// Add a volume group of the given size, bypassing vgcreate.
    pub fn add_volume_group(&self, name: &str, size: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.vgs.insert(
                name.to_string(),
                SimVg {
                    uuid: Uuid::new_v4().to_string(),
                    size,
                    lvs: Vec::new(),
                },
            );
        }
    }

    /// Make a block device of the given size available to vgcreate.
    pub fn add_device(&self, path: &str, size: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.devices.insert(path.to_string(), size);
        }
    }

    /// Make the next invocation of the given subcommand fail.
    pub fn fail_next(&self, subcommand: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.insert(subcommand.to_string());
        }
    }

    /// The number of times the given subcommand has been invoked.
    pub fn call_count(&self, subcommand: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.calls.get(subcommand).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// The total number of mutating invocations, i.e. all but fullreport.
    pub fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .calls
                    .iter()
                    .filter(|(cmd, _)| cmd.as_str() != "fullreport")
                    .map(|(_, n)| n)
                    .sum()
            })
            .unwrap_or(0)
    }
}

impl SimState {
    fn vg_mut(&mut self, cmd: &str, vg_name: &str) -> LvmCsiResult<&mut SimVg> {
        self.vgs
            .get_mut(vg_name)
            .ok_or_else(|| failure(cmd, format!("Volume group \"{vg_name}\" not found")))
    }

    fn allocate_minor(&mut self) -> i32 {
        self.next_minor += 1;
        self.next_minor
    }

    fn report(&self, args: &[String]) -> LvmCsiResult<Vec<u8>> {
        let filter = args.get(fullreport_args(None).len());
        if let Some(vg_name) = filter {
            if !self.vgs.contains_key(vg_name) {
                return Err(failure(
                    "fullreport",
                    format!("Volume group \"{vg_name}\" not found"),
                ));
            }
        }
        let report = self
            .vgs
            .iter()
            .filter(|(name, _)| filter.map_or(true, |f| f == *name))
            .map(|(name, vg)| VgReport {
                vg: vec![VgRecord {
                    vg_name: name.clone(),
                    vg_uuid: vg.uuid.clone(),
                    vg_size: vg.size.to_string(),
                    vg_free: vg.free().to_string(),
                }],
                lv: vg.lvs.iter().map(|lv| render_lv(name, vg, lv)).collect(),
            })
            .collect();
        Ok(serde_json::to_vec(&FullReport { report })?)
    }

    fn vgcreate(&mut self, args: &[String]) -> LvmCsiResult<()> {
        let (name, device) = match args {
            [_, .., name, device] => (name, device),
            _ => return Err(failure("vgcreate", "Please provide a volume group name")),
        };
        if self.vgs.contains_key(name) {
            return Err(failure(
                "vgcreate",
                format!("A volume group called {name} already exists."),
            ));
        }
        let size = self
            .devices
            .remove(device)
            .ok_or_else(|| failure("vgcreate", format!("No device found for {device}.")))?;
        self.vgs.insert(
            name.clone(),
            SimVg {
                uuid: Uuid::new_v4().to_string(),
                size,
                lvs: Vec::new(),
            },
        );
        Ok(())
    }

    fn lvcreate(&mut self, args: &[String]) -> LvmCsiResult<()> {
        let parsed = parse_lvcreate(args)?;
        let minor = self.allocate_minor();

        if parsed.snapshot {
            return self.lvcreate_snapshot(parsed, minor);
        }

        let (vg_name, name, kind, size, pool) = match (&parsed.thin_target, parsed.virtual_size) {
            (Some(target), Some(virtual_size)) => {
                let (vg_name, pool) = split_full_name("lvcreate", target)?;
                let name = parsed
                    .name
                    .clone()
                    .ok_or_else(|| failure("lvcreate", "Please specify a name"))?;
                (vg_name.to_string(), name, SimLvKind::Thin, virtual_size, Some(pool.to_string()))
            }
            (Some(target), None) => {
                let (vg_name, name) = split_full_name("lvcreate", target)?;
                let size = parsed
                    .size
                    .ok_or_else(|| failure("lvcreate", "Please specify a size"))?;
                (vg_name.to_string(), name.to_string(), SimLvKind::Pool, size, None)
            }
            (None, _) => {
                let vg_name = parsed
                    .positional
                    .clone()
                    .ok_or_else(|| failure("lvcreate", "Please specify a volume group"))?;
                let name = parsed
                    .name
                    .clone()
                    .ok_or_else(|| failure("lvcreate", "Please specify a name"))?;
                let size = parsed
                    .size
                    .ok_or_else(|| failure("lvcreate", "Please specify a size"))?;
                (vg_name, name, SimLvKind::Thick, size, None)
            }
        };

        let vg = self.vg_mut("lvcreate", &vg_name)?;
        if vg.find(&name).is_some() {
            return Err(failure(
                "lvcreate",
                format!("Logical Volume \"{name}\" already exists in volume group \"{vg_name}\""),
            ));
        }
        if let Some(ref pool) = pool {
            if vg.find(pool).map(|lv| lv.kind) != Some(SimLvKind::Pool) {
                return Err(failure(
                    "lvcreate",
                    format!("Thin pool {vg_name}/{pool} not found"),
                ));
            }
        }
        let allocated = if kind == SimLvKind::Thin { 0 } else { size };
        if allocated > vg.free() {
            return Err(failure(
                "lvcreate",
                format!("Volume group \"{vg_name}\" has insufficient free space"),
            ));
        }
        vg.lvs.push(SimLv {
            uuid: Uuid::new_v4().to_string(),
            name,
            kind,
            size,
            allocated,
            origin: None,
            pool,
            tags: parsed.tags,
            read_only: false,
            minor,
        });
        Ok(())
    }

    fn lvcreate_snapshot(&mut self, parsed: LvCreateArgs, minor: i32) -> LvmCsiResult<()> {
        let origin_full = parsed
            .positional
            .ok_or_else(|| failure("lvcreate", "Please specify an origin"))?;
        let (vg_name, origin_name) = split_full_name("lvcreate", &origin_full)?;
        let name = parsed
            .name
            .ok_or_else(|| failure("lvcreate", "Please specify a name"))?;
        let vg = self.vg_mut("lvcreate", vg_name)?;
        let origin = vg
            .find(origin_name)
            .cloned()
            .ok_or_else(|| failure("lvcreate", format!("Failed to find origin {origin_full}")))?;
        if vg.find(&name).is_some() {
            return Err(failure(
                "lvcreate",
                format!("Logical Volume \"{name}\" already exists in volume group \"{vg_name}\""),
            ));
        }
        let (kind, allocated) = match origin.kind {
            SimLvKind::Thin => (SimLvKind::Thin, 0),
            SimLvKind::Thick => {
                let cow = parsed
                    .size
                    .ok_or_else(|| failure("lvcreate", "Please specify a size"))?;
                if cow > vg.free() {
                    return Err(failure(
                        "lvcreate",
                        format!("Volume group \"{vg_name}\" has insufficient free space"),
                    ));
                }
                (SimLvKind::Snapshot, cow)
            }
            _ => {
                return Err(failure(
                    "lvcreate",
                    format!("Snapshots of {origin_full} are not supported"),
                ))
            }
        };
        vg.lvs.push(SimLv {
            uuid: Uuid::new_v4().to_string(),
            name,
            kind,
            size: origin.size,
            allocated,
            origin: Some(origin.name),
            pool: origin.pool,
            tags: parsed.tags,
            read_only: false,
            minor,
        });
        Ok(())
    }

    fn lvextend(&mut self, args: &[String]) -> LvmCsiResult<()> {
        let (size, full_name) = match args {
            [_, flag, size, full_name] if flag == "-L" => (size, full_name),
            _ => return Err(failure("lvextend", "Invalid arguments")),
        };
        let size = parse_bytes(size).ok_or_else(|| failure("lvextend", "Invalid size"))?;
        let (vg_name, lv_name) = split_full_name("lvextend", full_name)?;
        let vg = self.vg_mut("lvextend", vg_name)?;
        let free = vg.free();
        let lv = vg
            .lvs
            .iter_mut()
            .find(|lv| lv.name == lv_name)
            .ok_or_else(|| failure("lvextend", format!("Failed to find {full_name}")))?;
        if size <= lv.size {
            return Err(failure(
                "lvextend",
                format!("New size given is not larger than existing size of {full_name}"),
            ));
        }
        if lv.kind != SimLvKind::Thin {
            let delta = size - lv.size;
            if delta > free {
                return Err(failure(
                    "lvextend",
                    format!("Insufficient free space in volume group {vg_name}"),
                ));
            }
            lv.allocated += delta;
        }
        lv.size = size;
        Ok(())
    }

    fn lvremove(&mut self, args: &[String]) -> LvmCsiResult<()> {
        let full_name = args
            .last()
            .ok_or_else(|| failure("lvremove", "Please specify a logical volume"))?;
        let (vg_name, lv_name) = split_full_name("lvremove", full_name)?;
        let vg = self.vg_mut("lvremove", vg_name)?;
        let position = vg
            .lvs
            .iter()
            .position(|lv| lv.name == lv_name)
            .ok_or_else(|| {
                failure(
                    "lvremove",
                    format!("Failed to find logical volume \"{full_name}\""),
                )
            })?;
        if vg
            .lvs
            .iter()
            .any(|lv| lv.pool.as_deref() == Some(lv_name) && lv.kind == SimLvKind::Thin)
        {
            return Err(failure(
                "lvremove",
                format!("Thin pool {full_name} still has thin volumes"),
            ));
        }
        vg.lvs.remove(position);
        Ok(())
    }

    fn lvrename(&mut self, args: &[String]) -> LvmCsiResult<()> {
        let (vg_name, old, new) = match args {
            [_, vg_name, old, new] => (vg_name, old, new),
            _ => return Err(failure("lvrename", "Invalid arguments")),
        };
        let vg = self.vg_mut("lvrename", vg_name)?;
        if vg.find(new).is_some() {
            return Err(failure(
                "lvrename",
                format!("Logical Volume \"{new}\" already exists"),
            ));
        }
        let lv = vg
            .lvs
            .iter_mut()
            .find(|lv| &lv.name == old)
            .ok_or_else(|| {
                failure(
                    "lvrename",
                    format!("Existing logical volume \"{old}\" not found"),
                )
            })?;
        lv.name = new.clone();
        for other in vg.lvs.iter_mut() {
            if other.origin.as_ref() == Some(old) {
                other.origin = Some(new.clone());
            }
            if other.pool.as_ref() == Some(old) {
                other.pool = Some(new.clone());
            }
        }
        Ok(())
    }

    fn lvchange(&mut self, args: &[String]) -> LvmCsiResult<()> {
        let full_name = args
            .last()
            .ok_or_else(|| failure("lvchange", "Please specify a logical volume"))?;
        let read_only = args.windows(2).any(|w| w[0] == "-p" && w[1] == "r");
        let (vg_name, lv_name) = split_full_name("lvchange", full_name)?;
        let vg = self.vg_mut("lvchange", vg_name)?;
        let lv = vg
            .lvs
            .iter_mut()
            .find(|lv| lv.name == lv_name)
            .ok_or_else(|| failure("lvchange", format!("Failed to find {full_name}")))?;
        lv.read_only = read_only;
        Ok(())
    }
}

fn render_lv(vg_name: &str, vg: &SimVg, lv: &SimLv) -> LvRecord {
    let origin_size = lv
        .origin
        .as_ref()
        .and_then(|o| vg.find(o))
        .map(|o| o.size.to_string())
        .unwrap_or_default();
    let (data_percent, metadata_percent) = match lv.kind {
        SimLvKind::Pool => ("0.00", "0.00"),
        SimLvKind::Thin | SimLvKind::Snapshot => ("0.00", ""),
        SimLvKind::Thick => ("", ""),
    };
    LvRecord {
        lv_uuid: lv.uuid.clone(),
        lv_name: lv.name.clone(),
        lv_full_name: format!("{vg_name}/{}", lv.name),
        lv_path: if lv.kind == SimLvKind::Pool {
            String::new()
        } else {
            format!("/dev/{vg_name}/{}", lv.name)
        },
        lv_size: lv.size.to_string(),
        lv_kernel_major: DM_MAJOR.to_string(),
        lv_kernel_minor: lv.minor.to_string(),
        origin: lv.origin.clone().unwrap_or_default(),
        origin_size,
        pool_lv: lv.pool.clone().unwrap_or_default(),
        lv_tags: lv.tags.join(","),
        lv_attr: lv.attr(),
        vg_name: vg_name.to_string(),
        data_percent: data_percent.to_string(),
        metadata_percent: metadata_percent.to_string(),
    }
}

impl LvmExecutor for SimLvm {
    fn call(&self, args: &[String]) -> LvmCsiResult<Vec<u8>> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let mut state = self.state.lock()?;
        *state.calls.entry(subcommand.clone()).or_insert(0) += 1;
        trace!("Simulating lvm {}", args.join(" "));

        if state.failures.remove(&subcommand) {
            return Err(failure(&subcommand, "Injected failure"));
        }

        match subcommand.as_str() {
            "fullreport" => state.report(args),
            "vgcreate" => state.vgcreate(args).map(|_| Vec::new()),
            "lvcreate" => state.lvcreate(args).map(|_| Vec::new()),
            "lvextend" => state.lvextend(args).map(|_| Vec::new()),
            "lvremove" => state.lvremove(args).map(|_| Vec::new()),
            "lvrename" => state.lvrename(args).map(|_| Vec::new()),
            "lvchange" => state.lvchange(args).map(|_| Vec::new()),
            other => Err(LvmCsiError::Command {
                cmd: format!("lvm {other}"),
                exit_code: Some(INVALID_COMMAND),
                stderr: format!("No such command '{other}'."),
            }),
        }
    }
}
