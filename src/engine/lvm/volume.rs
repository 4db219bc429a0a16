// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed views of volume groups, thin pools and logical volumes, and the
//! operations that mutate them.
//!
//! The views are snapshots of LVM metadata taken by `lvm fullreport`. LVM
//! metadata may change out-of-band, so every mutating operation re-queries
//! the state it reports instead of patching the snapshot in place.

use std::{path::Path, sync::Arc};

use crate::{
    engine::{
        lvm::{
            cmd::LvmExecutor,
            report::{fullreport_args, parse_fullreport, ParsedLogicalVolume, ParsedVolumeGroup},
        },
        types::{GrowAction, RenameAction, GIB},
    },
    lvmcsi::{LvmCsiError, LvmCsiResult},
};

/// Lower bound of the copy-on-write space reserved for a thick snapshot.
const MIN_COW_SIZE: u64 = 50 * GIB;
/// Upper bound of the copy-on-write space reserved for a thick snapshot.
const MAX_COW_SIZE: u64 = 300 * GIB;

/// The copy-on-write space reserved for a snapshot of a thick origin of the
/// given size: 20% of the origin, kept within [50 GiB, 300 GiB], and never
/// more than the origin itself.
pub fn snapshot_cow_size(origin_size: u64) -> u64 {
    (origin_size / 5)
        .clamp(MIN_COW_SIZE, MAX_COW_SIZE)
        .min(origin_size)
}

fn to_args<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter().map(|s| s.into()).collect()
}

fn size_arg(size: u64) -> String {
    format!("{size}b")
}

fn tag_args(tags: &[String]) -> Vec<String> {
    tags.iter()
        .flat_map(|t| ["--addtag".to_string(), t.to_owned()])
        .collect()
}

fn stripe_args(stripe: Option<u32>, stripe_size: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(stripe) = stripe {
        args.extend(["-i".to_string(), stripe.to_string()]);
    }
    if let Some(stripe_size) = stripe_size {
        args.extend(["-I".to_string(), stripe_size.to_string()]);
    }
    args
}

fn query(
    exec: &Arc<dyn LvmExecutor>,
    vg_name: Option<&str>,
) -> LvmCsiResult<Vec<ParsedVolumeGroup>> {
    parse_fullreport(&exec.call(&fullreport_args(vg_name))?)
}

fn query_vg(exec: &Arc<dyn LvmExecutor>, vg_name: &str) -> LvmCsiResult<ParsedVolumeGroup> {
    query(exec, Some(vg_name))?
        .into_iter()
        .find(|vg| vg.name == vg_name)
        .ok_or_else(|| LvmCsiError::not_found(format!("volume group {vg_name} not found")))
}

fn query_lv(
    exec: &Arc<dyn LvmExecutor>,
    vg_name: &str,
    lv_name: &str,
) -> LvmCsiResult<LogicalVolume> {
    query_vg(exec, vg_name)?
        .lvs
        .into_iter()
        .find(|lv| lv.name == lv_name)
        .map(|lv| LogicalVolume::from_parsed(Arc::clone(exec), lv))
        .ok_or_else(|| {
            LvmCsiError::not_found(format!("logical volume {vg_name}/{lv_name} not found"))
        })
}

/// List every volume group on the host.
pub fn list_volume_groups(exec: &Arc<dyn LvmExecutor>) -> LvmCsiResult<Vec<VolumeGroup>> {
    Ok(query(exec, None)?
        .into_iter()
        .map(|vg| VolumeGroup::from_parsed(Arc::clone(exec), vg))
        .collect())
}

/// Find the volume group with the given name.
pub fn find_volume_group(exec: &Arc<dyn LvmExecutor>, name: &str) -> LvmCsiResult<VolumeGroup> {
    list_volume_groups(exec)?
        .into_iter()
        .find(|vg| vg.name == name)
        .ok_or_else(|| LvmCsiError::not_found(format!("volume group {name} not found")))
}

/// Create a volume group named name on the given device.
pub fn create_volume_group(
    exec: &Arc<dyn LvmExecutor>,
    name: &str,
    device: &Path,
) -> LvmCsiResult<VolumeGroup> {
    exec.call(&to_args([
        "vgcreate".to_string(),
        "-ff".to_string(),
        "-y".to_string(),
        name.to_string(),
        device.display().to_string(),
    ]))?;
    info!("Created volume group {name} on {}", device.display());
    find_volume_group(exec, name)
}

#[derive(Debug, Clone)]
pub struct VolumeGroup {
    exec: Arc<dyn LvmExecutor>,
    name: String,
    uuid: String,
    size: u64,
    free: u64,
    lvs: Vec<LogicalVolume>,
}

impl VolumeGroup {
    fn from_parsed(exec: Arc<dyn LvmExecutor>, vg: ParsedVolumeGroup) -> VolumeGroup {
        let lvs = vg
            .lvs
            .into_iter()
            .map(|lv| LogicalVolume::from_parsed(Arc::clone(&exec), lv))
            .collect();
        VolumeGroup {
            exec,
            name: vg.name,
            uuid: vg.uuid,
            size: vg.size,
            free: vg.free,
            lvs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn free(&self) -> u64 {
        self.free
    }

    /// Re-read this volume group's state from LVM.
    pub fn update(&mut self) -> LvmCsiResult<()> {
        let vg = query_vg(&self.exec, &self.name)?;
        *self = VolumeGroup::from_parsed(Arc::clone(&self.exec), vg);
        Ok(())
    }

    /// All logical volumes in this VG that are not thin pools.
    pub fn list_volumes(&self) -> Vec<&LogicalVolume> {
        self.lvs.iter().filter(|lv| !lv.is_thin_pool()).collect()
    }

    pub fn find_volume(&self, name: &str) -> Option<&LogicalVolume> {
        self.list_volumes().into_iter().find(|lv| lv.name == name)
    }

    pub fn list_pools(&self) -> Vec<ThinPool> {
        self.lvs
            .iter()
            .filter(|lv| lv.is_thin_pool())
            .map(|pool| ThinPool::new(pool.clone(), &self.lvs))
            .collect()
    }

    pub fn find_pool(&self, name: &str) -> Option<ThinPool> {
        self.list_pools().into_iter().find(|pool| pool.name() == name)
    }

    /// Create a thick logical volume in this VG.
    pub fn create_volume(
        &mut self,
        name: &str,
        size: u64,
        tags: &[String],
        stripe: Option<u32>,
        stripe_size: Option<&str>,
        extra_options: &[String],
    ) -> LvmCsiResult<LogicalVolume> {
        let size_flag = size_arg(size);
        let mut args = to_args(["lvcreate", "-n", name, "-L", size_flag.as_str(), "-W", "y", "-y"]);
        args.extend(tag_args(tags));
        args.extend(stripe_args(stripe, stripe_size));
        args.extend(extra_options.iter().cloned());
        args.push(self.name.clone());
        self.exec.call(&args)?;
        info!("Created logical volume {}/{name} of {size} bytes", self.name);

        self.update()?;
        self.find_volume(name).cloned().ok_or_else(|| {
            LvmCsiError::Msg(format!(
                "logical volume {}/{name} is not reported after creation",
                self.name
            ))
        })
    }

    /// Create a thin pool in this VG.
    pub fn create_pool(&mut self, name: &str, size: u64) -> LvmCsiResult<ThinPool> {
        let pool = format!("{}/{name}", self.name);
        let size_flag = size_arg(size);
        self.exec.call(&to_args([
            "lvcreate",
            "-T",
            pool.as_str(),
            "--size",
            size_flag.as_str(),
            "-W",
            "y",
            "-y",
        ]))?;
        info!("Created thin pool {pool} of {size} bytes");

        self.update()?;
        self.find_pool(name).ok_or_else(|| {
            LvmCsiError::Msg(format!("thin pool {pool} is not reported after creation"))
        })
    }
}

/// Current usage of a thin pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThinPoolUsage {
    pub data_percent: f64,
    pub metadata_percent: f64,
    pub size: u64,
    /// The sum of the virtual sizes of all thin volumes in the pool.
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ThinPool {
    lv: LogicalVolume,
    volumes: Vec<LogicalVolume>,
}

impl ThinPool {
    fn new(lv: LogicalVolume, vg_lvs: &[LogicalVolume]) -> ThinPool {
        let volumes = vg_lvs
            .iter()
            .filter(|v| v.pool.as_deref() == Some(lv.name.as_str()))
            .cloned()
            .collect();
        ThinPool { lv, volumes }
    }

    pub fn name(&self) -> &str {
        &self.lv.name
    }

    pub fn vg_name(&self) -> &str {
        &self.lv.vg_name
    }

    pub fn size(&self) -> u64 {
        self.lv.size
    }

    pub fn usage(&self) -> ThinPoolUsage {
        ThinPoolUsage {
            data_percent: self.lv.data_percent.unwrap_or(0.0),
            metadata_percent: self.lv.metadata_percent.unwrap_or(0.0),
            size: self.lv.size,
            virtual_bytes: self.volumes.iter().map(|v| v.size).sum(),
        }
    }

    pub fn list_volumes(&self) -> Vec<&LogicalVolume> {
        self.volumes.iter().collect()
    }

    pub fn find_volume(&self, name: &str) -> Option<&LogicalVolume> {
        self.volumes.iter().find(|v| v.name == name)
    }

    fn update(&mut self) -> LvmCsiResult<()> {
        let vg = query_vg(&self.lv.exec, &self.lv.vg_name)?;
        let vg = VolumeGroup::from_parsed(Arc::clone(&self.lv.exec), vg);
        *self = vg.find_pool(&self.lv.name).ok_or_else(|| {
            LvmCsiError::not_found(format!("thin pool {} not found", self.lv.full_name))
        })?;
        Ok(())
    }

    /// Create a thin logical volume backed by this pool.
    pub fn create_volume(
        &mut self,
        name: &str,
        size: u64,
        tags: &[String],
        stripe: Option<u32>,
        stripe_size: Option<&str>,
        extra_options: &[String],
    ) -> LvmCsiResult<LogicalVolume> {
        let pool = format!("{}/{}", self.lv.vg_name, self.lv.name);
        let virtual_size = size_arg(size);
        let mut args = to_args([
            "lvcreate",
            "-T",
            pool.as_str(),
            "-n",
            name,
            "-V",
            virtual_size.as_str(),
            "-W",
            "y",
            "-y",
        ]);
        args.extend(tag_args(tags));
        args.extend(stripe_args(stripe, stripe_size));
        args.extend(extra_options.iter().cloned());
        self.lv.exec.call(&args)?;
        info!("Created thin volume {}/{name} of {size} bytes in pool {pool}", self.lv.vg_name);

        self.update()?;
        self.find_volume(name).cloned().ok_or_else(|| {
            LvmCsiError::Msg(format!(
                "thin volume {}/{name} is not reported after creation",
                self.lv.vg_name
            ))
        })
    }
}

#[derive(Debug, Clone)]
pub struct LogicalVolume {
    exec: Arc<dyn LvmExecutor>,
    name: String,
    full_name: String,
    path: String,
    size: u64,
    origin: Option<String>,
    pool: Option<String>,
    major: i32,
    minor: i32,
    tags: Vec<String>,
    attr: String,
    vg_name: String,
    data_percent: Option<f64>,
    metadata_percent: Option<f64>,
}

impl LogicalVolume {
    fn from_parsed(exec: Arc<dyn LvmExecutor>, lv: ParsedLogicalVolume) -> LogicalVolume {
        LogicalVolume {
            exec,
            name: lv.name,
            full_name: lv.full_name,
            path: lv.path,
            size: lv.size,
            origin: lv.origin,
            pool: lv.pool,
            major: lv.major,
            minor: lv.minor,
            tags: lv.tags,
            attr: lv.attr,
            vg_name: lv.vg_name,
            data_percent: lv.data_percent,
            metadata_percent: lv.metadata_percent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn pool(&self) -> Option<&str> {
        self.pool.as_deref()
    }

    pub fn major(&self) -> i32 {
        self.major
    }

    pub fn minor(&self) -> i32 {
        self.minor
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn vg_name(&self) -> &str {
        &self.vg_name
    }

    pub fn is_thin(&self) -> bool {
        self.pool.is_some()
    }

    pub fn is_snapshot(&self) -> bool {
        self.origin.is_some()
    }

    /// The second attribute character carries the permission, 'w' or 'r'.
    pub fn is_read_only(&self) -> bool {
        self.attr.as_bytes().get(1) == Some(&b'r')
    }

    /// Thin pools are marked by the volume type character 't' at the start
    /// of the attribute string.
    pub fn is_thin_pool(&self) -> bool {
        self.attr.starts_with('t')
    }

    fn refresh(&mut self) -> LvmCsiResult<()> {
        *self = query_lv(&self.exec, self.vg_name.as_str(), &self.name)?;
        Ok(())
    }

    /// Grow this LV to new_size bytes. Shrinking is never permitted.
    pub fn resize(&mut self, new_size: u64) -> LvmCsiResult<GrowAction<u64>> {
        if new_size < self.size {
            return Err(LvmCsiError::invalid(format!(
                "shrinking {} from {} to {new_size} bytes is not supported",
                self.full_name, self.size
            )));
        }
        if new_size == self.size {
            return Ok(GrowAction::Identity);
        }
        let size = size_arg(new_size);
        self.exec
            .call(&to_args(["lvextend", "-L", size.as_str(), self.full_name.as_str()]))?;
        info!("Resized {} from {} to {new_size} bytes", self.full_name, self.size);
        self.refresh()?;
        Ok(GrowAction::Grown(self.size))
    }

    /// Take a snapshot of this LV. Thin volumes get a thin snapshot that is
    /// not skipped at activation. Thick volumes get a classic snapshot with
    /// cow_size bytes of copy-on-write space, or a reservation computed from
    /// the origin size if no size is given.
    pub fn snapshot(
        &self,
        name: &str,
        cow_size: Option<u64>,
        tags: &[String],
    ) -> LvmCsiResult<LogicalVolume> {
        let mut args = if self.is_thin() {
            to_args(["lvcreate", "-s", "-k", "n", "-n", name])
        } else {
            let cow_size = cow_size.unwrap_or_else(|| snapshot_cow_size(self.size));
            to_args(["lvcreate", "-s", "-n", name, "-L", size_arg(cow_size).as_str()])
        };
        args.extend(tag_args(tags));
        args.push(self.full_name.clone());
        self.exec.call(&args)?;
        info!("Created snapshot {}/{name} of {}", self.vg_name, self.full_name);

        query_lv(&self.exec, self.vg_name.as_str(), name)
    }

    /// Remove this LV. The LV is consumed, so there is no state left to
    /// refresh; callers re-query the VG if they need its new free space.
    pub fn remove(self) -> LvmCsiResult<()> {
        self.exec.call(&to_args(["lvremove", "-f", self.full_name.as_str()]))?;
        info!("Removed logical volume {}", self.full_name);
        Ok(())
    }

    /// Rename this LV within its volume group.
    pub fn rename(&mut self, name: &str) -> LvmCsiResult<RenameAction<String>> {
        if name == self.name {
            return Ok(RenameAction::Identity);
        }
        self.exec
            .call(&to_args(["lvrename", self.vg_name.as_str(), self.name.as_str(), name]))?;
        info!("Renamed logical volume {} to {name}", self.full_name);
        *self = query_lv(&self.exec, self.vg_name.as_str(), name)?;
        Ok(RenameAction::Renamed(self.full_name.clone()))
    }

    /// Activate this LV. "ro" puts the LV in read-only protected mode, "rw"
    /// activates it read-write, overriding any activation skip flag.
    pub fn activate(&mut self, access: &str) -> LvmCsiResult<()> {
        let args = match access {
            "ro" => to_args(["lvchange", "-p", "r", self.full_name.as_str()]),
            "rw" => to_args(["lvchange", "-k", "n", "-a", "y", self.full_name.as_str()]),
            _ => {
                return Err(LvmCsiError::invalid(format!(
                    "unknown access mode {access} for {}",
                    self.full_name
                )))
            }
        };
        self.exec.call(&args)?;
        debug!("Activated {} with access {access}", self.full_name);
        self.refresh()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use crate::engine::SimLvm;

    use super::*;

    fn sim_vg(size: u64) -> (Arc<SimLvm>, VolumeGroup) {
        let sim = Arc::new(SimLvm::default());
        sim.add_volume_group("vg1", size);
        let exec: Arc<dyn LvmExecutor> = sim.clone();
        let vg = find_volume_group(&exec, "vg1").expect("vg1 exists");
        (sim, vg)
    }

    #[test]
    fn test_cow_size_bounds() {
        assert_eq!(snapshot_cow_size(GIB), GIB);
        assert_eq!(snapshot_cow_size(100 * GIB), 50 * GIB);
        assert_eq!(snapshot_cow_size(1000 * GIB), 200 * GIB);
        assert_eq!(snapshot_cow_size(10_000 * GIB), 300 * GIB);
    }

    proptest! {
        #[test]
        fn cow_size_never_exceeds_bounds(origin in 0u64..(1u64 << 50)) {
            let cow = snapshot_cow_size(origin);
            prop_assert!(cow <= origin);
            prop_assert!(cow <= MAX_COW_SIZE);
            prop_assert!(origin < MIN_COW_SIZE || cow >= MIN_COW_SIZE);
        }
    }

    #[test]
    fn test_find_missing_volume_group() {
        let (sim, _) = sim_vg(10 * GIB);
        let exec: Arc<dyn LvmExecutor> = sim;
        assert_matches!(find_volume_group(&exec, "nope"), Err(e) if e.is_not_found());
    }

    #[test]
    fn test_create_thick_volume_updates_free() {
        let (_, mut vg) = sim_vg(10 * GIB);
        let lv = vg
            .create_volume("lv1", 3 * GIB, &["owner=test".to_string()], None, None, &[])
            .expect("enough space");
        assert_eq!(lv.size(), 3 * GIB);
        assert_eq!(lv.full_name(), "vg1/lv1");
        assert_eq!(lv.tags(), ["owner=test".to_string()]);
        assert!(!lv.is_thin());
        assert_eq!(vg.free(), 7 * GIB);
        assert_eq!(vg.list_volumes().len(), 1);
    }

    #[test]
    fn test_resize_rejects_shrink() {
        let (_, mut vg) = sim_vg(10 * GIB);
        let mut lv = vg
            .create_volume("lv1", 3 * GIB, &[], None, None, &[])
            .expect("enough space");
        assert_matches!(
            lv.resize(2 * GIB),
            Err(e) if e.code() == crate::lvmcsi::ErrorCode::InvalidArgument
        );
        assert_matches!(lv.resize(3 * GIB), Ok(GrowAction::Identity));
        assert_matches!(lv.resize(5 * GIB), Ok(GrowAction::Grown(s)) if s == 5 * GIB);
        assert_eq!(lv.size(), 5 * GIB);
    }

    #[test]
    fn test_thin_pool_volumes_and_snapshot() {
        let (_, mut vg) = sim_vg(20 * GIB);
        let mut pool = vg.create_pool("pool0", 4 * GIB).expect("enough space");
        let thin = pool
            .create_volume("thin1", 8 * GIB, &[], None, None, &[])
            .expect("thin volumes are not charged to the VG");
        assert!(thin.is_thin());
        assert_eq!(pool.usage().virtual_bytes, 8 * GIB);

        let mut snap = thin.snapshot("snap1", None, &[]).expect("snapshot");
        assert_eq!(snap.origin(), Some("thin1"));
        assert_eq!(snap.pool(), Some("pool0"));
        snap.activate("ro").expect("activate");
        assert!(snap.is_read_only());
        snap.activate("rw").expect("activate");
        assert!(!snap.is_read_only());
        assert_matches!(snap.activate("rx"), Err(_));

        vg.update().expect("update");
        let pool = vg.find_pool("pool0").expect("pool exists");
        assert_eq!(pool.list_volumes().len(), 2);
        assert_eq!(pool.usage().virtual_bytes, 16 * GIB);
    }

    #[test]
    fn test_rename_and_remove() {
        let (_, mut vg) = sim_vg(10 * GIB);
        let mut lv = vg
            .create_volume("lv1", GIB, &[], None, None, &[])
            .expect("enough space");
        assert_matches!(lv.rename("lv1"), Ok(RenameAction::Identity));
        assert_matches!(lv.rename("lv2"), Ok(RenameAction::Renamed(n)) if n == "vg1/lv2");
        lv.remove().expect("remove");
        vg.update().expect("update");
        assert!(vg.list_volumes().is_empty());
        assert_eq!(vg.free(), 10 * GIB);
    }
}
