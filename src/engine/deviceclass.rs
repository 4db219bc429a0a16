// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Device classes map the name a volume request carries to the volume group
//! and, for thin provisioning, the thin pool that serve it. The set of
//! classes is validated once at load and never mutated afterwards.

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    engine::types::gib_to_bytes,
    lvmcsi::{LvmCsiError, LvmCsiResult},
};

/// The capacity reserved in a volume group when none is configured.
pub const DEFAULT_SPARE_GB: u64 = 10;

const MAX_NAME_LEN: usize = 63;
const MAX_VG_NAME_LEN: usize = 126;

static QUALIFIED_NAME: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$"));

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Thick,
    Thin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ThinPoolConfig {
    pub name: String,
    pub overprovision_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceClass {
    pub name: String,
    pub volume_group: String,
    #[serde(default)]
    pub default: bool,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_pool: Option<ThinPoolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spare_gb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_size: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lvcreate_options: Vec<String>,
}

impl DeviceClass {
    /// Bytes of the volume group that are never handed out.
    pub fn spare_bytes(&self) -> u64 {
        gib_to_bytes(self.spare_gb.unwrap_or(DEFAULT_SPARE_GB))
    }

    pub fn is_thin(&self) -> bool {
        self.device_type == DeviceType::Thin
    }

    /// The thin pool of a thin class. Validation guarantees every thin class
    /// carries one.
    pub fn thin_pool(&self) -> LvmCsiResult<&ThinPoolConfig> {
        self.thin_pool.as_ref().ok_or_else(|| {
            LvmCsiError::invalid(format!("device class {} has no thin pool", self.name))
        })
    }

    fn validate(&self) -> LvmCsiResult<()> {
        if self.name.is_empty() {
            return Err(LvmCsiError::invalid("device class name must not be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(LvmCsiError::invalid(format!(
                "device class name {} is longer than {MAX_NAME_LEN} characters",
                self.name
            )));
        }
        let pattern = QUALIFIED_NAME.as_ref().map_err(|e| {
            LvmCsiError::Chained(
                "device class name pattern does not compile".to_string(),
                Box::new(LvmCsiError::Regex(e.clone())),
            )
        })?;
        if !pattern.is_match(&self.name) {
            return Err(LvmCsiError::invalid(format!(
                "device class name {} is not a qualified name",
                self.name
            )));
        }
        if self.volume_group.is_empty() {
            return Err(LvmCsiError::invalid(format!(
                "volume group of device class {} must not be empty",
                self.name
            )));
        }
        if self.volume_group.len() > MAX_VG_NAME_LEN {
            return Err(LvmCsiError::invalid(format!(
                "volume group name {} is longer than {MAX_VG_NAME_LEN} characters",
                self.volume_group
            )));
        }

        match (self.device_type, &self.thin_pool) {
            (DeviceType::Thin, None) => Err(LvmCsiError::invalid(format!(
                "thin device class {} requires a thin pool",
                self.name
            ))),
            (DeviceType::Thin, Some(pool)) if pool.name.is_empty() => {
                Err(LvmCsiError::invalid(format!(
                    "thin pool name of device class {} must not be empty",
                    self.name
                )))
            }
            (DeviceType::Thin, Some(pool)) if pool.overprovision_ratio <= 0.0 => {
                Err(LvmCsiError::invalid(format!(
                    "overprovision ratio of device class {} must be positive",
                    self.name
                )))
            }
            (DeviceType::Thick, Some(_)) => Err(LvmCsiError::invalid(format!(
                "thick device class {} must not have a thin pool",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// A validated, immutable set of device classes.
#[derive(Debug, Clone, Default)]
pub struct DeviceClassManager {
    classes: Vec<DeviceClass>,
}

impl DeviceClassManager {
    pub fn new(classes: Vec<DeviceClass>) -> LvmCsiResult<DeviceClassManager> {
        let mut names = HashSet::new();
        for class in &classes {
            class.validate()?;
            if !names.insert(class.name.as_str()) {
                return Err(LvmCsiError::invalid(format!(
                    "duplicate device class name {}",
                    class.name
                )));
            }
        }

        let defaults = classes.iter().filter(|c| c.default).count();
        if !classes.is_empty() && defaults != 1 {
            return Err(LvmCsiError::invalid(format!(
                "exactly one default device class is required, found {defaults}"
            )));
        }

        Ok(DeviceClassManager { classes })
    }

    pub fn device_classes(&self) -> &[DeviceClass] {
        &self.classes
    }

    /// Look up a class by name. The empty name denotes the default class.
    pub fn device_class(&self, name: &str) -> LvmCsiResult<&DeviceClass> {
        let found = if name.is_empty() {
            self.classes.iter().find(|c| c.default)
        } else {
            self.classes.iter().find(|c| c.name == name)
        };
        found.ok_or_else(|| {
            if name.is_empty() {
                LvmCsiError::not_found("no default device class is configured")
            } else {
                LvmCsiError::not_found(format!("device class {name} not found"))
            }
        })
    }

    pub fn find_device_class_by_vg_name(&self, vg_name: &str) -> LvmCsiResult<&DeviceClass> {
        self.classes
            .iter()
            .find(|c| c.volume_group == vg_name)
            .ok_or_else(|| {
                LvmCsiError::not_found(format!("no device class uses volume group {vg_name}"))
            })
    }

    pub fn find_device_class_by_thin_pool_name(
        &self,
        vg_name: &str,
        pool_name: &str,
    ) -> LvmCsiResult<&DeviceClass> {
        self.classes
            .iter()
            .find(|c| {
                c.volume_group == vg_name
                    && c.thin_pool.as_ref().map(|p| p.name.as_str()) == Some(pool_name)
            })
            .ok_or_else(|| {
                LvmCsiError::not_found(format!(
                    "no device class uses thin pool {vg_name}/{pool_name}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::lvmcsi::ErrorCode;

    use super::*;

    fn thick(name: &str, vg: &str, default: bool) -> DeviceClass {
        DeviceClass {
            name: name.to_string(),
            volume_group: vg.to_string(),
            default,
            device_type: DeviceType::Thick,
            thin_pool: None,
            spare_gb: None,
            stripe: None,
            stripe_size: None,
            lvcreate_options: Vec::new(),
        }
    }

    fn thin(name: &str, vg: &str, pool: &str, ratio: f64) -> DeviceClass {
        DeviceClass {
            device_type: DeviceType::Thin,
            thin_pool: Some(ThinPoolConfig {
                name: pool.to_string(),
                overprovision_ratio: ratio,
            }),
            ..thick(name, vg, false)
        }
    }

    fn assert_invalid(classes: Vec<DeviceClass>) {
        assert_matches!(
            DeviceClassManager::new(classes),
            Err(e) if e.code() == ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_lookup() {
        let manager = DeviceClassManager::new(vec![
            thick("ssd", "vg-ssd", true),
            thin("thin", "vg-ssd", "pool0", 10.0),
        ])
        .expect("valid");
        assert_eq!(manager.device_class("").map(|c| c.name.as_str()).ok(), Some("ssd"));
        assert_eq!(manager.device_class("thin").map(|c| c.is_thin()).ok(), Some(true));
        assert_matches!(manager.device_class("hdd"), Err(e) if e.is_not_found());
        assert_eq!(
            manager.find_device_class_by_vg_name("vg-ssd").map(|c| c.name.as_str()).ok(),
            Some("ssd")
        );
        assert_eq!(
            manager
                .find_device_class_by_thin_pool_name("vg-ssd", "pool0")
                .map(|c| c.name.as_str())
                .ok(),
            Some("thin")
        );
        assert_matches!(manager.find_device_class_by_vg_name("vg-hdd"), Err(e) if e.is_not_found());
    }

    #[test]
    fn test_empty_set_is_valid() {
        let manager = DeviceClassManager::new(Vec::new()).expect("valid");
        assert_matches!(manager.device_class(""), Err(e) if e.is_not_found());
    }

    #[test]
    fn test_default_count() {
        assert_invalid(vec![thick("a", "vg1", false)]);
        assert_invalid(vec![thick("a", "vg1", true), thick("b", "vg2", true)]);
    }

    #[test]
    fn test_names() {
        assert_invalid(vec![thick("", "vg1", true)]);
        assert_invalid(vec![thick("-ssd", "vg1", true)]);
        assert_invalid(vec![thick("ssd_", "vg1", true)]);
        assert_invalid(vec![thick(&"a".repeat(64), "vg1", true)]);
        assert_invalid(vec![thick("ssd", "", true)]);
        assert_invalid(vec![thick("ssd", &"v".repeat(127), true)]);
        assert_invalid(vec![thick("ssd", "vg1", true), thick("ssd", "vg2", false)]);
        assert!(DeviceClassManager::new(vec![thick("a.b_c-d", "vg1", true)]).is_ok());
        assert!(DeviceClassManager::new(vec![thick("x", "vg1", true)]).is_ok());
    }

    #[test]
    fn test_thin_pool_rules() {
        let mut no_pool = thin("thin", "vg1", "pool0", 1.0);
        no_pool.thin_pool = None;
        no_pool.default = true;
        assert_invalid(vec![no_pool]);
        let mut zero_ratio = thin("thin", "vg1", "pool0", 0.0);
        zero_ratio.default = true;
        assert_invalid(vec![zero_ratio]);
        let mut no_name = thin("thin", "vg1", "", 2.0);
        no_name.default = true;
        assert_invalid(vec![no_name]);
        let mut thick_with_pool = thin("thick", "vg1", "pool0", 2.0);
        thick_with_pool.device_type = DeviceType::Thick;
        thick_with_pool.default = true;
        assert_invalid(vec![thick_with_pool]);
    }

    #[test]
    fn test_yaml_form() {
        let classes: Vec<DeviceClass> = serde_yaml::from_str(
            r#"
- name: ssd
  volume-group: myvg1
  default: true
  spare-gb: 5
  lvcreate-options: ["--type=raid1"]
- name: thin
  volume-group: myvg1
  type: thin
  thin-pool:
    name: pool0
    overprovision-ratio: 5.0
"#,
        )
        .expect("valid yaml");
        assert_eq!(classes[0].spare_bytes(), 5 << 30);
        assert_eq!(classes[0].device_type, DeviceType::Thick);
        assert_eq!(classes[1].spare_bytes(), 10 << 30);
        assert_eq!(
            classes[1].thin_pool.as_ref().map(|p| p.overprovision_ratio),
            Some(5.0)
        );
        assert!(DeviceClassManager::new(classes).is_ok());
    }
}
