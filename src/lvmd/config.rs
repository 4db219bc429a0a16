// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{DeviceClass, DeviceClassManager},
    lvmcsi::{LvmCsiError, LvmCsiResult},
    lvmd::consts::DEFAULT_SOCKET_NAME,
};

fn default_socket_name() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_NAME)
}

/// The lvmd configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LvmdConfig {
    #[serde(default = "default_socket_name")]
    pub socket_name: PathBuf,
    /// Run lvm in the host namespaces, for an lvmd running in a container.
    #[serde(default)]
    pub containerized: bool,
    #[serde(default)]
    pub device_classes: Vec<DeviceClass>,
}

impl LvmdConfig {
    pub fn from_yaml(yaml: &str) -> LvmCsiResult<LvmdConfig> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> LvmCsiResult<LvmdConfig> {
        let yaml = fs::read_to_string(path).map_err(|e| {
            LvmCsiError::Chained(
                format!("Failed to read configuration file {}", path.display()),
                Box::new(LvmCsiError::Io(e)),
            )
        })?;
        LvmdConfig::from_yaml(&yaml).map_err(|e| {
            LvmCsiError::Chained(
                format!("Failed to parse configuration file {}", path.display()),
                Box::new(e),
            )
        })
    }

    /// Validate the configured device classes.
    pub fn device_class_manager(&self) -> LvmCsiResult<DeviceClassManager> {
        DeviceClassManager::new(self.device_classes.clone())
    }
}
