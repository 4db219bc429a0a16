// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The LogicalVolume record shared by the controller and the node agents.
//! Its serialized field names are the contract between the two sides.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    engine::{round_up_to_gib, AccessType},
    lvmcsi::ErrorCode,
};

/// Guards a record against removal until the node has removed its LV.
pub const FINALIZER: &str = "lvmcsi.io/logicalvolume";

/// Present while an expand request is outstanding. The value is the RFC
/// 3339 time of the request.
pub const RESIZE_REQUESTED_AT_ANNOTATION: &str = "lvmcsi.io/resize-requested-at";

/// Condition type that reports the outcome of removing the LV.
pub const VOLUME_REMOVED_CONDITION: &str = "VolumeRemoved";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalVolumeSpec {
    pub name: String,
    pub node_name: String,
    #[serde(default)]
    pub device_class: String,
    /// Requested size in bytes.
    pub size: u64,
    /// Name of the record whose volume this one is restored from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_type: Option<AccessType>,
}

impl LogicalVolumeSpec {
    /// The requested size in whole GiB.
    pub fn size_gb(&self) -> u64 {
        round_up_to_gib(self.size)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::AsRefStr,
)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalVolumeStatus {
    /// Empty until the volume is provisioned; never changes afterwards.
    #[serde(rename = "volumeID", default)]
    pub volume_id: String,
    #[serde(default)]
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolumeRecord {
    pub metadata: ObjectMeta,
    pub spec: LogicalVolumeSpec,
    #[serde(default)]
    pub status: LogicalVolumeStatus,
}

impl LogicalVolumeRecord {
    pub fn new(name: &str, spec: LogicalVolumeSpec) -> LogicalVolumeRecord {
        LogicalVolumeRecord {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..ObjectMeta::default()
            },
            spec,
            status: LogicalVolumeStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn is_provisioned(&self) -> bool {
        !self.status.volume_id.is_empty()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            false
        } else {
            self.metadata.finalizers.push(FINALIZER.to_string());
            true
        }
    }

    /// Returns true if the finalizer was removed.
    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != FINALIZER);
        before != self.metadata.finalizers.len()
    }

    pub fn resize_requested(&self) -> bool {
        self.metadata
            .annotations
            .contains_key(RESIZE_REQUESTED_AT_ANNOTATION)
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Set a condition. The transition time only moves when the status
    /// changes.
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let now = Utc::now();
        match self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.type_ == type_)
        {
            Some(condition) => {
                if condition.status != status {
                    condition.last_transition_time = now;
                }
                condition.status = status;
                condition.reason = reason.to_string();
                condition.message = message.to_string();
            }
            None => self.status.conditions.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_wire_names() {
        let mut record = LogicalVolumeRecord::new(
            "pvc-1",
            LogicalVolumeSpec {
                name: "pvc-1".to_string(),
                node_name: "node1".to_string(),
                device_class: "ssd".to_string(),
                size: 1 << 30,
                source: None,
                access_type: Some(AccessType::ReadOnly),
            },
        );
        record.status.volume_id = "abc".to_string();
        record.status.current_size = Some(1 << 30);
        let value = serde_json::to_value(&record).expect("serializable");
        assert_eq!(value["spec"]["nodeName"], json!("node1"));
        assert_eq!(value["spec"]["deviceClass"], json!("ssd"));
        assert_eq!(value["spec"]["accessType"], json!("ro"));
        assert_eq!(value["status"]["volumeID"], json!("abc"));
        assert_eq!(value["status"]["code"], json!("OK"));
        assert_eq!(value["status"]["currentSize"], json!(1 << 30));
        assert_eq!(value["metadata"]["resourceVersion"], json!(0));
    }

    #[test]
    fn test_finalizer_helpers() {
        let mut record = LogicalVolumeRecord::default();
        assert!(record.add_finalizer());
        assert!(!record.add_finalizer());
        assert!(record.has_finalizer());
        assert!(record.remove_finalizer());
        assert!(!record.remove_finalizer());
    }

    #[test]
    fn test_condition_transition_time() {
        let mut record = LogicalVolumeRecord::default();
        record.set_condition(VOLUME_REMOVED_CONDITION, ConditionStatus::False, "Failed", "a");
        let first = record
            .condition(VOLUME_REMOVED_CONDITION)
            .map(|c| c.last_transition_time);
        record.set_condition(VOLUME_REMOVED_CONDITION, ConditionStatus::False, "Failed", "b");
        let condition = record.condition(VOLUME_REMOVED_CONDITION).cloned();
        assert_eq!(condition.as_ref().map(|c| c.last_transition_time), first);
        assert_eq!(condition.map(|c| c.message), Some("b".to_string()));
        assert_eq!(record.status.conditions.len(), 1);
    }

    #[test]
    fn test_size_gb_rounds_up() {
        let spec = LogicalVolumeSpec {
            size: (1 << 30) + 1,
            ..LogicalVolumeSpec::default()
        };
        assert_eq!(spec.size_gb(), 2);
    }
}
