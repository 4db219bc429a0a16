// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod memory;
mod store;
mod types;

pub use self::{
    memory::MemoryStore,
    store::{update_with_retry, RecordStore, RecordWatch, WatchEvent},
    types::{
        Condition, ConditionStatus, LogicalVolumeRecord, LogicalVolumeSpec, LogicalVolumeStatus,
        ObjectMeta, FINALIZER, RESIZE_REQUESTED_AT_ANNOTATION, VOLUME_REMOVED_CONDITION,
    },
};
