// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use serde::{Deserialize, Serialize};

pub use crate::engine::types::actions::{DeleteAction, EngineAction, GrowAction, RenameAction};

mod actions;

/// Number of bytes in one GiB.
pub const GIB: u64 = 1 << 30;

/// Convert a whole number of GiB into bytes, saturating on overflow.
pub fn gib_to_bytes(gib: u64) -> u64 {
    gib.saturating_mul(GIB)
}

/// Round a byte count up to the next whole GiB, expressed in GiB.
/// Zero bytes rounds to one GiB, the smallest volume that is provisioned.
pub fn round_up_to_gib(bytes: u64) -> u64 {
    if bytes == 0 {
        1
    } else {
        bytes.div_ceil(GIB)
    }
}

/// How an LV is activated once created. Only meaningful for snapshots,
/// which may be restored read-only.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::AsRefStr,
)]
pub enum AccessType {
    #[strum(serialize = "ro")]
    #[serde(rename = "ro")]
    ReadOnly,
    #[strum(serialize = "rw")]
    #[serde(rename = "rw")]
    ReadWrite,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_round_up_to_gib() {
        assert_eq!(round_up_to_gib(0), 1);
        assert_eq!(round_up_to_gib(1), 1);
        assert_eq!(round_up_to_gib(GIB), 1);
        assert_eq!(round_up_to_gib(GIB + 1), 2);
        assert_eq!(round_up_to_gib(3 * GIB), 3);
    }

    #[test]
    fn test_access_type_strings() {
        assert_eq!(AccessType::from_str("ro").ok(), Some(AccessType::ReadOnly));
        assert_eq!(AccessType::ReadWrite.as_ref(), "rw");
        assert!(AccessType::from_str("rx").is_err());
    }
}
