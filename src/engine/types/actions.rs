// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Contains types which encode the results of actions requested on the
//! local volume service, a logical volume, or a LogicalVolume record. Each
//! action type is designed to support idempotency: the action was completed
//! successfully and the type indicates what changes had to be made.

use std::fmt::{self, Display};

/// A trait for a generic kind of action. Defines the type of the thing to
/// be changed, and also a method to indicate what changed.
pub trait EngineAction {
    type Return;

    /// Returns whether or not the action changed state.
    fn is_changed(&self) -> bool;

    /// Returns the thing or things changed.
    fn changed(self) -> Option<Self::Return>;
}

#[derive(Debug, PartialEq, Eq)]
/// An action which may delete a single thing.
pub enum DeleteAction<T> {
    /// The thing was already absent.
    Identity,
    /// The thing existed and was removed.
    Deleted(T),
}

impl<T> EngineAction for DeleteAction<T> {
    type Return = T;

    fn is_changed(&self) -> bool {
        matches!(*self, DeleteAction::Deleted(_))
    }

    fn changed(self) -> Option<T> {
        match self {
            DeleteAction::Deleted(t) => Some(t),
            _ => None,
        }
    }
}

impl Display for DeleteAction<String> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteAction::Deleted(name) => {
                write!(f, "Volume {name} was deleted successfully")
            }
            DeleteAction::Identity => {
                write!(
                    f,
                    "The volume requested for deletion is already absent; no action taken"
                )
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
/// An action which may grow a single thing.
pub enum GrowAction<T> {
    /// The thing was already at least as large as requested.
    Identity,
    /// The thing was grown.
    Grown(T),
}

impl<T> EngineAction for GrowAction<T> {
    type Return = T;

    fn is_changed(&self) -> bool {
        matches!(*self, GrowAction::Grown(_))
    }

    fn changed(self) -> Option<T> {
        match self {
            GrowAction::Grown(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
/// An action which may rename a single thing.
pub enum RenameAction<T> {
    /// The thing already had the given name.
    Identity,
    /// The thing did not have the given name and was renamed.
    Renamed(T),
}

impl<T> EngineAction for RenameAction<T> {
    type Return = T;

    fn is_changed(&self) -> bool {
        matches!(*self, RenameAction::Renamed(_))
    }

    fn changed(self) -> Option<T> {
        match self {
            RenameAction::Renamed(t) => Some(t),
            _ => None,
        }
    }
}
