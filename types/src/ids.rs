// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifiers used throughout the scheduler
//!
//! These are all thin wrappers around `String`.  They exist so that a cluster
//! name can't be passed where a mutex name is expected (and so on).

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Clone,
            Debug,
            Deserialize,
            Eq,
            Hash,
            Ord,
            PartialEq,
            PartialOrd,
            Serialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl slog::Value for $name {
            fn serialize(
                &self,
                _record: &slog::Record,
                key: slog::Key,
                serializer: &mut dyn slog::Serializer,
            ) -> slog::Result {
                serializer.emit_str(key, &self.0)
            }
        }
    };
}

string_id!(
    /// Name of one fleet-management instance (e.g., a production or staging
    /// organization).  Version history is persisted per instance.
    InstanceKey
);
string_id!(
    /// Name of a managed cluster
    ClusterName
);
string_id!(
    /// A workload-type tag.  Soak time is accumulated per (version, workload).
    Workload
);
string_id!(
    /// Name of an upgrade mutex
    MutexName
);
string_id!(
    /// Identifier of a version gate that must be agreed to before upgrading
    GateId
);
string_id!(
    /// Gateway-assigned identifier of an upgrade policy
    PolicyId
);
