// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Actions produced by planning and consumed by execution

use crate::ids::{ClusterName, GateId, PolicyId};
use crate::policy::UpgradePolicySpec;
use semver::Version;
use serde::Serialize;

/// Kind of change to make in the gateway
///
/// The ordering of the variants is the order in which execution applies
/// them.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffAction {
    Delete,
    Create,
}

/// One change to make in the gateway
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum UpgradeDiff {
    /// schedule an upgrade
    Create {
        cluster: ClusterName,
        spec: UpgradePolicySpec,
        /// version gates to agree to before creating the policy
        gates_to_agree: Vec<GateId>,
    },
    /// cancel a scheduled upgrade
    Delete {
        cluster: ClusterName,
        id: PolicyId,
        version: Option<Version>,
    },
}

impl UpgradeDiff {
    pub fn action(&self) -> DiffAction {
        match self {
            UpgradeDiff::Create { .. } => DiffAction::Create,
            UpgradeDiff::Delete { .. } => DiffAction::Delete,
        }
    }

    pub fn cluster(&self) -> &ClusterName {
        match self {
            UpgradeDiff::Create { cluster, .. }
            | UpgradeDiff::Delete { cluster, .. } => cluster,
        }
    }

    pub fn version(&self) -> Option<&Version> {
        match self {
            UpgradeDiff::Create { spec, .. } => Some(&spec.version),
            UpgradeDiff::Delete { version, .. } => version.as_ref(),
        }
    }
}

impl slog::KV for UpgradeDiff {
    fn serialize(
        &self,
        _record: &slog::Record,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_str(
            "action".into(),
            match self.action() {
                DiffAction::Create => "create",
                DiffAction::Delete => "delete",
            },
        )?;
        serializer.emit_str("cluster".into(), self.cluster().as_str())?;
        match self {
            UpgradeDiff::Create { spec, gates_to_agree, .. } => {
                serializer.emit_arguments(
                    "version".into(),
                    &format_args!("{}", spec.version),
                )?;
                serializer.emit_arguments(
                    "next_run".into(),
                    &format_args!("{}", spec.next_run),
                )?;
                serializer.emit_usize(
                    "gates_to_agree".into(),
                    gates_to_agree.len(),
                )
            }
            UpgradeDiff::Delete { id, version, .. } => {
                serializer.emit_str("id".into(), id.as_str())?;
                match version {
                    Some(v) => serializer
                        .emit_arguments("version".into(), &format_args!("{v}")),
                    None => serializer.emit_none("version".into()),
                }
            }
        }
    }
}
