// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of a simulated gateway

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use upgrade_scheduler_types::blocked::BlockedVersions;
use upgrade_scheduler_types::ids::{ClusterName, GateId, PolicyId};
use upgrade_scheduler_types::policy::{CurrentUpgradePolicy, ScheduleType};

/// Initial state of a simulated gateway
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimGatewayConfig {
    /// patterns of versions that may not be upgraded to
    #[serde(default)]
    pub blocked_versions: BlockedVersions,
    /// which versions are reachable from which
    #[serde(default)]
    pub upgrade_graph: Vec<SimUpgradeEdges>,
    /// version gates, per `major.minor` release
    #[serde(default)]
    pub version_gates: Vec<SimVersionGate>,
    /// clusters with pre-existing policies or agreements
    #[serde(default)]
    pub clusters: Vec<SimCluster>,
    /// whether version-gate agreements are acknowledged
    #[serde(default = "default_acknowledge_agreements")]
    pub acknowledge_agreements: bool,
}

fn default_acknowledge_agreements() -> bool {
    true
}

impl Default for SimGatewayConfig {
    fn default() -> Self {
        SimGatewayConfig {
            blocked_versions: BlockedVersions::default(),
            upgrade_graph: Vec::new(),
            version_gates: Vec::new(),
            clusters: Vec::new(),
            acknowledge_agreements: default_acknowledge_agreements(),
        }
    }
}

/// Versions reachable from `from` on `channel`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimUpgradeEdges {
    pub from: Version,
    pub channel: String,
    pub to: Vec<Version>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimVersionGate {
    pub id: GateId,
    pub version_prefix: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimCluster {
    pub name: ClusterName,
    #[serde(default)]
    pub policies: Vec<SimPolicy>,
    /// gates this cluster has already agreed to
    #[serde(default)]
    pub agreements: Vec<GateId>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SimPolicy {
    pub id: PolicyId,
    #[serde(default)]
    pub version: Option<Version>,
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

impl SimPolicy {
    pub fn into_current(self, cluster: ClusterName) -> CurrentUpgradePolicy {
        CurrentUpgradePolicy {
            id: self.id,
            cluster,
            version: self.version,
            schedule_type: self.schedule_type,
            next_run: self.next_run,
        }
    }
}
