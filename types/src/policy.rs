// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired and current upgrade policies

use crate::ids::{ClusterName, MutexName, PolicyId, Workload};
use crate::schedule::{MaintenanceWindow, ScheduleParseError};
use crate::version::{VersionParseError, parse_version};
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// How the gateway schedules an upgrade policy
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// one-shot upgrade to a specific version at a specific time
    Manual,
    /// recurring upgrade to whatever the gateway picks
    Automatic,
}

/// Conditions that must hold before a cluster may be upgraded
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct UpgradeConditions {
    /// minimum number of days a version must have soaked on every workload of
    /// the cluster before the cluster may move to it
    pub soak_days: Option<f64>,
    /// upgrade locks this cluster holds while its upgrade is in flight
    pub mutexes: Vec<MutexName>,
}

impl UpgradeConditions {
    pub fn required_soak_days(&self) -> f64 {
        self.soak_days.unwrap_or(0.0)
    }
}

/// A cluster as described by the desired state
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Cluster {
    pub name: ClusterName,
    pub current_version: Version,
    pub channel: String,
}

/// Upgrade policy for one cluster, as described by the desired state
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DesiredUpgradePolicy {
    pub cluster: Cluster,
    pub schedule: MaintenanceWindow,
    pub workloads: BTreeSet<Workload>,
    pub conditions: UpgradeConditions,
}

impl DesiredUpgradePolicy {
    pub fn name(&self) -> &ClusterName {
        &self.cluster.name
    }

    /// Validates a raw desired-state record
    ///
    /// Returns `Ok(None)` for clusters without an upgrade policy.  Those are
    /// not managed by the scheduler.
    pub fn from_record(
        record: ClusterRecord,
    ) -> Result<Option<Self>, InvalidPolicyError> {
        let Some(policy) = record.upgrade_policy else {
            return Ok(None);
        };
        let name = ClusterName::new(record.name);
        let current_version =
            parse_version(&record.current_version).map_err(|err| {
                InvalidPolicyError::Version { cluster: name.clone(), err }
            })?;
        let schedule =
            MaintenanceWindow::parse(&policy.schedule).map_err(|err| {
                InvalidPolicyError::Schedule { cluster: name.clone(), err }
            })?;
        if let Some(soak_days) = policy.conditions.soak_days {
            if !soak_days.is_finite() || soak_days < 0.0 {
                return Err(InvalidPolicyError::SoakDays {
                    cluster: name,
                    soak_days,
                });
            }
        }

        Ok(Some(DesiredUpgradePolicy {
            cluster: Cluster { name, current_version, channel: record.channel },
            schedule,
            workloads: policy.workloads,
            conditions: policy.conditions,
        }))
    }
}

/// Sorts desired policies into the order in which they are considered for
/// upgrades
///
/// Clusters running older versions come first.  Among clusters on the same
/// version, those with smaller soak requirements come first.  Mutexes are
/// granted first-come-first-served, so this order decides who wins a
/// contended mutex.  The sort is stable.
pub fn sort_by_priority(policies: &mut [DesiredUpgradePolicy]) {
    policies.sort_by(|a, b| {
        a.cluster.current_version.cmp(&b.cluster.current_version).then_with(
            || {
                a.conditions
                    .required_soak_days()
                    .total_cmp(&b.conditions.required_soak_days())
            },
        )
    });
}

#[derive(Debug, Error)]
pub enum InvalidPolicyError {
    #[error("cluster {cluster}: bad current version")]
    Version {
        cluster: ClusterName,
        #[source]
        err: VersionParseError,
    },
    #[error("cluster {cluster}: bad maintenance window")]
    Schedule {
        cluster: ClusterName,
        #[source]
        err: ScheduleParseError,
    },
    #[error("cluster {cluster}: soak_days must be a non-negative number (got {soak_days})")]
    SoakDays { cluster: ClusterName, soak_days: f64 },
}

/// Desired-state record for one cluster, as delivered by a config source
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ClusterRecord {
    pub name: String,
    pub current_version: String,
    pub channel: String,
    #[serde(default)]
    pub upgrade_policy: Option<UpgradePolicyRecord>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UpgradePolicyRecord {
    pub schedule: String,
    #[serde(default)]
    pub workloads: BTreeSet<Workload>,
    #[serde(default)]
    pub conditions: UpgradeConditions,
}

/// An upgrade policy that exists in the gateway
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CurrentUpgradePolicy {
    pub id: PolicyId,
    pub cluster: ClusterName,
    /// target version (absent for automatic policies)
    #[serde(default)]
    pub version: Option<Version>,
    pub schedule_type: ScheduleType,
    /// when the gateway will start (or started) the upgrade
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

/// The body of a request to create an upgrade policy
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct UpgradePolicySpec {
    pub version: Version,
    pub schedule_type: ScheduleType,
    pub next_run: DateTime<Utc>,
}
