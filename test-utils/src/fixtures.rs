// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Builders for desired-state fixtures
//!
//! These panic on invalid input; they are only meant for tests.

use chrono::{DateTime, Utc};
use semver::Version;
use upgrade_scheduler_types::ids::{MutexName, Workload};
use upgrade_scheduler_types::policy::{
    ClusterRecord, DesiredUpgradePolicy, UpgradeConditions,
    UpgradePolicyRecord,
};

/// Channel used by fixtures unless overridden
pub const DEFAULT_CHANNEL: &str = "stable-4.14";

/// Parses an RFC 3339 timestamp
pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .unwrap_or_else(|e| panic!("bad timestamp {s:?}: {e}"))
        .with_timezone(&Utc)
}

/// Parses a version
pub fn v(s: &str) -> Version {
    Version::parse(s).unwrap_or_else(|e| panic!("bad version {s:?}: {e}"))
}

/// Builds a desired-state record for one cluster
///
/// By default the cluster runs workload `wA`, has no soak requirement and no
/// mutexes, and its maintenance window opens every minute (so it is always
/// due).
#[derive(Clone, Debug)]
pub struct DesiredPolicyBuilder {
    name: String,
    current_version: String,
    channel: String,
    schedule: String,
    workloads: Vec<String>,
    soak_days: Option<f64>,
    mutexes: Vec<String>,
}

impl DesiredPolicyBuilder {
    pub fn new(name: &str, current_version: &str) -> Self {
        Self {
            name: name.to_owned(),
            current_version: current_version.to_owned(),
            channel: DEFAULT_CHANNEL.to_owned(),
            schedule: String::from("* * * * *"),
            workloads: vec![String::from("wA")],
            soak_days: None,
            mutexes: Vec::new(),
        }
    }

    pub fn channel(mut self, channel: &str) -> Self {
        self.channel = channel.to_owned();
        self
    }

    pub fn schedule(mut self, schedule: &str) -> Self {
        self.schedule = schedule.to_owned();
        self
    }

    pub fn workloads(mut self, workloads: &[&str]) -> Self {
        self.workloads = workloads.iter().map(|w| (*w).to_owned()).collect();
        self
    }

    pub fn soak_days(mut self, soak_days: f64) -> Self {
        self.soak_days = Some(soak_days);
        self
    }

    pub fn mutexes(mut self, mutexes: &[&str]) -> Self {
        self.mutexes = mutexes.iter().map(|m| (*m).to_owned()).collect();
        self
    }

    pub fn record(self) -> ClusterRecord {
        ClusterRecord {
            name: self.name,
            current_version: self.current_version,
            channel: self.channel,
            upgrade_policy: Some(UpgradePolicyRecord {
                schedule: self.schedule,
                workloads: self
                    .workloads
                    .into_iter()
                    .map(Workload::from)
                    .collect(),
                conditions: UpgradeConditions {
                    soak_days: self.soak_days,
                    mutexes: self
                        .mutexes
                        .into_iter()
                        .map(MutexName::from)
                        .collect(),
                },
            }),
        }
    }

    pub fn build(self) -> DesiredUpgradePolicy {
        let name = self.name.clone();
        DesiredUpgradePolicy::from_record(self.record())
            .unwrap_or_else(|e| panic!("bad fixture for {name}: {e}"))
            .unwrap_or_else(|| panic!("fixture {name} has no policy"))
    }
}
