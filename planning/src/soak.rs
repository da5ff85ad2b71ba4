// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Soak-time accounting
//!
//! Soak time is how long (in calendar days) a version has been running a
//! given workload type somewhere in the fleet.  Every pass, each cluster
//! reports the version it runs and its workloads.  If a cluster already known
//! to run a (version, workload) pair reports it again, the pair is credited
//! with the time since the previous pass.  A pair is credited at most once
//! per pass no matter how many clusters report it.  A cluster seen for the
//! first time is only registered, so no soak time is credited for the period
//! before it was observed.

use chrono::{DateTime, Utc};
use semver::Version;
use std::collections::BTreeSet;
use upgrade_scheduler_types::history::VersionHistory;
use upgrade_scheduler_types::ids::{ClusterName, Workload};
use upgrade_scheduler_types::policy::{DesiredUpgradePolicy, UpgradeConditions};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// A cluster observed running `version` with `workloads`
#[derive(Clone, Copy, Debug)]
pub struct ObservedVersion<'a> {
    pub cluster: &'a ClusterName,
    pub version: &'a Version,
    pub workloads: &'a BTreeSet<Workload>,
}

impl<'a> From<&'a DesiredUpgradePolicy> for ObservedVersion<'a> {
    fn from(policy: &'a DesiredUpgradePolicy) -> Self {
        ObservedVersion {
            cluster: &policy.cluster.name,
            version: &policy.cluster.current_version,
            workloads: &policy.workloads,
        }
    }
}

/// Folds one pass worth of observations into `history`
///
/// A history that has never been checked in (or whose check-in lies in the
/// future) credits no time in this call.  Soak time never decreases.
pub fn update_history<'a, I>(
    history: &mut VersionHistory,
    observed: I,
    now: DateTime<Utc>,
) where
    I: IntoIterator<Item = ObservedVersion<'a>>,
{
    let check_in = history.check_in.unwrap_or(now);
    let elapsed_days = ((now - check_in).num_milliseconds() as f64
        / 1000.0
        / SECONDS_PER_DAY)
        .max(0.0);

    let mut credited = BTreeSet::new();
    for observation in observed {
        for workload in observation.workloads {
            let record = history.record_mut(observation.version, workload);
            if !record.reporting.contains(observation.cluster) {
                record.reporting.insert(observation.cluster.clone());
            } else if credited.insert((observation.version, workload)) {
                record.soak_days += elapsed_days;
            }
        }
    }

    history.check_in = Some(now);
}

/// Read-only view of soak time for one instance, including any version data
/// inherited from other instances
///
/// Inherited soak time is added to the local soak time.
#[derive(Clone, Debug)]
pub struct SoakLedger<'a> {
    local: &'a VersionHistory,
    inherited: Vec<&'a VersionHistory>,
}

impl<'a> SoakLedger<'a> {
    pub fn new(local: &'a VersionHistory) -> Self {
        SoakLedger { local, inherited: Vec::new() }
    }

    pub fn with_inherited<I>(local: &'a VersionHistory, inherited: I) -> Self
    where
        I: IntoIterator<Item = &'a VersionHistory>,
    {
        SoakLedger { local, inherited: inherited.into_iter().collect() }
    }

    /// Total soak days of `version` on `workload`
    pub fn soak_days(&self, version: &Version, workload: &Workload) -> f64 {
        std::iter::once(self.local)
            .chain(self.inherited.iter().copied())
            .map(|h| h.soak_days(version, workload))
            .sum()
    }

    /// Returns whether `version` has soaked long enough on every one of
    /// `workloads` to satisfy `conditions`
    pub fn conditions_met(
        &self,
        version: &Version,
        workloads: &BTreeSet<Workload>,
        conditions: &UpgradeConditions,
    ) -> bool {
        let required = conditions.required_soak_days();
        workloads.iter().all(|w| self.soak_days(version, w) >= required)
    }
}
