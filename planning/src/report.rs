// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-cluster planning decisions

use chrono::{DateTime, Utc};
use semver::Version;
use serde::Serialize;
use std::fmt;
use upgrade_scheduler_types::ids::{ClusterName, MutexName, PolicyId};

/// What the planner decided for one cluster
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ClusterDecision {
    /// an upgrade to `version` is scheduled for `next_run`
    Create { version: Version, next_run: DateTime<Utc>, gates_to_agree: usize },
    /// the scheduled upgrade to blocked `version` is cancelled
    CancelBlocked { id: PolicyId, version: Version },
    /// the scheduled upgrade targets a blocked version but should already
    /// have started, so it is left alone
    BlockedUpgradeStarted { version: Version, next_run: DateTime<Utc> },
    /// an upgrade is already scheduled
    InFlight { version: Option<Version> },
    /// the gateway's view of this cluster could not be read
    CurrentStateUnknown,
    /// the maintenance window never opens again
    NoUpcomingWindow,
    /// the maintenance window is too far away
    OutsideWindow { next_run: DateTime<Utc> },
    /// a mutex this cluster needs is held by `holder`
    MutexHeld { mutex: MutexName, holder: ClusterName },
    /// none of the `candidates` upgrade targets is usable
    NoEligibleVersion { candidates: usize },
    /// a gateway query failed; the cluster is skipped this pass
    GatewayError { operation: &'static str, message: String },
}

impl ClusterDecision {
    /// Returns true if this decision produced a change
    pub fn is_action(&self) -> bool {
        matches!(
            self,
            ClusterDecision::Create { .. } | ClusterDecision::CancelBlocked { .. }
        )
    }
}

impl fmt::Display for ClusterDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterDecision::Create { version, next_run, gates_to_agree } => {
                write!(f, "upgrade to {version} at {next_run}")?;
                if *gates_to_agree > 0 {
                    write!(f, " ({gates_to_agree} version gates to agree)")?;
                }
                Ok(())
            }
            ClusterDecision::CancelBlocked { id, version } => {
                write!(f, "cancel upgrade {id} to blocked version {version}")
            }
            ClusterDecision::BlockedUpgradeStarted { version, next_run } => {
                write!(
                    f,
                    "upgrade to blocked version {version} started at \
                     {next_run}; leaving it alone"
                )
            }
            ClusterDecision::InFlight { version: Some(version) } => {
                write!(f, "upgrade to {version} already scheduled")
            }
            ClusterDecision::InFlight { version: None } => {
                write!(f, "automatic upgrade already scheduled")
            }
            ClusterDecision::CurrentStateUnknown => {
                write!(f, "current upgrade policies unknown")
            }
            ClusterDecision::NoUpcomingWindow => {
                write!(f, "maintenance window never opens again")
            }
            ClusterDecision::OutsideWindow { next_run } => {
                write!(f, "maintenance window opens at {next_run}")
            }
            ClusterDecision::MutexHeld { mutex, holder } => {
                write!(f, "mutex {mutex} held by {holder}")
            }
            ClusterDecision::NoEligibleVersion { candidates } => {
                write!(f, "no eligible version among {candidates} candidates")
            }
            ClusterDecision::GatewayError { operation, message } => {
                write!(f, "gateway {operation} failed: {message}")
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterReport {
    pub cluster: ClusterName,
    #[serde(flatten)]
    pub decision: ClusterDecision,
}

/// Decisions for every cluster considered in one pass, in priority order
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PlanningReport {
    pub clusters: Vec<ClusterReport>,
}

impl PlanningReport {
    pub fn push(&mut self, cluster: ClusterName, decision: ClusterDecision) {
        self.clusters.push(ClusterReport { cluster, decision });
    }

    pub fn decision(&self, cluster: &ClusterName) -> Option<&ClusterDecision> {
        self.clusters
            .iter()
            .find(|r| r.cluster == *cluster)
            .map(|r| &r.decision)
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

impl fmt::Display for PlanningReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clusters.is_empty() {
            return writeln!(f, "no clusters to plan");
        }
        for report in &self.clusters {
            writeln!(f, "* {}: {}", report.cluster, report.decision)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_report_display() {
        let mut report = PlanningReport::default();
        report.push(
            ClusterName::from("c1"),
            ClusterDecision::MutexHeld {
                mutex: MutexName::from("ingress"),
                holder: ClusterName::from("c0"),
            },
        );
        report.push(
            ClusterName::from("c2"),
            ClusterDecision::NoEligibleVersion { candidates: 3 },
        );
        assert_eq!(
            report.to_string(),
            "* c1: mutex ingress held by c0\n\
             * c2: no eligible version among 3 candidates\n"
        );
        assert!(!report.decision(&ClusterName::from("c2")).unwrap().is_action());
    }

    #[test]
    fn test_report_json() {
        let mut report = PlanningReport::default();
        report.push(
            ClusterName::from("c1"),
            ClusterDecision::InFlight { version: None },
        );
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "clusters": [
                    { "cluster": "c1", "decision": "in_flight", "version": null }
                ]
            })
        );
    }
}
