// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persisted version history (soak time per version and workload)

use crate::ids::{ClusterName, Workload};
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Soak time accumulated by one version on one workload type
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct WorkloadSoakRecord {
    /// days during which at least one cluster in `reporting` ran this version
    /// with this workload
    pub soak_days: f64,
    /// clusters that have been observed running this version and workload
    pub reporting: BTreeSet<ClusterName>,
}

/// Soak records for one version, keyed by workload
pub type VersionWorkloads = BTreeMap<Workload, WorkloadSoakRecord>;

/// Version history for one fleet-management instance
///
/// This is the only state the scheduler keeps between passes.  It grows over
/// the set of versions that have ever been observed and is never pruned.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct VersionHistory {
    /// when the history was last updated
    #[serde(default)]
    pub check_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub versions: BTreeMap<Version, VersionWorkloads>,
}

impl VersionHistory {
    pub fn record(
        &self,
        version: &Version,
        workload: &Workload,
    ) -> Option<&WorkloadSoakRecord> {
        self.versions.get(version).and_then(|w| w.get(workload))
    }

    /// Returns the record for (`version`, `workload`), creating an empty one
    /// if none exists yet
    pub fn record_mut(
        &mut self,
        version: &Version,
        workload: &Workload,
    ) -> &mut WorkloadSoakRecord {
        self.versions
            .entry(version.clone())
            .or_default()
            .entry(workload.clone())
            .or_default()
    }

    /// Soak days accumulated for (`version`, `workload`), zero if never seen
    pub fn soak_days(&self, version: &Version, workload: &Workload) -> f64 {
        self.record(version, workload).map_or(0.0, |r| r.soak_days)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_missing_record_has_no_soak() {
        let history = VersionHistory::default();
        assert_eq!(
            history.soak_days(&Version::new(4, 14, 1), &Workload::from("wA")),
            0.0
        );
    }

    #[test]
    fn test_json_shape() {
        let mut history = VersionHistory::default();
        let record = history
            .record_mut(&Version::new(4, 10, 1), &Workload::from("wA"));
        record.soak_days = 21.5;
        record.reporting.insert(ClusterName::from("c1"));

        let json = serde_json::to_value(&history).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "check_in": null,
                "versions": {
                    "4.10.1": {
                        "wA": { "soak_days": 21.5, "reporting": ["c1"] }
                    }
                }
            })
        );
        let back: VersionHistory = serde_json::from_value(json).unwrap();
        assert_eq!(back, history);
    }

    #[test]
    fn test_empty_document_is_default() {
        let history: VersionHistory = serde_json::from_str("{}").unwrap();
        assert_eq!(history, VersionHistory::default());
    }
}
