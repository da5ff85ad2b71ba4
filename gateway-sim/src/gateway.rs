// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementation of the gateway interface

use crate::config::SimGatewayConfig;
use async_trait::async_trait;
use semver::Version;
use slog::{Logger, debug, info, o};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use thiserror::Error;
use upgrade_scheduler_interface::{GateAgreement, Gateway, GatewayError};
use upgrade_scheduler_types::blocked::BlockedVersions;
use upgrade_scheduler_types::ids::{ClusterName, GateId, PolicyId};
use upgrade_scheduler_types::policy::{
    CurrentUpgradePolicy, UpgradePolicySpec,
};
use uuid::Uuid;

/// A gateway request that the simulator has been told to fail
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum SimFailure {
    CurrentPolicies(ClusterName),
    AvailableUpgrades(Version),
    BlockedLookup(Version),
    VersionAgreements(ClusterName),
    VersionGates(String),
    CreatePolicy(ClusterName),
    DeletePolicy(ClusterName),
}

#[derive(Debug, Error)]
#[error("injected failure: {0:?}")]
pub struct InjectedFailure(SimFailure);

/// A mutating request received by the simulator
#[derive(Clone, Debug, PartialEq)]
pub enum SimMutation {
    AgreeToVersionGate { cluster: ClusterName, gate: GateId },
    CreatePolicy { cluster: ClusterName, spec: UpgradePolicySpec },
    DeletePolicy { cluster: ClusterName, id: PolicyId },
}

#[derive(Debug, Default)]
struct SimClusterState {
    policies: Vec<CurrentUpgradePolicy>,
    agreements: BTreeSet<GateId>,
}

#[derive(Debug)]
struct SimState {
    blocked: BlockedVersions,
    graph: BTreeMap<(Version, String), BTreeSet<Version>>,
    gates: Vec<(GateId, String)>,
    clusters: BTreeMap<ClusterName, SimClusterState>,
    acknowledge_agreements: bool,
    failures: BTreeSet<SimFailure>,
    mutations: Vec<SimMutation>,
}

impl SimState {
    fn check(
        &self,
        operation: &'static str,
        failure: SimFailure,
    ) -> Result<(), GatewayError> {
        if self.failures.contains(&failure) {
            Err(GatewayError::request(operation, InjectedFailure(failure)))
        } else {
            Ok(())
        }
    }
}

/// Simulated gateway for one fleet-management instance
pub struct SimGateway {
    log: Logger,
    state: Mutex<SimState>,
}

impl SimGateway {
    pub fn new(log: &Logger, config: SimGatewayConfig) -> SimGateway {
        let log = log.new(o!("component" => "SimGateway"));
        let mut graph: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
        for edges in config.upgrade_graph {
            graph
                .entry((edges.from, edges.channel))
                .or_default()
                .extend(edges.to);
        }
        let gates = config
            .version_gates
            .into_iter()
            .map(|g| (g.id, g.version_prefix))
            .collect();
        let clusters = config
            .clusters
            .into_iter()
            .map(|c| {
                let name = c.name;
                let state = SimClusterState {
                    policies: c
                        .policies
                        .into_iter()
                        .map(|p| p.into_current(name.clone()))
                        .collect(),
                    agreements: c.agreements.into_iter().collect(),
                };
                (name, state)
            })
            .collect();

        SimGateway {
            log,
            state: Mutex::new(SimState {
                blocked: config.blocked_versions,
                graph,
                gates,
                clusters,
                acknowledge_agreements: config.acknowledge_agreements,
                failures: BTreeSet::new(),
                mutations: Vec::new(),
            }),
        }
    }

    /// Makes every subsequent matching request fail
    pub fn fail(&self, failure: SimFailure) {
        self.state.lock().unwrap().failures.insert(failure);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Returns every mutating request received so far, in order
    pub fn mutations(&self) -> Vec<SimMutation> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn policies(&self, cluster: &ClusterName) -> Vec<CurrentUpgradePolicy> {
        self.state
            .lock()
            .unwrap()
            .clusters
            .get(cluster)
            .map(|c| c.policies.clone())
            .unwrap_or_default()
    }

    pub fn agreements(&self, cluster: &ClusterName) -> BTreeSet<GateId> {
        self.state
            .lock()
            .unwrap()
            .clusters
            .get(cluster)
            .map(|c| c.agreements.clone())
            .unwrap_or_default()
    }

    /// Adds a pre-existing policy for `policy.cluster`
    pub fn insert_policy(&self, policy: CurrentUpgradePolicy) {
        self.state
            .lock()
            .unwrap()
            .clusters
            .entry(policy.cluster.clone())
            .or_default()
            .policies
            .push(policy);
    }

    /// Simulates `cluster` finishing its upgrade: its policies disappear
    ///
    /// Returns the policies that were removed.
    pub fn complete_upgrade(
        &self,
        cluster: &ClusterName,
    ) -> Vec<CurrentUpgradePolicy> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .clusters
            .get_mut(cluster)
            .map(|c| std::mem::take(&mut c.policies))
            .unwrap_or_default();
        info!(
            self.log, "simulated upgrade completion";
            "cluster" => cluster,
            "policies_removed" => removed.len(),
        );
        removed
    }

    pub fn set_blocked_versions(&self, blocked: BlockedVersions) {
        self.state.lock().unwrap().blocked = blocked;
    }
}

#[async_trait]
impl Gateway for SimGateway {
    async fn current_policies(
        &self,
        cluster: &ClusterName,
    ) -> Result<Vec<CurrentUpgradePolicy>, GatewayError> {
        let state = self.state.lock().unwrap();
        state.check(
            "current_policies",
            SimFailure::CurrentPolicies(cluster.clone()),
        )?;
        Ok(state
            .clusters
            .get(cluster)
            .map(|c| c.policies.clone())
            .unwrap_or_default())
    }

    async fn create_policy(
        &self,
        cluster: &ClusterName,
        spec: &UpgradePolicySpec,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.check("create_policy", SimFailure::CreatePolicy(cluster.clone()))?;
        let id = PolicyId::new(Uuid::new_v4().to_string());
        debug!(
            self.log, "creating upgrade policy";
            "cluster" => cluster,
            "id" => &id,
            "version" => %spec.version,
        );
        state.mutations.push(SimMutation::CreatePolicy {
            cluster: cluster.clone(),
            spec: spec.clone(),
        });
        state.clusters.entry(cluster.clone()).or_default().policies.push(
            CurrentUpgradePolicy {
                id,
                cluster: cluster.clone(),
                version: Some(spec.version.clone()),
                schedule_type: spec.schedule_type,
                next_run: Some(spec.next_run),
            },
        );
        Ok(())
    }

    async fn delete_policy(
        &self,
        cluster: &ClusterName,
        id: &PolicyId,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.check("delete_policy", SimFailure::DeletePolicy(cluster.clone()))?;
        let policies = &mut state
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| GatewayError::UnknownCluster(cluster.clone()))?
            .policies;
        let before = policies.len();
        policies.retain(|p| p.id != *id);
        if policies.len() == before {
            return Err(GatewayError::InvalidResponse {
                operation: "delete_policy",
                message: format!("no upgrade policy {id} for cluster {cluster}"),
            });
        }
        debug!(self.log, "deleted upgrade policy"; "cluster" => cluster, "id" => id);
        state.mutations.push(SimMutation::DeletePolicy {
            cluster: cluster.clone(),
            id: id.clone(),
        });
        Ok(())
    }

    async fn available_upgrades(
        &self,
        current_version: &Version,
        channel: &str,
    ) -> Result<Vec<Version>, GatewayError> {
        let state = self.state.lock().unwrap();
        state.check(
            "available_upgrades",
            SimFailure::AvailableUpgrades(current_version.clone()),
        )?;
        Ok(state
            .graph
            .get(&(current_version.clone(), channel.to_owned()))
            .map(|to| to.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn is_version_blocked(
        &self,
        version: &Version,
    ) -> Result<bool, GatewayError> {
        let state = self.state.lock().unwrap();
        state.check(
            "is_version_blocked",
            SimFailure::BlockedLookup(version.clone()),
        )?;
        Ok(state.blocked.is_blocked(version))
    }

    async fn version_agreements(
        &self,
        cluster: &ClusterName,
    ) -> Result<Vec<GateId>, GatewayError> {
        let state = self.state.lock().unwrap();
        state.check(
            "version_agreements",
            SimFailure::VersionAgreements(cluster.clone()),
        )?;
        Ok(state
            .clusters
            .get(cluster)
            .map(|c| c.agreements.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn version_gates(
        &self,
        version_prefix: &str,
    ) -> Result<Vec<GateId>, GatewayError> {
        let state = self.state.lock().unwrap();
        state.check(
            "version_gates",
            SimFailure::VersionGates(version_prefix.to_owned()),
        )?;
        Ok(state
            .gates
            .iter()
            .filter(|(_, prefix)| prefix == version_prefix)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn agree_to_version_gate(
        &self,
        gate: &GateId,
        cluster: &ClusterName,
    ) -> Result<GateAgreement, GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(SimMutation::AgreeToVersionGate {
            cluster: cluster.clone(),
            gate: gate.clone(),
        });
        let accepted = state.acknowledge_agreements;
        if accepted {
            state
                .clusters
                .entry(cluster.clone())
                .or_default()
                .agreements
                .insert(gate.clone());
        }
        Ok(GateAgreement { accepted })
    }
}
