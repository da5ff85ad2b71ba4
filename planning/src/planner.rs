// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding which clusters may upgrade in this pass

use crate::mutex::MutexTable;
use crate::report::{ClusterDecision, PlanningReport};
use crate::soak::SoakLedger;
use crate::window::{WindowStatus, window_status};
use chrono::{DateTime, Utc};
use semver::Version;
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use upgrade_scheduler_interface::{Gateway, GatewayError};
use upgrade_scheduler_types::diff::UpgradeDiff;
use upgrade_scheduler_types::ids::{ClusterName, GateId, PolicyId};
use upgrade_scheduler_types::policy::{
    CurrentUpgradePolicy, DesiredUpgradePolicy, ScheduleType,
    UpgradePolicySpec,
};
use upgrade_scheduler_types::version::{sort_descending, version_prefix};

#[derive(Debug, Error, SlogInlineError)]
pub enum PlanningError {
    #[error("planning was cancelled")]
    Cancelled,
}

/// The gateway reported more than one upgrade policy for a cluster
///
/// The scheduler never creates a second policy for a cluster, so this means
/// something else is managing the cluster's upgrades.  We don't try to guess
/// which policy is authoritative.
#[derive(Debug, Error, SlogInlineError)]
#[error(
    "cluster {cluster} has {} upgrade policies (expected at most one)",
    .ids.len()
)]
pub struct MultiplePoliciesError {
    pub cluster: ClusterName,
    pub ids: Vec<PolicyId>,
}

/// What the gateway says about one cluster
#[derive(Clone, Copy, Debug)]
pub enum ClusterState<'a> {
    /// no upgrade is scheduled
    Idle,
    /// an upgrade is scheduled
    Scheduled(&'a CurrentUpgradePolicy),
    /// the gateway could not be asked
    Unknown,
}

/// The gateway's upgrade policies for every cluster of one instance
#[derive(Clone, Debug, Default)]
pub struct CurrentState {
    scheduled: BTreeMap<ClusterName, CurrentUpgradePolicy>,
    unknown: BTreeSet<ClusterName>,
}

impl CurrentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the policies the gateway reported for `cluster`
    pub fn insert(
        &mut self,
        cluster: ClusterName,
        policies: Vec<CurrentUpgradePolicy>,
    ) -> Result<(), MultiplePoliciesError> {
        let mut policies = policies.into_iter();
        match (policies.next(), policies.next()) {
            (None, _) => {
                self.scheduled.remove(&cluster);
            }
            (Some(policy), None) => {
                self.scheduled.insert(cluster, policy);
            }
            (Some(first), Some(second)) => {
                let ids = [first, second]
                    .into_iter()
                    .chain(policies)
                    .map(|p| p.id)
                    .collect();
                return Err(MultiplePoliciesError { cluster, ids });
            }
        }
        Ok(())
    }

    /// Records that the policies of `cluster` could not be fetched
    pub fn mark_unknown(&mut self, cluster: ClusterName) {
        self.scheduled.remove(&cluster);
        self.unknown.insert(cluster);
    }

    pub fn get(&self, cluster: &ClusterName) -> ClusterState<'_> {
        if self.unknown.contains(cluster) {
            ClusterState::Unknown
        } else if let Some(policy) = self.scheduled.get(cluster) {
            ClusterState::Scheduled(policy)
        } else {
            ClusterState::Idle
        }
    }

    pub fn unknown(&self) -> impl Iterator<Item = &ClusterName> {
        self.unknown.iter()
    }
}

/// Everything planning needs to know about one instance
pub struct PlanningInput<'a> {
    /// desired policies, in priority order (see
    /// [`upgrade_scheduler_types::policy::sort_by_priority`])
    pub desired: &'a [DesiredUpgradePolicy],
    pub current: &'a CurrentState,
    pub ledger: &'a SoakLedger<'a>,
    pub now: DateTime<Utc>,
}

/// Result of planning
#[derive(Clone, Debug, Default)]
pub struct UpgradePlan {
    /// changes to make, in the order they were decided
    pub diffs: Vec<UpgradeDiff>,
    pub report: PlanningReport,
}

/// A gateway query that failed while planning one cluster
struct GatewayFailure {
    operation: &'static str,
    err: GatewayError,
}

impl GatewayFailure {
    fn wrap(operation: &'static str) -> impl FnOnce(GatewayError) -> Self {
        move |err| GatewayFailure { operation, err }
    }
}

enum VersionChoice {
    Chosen(Version),
    NoneEligible { candidates: usize },
}

/// Decides, for one instance, which clusters to schedule for upgrade and
/// which scheduled upgrades to cancel
///
/// Clusters are considered one at a time in priority order.  Mutexes are
/// granted first-come-first-served, so the order matters: the table of held
/// mutexes is only ever touched from this loop.
pub struct Planner<'a> {
    log: Logger,
    gateway: &'a dyn Gateway,
    input: PlanningInput<'a>,
    cancel: CancellationToken,
}

impl<'a> Planner<'a> {
    pub fn new(
        log: &Logger,
        gateway: &'a dyn Gateway,
        input: PlanningInput<'a>,
    ) -> Planner<'a> {
        Planner {
            log: log.new(o!("component" => "UpgradePlanner")),
            gateway,
            input,
            cancel: CancellationToken::new(),
        }
    }

    /// Stops planning before the next cluster once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn plan(self) -> Result<UpgradePlan, PlanningError> {
        let mut locks = self.seed_mutexes();
        info!(
            self.log, "planning upgrades";
            "clusters" => self.input.desired.len(),
            "mutexes_held" => locks.len(),
            "now" => %self.input.now,
        );

        let mut plan = UpgradePlan::default();
        for policy in self.input.desired {
            if self.cancel.is_cancelled() {
                warn!(
                    self.log, "planning cancelled";
                    "clusters_planned" => plan.report.clusters.len(),
                );
                return Err(PlanningError::Cancelled);
            }

            let log = self.log.new(o!("cluster" => policy.name().to_string()));
            let decision =
                self.plan_cluster(&log, policy, &mut locks, &mut plan.diffs).await;
            if decision.is_action() {
                info!(log, "{decision}");
            } else {
                debug!(log, "no action: {decision}");
            }
            plan.report.push(policy.name().clone(), decision);
        }

        info!(
            self.log, "finished planning";
            "diffs" => plan.diffs.len(),
            "mutexes_held" => locks.len(),
        );
        Ok(plan)
    }

    /// Builds the mutex table for this pass from the clusters that already
    /// have an upgrade scheduled
    ///
    /// A cluster whose state we couldn't read might have one, so its mutexes
    /// are considered held as well.
    fn seed_mutexes(&self) -> MutexTable {
        let mut locks = MutexTable::new();
        for policy in self.input.desired {
            match self.input.current.get(policy.name()) {
                ClusterState::Idle => (),
                ClusterState::Scheduled(_) | ClusterState::Unknown => {
                    locks.hold_all(&policy.conditions.mutexes, policy.name());
                }
            }
        }
        locks
    }

    async fn plan_cluster(
        &self,
        log: &Logger,
        policy: &DesiredUpgradePolicy,
        locks: &mut MutexTable,
        diffs: &mut Vec<UpgradeDiff>,
    ) -> ClusterDecision {
        match self.input.current.get(policy.name()) {
            ClusterState::Idle => (),
            ClusterState::Unknown => return ClusterDecision::CurrentStateUnknown,
            ClusterState::Scheduled(current) => {
                return self.review_scheduled(log, current, diffs).await;
            }
        }

        let next_run = match window_status(&policy.schedule, self.input.now) {
            WindowStatus::Due { next_run } => next_run,
            WindowStatus::NotYetDue { next_run } => {
                return ClusterDecision::OutsideWindow { next_run };
            }
            WindowStatus::Never => return ClusterDecision::NoUpcomingWindow,
        };

        if let Some((mutex, holder)) =
            locks.first_held(&policy.conditions.mutexes)
        {
            return ClusterDecision::MutexHeld {
                mutex: mutex.clone(),
                holder: holder.clone(),
            };
        }

        let version = match self.choose_version(log, policy).await {
            Ok(VersionChoice::Chosen(version)) => version,
            Ok(VersionChoice::NoneEligible { candidates }) => {
                return ClusterDecision::NoEligibleVersion { candidates };
            }
            Err(failure) => return gateway_error(log, failure),
        };

        // From here on this cluster holds its mutexes for the rest of the
        // pass, even if the gate lookup below fails.
        locks.hold_all(&policy.conditions.mutexes, policy.name());

        let gates_to_agree =
            match self.gates_to_agree(policy.name(), &version).await {
                Ok(gates) => gates,
                Err(failure) => return gateway_error(log, failure),
            };

        let decision = ClusterDecision::Create {
            version: version.clone(),
            next_run,
            gates_to_agree: gates_to_agree.len(),
        };
        diffs.push(UpgradeDiff::Create {
            cluster: policy.name().clone(),
            spec: UpgradePolicySpec {
                version,
                schedule_type: ScheduleType::Manual,
                next_run,
            },
            gates_to_agree,
        });
        decision
    }

    /// Decides what to do about a cluster that already has an upgrade
    /// scheduled: nothing, unless it targets a blocked version
    async fn review_scheduled(
        &self,
        log: &Logger,
        current: &CurrentUpgradePolicy,
        diffs: &mut Vec<UpgradeDiff>,
    ) -> ClusterDecision {
        let Some(version) = &current.version else {
            return ClusterDecision::InFlight { version: None };
        };

        match self.gateway.is_version_blocked(version).await {
            Err(err) => {
                gateway_error(log, GatewayFailure::wrap("is_version_blocked")(err))
            }
            Ok(false) => {
                ClusterDecision::InFlight { version: Some(version.clone()) }
            }
            Ok(true) => match current.next_run {
                Some(next_run) if next_run < self.input.now => {
                    warn!(
                        log,
                        "upgrade to blocked version should already have \
                         started; leaving it alone";
                        "version" => %version,
                        "next_run" => %next_run,
                        "id" => &current.id,
                    );
                    ClusterDecision::BlockedUpgradeStarted {
                        version: version.clone(),
                        next_run,
                    }
                }
                _ => {
                    diffs.push(UpgradeDiff::Delete {
                        cluster: current.cluster.clone(),
                        id: current.id.clone(),
                        version: Some(version.clone()),
                    });
                    ClusterDecision::CancelBlocked {
                        id: current.id.clone(),
                        version: version.clone(),
                    }
                }
            },
        }
    }

    /// Picks the highest upgrade target that is not blocked and has soaked
    /// long enough on every workload of the cluster
    async fn choose_version(
        &self,
        log: &Logger,
        policy: &DesiredUpgradePolicy,
    ) -> Result<VersionChoice, GatewayFailure> {
        let mut candidates = self
            .gateway
            .available_upgrades(
                &policy.cluster.current_version,
                &policy.cluster.channel,
            )
            .await
            .map_err(GatewayFailure::wrap("available_upgrades"))?;
        sort_descending(&mut candidates);
        candidates.dedup();

        for candidate in &candidates {
            let blocked = self
                .gateway
                .is_version_blocked(candidate)
                .await
                .map_err(GatewayFailure::wrap("is_version_blocked"))?;
            if blocked {
                debug!(log, "skipping blocked version"; "version" => %candidate);
                continue;
            }

            if self.input.ledger.conditions_met(
                candidate,
                &policy.workloads,
                &policy.conditions,
            ) {
                return Ok(VersionChoice::Chosen(candidate.clone()));
            }
            debug!(
                log, "version has not soaked long enough";
                "version" => %candidate,
                "soak_days_required" => policy.conditions.required_soak_days(),
            );
        }

        Ok(VersionChoice::NoneEligible { candidates: candidates.len() })
    }

    /// Returns the version gates `cluster` must agree to before upgrading to
    /// `version`
    async fn gates_to_agree(
        &self,
        cluster: &ClusterName,
        version: &Version,
    ) -> Result<Vec<GateId>, GatewayFailure> {
        let agreed: BTreeSet<GateId> = self
            .gateway
            .version_agreements(cluster)
            .await
            .map_err(GatewayFailure::wrap("version_agreements"))?
            .into_iter()
            .collect();
        let required = self
            .gateway
            .version_gates(&version_prefix(version))
            .await
            .map_err(GatewayFailure::wrap("version_gates"))?;
        Ok(required.into_iter().filter(|gate| !agreed.contains(gate)).collect())
    }
}

fn gateway_error(log: &Logger, failure: GatewayFailure) -> ClusterDecision {
    let GatewayFailure { operation, err } = failure;
    warn!(
        log, "gateway query failed; skipping cluster for this pass";
        "operation" => operation,
        InlineErrorChain::new(&err)
    );
    ClusterDecision::GatewayError {
        operation,
        message: InlineErrorChain::new(&err).to_string(),
    }
}
