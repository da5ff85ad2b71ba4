// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Full reconciliation passes against a simulated gateway

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dropshot::{ConfigLogging, ConfigLoggingLevel};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use upgrade_gateway_sim::{
    SimFailure, SimGateway, SimGatewayConfig, SimMutation, SimUpgradeEdges,
};
use upgrade_scheduler::reconcile::{
    PassReport, ReconcileArgs, ReconcileError, reconcile,
};
use upgrade_scheduler::{
    Config, FetchError, HistoryConfig, InMemoryHistoryStore, InstanceConfig,
    InstanceOutcome, Scheduler,
};
use upgrade_scheduler_execution::DiffResult;
use semver::Version;
use upgrade_scheduler_interface::{
    ConfigSource, ConfigSourceError, GateAgreement, Gateway, GatewayError,
    StoreError, VersionHistoryStore,
};
use upgrade_scheduler_planning::report::ClusterDecision;
use upgrade_scheduler_test_utils::dev::{LogContext, test_setup_log};
use upgrade_scheduler_test_utils::fixtures::{
    DEFAULT_CHANNEL, DesiredPolicyBuilder, ts, v,
};
use upgrade_scheduler_types::blocked::BlockedVersions;
use upgrade_scheduler_types::history::VersionHistory;
use upgrade_scheduler_types::ids::{
    ClusterName, GateId, InstanceKey, PolicyId, Workload,
};
use upgrade_scheduler_types::policy::{
    ClusterRecord, CurrentUpgradePolicy, ScheduleType, UpgradePolicySpec,
};

const T0: &str = "2024-05-06T10:30:00Z";

/// Desired state that tests can change between passes
#[derive(Default)]
struct StaticConfigSource {
    instances: Mutex<BTreeMap<InstanceKey, Vec<ClusterRecord>>>,
}

impl StaticConfigSource {
    fn set(&self, key: &str, records: Vec<ClusterRecord>) {
        self.instances.lock().unwrap().insert(InstanceKey::from(key), records);
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn desired_clusters(
        &self,
        instance: &InstanceKey,
    ) -> Result<Vec<ClusterRecord>, ConfigSourceError> {
        self.instances
            .lock()
            .unwrap()
            .get(instance)
            .cloned()
            .ok_or_else(|| ConfigSourceError::UnknownInstance(instance.clone()))
    }
}

fn edges(from: &str, to: &[&str]) -> SimUpgradeEdges {
    SimUpgradeEdges {
        from: v(from),
        channel: DEFAULT_CHANNEL.to_owned(),
        to: to.iter().map(|t| v(t)).collect(),
    }
}

fn sim_config() -> SimGatewayConfig {
    SimGatewayConfig {
        upgrade_graph: vec![
            edges("4.13.10", &["4.13.11", "4.14.1"]),
            edges("4.13.11", &["4.14.1"]),
        ],
        ..Default::default()
    }
}

struct Harness {
    logctx: LogContext,
    gateway: Arc<SimGateway>,
    source: StaticConfigSource,
    store: InMemoryHistoryStore,
}

impl Harness {
    fn new(test_name: &str, config: SimGatewayConfig) -> Harness {
        let logctx = test_setup_log(test_name);
        let gateway = Arc::new(SimGateway::new(&logctx.log, config));
        Harness {
            logctx,
            gateway,
            source: StaticConfigSource::default(),
            store: InMemoryHistoryStore::new(),
        }
    }

    fn args<'a>(
        &'a self,
        instance: &'a InstanceConfig,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> ReconcileArgs<'a> {
        ReconcileArgs {
            log: &self.logctx.log,
            instance,
            gateway: self.gateway.clone(),
            config_source: &self.source,
            store: &self.store,
            now,
            dry_run,
            max_gateway_parallelism: 4,
            cancel: CancellationToken::new(),
        }
    }

    async fn pass(
        &self,
        instance: &InstanceConfig,
        now: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<PassReport, ReconcileError> {
        reconcile(self.args(instance, now, dry_run)).await
    }

    fn cleanup_successful(self) {
        self.logctx.cleanup_successful();
    }
}

fn decision<'a>(report: &'a PassReport, cluster: &str) -> &'a ClusterDecision {
    report.planning.decision(&ClusterName::from(cluster)).unwrap()
}

#[tokio::test]
async fn test_replanning_after_apply_is_a_no_op() {
    let h = Harness::new("replanning_after_apply_is_a_no_op", sim_config());
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![
            DesiredPolicyBuilder::new("c1", "4.13.10").mutexes(&["ingress"]).record(),
            DesiredPolicyBuilder::new("c2", "4.13.11").mutexes(&["ingress"]).record(),
            DesiredPolicyBuilder::new("c3", "4.13.10").record(),
        ],
    );

    let first = h.pass(&instance, ts(T0), false).await.unwrap();
    assert!(decision(&first, "c1").is_action());
    assert!(matches!(decision(&first, "c2"), ClusterDecision::MutexHeld { .. }));
    assert!(decision(&first, "c3").is_action());
    let mutations = h.gateway.mutations();
    assert_eq!(mutations.len(), 2);

    let second = h.pass(&instance, ts(T0), false).await.unwrap();
    assert!(second.planning.clusters.iter().all(|r| !r.decision.is_action()));
    assert_eq!(
        *decision(&second, "c1"),
        ClusterDecision::InFlight { version: Some(v("4.14.1")) }
    );
    assert!(matches!(decision(&second, "c2"), ClusterDecision::MutexHeld { .. }));
    assert!(second.execution.outcomes.is_empty());
    assert_eq!(h.gateway.mutations(), mutations);

    // Once c1's upgrade completes its mutex is free again.
    h.gateway.complete_upgrade(&ClusterName::from("c1"));
    h.source.set(
        "production",
        vec![
            DesiredPolicyBuilder::new("c1", "4.14.1").mutexes(&["ingress"]).record(),
            DesiredPolicyBuilder::new("c2", "4.13.11").mutexes(&["ingress"]).record(),
            DesiredPolicyBuilder::new("c3", "4.13.10").record(),
        ],
    );
    let third = h.pass(&instance, ts(T0), false).await.unwrap();
    assert!(decision(&third, "c2").is_action());
    // c1 now sorts after c2, which takes the mutex first.
    assert!(matches!(
        decision(&third, "c1"),
        ClusterDecision::MutexHeld { holder, .. } if holder.as_str() == "c2"
    ));
    assert_eq!(h.gateway.policies(&ClusterName::from("c2")).len(), 1);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_soak_accumulates_across_passes() {
    let h = Harness::new("soak_accumulates_across_passes", sim_config());
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![
            DesiredPolicyBuilder::new("canary", "4.14.1").record(),
            DesiredPolicyBuilder::new("c2", "4.13.11").soak_days(1.0).record(),
        ],
    );
    let key = InstanceKey::from("production");
    let wa = Workload::from("wA");

    let first = h.pass(&instance, ts(T0), false).await.unwrap();
    assert_eq!(
        *decision(&first, "c2"),
        ClusterDecision::NoEligibleVersion { candidates: 1 }
    );
    let history = h.store.snapshot(&key).unwrap();
    assert_eq!(history.check_in, Some(ts(T0)));
    assert_eq!(history.soak_days(&v("4.14.1"), &wa), 0.0);

    let t1 = ts(T0) + TimeDelta::days(1);
    let second = h.pass(&instance, t1, false).await.unwrap();
    let history = h.store.snapshot(&key).unwrap();
    assert_eq!(history.check_in, Some(t1));
    assert_eq!(history.soak_days(&v("4.14.1"), &wa), 1.0);
    assert_eq!(second.history, history);
    assert!(matches!(
        decision(&second, "c2"),
        ClusterDecision::Create { version, .. } if *version == v("4.14.1")
    ));
    h.cleanup_successful();
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let h = Harness::new("dry_run_changes_nothing", sim_config());
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![DesiredPolicyBuilder::new("c1", "4.13.10").record()],
    );

    let report = h.pass(&instance, ts(T0), true).await.unwrap();
    assert!(report.dry_run);
    assert!(decision(&report, "c1").is_action());
    assert_eq!(report.execution.outcomes.len(), 1);
    assert_eq!(report.execution.outcomes[0].result, DiffResult::DryRun);
    assert!(h.gateway.mutations().is_empty());
    assert_eq!(h.store.snapshot(&InstanceKey::from("production")), None);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_inherited_soak_time() {
    let h = Harness::new("inherited_soak_time", sim_config());
    h.source.set(
        "production",
        vec![DesiredPolicyBuilder::new("c1", "4.13.11").soak_days(30.0).record()],
    );
    let mut staging_history = VersionHistory::default();
    staging_history.check_in = Some(ts(T0));
    staging_history.record_mut(&v("4.14.1"), &Workload::from("wA")).soak_days =
        40.0;
    h.store.insert(InstanceKey::from("staging"), staging_history.clone());

    // Without inheritance, production has no soak time of its own.
    let alone = InstanceConfig::new("production");
    let report = h.pass(&alone, ts(T0), true).await.unwrap();
    assert!(!decision(&report, "c1").is_action());

    let inheriting = InstanceConfig {
        key: InstanceKey::from("production"),
        inherit_version_data: vec![InstanceKey::from("staging")],
    };
    let report = h.pass(&inheriting, ts(T0), false).await.unwrap();
    assert!(decision(&report, "c1").is_action());
    assert_eq!(report.history.soak_days(&v("4.14.1"), &Workload::from("wA")), 0.0);
    assert_eq!(
        h.store.snapshot(&InstanceKey::from("staging")),
        Some(staging_history)
    );
    h.cleanup_successful();
}

#[tokio::test]
async fn test_blocked_pending_upgrade_is_replaced() {
    let h = Harness::new("blocked_pending_upgrade_is_replaced", sim_config());
    let instance = InstanceConfig::new("production");
    let c1 = ClusterName::from("c1");
    h.source.set(
        "production",
        vec![DesiredPolicyBuilder::new("c1", "4.13.10").record()],
    );

    let first = h.pass(&instance, ts(T0), false).await.unwrap();
    assert!(matches!(
        decision(&first, "c1"),
        ClusterDecision::Create { version, .. } if *version == v("4.14.1")
    ));
    assert_eq!(h.gateway.policies(&c1).len(), 1);

    // 4.14.1 is pulled before c1's upgrade starts.
    h.gateway
        .set_blocked_versions(BlockedVersions::new([r"^4\.14\.1$"]).unwrap());
    let second = h.pass(&instance, ts(T0), false).await.unwrap();
    assert!(matches!(
        decision(&second, "c1"),
        ClusterDecision::CancelBlocked { .. }
    ));
    assert!(h.gateway.policies(&c1).is_empty());

    let third = h.pass(&instance, ts(T0), false).await.unwrap();
    assert!(matches!(
        decision(&third, "c1"),
        ClusterDecision::Create { version, .. } if *version == v("4.13.11")
    ));
    let policies = h.gateway.policies(&c1);
    assert_eq!(policies.len(), 1);
    assert_eq!(policies[0].version, Some(v("4.13.11")));
    h.cleanup_successful();
}

#[tokio::test]
async fn test_invalid_desired_state() {
    let h = Harness::new("invalid_desired_state", sim_config());
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![
            DesiredPolicyBuilder::new("c1", "4.13.10").record(),
            DesiredPolicyBuilder::new("c1", "4.13.11").record(),
            DesiredPolicyBuilder::new("c2", "not-a-version").record(),
            DesiredPolicyBuilder::new("c3", "4.13.10").schedule("whenever").record(),
        ],
    );

    let err = h.pass(&instance, ts(T0), false).await.unwrap_err();
    let ReconcileError::InvalidDesiredState { reasons } = &err else {
        panic!("unexpected error: {err:?}");
    };
    assert_eq!(reasons.len(), 3, "reasons: {reasons:?}");
    assert!(reasons[0].contains("c1"));
    assert!(reasons[1].contains("c2"));
    assert!(reasons[2].contains("c3"));
    assert!(h.gateway.mutations().is_empty());
    assert_eq!(h.store.snapshot(&InstanceKey::from("production")), None);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_execution_failure_still_persists_history() {
    let h = Harness::new("execution_failure_persists_history", sim_config());
    h.gateway.fail(SimFailure::CreatePolicy(ClusterName::from("c1")));
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![
            DesiredPolicyBuilder::new("c1", "4.13.10").record(),
            DesiredPolicyBuilder::new("c2", "4.13.10").record(),
        ],
    );

    let err = h.pass(&instance, ts(T0), false).await.unwrap_err();
    let report = err.report().expect("execution errors carry the report");
    assert_eq!(report.execution.failed(), 1);
    assert_eq!(h.gateway.policies(&ClusterName::from("c2")).len(), 1);
    assert!(h.store.snapshot(&InstanceKey::from("production")).is_some());
    h.cleanup_successful();
}

#[tokio::test]
async fn test_unreadable_cluster_is_skipped() {
    let h = Harness::new("unreadable_cluster_is_skipped", sim_config());
    h.gateway.fail(SimFailure::CurrentPolicies(ClusterName::from("c1")));
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![
            DesiredPolicyBuilder::new("c1", "4.13.10").mutexes(&["db"]).record(),
            DesiredPolicyBuilder::new("c2", "4.13.11").mutexes(&["db"]).record(),
            DesiredPolicyBuilder::new("c3", "4.13.11").record(),
        ],
    );

    let report = h.pass(&instance, ts(T0), false).await.unwrap();
    assert_eq!(*decision(&report, "c1"), ClusterDecision::CurrentStateUnknown);
    assert!(matches!(decision(&report, "c2"), ClusterDecision::MutexHeld { .. }));
    assert!(decision(&report, "c3").is_action());
    assert_eq!(
        h.gateway.mutations(),
        vec![SimMutation::CreatePolicy {
            cluster: ClusterName::from("c3"),
            spec: UpgradePolicySpec {
                version: v("4.14.1"),
                schedule_type: ScheduleType::Manual,
                next_run: ts("2024-05-06T10:31:00Z"),
            },
        }]
    );
    h.cleanup_successful();
}

#[tokio::test]
async fn test_multiple_current_policies_fail_the_pass() {
    let h = Harness::new("multiple_current_policies", sim_config());
    for id in ["p1", "p2"] {
        h.gateway.insert_policy(CurrentUpgradePolicy {
            id: PolicyId::from(id),
            cluster: ClusterName::from("c1"),
            version: Some(v("4.14.1")),
            schedule_type: ScheduleType::Manual,
            next_run: Some(ts("2024-05-07T02:00:00Z")),
        });
    }
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![DesiredPolicyBuilder::new("c1", "4.13.10").record()],
    );

    let err = h.pass(&instance, ts(T0), false).await.unwrap_err();
    assert!(
        matches!(
            err,
            ReconcileError::CurrentState(FetchError::MultiplePolicies(_))
        ),
        "unexpected error: {err:?}"
    );
    assert!(h.gateway.mutations().is_empty());
    assert_eq!(h.store.snapshot(&InstanceKey::from("production")), None);
    h.cleanup_successful();
}

/// A history store that can be read but not written
struct ReadOnlyHistoryStore(InMemoryHistoryStore);

#[async_trait]
impl VersionHistoryStore for ReadOnlyHistoryStore {
    async fn get(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<VersionHistory>, StoreError> {
        self.0.get(key).await
    }

    async fn put(
        &self,
        key: &InstanceKey,
        _history: &VersionHistory,
    ) -> Result<(), StoreError> {
        Err(StoreError::Write {
            key: key.clone(),
            err: std::io::Error::other("read-only file system").into(),
        })
    }
}

#[tokio::test]
async fn test_history_write_failure_fails_the_pass() {
    let h = Harness::new("history_write_failure_fails_the_pass", sim_config());
    let store = ReadOnlyHistoryStore(InMemoryHistoryStore::new());
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![DesiredPolicyBuilder::new("c1", "4.13.10").record()],
    );

    let err = reconcile(ReconcileArgs {
        store: &store,
        ..h.args(&instance, ts(T0), false)
    })
    .await
    .unwrap_err();
    assert!(
        matches!(err, ReconcileError::PersistHistory(StoreError::Write { .. })),
        "unexpected error: {err:?}"
    );
    // The upgrade that was already scheduled stays in place.
    assert!(matches!(
        &h.gateway.mutations()[..],
        [SimMutation::CreatePolicy { cluster, .. }] if cluster.as_str() == "c1"
    ));
    assert_eq!(h.gateway.policies(&ClusterName::from("c1")).len(), 1);
    h.cleanup_successful();
}

#[tokio::test]
async fn test_cancelled_pass_changes_nothing() {
    let h = Harness::new("cancelled_pass_changes_nothing", sim_config());
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![DesiredPolicyBuilder::new("c1", "4.13.10").record()],
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = reconcile(ReconcileArgs {
        cancel,
        ..h.args(&instance, ts(T0), false)
    })
    .await
    .unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled), "{err:?}");
    assert!(h.gateway.mutations().is_empty());
    assert_eq!(h.store.snapshot(&InstanceKey::from("production")), None);
    h.cleanup_successful();
}

/// Forwards to a simulated gateway, and fires `cancel` once the planner asks
/// for upgrade targets
struct CancellingGateway {
    inner: Arc<SimGateway>,
    cancel: CancellationToken,
}

#[async_trait]
impl Gateway for CancellingGateway {
    async fn current_policies(
        &self,
        cluster: &ClusterName,
    ) -> Result<Vec<CurrentUpgradePolicy>, GatewayError> {
        self.inner.current_policies(cluster).await
    }

    async fn create_policy(
        &self,
        cluster: &ClusterName,
        spec: &UpgradePolicySpec,
    ) -> Result<(), GatewayError> {
        self.inner.create_policy(cluster, spec).await
    }

    async fn delete_policy(
        &self,
        cluster: &ClusterName,
        id: &PolicyId,
    ) -> Result<(), GatewayError> {
        self.inner.delete_policy(cluster, id).await
    }

    async fn available_upgrades(
        &self,
        current_version: &Version,
        channel: &str,
    ) -> Result<Vec<Version>, GatewayError> {
        self.cancel.cancel();
        self.inner.available_upgrades(current_version, channel).await
    }

    async fn is_version_blocked(
        &self,
        version: &Version,
    ) -> Result<bool, GatewayError> {
        self.inner.is_version_blocked(version).await
    }

    async fn version_agreements(
        &self,
        cluster: &ClusterName,
    ) -> Result<Vec<GateId>, GatewayError> {
        self.inner.version_agreements(cluster).await
    }

    async fn version_gates(
        &self,
        version_prefix: &str,
    ) -> Result<Vec<GateId>, GatewayError> {
        self.inner.version_gates(version_prefix).await
    }

    async fn agree_to_version_gate(
        &self,
        gate: &GateId,
        cluster: &ClusterName,
    ) -> Result<GateAgreement, GatewayError> {
        self.inner.agree_to_version_gate(gate, cluster).await
    }
}

#[tokio::test]
async fn test_cancelled_planning_still_persists_history() {
    let h = Harness::new("cancelled_planning_persists_history", sim_config());
    let instance = InstanceConfig::new("production");
    h.source.set(
        "production",
        vec![
            DesiredPolicyBuilder::new("c1", "4.13.10").record(),
            DesiredPolicyBuilder::new("c2", "4.13.10").record(),
        ],
    );
    let cancel = CancellationToken::new();
    let gateway: Arc<dyn Gateway> = Arc::new(CancellingGateway {
        inner: h.gateway.clone(),
        cancel: cancel.clone(),
    });

    let err = reconcile(ReconcileArgs {
        gateway,
        cancel,
        ..h.args(&instance, ts(T0), false)
    })
    .await
    .unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled), "{err:?}");
    // Planning stopped before c2, and nothing planned so far was applied.
    assert!(h.gateway.mutations().is_empty());
    let history = h.store.snapshot(&InstanceKey::from("production")).unwrap();
    assert_eq!(history.check_in, Some(ts(T0)));
    h.cleanup_successful();
}

#[tokio::test]
async fn test_fleet_pass_isolates_instances() {
    let logctx = test_setup_log("fleet_pass_isolates_instances");
    let source = Arc::new(StaticConfigSource::default());
    source.set(
        "staging",
        vec![DesiredPolicyBuilder::new("s1", "4.13.10").record()],
    );
    source.set(
        "production",
        vec![DesiredPolicyBuilder::new("p1", "4.13.10").record()],
    );
    let store = Arc::new(InMemoryHistoryStore::new());
    let config = Config {
        dry_run: false,
        max_gateway_parallelism: 2,
        log: ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info },
        history: HistoryConfig { directory: "unused".into() },
        instances: vec![
            InstanceConfig::new("staging"),
            InstanceConfig::new("production"),
        ],
    };
    let staging = Arc::new(SimGateway::new(&logctx.log, sim_config()));
    // No gateway is registered for production.
    let scheduler =
        Scheduler::new(&logctx.log, config, source, store.clone())
            .with_gateway(InstanceKey::from("staging"), staging.clone());

    let status = scheduler.run_pass(ts(T0), &CancellationToken::new()).await;
    assert_eq!(status.instances.len(), 2);
    assert!(matches!(
        status.instances[0].outcome,
        InstanceOutcome::Completed { .. }
    ));
    assert!(matches!(
        &status.instances[1].outcome,
        InstanceOutcome::Failed { error, report: None }
            if error.contains("no gateway")
    ));
    assert_eq!(status.failed().count(), 1);
    assert_eq!(staging.policies(&ClusterName::from("s1")).len(), 1);
    assert!(store.snapshot(&InstanceKey::from("staging")).is_some());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["instances"][0]["instance"], "staging");
    assert_eq!(json["instances"][0]["status"], "completed");
    assert_eq!(
        json["instances"][0]["report"]["planning"]["clusters"][0]["decision"],
        "create"
    );
    assert_eq!(json["instances"][1]["status"], "failed");
    logctx.cleanup_successful();
}
