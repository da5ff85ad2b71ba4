// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution of upgrade plans
//!
//! Planning (see `upgrade_scheduler_planning`) produces a list of
//! [`UpgradeDiff`]s.  This crate applies them to a [`Gateway`]: cancellations
//! first, then new upgrade policies, each preceded by agreeing to whatever
//! version gates the target version requires.
//!
//! A failure to apply one diff does not stop the others.  Nothing is rolled
//! back: the next pass recomputes everything from what the gateway reports,
//! so a partially-applied plan converges on its own.

use serde::Serialize;
use slog::{Logger, error, info, o, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use upgrade_scheduler_interface::{Gateway, GatewayError};
use upgrade_scheduler_types::diff::UpgradeDiff;
use upgrade_scheduler_types::ids::{ClusterName, GateId, PolicyId};
use upgrade_scheduler_types::policy::UpgradePolicySpec;

#[derive(Debug, Error, SlogInlineError)]
pub enum ExecutionError {
    #[error("failed to agree to version gate {gate} for cluster {cluster}")]
    AgreeToGate {
        cluster: ClusterName,
        gate: GateId,
        #[source]
        err: GatewayError,
    },
    #[error("failed to create upgrade policy for cluster {cluster}")]
    CreatePolicy {
        cluster: ClusterName,
        #[source]
        err: GatewayError,
    },
    #[error("failed to delete upgrade policy {id} of cluster {cluster}")]
    DeletePolicy {
        cluster: ClusterName,
        id: PolicyId,
        #[source]
        err: GatewayError,
    },
}

/// Encapsulates arguments used for [`apply_diffs`]
pub struct ApplyArgs<'a> {
    pub log: &'a Logger,
    pub gateway: &'a dyn Gateway,
    pub diffs: &'a [UpgradeDiff],
    pub dry_run: bool,
    pub cancel: CancellationToken,
}

impl<'a> ApplyArgs<'a> {
    pub fn new(
        log: &'a Logger,
        gateway: &'a dyn Gateway,
        diffs: &'a [UpgradeDiff],
    ) -> ApplyArgs<'a> {
        ApplyArgs {
            log,
            gateway,
            diffs,
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    /// In a dry run every diff is logged and nothing is sent to the gateway
    pub fn with_dry_run(mut self, dry_run: bool) -> ApplyArgs<'a> {
        self.dry_run = dry_run;
        self
    }

    /// Stops execution before the next diff once `cancel` fires
    pub fn with_cancellation(
        mut self,
        cancel: CancellationToken,
    ) -> ApplyArgs<'a> {
        self.cancel = cancel;
        self
    }
}

/// What happened to one diff
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DiffResult {
    Applied {
        /// gates the gateway did not acknowledge agreeing to
        #[serde(skip_serializing_if = "Vec::is_empty")]
        unacknowledged_gates: Vec<GateId>,
    },
    DryRun,
    Failed { message: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiffOutcome {
    pub diff: UpgradeDiff,
    #[serde(flatten)]
    pub result: DiffResult,
}

/// Summary of applying a list of diffs
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ExecutionReport {
    /// outcome of each diff that was attempted, in the order attempted
    pub outcomes: Vec<DiffOutcome>,
    /// diffs not attempted because execution was cancelled
    pub skipped: usize,
}

impl ExecutionReport {
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, DiffResult::Failed { .. }))
            .count()
    }

    pub fn cancelled(&self) -> bool {
        self.skipped > 0
    }
}

/// Applies `diffs` to the gateway
///
/// Deletes are applied before creates; the order within each kind is kept.
pub async fn apply_diffs(args: ApplyArgs<'_>) -> ExecutionReport {
    let ApplyArgs { log, gateway, diffs, dry_run, cancel } = args;
    let log = log.new(o!("component" => "UpgradeExecutor", "dry_run" => dry_run));

    let mut ordered: Vec<&UpgradeDiff> = diffs.iter().collect();
    ordered.sort_by_key(|diff| diff.action());

    let mut report = ExecutionReport::default();
    for (i, diff) in ordered.iter().copied().enumerate() {
        if cancel.is_cancelled() {
            report.skipped = ordered.len() - i;
            warn!(log, "execution cancelled"; "diffs_skipped" => report.skipped);
            break;
        }

        let result = if dry_run {
            info!(log, "dry run: not applying"; diff);
            DiffResult::DryRun
        } else {
            match apply_one(&log, gateway, diff).await {
                Ok(unacknowledged_gates) => {
                    info!(log, "applied"; diff);
                    DiffResult::Applied { unacknowledged_gates }
                }
                Err(err) => {
                    error!(log, "failed to apply"; diff, &err);
                    DiffResult::Failed {
                        message: InlineErrorChain::new(&err).to_string(),
                    }
                }
            }
        };
        report.outcomes.push(DiffOutcome { diff: diff.clone(), result });
    }

    info!(
        log, "finished applying diffs";
        "attempted" => report.outcomes.len(),
        "failed" => report.failed(),
        "skipped" => report.skipped,
    );
    report
}

/// Applies one diff, returning the gates whose agreement was not
/// acknowledged
async fn apply_one(
    log: &Logger,
    gateway: &dyn Gateway,
    diff: &UpgradeDiff,
) -> Result<Vec<GateId>, ExecutionError> {
    match diff {
        UpgradeDiff::Create { cluster, spec, gates_to_agree } => {
            create_policy(log, gateway, cluster, spec, gates_to_agree).await
        }
        UpgradeDiff::Delete { cluster, id, .. } => {
            gateway.delete_policy(cluster, id).await.map_err(|err| {
                ExecutionError::DeletePolicy {
                    cluster: cluster.clone(),
                    id: id.clone(),
                    err,
                }
            })?;
            Ok(Vec::new())
        }
    }
}

async fn create_policy(
    log: &Logger,
    gateway: &dyn Gateway,
    cluster: &ClusterName,
    spec: &UpgradePolicySpec,
    gates_to_agree: &[GateId],
) -> Result<Vec<GateId>, ExecutionError> {
    let mut unacknowledged = Vec::new();
    for gate in gates_to_agree {
        let agreement = gateway
            .agree_to_version_gate(gate, cluster)
            .await
            .map_err(|err| ExecutionError::AgreeToGate {
                cluster: cluster.clone(),
                gate: gate.clone(),
                err,
            })?;
        if !agreement.accepted {
            error!(
                log, "version gate agreement was not acknowledged";
                "cluster" => cluster,
                "gate" => gate,
            );
            unacknowledged.push(gate.clone());
        }
    }

    gateway.create_policy(cluster, spec).await.map_err(|err| {
        ExecutionError::CreatePolicy { cluster: cluster.clone(), err }
    })?;
    Ok(unacknowledged)
}

#[cfg(test)]
mod test {
    use super::*;
    use upgrade_gateway_sim::{
        SimFailure, SimGateway, SimGatewayConfig, SimMutation,
    };
    use upgrade_scheduler_test_utils::dev::test_setup_log;
    use upgrade_scheduler_test_utils::fixtures::{ts, v};
    use upgrade_scheduler_types::policy::{CurrentUpgradePolicy, ScheduleType};

    fn create(cluster: &str, version: &str, gates: &[&str]) -> UpgradeDiff {
        UpgradeDiff::Create {
            cluster: ClusterName::from(cluster),
            spec: UpgradePolicySpec {
                version: v(version),
                schedule_type: ScheduleType::Manual,
                next_run: ts("2024-05-06T12:00:00Z"),
            },
            gates_to_agree: gates.iter().map(|g| GateId::from(*g)).collect(),
        }
    }

    fn delete(cluster: &str, id: &str) -> UpgradeDiff {
        UpgradeDiff::Delete {
            cluster: ClusterName::from(cluster),
            id: PolicyId::from(id),
            version: Some(v("4.14.1")),
        }
    }

    fn existing(cluster: &str, id: &str) -> CurrentUpgradePolicy {
        CurrentUpgradePolicy {
            id: PolicyId::from(id),
            cluster: ClusterName::from(cluster),
            version: Some(v("4.14.1")),
            schedule_type: ScheduleType::Manual,
            next_run: Some(ts("2024-05-07T12:00:00Z")),
        }
    }

    #[tokio::test]
    async fn test_deletes_before_creates() {
        let logctx = test_setup_log("execution_deletes_before_creates");
        let gateway = SimGateway::new(&logctx.log, SimGatewayConfig::default());
        gateway.insert_policy(existing("c2", "p2"));
        gateway.insert_policy(existing("c4", "p4"));
        let diffs = vec![
            create("c1", "4.14.1", &[]),
            delete("c2", "p2"),
            create("c3", "4.13.11", &[]),
            delete("c4", "p4"),
        ];

        let report =
            apply_diffs(ApplyArgs::new(&logctx.log, &gateway, &diffs)).await;
        assert_eq!(report.failed(), 0);
        let order: Vec<_> = report
            .outcomes
            .iter()
            .map(|o| o.diff.cluster().as_str())
            .collect();
        assert_eq!(order, ["c2", "c4", "c1", "c3"]);

        let mutations = gateway.mutations();
        assert_eq!(mutations.len(), 4);
        assert!(matches!(
            &mutations[0],
            SimMutation::DeletePolicy { cluster, .. } if cluster.as_str() == "c2"
        ));
        assert!(matches!(
            &mutations[3],
            SimMutation::CreatePolicy { cluster, .. } if cluster.as_str() == "c3"
        ));
        assert_eq!(gateway.policies(&ClusterName::from("c1")).len(), 1);
        assert!(gateway.policies(&ClusterName::from("c2")).is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_gates_agreed_before_create() {
        let logctx = test_setup_log("execution_gates_agreed_before_create");
        let gateway = SimGateway::new(&logctx.log, SimGatewayConfig::default());
        let diffs = vec![create("c1", "4.14.1", &["ack-a", "ack-b"])];

        let report =
            apply_diffs(ApplyArgs::new(&logctx.log, &gateway, &diffs)).await;
        assert_eq!(
            report.outcomes[0].result,
            DiffResult::Applied { unacknowledged_gates: Vec::new() }
        );
        let c1 = ClusterName::from("c1");
        let mutations = gateway.mutations();
        assert_eq!(
            mutations[..2],
            [
                SimMutation::AgreeToVersionGate {
                    cluster: c1.clone(),
                    gate: GateId::from("ack-a"),
                },
                SimMutation::AgreeToVersionGate {
                    cluster: c1.clone(),
                    gate: GateId::from("ack-b"),
                },
            ]
        );
        assert!(matches!(mutations[2], SimMutation::CreatePolicy { .. }));
        assert_eq!(gateway.agreements(&c1).len(), 2);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unacknowledged_gate_still_creates() {
        let logctx = test_setup_log("execution_unacknowledged_gate");
        let gateway = SimGateway::new(
            &logctx.log,
            SimGatewayConfig {
                acknowledge_agreements: false,
                ..Default::default()
            },
        );
        let diffs = vec![create("c1", "4.14.1", &["ack-a"])];

        let report =
            apply_diffs(ApplyArgs::new(&logctx.log, &gateway, &diffs)).await;
        assert_eq!(
            report.outcomes[0].result,
            DiffResult::Applied {
                unacknowledged_gates: vec![GateId::from("ack-a")]
            }
        );
        assert_eq!(gateway.policies(&ClusterName::from("c1")).len(), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_mutations() {
        let logctx = test_setup_log("execution_dry_run");
        let gateway = SimGateway::new(&logctx.log, SimGatewayConfig::default());
        gateway.insert_policy(existing("c2", "p2"));
        let diffs = vec![create("c1", "4.14.1", &["ack-a"]), delete("c2", "p2")];

        let report = apply_diffs(
            ApplyArgs::new(&logctx.log, &gateway, &diffs).with_dry_run(true),
        )
        .await;
        assert_eq!(report.outcomes.len(), 2);
        assert!(
            report.outcomes.iter().all(|o| o.result == DiffResult::DryRun)
        );
        assert!(gateway.mutations().is_empty());
        assert_eq!(gateway.policies(&ClusterName::from("c2")).len(), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_diffs() {
        let logctx = test_setup_log("execution_failure_isolation");
        let gateway = SimGateway::new(&logctx.log, SimGatewayConfig::default());
        gateway.fail(SimFailure::CreatePolicy(ClusterName::from("c1")));
        let diffs = vec![
            create("c1", "4.14.1", &[]),
            create("c2", "4.14.1", &[]),
            // no such policy
            delete("c3", "p3"),
        ];

        let report =
            apply_diffs(ApplyArgs::new(&logctx.log, &gateway, &diffs)).await;
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.failed(), 2);
        // The delete goes first and fails; so does c1's create.
        assert_eq!(report.outcomes[0].diff.cluster().as_str(), "c3");
        assert!(matches!(
            report.outcomes[0].result,
            DiffResult::Failed { .. }
        ));
        assert!(matches!(
            report.outcomes[1].result,
            DiffResult::Failed { .. }
        ));
        assert!(matches!(
            report.outcomes[2].result,
            DiffResult::Applied { .. }
        ));
        assert_eq!(gateway.policies(&ClusterName::from("c2")).len(), 1);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_cancelled_execution() {
        let logctx = test_setup_log("execution_cancelled");
        let gateway = SimGateway::new(&logctx.log, SimGatewayConfig::default());
        let diffs = vec![create("c1", "4.14.1", &[]), create("c2", "4.14.1", &[])];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = apply_diffs(
            ApplyArgs::new(&logctx.log, &gateway, &diffs)
                .with_cancellation(cancel),
        )
        .await;
        assert!(report.cancelled());
        assert_eq!(report.skipped, 2);
        assert!(report.outcomes.is_empty());
        assert!(gateway.mutations().is_empty());
        logctx.cleanup_successful();
    }

    #[test]
    fn test_report_json() {
        let report = ExecutionReport {
            outcomes: vec![DiffOutcome {
                diff: delete("c2", "p2"),
                result: DiffResult::Failed { message: String::from("boom") },
            }],
            skipped: 0,
        };
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "outcomes": [{
                    "diff": {
                        "action": "delete",
                        "cluster": "c2",
                        "id": "p2",
                        "version": "4.14.1",
                    },
                    "result": "failed",
                    "message": "boom",
                }],
                "skipped": 0,
            })
        );
    }
}
