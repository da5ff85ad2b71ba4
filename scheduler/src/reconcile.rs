// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One reconciliation pass for one fleet-management instance

use crate::config::InstanceConfig;
use crate::fetch::{FetchError, fetch_current_state};
use chrono::{DateTime, Utc};
use serde::Serialize;
use slog::{Logger, debug, info, o, warn};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use upgrade_scheduler_execution::{ApplyArgs, ExecutionReport, apply_diffs};
use upgrade_scheduler_interface::{
    ConfigSource, ConfigSourceError, Gateway, StoreError, VersionHistoryStore,
};
use upgrade_scheduler_planning::planner::{
    Planner, PlanningError, PlanningInput,
};
use upgrade_scheduler_planning::report::PlanningReport;
use upgrade_scheduler_planning::soak::{
    ObservedVersion, SoakLedger, update_history,
};
use upgrade_scheduler_types::history::VersionHistory;
use upgrade_scheduler_types::ids::{ClusterName, InstanceKey};
use upgrade_scheduler_types::policy::{
    ClusterRecord, DesiredUpgradePolicy, sort_by_priority,
};

#[derive(Debug, Error, SlogInlineError)]
pub enum ReconcileError {
    #[error("failed to load desired state")]
    LoadDesired(#[source] ConfigSourceError),
    #[error("invalid desired state: {}", .reasons.join("; "))]
    InvalidDesiredState { reasons: Vec<String> },
    #[error("failed to read current state")]
    CurrentState(#[source] FetchError),
    #[error("failed to load version history")]
    LoadHistory(#[source] StoreError),
    #[error("failed to persist version history")]
    PersistHistory(#[source] StoreError),
    #[error(
        "{} of {} upgrade changes failed",
        .report.execution.failed(),
        .report.execution.outcomes.len()
    )]
    Execution { report: Box<PassReport> },
    #[error("pass was cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Returns the report of the pass, for errors that happen after
    /// planning completed
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            ReconcileError::Execution { report } => Some(report),
            _ => None,
        }
    }
}

/// Everything one pass needs
pub struct ReconcileArgs<'a> {
    pub log: &'a Logger,
    pub instance: &'a InstanceConfig,
    pub gateway: Arc<dyn Gateway>,
    pub config_source: &'a dyn ConfigSource,
    pub store: &'a dyn VersionHistoryStore,
    pub now: DateTime<Utc>,
    pub dry_run: bool,
    pub max_gateway_parallelism: usize,
    pub cancel: CancellationToken,
}

/// What one pass did
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PassReport {
    pub instance: InstanceKey,
    pub now: DateTime<Utc>,
    pub dry_run: bool,
    pub planning: PlanningReport,
    pub execution: ExecutionReport,
    /// version history after this pass's observations (persisted unless this
    /// was a dry run)
    pub history: VersionHistory,
}

/// Runs one reconciliation pass for `args.instance`
///
/// The steps are: load and validate the desired state; read the current
/// state from the gateway; fold this pass's observations into the version
/// history; plan; apply the plan; persist the history.
pub async fn reconcile(
    args: ReconcileArgs<'_>,
) -> Result<PassReport, ReconcileError> {
    let ReconcileArgs {
        log,
        instance,
        gateway,
        config_source,
        store,
        now,
        dry_run,
        max_gateway_parallelism,
        cancel,
    } = args;
    let key = &instance.key;
    let log = log.new(o!("instance" => key.to_string()));
    info!(log, "starting pass"; "now" => %now, "dry_run" => dry_run);

    let records = config_source
        .desired_clusters(key)
        .await
        .map_err(ReconcileError::LoadDesired)?;
    let mut desired = validate_desired(&log, records)?;
    sort_by_priority(&mut desired);

    let current = fetch_current_state(
        &log,
        &gateway,
        desired.iter().map(|p| p.name().clone()),
        max_gateway_parallelism,
        &cancel,
    )
    .await
    .map_err(|err| match err {
        FetchError::Cancelled => ReconcileError::Cancelled,
        err => ReconcileError::CurrentState(err),
    })?;

    let mut history = store
        .get(key)
        .await
        .map_err(ReconcileError::LoadHistory)?
        .unwrap_or_default();
    update_history(&mut history, desired.iter().map(ObservedVersion::from), now);

    let mut inherited = Vec::new();
    for source in &instance.inherit_version_data {
        match store.get(source).await.map_err(ReconcileError::LoadHistory)? {
            Some(history) => inherited.push(history),
            None => {
                warn!(log, "no version history to inherit"; "from" => source);
            }
        }
    }
    let ledger = SoakLedger::with_inherited(&history, &inherited);

    let plan = Planner::new(
        &log,
        &*gateway,
        PlanningInput { desired: &desired, current: &current, ledger: &ledger, now },
    )
    .with_cancellation(cancel.clone())
    .plan()
    .await;
    let plan = match plan {
        Ok(plan) => plan,
        Err(PlanningError::Cancelled) => {
            persist_history(&log, store, key, &history, dry_run).await?;
            return Err(ReconcileError::Cancelled);
        }
    };
    info!(log, "planned upgrades"; "diffs" => plan.diffs.len());
    debug!(log, "planning report:\n{}", plan.report);

    let execution = apply_diffs(
        ApplyArgs::new(&log, &*gateway, &plan.diffs)
            .with_dry_run(dry_run)
            .with_cancellation(cancel.clone()),
    )
    .await;

    // History is persisted even if execution failed or was cancelled.
    persist_history(&log, store, key, &history, dry_run).await?;

    if execution.cancelled() {
        return Err(ReconcileError::Cancelled);
    }

    let report = PassReport {
        instance: key.clone(),
        now,
        dry_run,
        planning: plan.report,
        execution,
        history,
    };
    if report.execution.failed() > 0 {
        return Err(ReconcileError::Execution { report: Box::new(report) });
    }
    info!(log, "finished pass");
    Ok(report)
}

async fn persist_history(
    log: &Logger,
    store: &dyn VersionHistoryStore,
    key: &InstanceKey,
    history: &VersionHistory,
    dry_run: bool,
) -> Result<(), ReconcileError> {
    if dry_run {
        info!(log, "dry run: not persisting version history");
        return Ok(());
    }
    store.put(key, history).await.map_err(ReconcileError::PersistHistory)
}

/// Turns desired-state records into policies, collecting every problem
///
/// Records without an upgrade policy are skipped.
fn validate_desired(
    log: &Logger,
    records: Vec<ClusterRecord>,
) -> Result<Vec<DesiredUpgradePolicy>, ReconcileError> {
    let mut reasons = Vec::new();
    let mut seen: BTreeSet<ClusterName> = BTreeSet::new();
    let mut desired = Vec::with_capacity(records.len());

    for record in records {
        let name = ClusterName::new(record.name.clone());
        if !seen.insert(name.clone()) {
            reasons.push(format!("cluster {name} is listed more than once"));
            continue;
        }
        match DesiredUpgradePolicy::from_record(record) {
            Ok(Some(policy)) => desired.push(policy),
            Ok(None) => {
                debug!(log, "cluster has no upgrade policy"; "cluster" => &name);
            }
            Err(err) => reasons.push(InlineErrorChain::new(&err).to_string()),
        }
    }

    if reasons.is_empty() {
        Ok(desired)
    } else {
        Err(ReconcileError::InvalidDesiredState { reasons })
    }
}
