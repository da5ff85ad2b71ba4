// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upgrade scheduling for fleets of clusters
//!
//! Each pass over a fleet-management instance reads the desired state of its
//! clusters, asks the gateway what upgrades are already scheduled, updates
//! the soak history, decides which clusters may start an upgrade, and
//! applies the result.  See [`reconcile::reconcile`] for one instance and
//! [`Scheduler`] for a whole fleet.

mod config;
mod config_source;
mod fetch;
pub mod reconcile;
mod store;

pub use config::Config;
pub use config::ConfigError;
pub use config::DEFAULT_MAX_GATEWAY_PARALLELISM;
pub use config::HistoryConfig;
pub use config::InstanceConfig;
pub use config::LoadError;
pub use config_source::FileConfigSource;
pub use fetch::FetchError;
pub use fetch::fetch_current_state;
pub use store::FileHistoryStore;
pub use store::InMemoryHistoryStore;

use chrono::{DateTime, Utc};
use reconcile::{PassReport, ReconcileArgs, ReconcileError, reconcile};
use serde::Serialize;
use slog::{Logger, error, info, o};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use upgrade_scheduler_interface::{ConfigSource, Gateway, VersionHistoryStore};
use upgrade_scheduler_types::ids::InstanceKey;

/// Outcome of one pass over one instance
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstanceOutcome {
    Completed {
        report: PassReport,
    },
    Failed {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        report: Option<PassReport>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub instance: InstanceKey,
    #[serde(flatten)]
    pub outcome: InstanceOutcome,
}

/// Outcome of one pass over every configured instance
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FleetStatus {
    pub instances: Vec<InstanceStatus>,
}

impl FleetStatus {
    pub fn failed(&self) -> impl Iterator<Item = &InstanceStatus> {
        self.instances
            .iter()
            .filter(|s| matches!(s.outcome, InstanceOutcome::Failed { .. }))
    }
}

/// Schedules upgrades across every instance named in the configuration
pub struct Scheduler {
    log: Logger,
    config: Config,
    gateways: BTreeMap<InstanceKey, Arc<dyn Gateway>>,
    config_source: Arc<dyn ConfigSource>,
    store: Arc<dyn VersionHistoryStore>,
}

impl Scheduler {
    pub fn new(
        log: &Logger,
        config: Config,
        config_source: Arc<dyn ConfigSource>,
        store: Arc<dyn VersionHistoryStore>,
    ) -> Scheduler {
        Scheduler {
            log: log.new(o!("component" => "UpgradeScheduler")),
            config,
            gateways: BTreeMap::new(),
            config_source,
            store,
        }
    }

    /// Registers the gateway of instance `key`
    pub fn with_gateway(
        mut self,
        key: InstanceKey,
        gateway: Arc<dyn Gateway>,
    ) -> Scheduler {
        self.gateways.insert(key, gateway);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one pass over each configured instance, in configuration order
    ///
    /// A failed instance does not stop the others.
    pub async fn run_pass(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> FleetStatus {
        let mut status = FleetStatus::default();
        for instance in &self.config.instances {
            let outcome = match self.run_instance(instance, now, cancel).await {
                Ok(report) => InstanceOutcome::Completed { report },
                Err(err) => {
                    error!(
                        self.log, "pass failed";
                        "instance" => &instance.key,
                        &err
                    );
                    InstanceOutcome::Failed {
                        error: InlineErrorChain::new(&err).to_string(),
                        report: err.report().cloned(),
                    }
                }
            };
            status
                .instances
                .push(InstanceStatus { instance: instance.key.clone(), outcome });
        }

        info!(
            self.log, "finished fleet pass";
            "instances" => status.instances.len(),
            "failed" => status.failed().count(),
        );
        status
    }

    async fn run_instance(
        &self,
        instance: &InstanceConfig,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<PassReport, SchedulerError> {
        let gateway = self
            .gateways
            .get(&instance.key)
            .ok_or_else(|| SchedulerError::NoGateway(instance.key.clone()))?;
        let report = reconcile(ReconcileArgs {
            log: &self.log,
            instance,
            gateway: Arc::clone(gateway),
            config_source: &*self.config_source,
            store: &*self.store,
            now,
            dry_run: self.config.dry_run,
            max_gateway_parallelism: self.config.max_gateway_parallelism,
            cancel: cancel.clone(),
        })
        .await?;
        Ok(report)
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum SchedulerError {
    #[error("no gateway registered for instance {0}")]
    NoGateway(InstanceKey),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl SchedulerError {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            SchedulerError::NoGateway(_) => None,
            SchedulerError::Reconcile(err) => err.report(),
        }
    }
}
