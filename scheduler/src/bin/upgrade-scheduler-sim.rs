// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run upgrade-scheduler passes against simulated gateways

use anyhow::{Context, bail};
use camino::Utf8PathBuf;
use chrono::{DateTime, TimeDelta, Utc};
use clap::Parser;
use serde::Deserialize;
use slog::{info, o, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use upgrade_gateway_sim::{SimGateway, SimGatewayConfig};
use upgrade_scheduler::{
    Config, FileConfigSource, FileHistoryStore, InMemoryHistoryStore, Scheduler,
};
use upgrade_scheduler_interface::VersionHistoryStore;
use upgrade_scheduler_types::ids::InstanceKey;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = SchedulerSim::parse();

    if let Err(error) = args.exec().await {
        eprintln!("error: {:#}", error);
        std::process::exit(1);
    }

    Ok(())
}

/// Run upgrade-scheduler passes against simulated gateways
///
/// The fleet file holds, for each instance, the desired state of its
/// clusters (`clusters`) and the initial state of its simulated gateway
/// (`gateway`).  The status of every pass is printed to stdout as JSON.
#[derive(Debug, Parser)]
struct SchedulerSim {
    /// path to the scheduler's TOML configuration
    #[arg(long)]
    config: Utf8PathBuf,

    /// path to the TOML fleet file
    #[arg(long)]
    fleet: Utf8PathBuf,

    /// number of passes to run
    #[arg(long, default_value_t = 1)]
    passes: u32,

    /// time of the first pass (RFC 3339; defaults to the current time)
    #[arg(long)]
    now: Option<DateTime<Utc>>,

    /// simulated hours between passes
    #[arg(long, default_value_t = 24)]
    interval_hours: u32,

    /// keep version history in memory instead of the configured directory
    #[arg(long)]
    in_memory_history: bool,

    /// plan and log, but change nothing (overrides the configuration)
    #[arg(long)]
    dry_run: bool,
}

#[derive(Deserialize)]
struct SimFleet {
    #[serde(default)]
    instances: Vec<SimInstance>,
}

#[derive(Deserialize)]
struct SimInstance {
    key: InstanceKey,
    #[serde(default)]
    gateway: SimGatewayConfig,
}

impl SchedulerSim {
    async fn exec(self) -> Result<(), anyhow::Error> {
        let mut config = Config::from_file(&self.config)
            .with_context(|| format!("loading config {:?}", self.config))?;
        config.dry_run |= self.dry_run;
        let log = config
            .log
            .to_logger("upgrade-scheduler-sim")
            .context("failed to create logger")?;

        let fleet_contents = std::fs::read_to_string(&self.fleet)
            .with_context(|| format!("read {:?}", self.fleet))?;
        let fleet: SimFleet = toml::from_str(&fleet_contents)
            .with_context(|| format!("parse {:?}", self.fleet))?;
        let config_source = FileConfigSource::from_toml(&fleet_contents)
            .with_context(|| format!("load desired state from {:?}", self.fleet))?;

        let store: Arc<dyn VersionHistoryStore> = if self.in_memory_history {
            Arc::new(InMemoryHistoryStore::new())
        } else {
            Arc::new(FileHistoryStore::new(config.history.directory.clone()))
        };

        let mut scheduler =
            Scheduler::new(&log, config, Arc::new(config_source), store);
        for instance in fleet.instances {
            let gateway = SimGateway::new(
                &log.new(o!("instance" => instance.key.to_string())),
                instance.gateway,
            );
            scheduler = scheduler.with_gateway(instance.key, Arc::new(gateway));
        }

        // Ctrl-C stops the current pass before its next gateway request.
        let cancel = CancellationToken::new();
        tokio::spawn({
            let log = log.clone();
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!(log, "interrupted; cancelling pass");
                    cancel.cancel();
                }
            }
        });
        let interval = TimeDelta::hours(i64::from(self.interval_hours));
        let mut now = self.now.unwrap_or_else(Utc::now);
        let mut any_failed = false;
        for pass in 0..self.passes {
            if cancel.is_cancelled() {
                break;
            }
            info!(log, "running pass"; "pass" => pass, "now" => %now);
            let status = scheduler.run_pass(now, &cancel).await;
            any_failed |= status.failed().next().is_some();
            println!(
                "{}",
                serde_json::to_string_pretty(&status)
                    .context("serializing pass status")?
            );
            now += interval;
        }

        if cancel.is_cancelled() {
            bail!("interrupted");
        }
        if any_failed {
            bail!("at least one instance pass failed");
        }
        Ok(())
    }
}
