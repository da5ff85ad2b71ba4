// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing the scheduler's configuration file

use camino::{Utf8Path, Utf8PathBuf};
use dropshot::ConfigLogging;
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeSet;
use thiserror::Error;
use upgrade_scheduler_types::ids::InstanceKey;

/// Default bound on concurrent gateway requests while reading current state
pub const DEFAULT_MAX_GATEWAY_PARALLELISM: usize = 16;

/// Configuration for the upgrade scheduler
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Compute and log the plan, but change nothing.
    #[serde(default)]
    pub dry_run: bool,
    /// Maximum number of gateway requests in flight while reading the current
    /// upgrade policies of an instance's clusters.
    #[serde(default = "default_max_gateway_parallelism")]
    pub max_gateway_parallelism: usize,
    /// Process-wide logging configuration.
    pub log: ConfigLogging,
    /// Where version history is persisted.
    pub history: HistoryConfig,
    /// Fleet-management instances to schedule upgrades for, in the order
    /// they are processed.
    pub instances: Vec<InstanceConfig>,
}

fn default_max_gateway_parallelism() -> usize {
    DEFAULT_MAX_GATEWAY_PARALLELISM
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    /// directory holding one JSON document per instance
    pub directory: Utf8PathBuf,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceConfig {
    pub key: InstanceKey,
    /// Instances whose soak time also counts for this one (for example,
    /// production inheriting from staging).  Their history is only read.
    #[serde(default)]
    pub inherit_version_data: Vec<InstanceKey>,
}

impl InstanceConfig {
    pub fn new(key: &str) -> InstanceConfig {
        InstanceConfig {
            key: InstanceKey::from(key),
            inherit_version_data: Vec::new(),
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config_parsed
            .validate()
            .map_err(|err| LoadError::Invalid { path: path.into(), err })?;
        Ok(config_parsed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut reasons = Vec::new();

        if self.max_gateway_parallelism == 0 {
            reasons.push(String::from("max_gateway_parallelism must be > 0"));
        }

        let mut seen = BTreeSet::new();
        for instance in &self.instances {
            if let Err(reason) = check_instance_key(&instance.key) {
                reasons.push(reason);
            }
            if !seen.insert(&instance.key) {
                reasons.push(format!(
                    "instance {} is configured more than once",
                    instance.key
                ));
            }
            for inherited in &instance.inherit_version_data {
                if *inherited == instance.key {
                    reasons.push(format!(
                        "instance {} inherits version data from itself",
                        instance.key
                    ));
                } else if let Err(reason) = check_instance_key(inherited) {
                    reasons.push(reason);
                }
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::InvalidConfig { reasons })
        }
    }
}

/// Instance keys name history files, so they are restricted to characters
/// that are safe in a file name.
fn check_instance_key(key: &InstanceKey) -> Result<(), String> {
    let s = key.as_str();
    let valid = !s.is_empty()
        && !s.starts_with('.')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(format!(
            "instance key {s:?} must be non-empty, must not start with '.', \
             and may only contain ASCII letters, digits, '-', '_' and '.'"
        ))
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .reasons.join("; "))]
    InvalidConfig { reasons: Vec<String> },
}

#[derive(Debug, Error, SlogInlineError)]
pub enum LoadError {
    #[error("error reading \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("error validating \"{path}\"")]
    Invalid {
        path: Utf8PathBuf,
        #[source]
        err: ConfigError,
    },
}
