// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Desired state loaded from a fleet file

use async_trait::async_trait;
use camino::Utf8Path;
use serde::Deserialize;
use std::collections::BTreeMap;
use upgrade_scheduler_interface::{ConfigSource, ConfigSourceError};
use upgrade_scheduler_types::ids::InstanceKey;
use upgrade_scheduler_types::policy::ClusterRecord;

/// Desired state for every instance, from a TOML document of the form:
///
/// ```toml
/// [[instances]]
/// key = "production"
///
/// [[instances.clusters]]
/// name = "prod-eu-1"
/// current_version = "4.14.1"
/// channel = "stable-4.14"
/// upgrade_policy = { schedule = "0 2 * * 1", workloads = ["ingress"] }
/// ```
///
/// Other keys in an instance table are ignored, so the same file can carry
/// additional per-instance data (the simulator keeps its gateway state
/// there).
#[derive(Clone, Debug, Default)]
pub struct FileConfigSource {
    instances: BTreeMap<InstanceKey, Vec<ClusterRecord>>,
}

#[derive(Deserialize)]
struct FleetDocument {
    #[serde(default)]
    instances: Vec<FleetInstance>,
}

#[derive(Deserialize)]
struct FleetInstance {
    key: InstanceKey,
    #[serde(default)]
    clusters: Vec<ClusterRecord>,
}

impl FileConfigSource {
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigSourceError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigSourceError::Load(err.into()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigSourceError> {
        let document: FleetDocument = toml::from_str(contents)
            .map_err(|err| ConfigSourceError::Load(err.into()))?;
        let mut instances = BTreeMap::new();
        for instance in document.instances {
            if instances.contains_key(&instance.key) {
                return Err(ConfigSourceError::Load(
                    format!("instance {} appears more than once", instance.key)
                        .into(),
                ));
            }
            instances.insert(instance.key, instance.clusters);
        }
        Ok(FileConfigSource { instances })
    }

    pub fn instances(&self) -> impl Iterator<Item = &InstanceKey> {
        self.instances.keys()
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn desired_clusters(
        &self,
        instance: &InstanceKey,
    ) -> Result<Vec<ClusterRecord>, ConfigSourceError> {
        self.instances
            .get(instance)
            .cloned()
            .ok_or_else(|| ConfigSourceError::UnknownInstance(instance.clone()))
    }
}
