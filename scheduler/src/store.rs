// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Version history persistence

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Mutex;
use upgrade_scheduler_interface::{StoreError, VersionHistoryStore};
use upgrade_scheduler_types::history::VersionHistory;
use upgrade_scheduler_types::ids::InstanceKey;

/// Stores each instance's history as a JSON document `<key>.json` in one
/// directory
///
/// Writes go to a temporary file that is then renamed over the document, so
/// readers see either the old history or the new one.
#[derive(Clone, Debug)]
pub struct FileHistoryStore {
    directory: Utf8PathBuf,
}

impl FileHistoryStore {
    pub fn new(directory: impl Into<Utf8PathBuf>) -> FileHistoryStore {
        FileHistoryStore { directory: directory.into() }
    }

    pub fn directory(&self) -> &Utf8Path {
        &self.directory
    }

    fn path(&self, key: &InstanceKey) -> Utf8PathBuf {
        self.directory.join(format!("{key}.json"))
    }
}

#[async_trait]
impl VersionHistoryStore for FileHistoryStore {
    async fn get(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<VersionHistory>, StoreError> {
        let path = self.path(key);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::Read { key: key.clone(), err: err.into() });
            }
        };
        let history = serde_json::from_slice(&contents)
            .map_err(|err| StoreError::Read { key: key.clone(), err: err.into() })?;
        Ok(Some(history))
    }

    async fn put(
        &self,
        key: &InstanceKey,
        history: &VersionHistory,
    ) -> Result<(), StoreError> {
        let write_err =
            |err: Box<dyn std::error::Error + Send + Sync>| StoreError::Write {
                key: key.clone(),
                err,
            };

        let contents =
            serde_json::to_vec_pretty(history).map_err(|e| write_err(e.into()))?;
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| write_err(e.into()))?;

        let path = self.path(key);
        let tmp_path = self.directory.join(format!(".{key}.json.tmp"));
        tokio::fs::write(&tmp_path, &contents)
            .await
            .map_err(|e| write_err(e.into()))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| write_err(e.into()))?;
        Ok(())
    }
}

/// Keeps histories in memory; used by tests and simulations
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    histories: Mutex<BTreeMap<InstanceKey, VersionHistory>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> InMemoryHistoryStore {
        InMemoryHistoryStore::default()
    }

    /// Returns what is currently stored for `key`, without going through the
    /// async interface
    pub fn snapshot(&self, key: &InstanceKey) -> Option<VersionHistory> {
        self.histories.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: InstanceKey, history: VersionHistory) {
        self.histories.lock().unwrap().insert(key, history);
    }
}

#[async_trait]
impl VersionHistoryStore for InMemoryHistoryStore {
    async fn get(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<VersionHistory>, StoreError> {
        Ok(self.snapshot(key))
    }

    async fn put(
        &self,
        key: &InstanceKey,
        history: &VersionHistory,
    ) -> Result<(), StoreError> {
        self.insert(key.clone(), history.clone());
        Ok(())
    }
}
