// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upgrade mutexes held during one planning pass

use std::collections::BTreeMap;
use upgrade_scheduler_types::ids::{ClusterName, MutexName};

/// Which cluster holds each upgrade mutex
///
/// A fresh table is built for every planning pass.  It starts out with the
/// mutexes of clusters that already have an upgrade scheduled, and grows as
/// the planner grants upgrades.  It is never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MutexTable {
    held: BTreeMap<MutexName, ClusterName>,
}

impl MutexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `cluster` holds each of `mutexes`
    pub fn hold_all<'a, I>(&mut self, mutexes: I, cluster: &ClusterName)
    where
        I: IntoIterator<Item = &'a MutexName>,
    {
        for mutex in mutexes {
            self.held.insert(mutex.clone(), cluster.clone());
        }
    }

    pub fn holder(&self, mutex: &MutexName) -> Option<&ClusterName> {
        self.held.get(mutex)
    }

    /// Returns the first of `mutexes` that is already held, with its holder
    pub fn first_held<'a, I>(
        &self,
        mutexes: I,
    ) -> Option<(&'a MutexName, &ClusterName)>
    where
        I: IntoIterator<Item = &'a MutexName>,
    {
        mutexes
            .into_iter()
            .find_map(|mutex| self.holder(mutex).map(|holder| (mutex, holder)))
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
