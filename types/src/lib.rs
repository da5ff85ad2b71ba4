// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by the cluster upgrade scheduler
//!
//! The scheduler works from two views of the fleet:
//!
//! * the *desired* state: one [`policy::DesiredUpgradePolicy`] per cluster,
//!   describing when the cluster may upgrade and under which conditions
//! * the *current* state: the [`policy::CurrentUpgradePolicy`] records held by
//!   the fleet-management gateway for upgrades that are already scheduled
//!
//! Each reconciliation pass compares the two (together with the persisted
//! [`history::VersionHistory`]) and produces a list of
//! [`diff::UpgradeDiff`]s to apply against the gateway.

pub mod blocked;
pub mod diff;
pub mod history;
pub mod ids;
pub mod policy;
pub mod schedule;
pub mod version;
