// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Upgrade admission planning
//!
//! Planning takes the desired upgrade policies of every cluster in one
//! fleet-management instance, the upgrade policies currently scheduled in the
//! gateway, and the soak history of the fleet, and decides which clusters may
//! be scheduled for an upgrade in this pass and which scheduled upgrades must
//! be cancelled.  The output is an [`planner::UpgradePlan`]: the list of
//! changes to make plus a report of the decision taken for every cluster.
//!
//! Planning makes read-only gateway queries.  Applying the plan is the job of
//! the execution crate.

pub mod mutex;
pub mod planner;
pub mod report;
pub mod soak;
pub mod window;
