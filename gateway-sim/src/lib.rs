// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated fleet-management gateway
//!
//! [`SimGateway`] implements [`upgrade_scheduler_interface::Gateway`] over
//! in-memory state described by a [`SimGatewayConfig`].  It records every
//! mutating request so tests can assert on exactly what the scheduler did,
//! and it can be told to fail specific requests.

mod config;
mod gateway;

pub use config::*;
pub use gateway::*;
