// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Maintenance-window gating

use chrono::{DateTime, TimeDelta, Utc};
use upgrade_scheduler_types::schedule::MaintenanceWindow;

/// How far ahead of a maintenance window an upgrade may be scheduled
pub const MAINTENANCE_WINDOW_LEAD_HOURS: i64 = 2;

/// Whether a cluster's maintenance window is close enough to act on
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WindowStatus {
    /// the window opens at `next_run`, within the lead time
    Due { next_run: DateTime<Utc> },
    /// the window opens at `next_run`, beyond the lead time
    NotYetDue { next_run: DateTime<Utc> },
    /// the schedule never fires again
    Never,
}

/// Evaluates `window` relative to `now`
///
/// Only the next opening strictly after `now` is considered.  A window that
/// opened at or before `now` does not count as open; if it recurs within the
/// lead time the cluster is due for that next opening.
pub fn window_status(
    window: &MaintenanceWindow,
    now: DateTime<Utc>,
) -> WindowStatus {
    match window.next_after(now) {
        None => WindowStatus::Never,
        Some(next_run) => {
            if next_run - now > TimeDelta::hours(MAINTENANCE_WINDOW_LEAD_HOURS)
            {
                WindowStatus::NotYetDue { next_run }
            } else {
                WindowStatus::Due { next_run }
            }
        }
    }
}
