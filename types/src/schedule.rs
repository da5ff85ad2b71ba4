// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cron-defined maintenance windows

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid maintenance window schedule {expression:?}")]
pub struct ScheduleParseError {
    expression: String,
    #[source]
    err: cron::error::Error,
}

/// A recurring maintenance window, expressed as a cron schedule in UTC
///
/// Cluster policies use the classic five-field crontab syntax
/// (`minute hour day-of-month month day-of-week`).  As in crontab, when both
/// day fields are restricted the window opens on days matching either one.
/// Six- and seven-field expressions (with leading seconds and optional
/// trailing year) are handed to the `cron` crate as they are.
#[derive(Clone)]
pub struct MaintenanceWindow {
    expression: String,
    /// the window opens at the earliest next firing of any of these
    schedules: Vec<Schedule>,
}

impl MaintenanceWindow {
    pub fn parse(expression: &str) -> Result<Self, ScheduleParseError> {
        let trimmed = expression.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match &fields[..] {
            [minute, hour, dom, month, dow] => {
                let dow = crontab_days_of_week(dow);
                if is_restricted(dom) && is_restricted(&dow) {
                    vec![
                        format!("0 {minute} {hour} {dom} {month} *"),
                        format!("0 {minute} {hour} * {month} {dow}"),
                    ]
                } else {
                    vec![format!("0 {minute} {hour} {dom} {month} {dow}")]
                }
            }
            _ => vec![trimmed.to_owned()],
        };
        let schedules = normalized
            .iter()
            .map(|expr| Schedule::from_str(expr))
            .collect::<Result<_, _>>()
            .map_err(|err| ScheduleParseError {
                expression: expression.to_owned(),
                err,
            })?;
        Ok(Self { expression: trimmed.to_owned(), schedules })
    }

    /// Returns the first time the window opens strictly after `now`
    ///
    /// Returns `None` for schedules that never fire again.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules.iter().filter_map(|s| s.after(&now).next()).min()
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

/// Crontab treats a day field starting with `*` as unrestricted, even with a
/// step.
fn is_restricted(field: &str) -> bool {
    !field.starts_with('*')
}

/// Translates a crontab day-of-week field (0-7, Sunday is 0 or 7) into the
/// numbering used by the `cron` crate (1-7, Sunday is 1).
///
/// Numeric ranges are expanded into lists, since a range ending on Sunday
/// (`5-7`) would otherwise wrap around.  Named days and wildcards pass
/// through unchanged.
fn crontab_days_of_week(field: &str) -> String {
    fn shift(day: u8) -> u8 {
        if day == 7 { 1 } else { day + 1 }
    }

    let mut out: Vec<String> = Vec::new();
    for item in field.split(',') {
        match expand_days(item) {
            Some(days) => {
                for day in days {
                    let day = shift(day).to_string();
                    if !out.contains(&day) {
                        out.push(day);
                    }
                }
            }
            // Names, wildcards and malformed items are left for the `cron`
            // crate to accept or reject.
            None => out.push(item.to_owned()),
        }
    }
    out.join(",")
}

/// Expands a numeric crontab day-of-week item (`3`, `1-5`, `1-5/2`, `1/2`)
/// into the crontab day numbers it selects
fn expand_days(item: &str) -> Option<Vec<u8>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<usize>().ok()?)),
        None => (item, None),
    };
    let (start, end) = match range.split_once('-') {
        Some((start, end)) => {
            (start.parse::<u8>().ok()?, end.parse::<u8>().ok()?)
        }
        // A single day with a step runs to the end of the week.
        None if step.is_some() => (range.parse::<u8>().ok()?, 7),
        None => {
            let day = range.parse::<u8>().ok()?;
            (day, day)
        }
    };
    if start > end || end > 7 || step == Some(0) {
        return None;
    }
    Some((start..=end).step_by(step.unwrap_or(1)).collect())
}

impl fmt::Debug for MaintenanceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MaintenanceWindow").field(&self.expression).finish()
    }
}

impl fmt::Display for MaintenanceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl PartialEq for MaintenanceWindow {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for MaintenanceWindow {}

impl FromStr for MaintenanceWindow {
    type Err = ScheduleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MaintenanceWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for MaintenanceWindow {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        Self::parse(&expression).map_err(serde::de::Error::custom)
    }
}
