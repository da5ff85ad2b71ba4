// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for OpenShift version strings

use semver::Version;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid OpenShift version {input:?}")]
pub struct VersionParseError {
    input: String,
    #[source]
    err: semver::Error,
}

/// Parses an OpenShift version string (e.g., `4.14.2` or `4.15.0-rc.1`)
pub fn parse_version(input: &str) -> Result<Version, VersionParseError> {
    Version::parse(input.trim())
        .map_err(|err| VersionParseError { input: input.to_owned(), err })
}

/// Returns the `major.minor` prefix of `version`
///
/// Version gates are published per minor release, so this is the key used to
/// look them up.
pub fn version_prefix(version: &Version) -> String {
    format!("{}.{}", version.major, version.minor)
}

/// Sorts `versions` from highest to lowest
pub fn sort_descending(versions: &mut [Version]) {
    versions.sort_by(|a, b| b.cmp(a));
}
