// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Administratively blocked versions

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid blocked-version pattern {pattern:?}")]
pub struct BlockedVersionsError {
    pattern: String,
    #[source]
    err: regex::Error,
}

/// A set of regular expressions matching versions that must not be used as
/// upgrade targets
///
/// A version is blocked if any pattern matches somewhere in its string form.
/// Anchor the pattern (`^4\.14\.0$`) to block exactly one version.
#[derive(Clone, Debug, Default)]
pub struct BlockedVersions {
    patterns: Vec<Regex>,
}

impl BlockedVersions {
    pub fn new<I, S>(patterns: I) -> Result<Self, BlockedVersionsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let pattern = p.as_ref();
                Regex::new(pattern).map_err(|err| BlockedVersionsError {
                    pattern: pattern.to_owned(),
                    err,
                })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_blocked(&self, version: &Version) -> bool {
        let version = version.to_string();
        self.patterns.iter().any(|p| p.is_match(&version))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl Serialize for BlockedVersions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.patterns.iter().map(|p| p.as_str()))
    }
}

impl<'de> Deserialize<'de> for BlockedVersions {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let patterns = Vec::<String>::deserialize(deserializer)?;
        Self::new(patterns).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_matching() {
        let blocked =
            BlockedVersions::new([r"^4\.14\.0$", r"^4\.15\..*-rc"]).unwrap();
        assert!(blocked.is_blocked(&Version::new(4, 14, 0)));
        assert!(!blocked.is_blocked(&Version::new(4, 14, 10)));
        assert!(blocked.is_blocked(&Version::parse("4.15.0-rc.2").unwrap()));
        assert!(!blocked.is_blocked(&Version::new(4, 15, 0)));
    }

    #[test]
    fn test_unanchored_pattern_matches_anywhere() {
        let blocked = BlockedVersions::new([r"4\.13"]).unwrap();
        assert!(blocked.is_blocked(&Version::new(4, 13, 7)));
    }

    #[test]
    fn test_bad_pattern() {
        assert!(BlockedVersions::new(["4.14.(0"]).is_err());
        let parsed: Result<BlockedVersions, _> =
            serde_json::from_str(r#"["4.14.(0"]"#);
        assert!(parsed.is_err());
    }
}
