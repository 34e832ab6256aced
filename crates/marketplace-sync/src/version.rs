// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Semantic-version helpers and the per-service version catalog.

use std::collections::BTreeMap;

use semver::Version;

use crate::error::DocumentError;

/// Parses a semantic version string, tolerating shorthand core versions.
///
/// Publishers occasionally omit the patch number (`1.2`); missing segments
/// are padded so the comparison still follows semver precedence.
pub fn parse_version(input: &str) -> Result<Version, semver::Error> {
    let input = input.trim();
    match Version::parse(input) {
        Ok(version) => Ok(version),
        Err(original_err) => {
            let (core, suffix) = split_version_core_suffix(input);
            let mut segments: Vec<&str> = core
                .split('.')
                .filter(|segment| !segment.is_empty())
                .collect();
            if segments.is_empty() || segments.len() > 3 {
                return Err(original_err);
            }
            while segments.len() < 3 {
                segments.push("0");
            }
            let normalized = format!("{}{}", segments.join("."), suffix);
            Version::parse(&normalized).map_err(|_| original_err)
        }
    }
}

fn split_version_core_suffix(input: &str) -> (&str, &str) {
    if let Some(idx) = input.find(['-', '+']) {
        (&input[..idx], &input[idx..])
    } else {
        (input, "")
    }
}

/// Returns whether `candidate` is strictly newer than `installed`.
pub fn is_newer(candidate: &Version, installed: &Version) -> bool {
    candidate.cmp_precedence(installed).is_gt()
}

/// Known published versions of one service, keyed by document id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionCatalog {
    versions: BTreeMap<String, Version>,
}

impl VersionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a version id; returns `Ok(false)` when it was already known.
    pub fn insert(&mut self, id: &str) -> Result<bool, DocumentError> {
        if self.versions.contains_key(id) {
            return Ok(false);
        }
        let version = parse_version(id).map_err(|err| DocumentError::InvalidVersion {
            id: id.to_string(),
            reason: err.to_string(),
        })?;
        self.versions.insert(id.to_string(), version);
        Ok(true)
    }

    /// Removes a version id; returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        self.versions.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.versions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The highest version under semver precedence, with its document id.
    ///
    /// Ids that only differ in build metadata have equal precedence; the
    /// lexically greater id wins so the result does not depend on insertion
    /// order.
    pub fn latest(&self) -> Option<(&str, &Version)> {
        self.versions
            .iter()
            .max_by(|(a_id, a), (b_id, b)| a.cmp_precedence(b).then_with(|| a_id.cmp(b_id)))
            .map(|(id, version)| (id.as_str(), version))
    }
}
