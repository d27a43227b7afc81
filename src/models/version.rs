//! Per-model revision tracking.
//!
//! At most one version per model id is active. Registration never overwrites
//! an existing version, and activating an unregistered version leaves the
//! current active one in place.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Version {version} of {model_id} is not registered")]
    VersionNotFound { model_id: String, version: String },

    #[error("Version {version} of {model_id} is already registered")]
    VersionConflict { model_id: String, version: String },

    #[error("Version {version} of {model_id} is active and cannot be removed")]
    ActiveVersion { model_id: String, version: String },
}

/// One registered revision of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model_id: String,
    pub version: String,
    pub model_path: String,
    pub size_mb: u64,
    pub created_time: DateTime<Utc>,
    /// Hex SHA-256 of the model file; empty when unknown.
    pub checksum: String,
    pub is_active: bool,
}

impl ModelVersion {
    pub fn new(model_id: &str, version: &str, model_path: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            version: version.to_string(),
            model_path: model_path.to_string(),
            size_mb: 0,
            created_time: Utc::now(),
            checksum: String::new(),
            is_active: false,
        }
    }

    pub fn with_size_mb(mut self, size_mb: u64) -> Self {
        self.size_mb = size_mb;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    pub fn active(mut self) -> Self {
        self.is_active = true;
        self
    }
}

/// Numeric components of a version string; a leading `v` is ignored.
fn version_key(version: &str) -> Option<Vec<u64>> {
    let trimmed = version.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    // Pre-release and build suffixes do not take part in ordering.
    let core = trimmed.split(['-', '+']).next().unwrap_or(trimmed);
    core.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// Order two versions numerically, falling back to registration time.
fn compare_versions(a: &ModelVersion, b: &ModelVersion) -> Ordering {
    match (version_key(&a.version), version_key(&b.version)) {
        (Some(ka), Some(kb)) => ka.cmp(&kb).then(a.created_time.cmp(&b.created_time)),
        _ => a.created_time.cmp(&b.created_time),
    }
}

/// Registry of model revisions.
#[derive(Default)]
pub struct VersionManager {
    versions: RwLock<HashMap<String, Vec<ModelVersion>>>,
}

impl VersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a version. If it is marked active, every other version of the
    /// model is deactivated.
    pub fn register(&self, version: ModelVersion) -> Result<(), VersionError> {
        let mut versions = self.versions.write();
        let list = versions.entry(version.model_id.clone()).or_default();

        if list.iter().any(|v| v.version == version.version) {
            return Err(VersionError::VersionConflict {
                model_id: version.model_id,
                version: version.version,
            });
        }
        if version.is_active {
            for existing in list.iter_mut() {
                existing.is_active = false;
            }
        }

        tracing::debug!(model_id = %version.model_id, version = %version.version, active = version.is_active, "version registered");
        list.push(version);
        Ok(())
    }

    pub fn get_active_version(&self, model_id: &str) -> Option<ModelVersion> {
        self.versions
            .read()
            .get(model_id)?
            .iter()
            .find(|v| v.is_active)
            .cloned()
    }

    /// Every version of a model, oldest registration first.
    pub fn get_all_versions(&self, model_id: &str) -> Vec<ModelVersion> {
        let mut list = self.versions.read().get(model_id).cloned().unwrap_or_default();
        list.sort_by(|a, b| a.created_time.cmp(&b.created_time));
        list
    }

    /// Activate a registered version, deactivating the others.
    pub fn set_active_version(&self, model_id: &str, version: &str) -> Result<(), VersionError> {
        let mut versions = self.versions.write();
        let not_found = || VersionError::VersionNotFound {
            model_id: model_id.to_string(),
            version: version.to_string(),
        };
        let list = versions.get_mut(model_id).ok_or_else(not_found)?;
        if !list.iter().any(|v| v.version == version) {
            return Err(not_found());
        }

        for v in list.iter_mut() {
            v.is_active = v.version == version;
        }
        tracing::info!(model_id, version, "active version changed");
        Ok(())
    }

    /// Remove an inactive version.
    pub fn remove_version(&self, model_id: &str, version: &str) -> Result<ModelVersion, VersionError> {
        let mut versions = self.versions.write();
        let list = versions.get_mut(model_id).ok_or_else(|| VersionError::VersionNotFound {
            model_id: model_id.to_string(),
            version: version.to_string(),
        })?;
        let index = list
            .iter()
            .position(|v| v.version == version)
            .ok_or_else(|| VersionError::VersionNotFound {
                model_id: model_id.to_string(),
                version: version.to_string(),
            })?;
        if list[index].is_active {
            return Err(VersionError::ActiveVersion {
                model_id: model_id.to_string(),
                version: version.to_string(),
            });
        }

        let removed = list.remove(index);
        if list.is_empty() {
            versions.remove(model_id);
        }
        Ok(removed)
    }

    /// True when `version` shares the active version's major number.
    ///
    /// A model with no active version accepts anything; unparseable versions
    /// are compatible only with themselves.
    pub fn check_version_compatibility(&self, model_id: &str, version: &str) -> bool {
        let Some(active) = self.get_active_version(model_id) else {
            return true;
        };
        match (version_key(&active.version), version_key(version)) {
            (Some(a), Some(b)) => a.first() == b.first(),
            _ => active.version == version,
        }
    }

    /// Ids whose newest registered version is newer than the active one.
    pub fn get_upgrade_recommendations(&self) -> Vec<String> {
        let versions = self.versions.read();
        let mut ids: Vec<String> = versions
            .iter()
            .filter_map(|(id, list)| {
                let active = list.iter().find(|v| v.is_active)?;
                let newest = list.iter().max_by(|a, b| compare_versions(a, b))?;
                (newest.version != active.version
                    && compare_versions(newest, active) == Ordering::Greater)
                    .then(|| id.clone())
            })
            .collect();
        ids.sort();
        ids
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.versions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Hex SHA-256 of a file, streamed.
pub fn sha256_file(path: impl AsRef<Path>) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_key_ignores_prefix_and_suffix() {
        assert_eq!(version_key("v1.2.3"), Some(vec![1, 2, 3]));
        assert_eq!(version_key("2.0-rc1"), Some(vec![2, 0]));
        assert_eq!(version_key("latest"), None);
    }

    #[test]
    fn numeric_ordering_beats_lexical() {
        let a = ModelVersion::new("m", "1.10", "models/a.bin");
        let b = ModelVersion::new("m", "1.9", "models/b.bin");
        assert_eq!(compare_versions(&a, &b), Ordering::Greater);
    }
}
