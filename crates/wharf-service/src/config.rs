// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the storage provider and artifact server.

use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use wharf_core::DigestAlgorithm;

use crate::error::{Result, StorageError};

/// The storage backend implementations that can be selected at startup.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local filesystem storage served by this process.
    #[default]
    Filesystem,
    /// AWS S3 or any S3-compatible object store.
    S3,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => f.write_str("filesystem"),
            Self::S3 => f.write_str("s3"),
        }
    }
}

/// Configuration selecting and parameterizing exactly one storage backend.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// The backend to use.
    #[serde(default)]
    pub backend: BackendKind,
    /// Externally reachable `host[:port]` stamped into filesystem artifact
    /// URLs. Ignored by backends that mint their own URLs.
    #[serde(default)]
    pub hostname: String,
    /// Duration artifacts from previous reconciliations are retained before
    /// garbage collection.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "defaults::retention_ttl")]
    pub retention_ttl: Duration,
    /// Maximum number of artifacts retained per resource after garbage
    /// collection. Must be at least 1.
    #[serde(default = "defaults::retention_records")]
    pub retention_records: usize,
    /// Algorithm used for artifact digests. Fixed for the process lifetime.
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,
    /// Filesystem backend parameters; required when `backend` is `filesystem`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemConfig>,
    /// Object store backend parameters; required when `backend` is `s3`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            hostname: String::new(),
            retention_ttl: defaults::retention_ttl(),
            retention_records: defaults::retention_records(),
            digest_algorithm: DigestAlgorithm::default(),
            filesystem: None,
            s3: None,
        }
    }
}

/// Parameters for the filesystem backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesystemConfig {
    /// Directory under which all artifacts are stored.
    pub base_path: PathBuf,
}

/// Parameters for the S3-compatible backend.
///
/// Credentials are taken from the environment, matching the conventions of the
/// AWS SDKs.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct S3Config {
    /// Bucket holding all artifacts.
    pub bucket: String,
    /// Key prefix prepended to every artifact path. Never part of the
    /// caller-visible path.
    #[serde(default)]
    pub prefix: String,
    /// Bucket region.
    #[serde(default = "defaults::region")]
    pub region: String,
    /// Custom endpoint for S3-compatible stores such as MinIO.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Force path-style addressing, required by most S3-compatible stores.
    #[serde(default)]
    pub force_path_style: bool,
    /// Lifetime of presigned GET URLs handed out to clients.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "defaults::url_expiration")]
    pub url_expiration: Duration,
}

impl StorageConfig {
    /// Loads the configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "reading storage configuration");
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Checks that the selected backend has the parameters it requires.
    pub fn validate(&self) -> Result<()> {
        if self.retention_records == 0 {
            return Err(StorageError::config(
                "retention_records must be at least 1",
            ));
        }
        match self.backend {
            BackendKind::Filesystem => {
                let filesystem = self.filesystem.as_ref().ok_or_else(|| {
                    StorageError::config("filesystem backend requires a base path")
                })?;
                if filesystem.base_path.as_os_str().is_empty() {
                    return Err(StorageError::config(
                        "filesystem backend requires a base path",
                    ));
                }
            }
            BackendKind::S3 => {
                let s3 = self
                    .s3
                    .as_ref()
                    .ok_or_else(|| StorageError::config("s3 backend requires a bucket"))?;
                if s3.bucket.is_empty() {
                    return Err(StorageError::config("s3 backend requires a bucket"));
                }
            }
        }
        Ok(())
    }
}

/// Storage-related default values.
pub mod defaults {
    use std::time::Duration;

    /// Default retention period for artifacts of previous reconciliations.
    pub fn retention_ttl() -> Duration {
        Duration::from_secs(60)
    }

    /// Default number of artifacts retained per resource.
    pub fn retention_records() -> usize {
        2
    }

    /// Default bucket region.
    pub fn region() -> String {
        "us-east-1".to_owned()
    }

    /// Default lifetime of presigned URLs.
    pub fn url_expiration() -> Duration {
        Duration::from_secs(15 * 60)
    }
}

#[cfg(test)]
mod tests {
    use wharf_test_utils::param_test;

    use super::*;

    #[test]
    fn filesystem_config_parses_with_defaults() {
        let config: StorageConfig = serde_yaml::from_str(
            "backend: filesystem\nhostname: demo.local\nfilesystem:\n  base_path: /data\n",
        )
        .expect("well-formed configuration");
        assert_eq!(config.backend, BackendKind::Filesystem);
        assert_eq!(config.retention_ttl, Duration::from_secs(60));
        assert_eq!(config.retention_records, 2);
        assert_eq!(config.digest_algorithm, DigestAlgorithm::Sha256);
        config.validate().expect("valid configuration");
    }

    #[test]
    fn s3_config_parses_durations_as_seconds() {
        let config: StorageConfig = serde_yaml::from_str(
            "backend: s3\nretention_ttl: 120\ns3:\n  bucket: artifacts\n  prefix: flux\n  url_expiration: 300\n",
        )
        .expect("well-formed configuration");
        assert_eq!(config.backend, BackendKind::S3);
        assert_eq!(config.retention_ttl, Duration::from_secs(120));
        let s3 = config.s3.as_ref().expect("s3 section present");
        assert_eq!(s3.region, "us-east-1");
        assert_eq!(s3.url_expiration, Duration::from_secs(300));
        config.validate().expect("valid configuration");
    }

    #[test]
    fn unknown_backend_is_rejected_at_parse_time() {
        let result: std::result::Result<StorageConfig, _> =
            serde_yaml::from_str("backend: gcs\n");
        assert!(result.is_err());
    }

    param_test! {
        validation_rejects_incomplete_backends: [
            missing_fs_section: ("backend: filesystem\n"),
            empty_base_path: ("backend: filesystem\nfilesystem:\n  base_path: \"\"\n"),
            missing_s3_section: ("backend: s3\n"),
            empty_bucket: ("backend: s3\ns3:\n  bucket: \"\"\n"),
            zero_retention_records: (
                "backend: filesystem\nretention_records: 0\nfilesystem:\n  base_path: /data\n"
            ),
        ]
    }
    fn validation_rejects_incomplete_backends(yaml: &str) {
        let config: StorageConfig = serde_yaml::from_str(yaml).expect("parseable configuration");
        let error = config.validate().expect_err("incomplete configuration");
        assert!(matches!(error, StorageError::Config(_)));
    }
}
