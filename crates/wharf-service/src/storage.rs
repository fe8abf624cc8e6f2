// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The storage contract shared by every backend, and the provider factory.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{io::AsyncRead, runtime::Handle, time::Instant};
use tokio_util::io::SyncIoBridge;
use wharf_core::{Artifact, ArtifactFilter, RetentionPolicy};

use crate::{
    archive::{self, ArchiveFilter},
    config::{BackendKind, StorageConfig},
    error::{Result, StorageError},
};

pub mod filesystem;
pub mod s3;

pub use filesystem::FilesystemStore;
pub use s3::S3Store;

/// Buffer size of the pipe between the blocking archive builder and the
/// async store pipeline.
const ARCHIVE_PIPE_CAPACITY: usize = 64 * 1024;

/// A readable artifact byte stream. The caller drops it to release the
/// underlying resource; if the object disappears mid-read the stream
/// terminates with an I/O error.
pub type ArtifactReader = Box<dyn AsyncRead + Send + Unpin>;

/// An exclusive hold on an artifact, released by dropping the guard.
#[derive(Debug)]
pub struct StoreLock {
    _inner: LockInner,
}

#[derive(Debug)]
enum LockInner {
    /// Advisory file lock, observed by every process sharing the filesystem.
    /// Closing the handle releases it.
    File(std::fs::File),
    /// Process-local mutex for backends without shared filesystem locks.
    /// Not safe across replicas.
    Local(tokio::sync::OwnedMutexGuard<()>),
}

impl StoreLock {
    pub(crate) fn from_file(file: std::fs::File) -> Self {
        Self {
            _inner: LockInner::File(file),
        }
    }

    pub(crate) fn from_local(guard: tokio::sync::OwnedMutexGuard<()>) -> Self {
        Self {
            _inner: LockInner::Local(guard),
        }
    }
}

/// The operations every storage backend provides.
///
/// Implementations must be safe for concurrent use across unrelated keys. A
/// successful [`store`](Self::store) happens-before any subsequent
/// [`exists`](Self::exists), [`retrieve`](Self::retrieve), or
/// [`list`](Self::list) on the same backend; there is no ordering guarantee
/// across distinct keys.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes the artifact content from the reader to storage.
    ///
    /// The write is atomic: after success the artifact exists with
    /// digest-verified bytes, after failure no partial object is visible under
    /// the final path. On success the artifact's digest, size, update time,
    /// and URL are filled in.
    async fn store(&self, artifact: &mut Artifact, reader: ArtifactReader) -> Result<()>;

    /// Returns a reader for the artifact content.
    async fn retrieve(&self, artifact: &Artifact) -> Result<ArtifactReader>;

    /// Checks whether a complete object exists under the artifact's path.
    ///
    /// A `true` result may be outdated by a concurrent deletion before a
    /// subsequent [`retrieve`](Self::retrieve).
    async fn exists(&self, artifact: &Artifact) -> Result<bool>;

    /// Removes the artifact. Deleting a non-existent artifact is a success.
    async fn delete(&self, artifact: &Artifact) -> Result<()>;

    /// Returns a URL under which clients can fetch the artifact. Depending on
    /// the backend this is either a stable host path or a short-lived
    /// presigned URL.
    async fn get_url(&self, artifact: &Artifact) -> Result<String>;

    /// Enumerates artifacts under the path prefix derived from the filter, in
    /// unspecified order.
    async fn list(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>>;

    /// Acquires a mutual-exclusion token for the artifact, observed by this
    /// backend instance. Acquisition blocks until the current holder releases
    /// the lock. See [`StoreLock`] for the guarantees per backend.
    async fn lock(&self, artifact: &Artifact) -> Result<StoreLock>;

    /// Attempts to acquire the artifact's lock without blocking.
    ///
    /// Fails with [`StorageError::Conflict`] while another holder has it.
    /// Garbage collection uses this to step around artifacts that a writer
    /// currently holds.
    async fn try_lock(&self, artifact: &Artifact) -> Result<StoreLock>;

    /// Performs a lightweight round-trip to the backend.
    async fn healthy(&self) -> Result<()>;

    /// Whether clients should be redirected to URLs minted by
    /// [`get_url`](Self::get_url) instead of being streamed to directly.
    fn supports_redirect(&self) -> bool {
        false
    }

    /// Builds a tar+gzip archive from `source_dir` and stores it under the
    /// artifact's path, streaming through the digest pipeline.
    ///
    /// The archive is deterministic for identical trees and filters; see
    /// [`archive::write_archive`] for the exact entry rules.
    async fn archive(
        &self,
        artifact: &mut Artifact,
        source_dir: &Path,
        filter: Option<ArchiveFilter>,
    ) -> Result<()> {
        let (writer, reader) = tokio::io::duplex(ARCHIVE_PIPE_CAPACITY);
        let source_dir = source_dir.to_path_buf();
        let handle = Handle::current();
        let builder = tokio::task::spawn_blocking(move || {
            let bridge = SyncIoBridge::new_with_handle(writer, handle);
            archive::write_archive(bridge, &source_dir, filter.as_deref())
        });

        let (stored, built) = tokio::join!(self.store(artifact, Box::new(reader)), builder);
        match (stored, built) {
            (Err(error), _) => Err(error),
            (Ok(()), Ok(Ok(()))) => Ok(()),
            (Ok(()), built) => {
                // The builder failed after the store committed a truncated
                // stream; withdraw the object so it never serves.
                self.delete(artifact).await.ok();
                artifact.digest = None;
                artifact.size = None;
                let cause = match built {
                    Ok(Err(error)) => anyhow::Error::new(error),
                    Err(join_error) => anyhow::Error::new(join_error),
                    Ok(Ok(())) => unreachable!("handled above"),
                };
                Err(StorageError::Internal(
                    cause.context("failed to build archive"),
                ))
            }
        }
    }

    /// Stores the file at `path` under the artifact's path.
    async fn copy_from_path(&self, artifact: &mut Artifact, path: &Path) -> Result<()> {
        let file = tokio::fs::File::open(path).await.map_err(|error| {
            StorageError::Internal(
                anyhow::Error::new(error)
                    .context(format!("failed to open {}", path.display())),
            )
        })?;
        self.store(artifact, Box::new(file)).await
    }

    /// Extracts the artifact's archive below `to_path`, preserving file
    /// modes. A non-empty `sub_path` selects a subset of entries, re-rooted
    /// at `to_path`.
    async fn copy_to_path(&self, artifact: &Artifact, sub_path: &str, to_path: &Path) -> Result<()> {
        let reader = self.retrieve(artifact).await?;
        let sub_path = sub_path.to_owned();
        let to_path = to_path.to_path_buf();
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || {
            let bridge = SyncIoBridge::new_with_handle(reader, handle);
            archive::unpack_archive(bridge, &sub_path, &to_path)
        })
        .await
        .map_err(|join_error| StorageError::Internal(join_error.into()))?
        .map_err(|error| {
            StorageError::Internal(anyhow::Error::new(error).context("failed to unpack archive"))
        })
    }

    /// Applies the retention policy to the artifacts selected by the filter.
    ///
    /// Artifacts whose lock is currently held are stepped over and retried on
    /// the next run. Individual delete failures are logged and skipped.
    /// Crossing the deadline stops further deletions; completed deletions are
    /// not rolled back. Returns the paths that were deleted.
    async fn garbage_collect(
        &self,
        filter: &ArtifactFilter,
        policy: RetentionPolicy,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let artifacts = self.list(filter).await?;
        let expired = crate::retention::evaluate(artifacts, policy, Utc::now());

        let mut deleted = Vec::new();
        for artifact in expired {
            if Instant::now() >= deadline {
                tracing::warn!(
                    prefix = %filter.prefix(),
                    deleted = deleted.len(),
                    "garbage collection deadline reached with candidates remaining",
                );
                break;
            }
            let _guard = match self.try_lock(&artifact).await {
                Ok(guard) => guard,
                Err(StorageError::Conflict { .. }) => {
                    tracing::debug!(path = %artifact.path, "artifact is locked, skipping");
                    continue;
                }
                Err(error) => {
                    tracing::warn!(path = %artifact.path, %error, "failed to lock artifact");
                    continue;
                }
            };
            match self.delete(&artifact).await {
                Ok(()) => {
                    tracing::debug!(path = %artifact.path, "garbage collected artifact");
                    deleted.push(artifact.path);
                }
                Err(error) => {
                    tracing::warn!(path = %artifact.path, %error, "failed to delete artifact");
                }
            }
        }
        Ok(deleted)
    }

    /// Removes every artifact selected by the filter, returning how many were
    /// deleted. Used when the owning resource itself is deleted.
    async fn remove_all(&self, filter: &ArtifactFilter) -> Result<usize> {
        let artifacts = self.list(filter).await?;
        let mut removed = 0;
        for artifact in &artifacts {
            self.delete(artifact).await?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Creates the storage backend selected by the configuration.
///
/// Validates the configuration and probes the backend, returning a precise
/// error when a required parameter is missing or the backend is unreachable.
pub async fn new_store(config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    config.validate()?;
    match config.backend {
        BackendKind::Filesystem => {
            let filesystem = config
                .filesystem
                .as_ref()
                .ok_or_else(|| StorageError::config("filesystem backend requires a base path"))?;
            let store = FilesystemStore::new(
                &filesystem.base_path,
                &config.hostname,
                config.digest_algorithm,
            )
            .await?;
            Ok(Arc::new(store))
        }
        BackendKind::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| StorageError::config("s3 backend requires a bucket"))?;
            let store = S3Store::new(s3, config.digest_algorithm).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Convenience used by binaries to report which backend was configured.
pub fn describe_backend(config: &StorageConfig) -> String {
    match config.backend {
        BackendKind::Filesystem => {
            let base = config
                .filesystem
                .as_ref()
                .map(|fs| fs.base_path.display().to_string())
                .unwrap_or_default();
            format!("filesystem backend at {base}")
        }
        BackendKind::S3 => {
            let bucket = config
                .s3
                .as_ref()
                .map(|s3| s3.bucket.clone())
                .unwrap_or_default();
            format!("s3 backend in bucket {bucket}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilesystemConfig;

    #[tokio::test]
    async fn factory_rejects_invalid_configuration() {
        let config = StorageConfig {
            backend: BackendKind::S3,
            ..StorageConfig::default()
        };
        let error = match new_store(&config).await {
            Err(error) => error,
            Ok(_) => panic!("missing bucket"),
        };
        assert!(matches!(error, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn factory_builds_filesystem_store() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig {
            backend: BackendKind::Filesystem,
            hostname: "demo.local".to_owned(),
            filesystem: Some(FilesystemConfig {
                base_path: temp_dir.path().to_path_buf(),
            }),
            ..StorageConfig::default()
        };
        let store = new_store(&config).await.expect("valid configuration");
        assert!(!store.supports_redirect());
        store.healthy().await.expect("base path exists");
    }
}
