// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Local filesystem storage backend.

use std::{
    io,
    path::{Component, Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs4::FileExt as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use walkdir::WalkDir;
use wharf_core::{parse_path, Artifact, ArtifactFilter, DigestAlgorithm};

use crate::{
    error::{Result, StorageError},
    storage::{ArtifactReader, ArtifactStore, StoreLock},
};

/// Prefix of staged temp files, swept when stale before the next write in
/// their directory.
const TEMP_PREFIX: &str = ".wharf-tmp-";

/// Suffix of the sibling lock files.
const LOCK_SUFFIX: &str = ".lock";

/// Temp files older than this are considered leftovers of a crashed write.
const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

/// Storage backend writing artifacts below a base directory.
///
/// Layout: `<base>/<kind>/<namespace>/<name>/<file name>`, with a sibling
/// `<file name>.lock` per artifact. Writes are staged in a temp file in the
/// destination directory, fsynced, and renamed into place, so readers never
/// observe partial objects.
#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
    hostname: String,
    algorithm: DigestAlgorithm,
}

impl FilesystemStore {
    /// Creates the backend, ensuring the base directory exists.
    pub async fn new(
        base_path: &Path,
        hostname: &str,
        algorithm: DigestAlgorithm,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(base_path).await.map_err(|error| {
            StorageError::config(format!(
                "cannot create storage base path {}: {error}",
                base_path.display()
            ))
        })?;
        Ok(Self {
            base_path: base_path.to_path_buf(),
            hostname: hostname.to_owned(),
            algorithm,
        })
    }

    /// Resolves the artifact's location on disk, rejecting paths that would
    /// escape the base directory.
    fn local_path(&self, artifact: &Artifact) -> Result<PathBuf> {
        if artifact.path.is_empty() {
            return Err(StorageError::invalid_artifact("artifact path is empty"));
        }
        let relative = Path::new(&artifact.path);
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(StorageError::invalid_artifact(format!(
                "artifact path escapes the storage root: {}",
                artifact.path
            )));
        }
        Ok(self.base_path.join(relative))
    }

    fn url_for(&self, path: &str) -> String {
        format!("http://{}/{path}", self.hostname)
    }

    /// Resolves the artifact's sibling lock file, creating the scope
    /// directory when the lock precedes the first write.
    async fn prepare_lock_path(&self, artifact: &Artifact) -> Result<PathBuf> {
        let local_path = self.local_path(artifact)?;
        if let Some(dir) = local_path.parent() {
            let mut dir_builder = tokio::fs::DirBuilder::new();
            dir_builder.recursive(true).mode(0o700);
            dir_builder
                .create(dir)
                .await
                .map_err(|error| StorageError::from_io(error, &artifact.path))?;
        }
        let mut lock_path = local_path.into_os_string();
        lock_path.push(LOCK_SUFFIX);
        Ok(PathBuf::from(lock_path))
    }

    /// Best-effort removal of temp files a crashed writer left behind.
    async fn sweep_stale_temp_files(&self, dir: &Path) {
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let stale = entry
                .metadata()
                .await
                .and_then(|metadata| metadata.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .is_some_and(|age| age > STALE_TEMP_AGE);
            if stale {
                tracing::debug!(file = %entry.path().display(), "removing stale temp file");
                tokio::fs::remove_file(entry.path()).await.ok();
            }
        }
    }
}

fn open_lock_file(lock_path: &Path, artifact_path: &str) -> Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|error| StorageError::from_io(error, artifact_path))
}

#[async_trait]
impl ArtifactStore for FilesystemStore {
    async fn store(&self, artifact: &mut Artifact, mut reader: ArtifactReader) -> Result<()> {
        let local_path = self.local_path(artifact)?;
        let dir = local_path
            .parent()
            .ok_or_else(|| StorageError::invalid_artifact("artifact path has no parent"))?
            .to_path_buf();

        let mut dir_builder = tokio::fs::DirBuilder::new();
        dir_builder.recursive(true).mode(0o700);
        dir_builder
            .create(&dir)
            .await
            .map_err(|error| StorageError::from_io(error, &artifact.path))?;

        self.sweep_stale_temp_files(&dir).await;

        // Stage in a sibling temp file so a failed or interrupted write never
        // becomes visible under the final path.
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)
            .map_err(|error| StorageError::from_io(error, &artifact.path))?;
        let mut file = tokio::fs::File::from_std(
            temp.reopen()
                .map_err(|error| StorageError::from_io(error, &artifact.path))?,
        );

        let mut digester = self.algorithm.digester();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|error| StorageError::unavailable(error))?;
            if read == 0 {
                break;
            }
            digester.update(&buffer[..read]);
            file.write_all(&buffer[..read])
                .await
                .map_err(|error| StorageError::from_io(error, &artifact.path))?;
        }
        file.sync_all()
            .await
            .map_err(|error| StorageError::from_io(error, &artifact.path))?;
        drop(file);

        temp.persist(&local_path)
            .map_err(|error| StorageError::from_io(error.error, &artifact.path))?;

        let metadata = tokio::fs::metadata(&local_path)
            .await
            .map_err(|error| StorageError::from_io(error, &artifact.path))?;
        let modified = metadata
            .modified()
            .map_err(|error| StorageError::unavailable(error))?;

        artifact.size = Some(digester.bytes_written());
        artifact.digest = Some(digester.finalize());
        artifact.last_update_time = Some(DateTime::<Utc>::from(modified));
        artifact.url = self.url_for(&artifact.path);
        tracing::debug!(
            path = %artifact.path,
            size = artifact.size,
            "stored artifact on the filesystem",
        );
        Ok(())
    }

    async fn retrieve(&self, artifact: &Artifact) -> Result<ArtifactReader> {
        let local_path = self.local_path(artifact)?;
        let file = tokio::fs::File::open(&local_path)
            .await
            .map_err(|error| StorageError::from_io(error, &artifact.path))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, artifact: &Artifact) -> Result<bool> {
        let local_path = self.local_path(artifact)?;
        match tokio::fs::metadata(&local_path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(StorageError::unavailable(error)),
        }
    }

    async fn delete(&self, artifact: &Artifact) -> Result<()> {
        let local_path = self.local_path(artifact)?;
        match tokio::fs::remove_file(&local_path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StorageError::unavailable(error)),
        }
    }

    async fn get_url(&self, artifact: &Artifact) -> Result<String> {
        Ok(self.url_for(&artifact.path))
    }

    async fn list(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>> {
        let prefix = filter.prefix();
        let root = if prefix.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(prefix.trim_end_matches('/'))
        };
        match tokio::fs::metadata(&root).await {
            Ok(_) => {}
            // A scope that never published lists as empty.
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(StorageError::unavailable(error)),
        }

        let base_path = self.base_path.clone();
        let hostname = self.hostname.clone();
        tokio::task::spawn_blocking(move || {
            let mut artifacts = Vec::new();
            for entry in WalkDir::new(&root) {
                let entry = entry.map_err(|error| StorageError::unavailable(error))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if name.ends_with(LOCK_SUFFIX) || name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&base_path)
                    .map_err(|error| StorageError::Internal(error.into()))?
                    .to_string_lossy()
                    .into_owned();
                if parse_path(&relative).is_none() {
                    continue;
                }
                let metadata = entry
                    .metadata()
                    .map_err(|error| StorageError::unavailable(error))?;
                let last_update_time = metadata.modified().ok().map(DateTime::<Utc>::from);
                artifacts.push(Artifact {
                    size: Some(metadata.len()),
                    last_update_time,
                    url: format!("http://{hostname}/{relative}"),
                    ..Artifact::from_path(relative)
                });
            }
            Ok(artifacts)
        })
        .await
        .map_err(|join_error| StorageError::Internal(join_error.into()))?
    }

    async fn lock(&self, artifact: &Artifact) -> Result<StoreLock> {
        let lock_path = self.prepare_lock_path(artifact).await?;
        let path = artifact.path.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            let file = open_lock_file(&lock_path, &path)?;
            file.lock_exclusive()
                .map_err(|error| StorageError::unavailable(error))?;
            Ok(file)
        })
        .await
        .map_err(|join_error| StorageError::Internal(join_error.into()))??;

        Ok(StoreLock::from_file(file))
    }

    async fn try_lock(&self, artifact: &Artifact) -> Result<StoreLock> {
        let lock_path = self.prepare_lock_path(artifact).await?;
        let path = artifact.path.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            let file = open_lock_file(&lock_path, &path)?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok(file),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    Err(StorageError::conflict(path))
                }
                Err(error) => Err(StorageError::unavailable(error)),
            }
        })
        .await
        .map_err(|join_error| StorageError::Internal(join_error.into()))??;

        Ok(StoreLock::from_file(file))
    }

    async fn healthy(&self) -> Result<()> {
        tokio::fs::metadata(&self.base_path)
            .await
            .map(|_| ())
            .map_err(|error| StorageError::unavailable(error))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use tokio::io::{AsyncRead, ReadBuf};
    use wharf_core::RetentionPolicy;
    use wharf_test_utils::WithTempDir;

    use super::*;

    async fn new_store() -> WithTempDir<FilesystemStore> {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let inner = FilesystemStore::new(temp_dir.path(), "demo.local", DigestAlgorithm::Sha256)
            .await
            .unwrap();
        WithTempDir { inner, temp_dir }
    }

    fn reader(bytes: &'static [u8]) -> ArtifactReader {
        Box::new(bytes)
    }

    /// Reader that fails partway through, to exercise aborted writes.
    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::other("source stream failed")));
            }
            let chunk = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![0xA5; chunk]);
            self.remaining -= chunk;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn store_sets_digest_size_time_and_url() {
        let store = new_store().await;
        let mut artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        store
            .inner
            .store(&mut artifact, reader(b"hello"))
            .await
            .unwrap();

        assert_eq!(
            artifact.digest.as_deref(),
            Some("sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"),
        );
        assert_eq!(artifact.size, Some(5));
        assert!(artifact.last_update_time.is_some());
        assert_eq!(
            artifact.url,
            "http://demo.local/gitrepository/default/app/rev1.tar.gz",
        );
        assert!(store.inner.exists(&artifact).await.unwrap());

        let mut retrieved = store.inner.retrieve(&artifact).await.unwrap();
        let mut contents = Vec::new();
        retrieved.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"hello");
    }

    #[tokio::test]
    async fn failed_store_leaves_no_partial_object() {
        let store = new_store().await;
        let mut artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        let result = store
            .inner
            .store(&mut artifact, Box::new(FailingReader { remaining: 1024 }))
            .await;

        assert!(result.is_err());
        assert!(!store.inner.exists(&artifact).await.unwrap());
        assert!(artifact.digest.is_none());
        assert!(artifact.size.is_none());
    }

    #[tokio::test]
    async fn store_is_idempotent_under_the_same_path() {
        let store = new_store().await;
        let mut artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        store
            .inner
            .store(&mut artifact, reader(b"first"))
            .await
            .unwrap();
        store
            .inner
            .store(&mut artifact, reader(b"second"))
            .await
            .unwrap();

        let mut retrieved = store.inner.retrieve(&artifact).await.unwrap();
        let mut contents = Vec::new();
        retrieved.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"second");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = new_store().await;
        let mut artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        store
            .inner
            .store(&mut artifact, reader(b"bytes"))
            .await
            .unwrap();

        store.inner.delete(&artifact).await.unwrap();
        assert!(!store.inner.exists(&artifact).await.unwrap());
        store.inner.delete(&artifact).await.unwrap();
    }

    #[tokio::test]
    async fn traversing_paths_are_rejected() {
        let store = new_store().await;
        let mut artifact = Artifact::from_path("../outside/app/rev1.tar.gz");
        let error = store
            .inner
            .store(&mut artifact, reader(b"bytes"))
            .await
            .expect_err("path escapes the root");
        assert!(matches!(error, StorageError::InvalidArtifact(_)));
    }

    #[tokio::test]
    async fn list_skips_lock_files_and_foreign_paths() {
        let store = new_store().await;
        let mut artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        store
            .inner
            .store(&mut artifact, reader(b"bytes"))
            .await
            .unwrap();
        let _lock = store.inner.lock(&artifact).await.unwrap();
        // A file outside any scope should not be listed either.
        std::fs::write(store.temp_dir.path().join("stray.txt"), b"x").unwrap();

        let listed = store
            .inner
            .list(&ArtifactFilter::scope_of(&artifact))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, artifact.path);
        assert_eq!(listed[0].size, Some(5));

        let all = store.inner.list(&ArtifactFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn list_of_unpublished_scope_is_empty() {
        let store = new_store().await;
        let listed = store
            .inner
            .list(&ArtifactFilter::for_scope("gitrepository", "default", "app"))
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn garbage_collect_honors_max_records_and_keeps_newest() {
        let store = new_store().await;
        for revision in ["rev1", "rev2", "rev3"] {
            let mut artifact = Artifact::for_resource(
                "GitRepository",
                "default",
                "app",
                revision,
                &format!("{revision}.tar.gz"),
            );
            store
                .inner
                .store(&mut artifact, reader(b"bytes"))
                .await
                .unwrap();
            // Distinct modification times keep the ordering unambiguous.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let filter = ArtifactFilter::for_scope("gitrepository", "default", "app");
        let policy = RetentionPolicy {
            ttl: Duration::from_secs(3600),
            max_records: 2,
        };
        let deleted = store
            .inner
            .garbage_collect(&filter, policy, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(deleted, vec!["gitrepository/default/app/rev1.tar.gz"]);

        let remaining = store.inner.list(&filter).await.unwrap();
        let mut paths: Vec<_> = remaining.iter().map(|a| a.path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(
            paths,
            vec![
                "gitrepository/default/app/rev2.tar.gz",
                "gitrepository/default/app/rev3.tar.gz",
            ],
        );
    }

    #[tokio::test]
    async fn garbage_collect_keeps_expired_sole_survivor() {
        let store = new_store().await;
        let mut artifact =
            Artifact::for_resource("GitRepository", "default", "app", "rev1", "rev1.tar.gz");
        store
            .inner
            .store(&mut artifact, reader(b"bytes"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let filter = ArtifactFilter::scope_of(&artifact);
        let policy = RetentionPolicy {
            ttl: Duration::from_millis(10),
            max_records: 5,
        };
        let deleted = store
            .inner
            .garbage_collect(&filter, policy, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(deleted.is_empty());
        assert!(store.inner.exists(&artifact).await.unwrap());
    }

    #[tokio::test]
    async fn remove_all_clears_the_scope() {
        let store = new_store().await;
        for revision in ["rev1", "rev2"] {
            let mut artifact = Artifact::for_resource(
                "GitRepository",
                "default",
                "app",
                revision,
                &format!("{revision}.tar.gz"),
            );
            store
                .inner
                .store(&mut artifact, reader(b"bytes"))
                .await
                .unwrap();
        }

        let filter = ArtifactFilter::for_scope("gitrepository", "default", "app");
        assert_eq!(store.inner.remove_all(&filter).await.unwrap(), 2);
        assert!(store.inner.list(&filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn try_lock_conflicts_while_held() {
        let store = new_store().await;
        let artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");

        let guard = store.inner.lock(&artifact).await.unwrap();
        let error = store
            .inner
            .try_lock(&artifact)
            .await
            .expect_err("lock is held");
        assert!(matches!(error, StorageError::Conflict { .. }));

        drop(guard);
        let _guard = store.inner.try_lock(&artifact).await.unwrap();
    }

    #[tokio::test]
    async fn garbage_collect_steps_around_locked_artifacts() {
        let store = new_store().await;
        for revision in ["rev1", "rev2", "rev3"] {
            let mut artifact = Artifact::for_resource(
                "GitRepository",
                "default",
                "app",
                revision,
                &format!("{revision}.tar.gz"),
            );
            store
                .inner
                .store(&mut artifact, reader(b"bytes"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let oldest = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        let guard = store.inner.lock(&oldest).await.unwrap();

        let filter = ArtifactFilter::for_scope("gitrepository", "default", "app");
        let policy = RetentionPolicy {
            ttl: Duration::from_secs(3600),
            max_records: 1,
        };
        let deleted = store
            .inner
            .garbage_collect(&filter, policy, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(deleted, vec!["gitrepository/default/app/rev2.tar.gz"]);
        assert!(store.inner.exists(&oldest).await.unwrap());

        // Released artifacts are collected on the next run.
        drop(guard);
        let deleted = store
            .inner
            .garbage_collect(&filter, policy, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(deleted, vec!["gitrepository/default/app/rev1.tar.gz"]);
    }

    #[tokio::test]
    async fn lock_creates_sibling_lock_file() {
        let store = new_store().await;
        let artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        let guard = store.inner.lock(&artifact).await.unwrap();
        assert!(store
            .temp_dir
            .path()
            .join("gitrepository/default/app/rev1.tar.gz.lock")
            .exists());
        drop(guard);

        // Re-acquiring after release succeeds.
        let _guard = store.inner.lock(&artifact).await.unwrap();
    }

    #[tokio::test]
    async fn archive_and_copy_to_path_round_trip() {
        let store = new_store().await;
        let source = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(source.path().join("sub")).unwrap();
        std::fs::write(source.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(source.path().join("sub/b.txt"), b"beta").unwrap();
        std::fs::write(source.path().join("skip.tmp"), b"noise").unwrap();

        let mut artifact =
            Artifact::for_resource("GitRepository", "default", "app", "rev1", "rev1.tar.gz");
        let filter: crate::archive::ArchiveFilter =
            Box::new(|path, _is_dir| path.extension().is_some_and(|ext| ext == "tmp"));
        store
            .inner
            .archive(&mut artifact, source.path(), Some(filter))
            .await
            .unwrap();
        assert!(artifact.digest.as_deref().unwrap().starts_with("sha256:"));
        assert!(artifact.size.unwrap() > 0);

        let restored = tempfile::TempDir::new().unwrap();
        store
            .inner
            .copy_to_path(&artifact, "", restored.path())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(restored.path().join("a.txt")).unwrap(),
            b"alpha"
        );
        assert_eq!(
            std::fs::read(restored.path().join("sub/b.txt")).unwrap(),
            b"beta"
        );
        assert!(!restored.path().join("skip.tmp").exists());
    }

    #[tokio::test]
    async fn copy_from_path_stores_file_contents() {
        let store = new_store().await;
        let source = tempfile::TempDir::new().unwrap();
        let file_path = source.path().join("index.yaml");
        std::fs::write(&file_path, b"entries: {}\n").unwrap();

        let mut artifact =
            Artifact::for_resource("HelmRepository", "default", "repo", "rev1", "index.yaml");
        store
            .inner
            .copy_from_path(&mut artifact, &file_path)
            .await
            .unwrap();
        assert_eq!(artifact.size, Some(12));
        assert!(store.inner.exists(&artifact).await.unwrap());
    }
}
