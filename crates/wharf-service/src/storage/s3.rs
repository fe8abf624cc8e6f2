// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! S3-compatible object store backend.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt as _, TryStreamExt as _};
use http::Method;
use object_store::{
    aws::{AmazonS3, AmazonS3Builder},
    path::Path as ObjectPath,
    signer::Signer as _,
    Attribute, Attributes, ObjectStore as _, PutOptions, PutPayload,
};
use tokio::io::AsyncReadExt as _;
use tokio_util::io::StreamReader;
use wharf_core::{Artifact, ArtifactFilter, DigestAlgorithm};

use crate::{
    config::S3Config,
    error::{Result, StorageError},
    storage::{ArtifactReader, ArtifactStore, StoreLock},
};

/// Reserved key prefix probed by health checks and excluded from listings.
const HEALTH_PREFIX: &str = ".health";

/// Storage backend keeping artifacts in an S3-compatible bucket.
///
/// Keys are the artifact paths below a configured prefix; the prefix is never
/// part of the caller-visible path. Uploads are single-request puts, so the
/// bucket's last-writer-wins semantics provide the atomicity the contract
/// requires. Locks are process-local only; publication relies on
/// revision-fresh paths rather than cross-replica exclusion.
pub struct S3Store {
    client: AmazonS3,
    bucket: String,
    prefix: String,
    url_expiration: Duration,
    algorithm: DigestAlgorithm,
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("url_expiration", &self.url_expiration)
            .finish()
    }
}

impl S3Store {
    /// Creates the backend and probes the bucket, failing fast when it is
    /// missing or unreachable. Credentials are taken from the environment.
    pub async fn new(config: &S3Config, algorithm: DigestAlgorithm) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(config.bucket.as_str())
            .with_region(config.region.as_str());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint.as_str());
            if endpoint.starts_with("http://") {
                builder = builder.with_allow_http(true);
            }
        }
        if config.force_path_style {
            builder = builder.with_virtual_hosted_style_request(false);
        }
        let client = builder.build().map_err(|error| {
            StorageError::config(format!("cannot initialize the S3 client: {error}"))
        })?;

        let store = Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_end_matches('/').to_owned(),
            url_expiration: config.url_expiration,
            algorithm,
            locks: tokio::sync::Mutex::new(HashMap::new()),
        };
        store.healthy().await.map_err(|error| {
            StorageError::config(format!(
                "bucket {} is not accessible: {error}",
                store.bucket
            ))
        })?;
        Ok(store)
    }

    fn object_path(&self, path: &str) -> ObjectPath {
        ObjectPath::from(object_key(&self.prefix, path))
    }

    /// The process-local mutex guarding the artifact's key.
    async fn scope_mutex(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = object_key(&self.prefix, path);
        let mut locks = self.locks.lock().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Maps backend errors for an operation on `path`, folding missing keys
    /// into [`StorageError::NotFound`] with the caller-visible path.
    fn map_error(&self, error: object_store::Error, path: &str) -> StorageError {
        match error {
            object_store::Error::NotFound { .. } => StorageError::not_found(path),
            other => StorageError::unavailable(other),
        }
    }
}

/// Joins the configured key prefix and an artifact path into an object key.
fn object_key(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_owned()
    } else {
        format!("{prefix}/{path}")
    }
}

/// Strips the configured key prefix from a listed object key, recovering the
/// caller-visible artifact path.
fn strip_key_prefix<'a>(prefix: &str, key: &'a str) -> &'a str {
    if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key)
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn store(&self, artifact: &mut Artifact, mut reader: ArtifactReader) -> Result<()> {
        if artifact.path.is_empty() {
            return Err(StorageError::invalid_artifact("artifact path is empty"));
        }

        // Buffer the full archive so the upload is a single request and the
        // object becomes visible all at once.
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await.map_err(|error| {
            StorageError::Internal(
                anyhow::Error::new(error).context("failed to read artifact content"),
            )
        })?;

        let mut digester = self.algorithm.digester();
        digester.update(&buffer);
        let size = digester.bytes_written();
        let digest = digester.finalize();

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, "application/gzip".into());
        attributes.insert(Attribute::Metadata("digest".into()), digest.clone().into());
        attributes.insert(
            Attribute::Metadata("revision".into()),
            artifact.revision.clone().into(),
        );
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        let location = self.object_path(&artifact.path);
        self.client
            .put_opts(&location, PutPayload::from(Bytes::from(buffer)), options)
            .await
            .map_err(|error| self.map_error(error, &artifact.path))?;

        artifact.digest = Some(digest);
        artifact.size = Some(size);
        // Object stores do not report the committed timestamp on put.
        artifact.last_update_time = Some(Utc::now());
        artifact.url = self.get_url(artifact).await?;
        tracing::debug!(
            path = %artifact.path,
            bucket = %self.bucket,
            size,
            "stored artifact in the object store",
        );
        Ok(())
    }

    async fn retrieve(&self, artifact: &Artifact) -> Result<ArtifactReader> {
        let location = self.object_path(&artifact.path);
        let result = self
            .client
            .get(&location)
            .await
            .map_err(|error| self.map_error(error, &artifact.path))?;
        let stream = result.into_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn exists(&self, artifact: &Artifact) -> Result<bool> {
        let location = self.object_path(&artifact.path);
        match self.client.head(&location).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(StorageError::unavailable(error)),
        }
    }

    async fn delete(&self, artifact: &Artifact) -> Result<()> {
        let location = self.object_path(&artifact.path);
        match self.client.delete(&location).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(error) => Err(StorageError::unavailable(error)),
        }
    }

    async fn get_url(&self, artifact: &Artifact) -> Result<String> {
        let location = self.object_path(&artifact.path);
        let url = self
            .client
            .signed_url(Method::GET, &location, self.url_expiration)
            .await
            .map_err(|error| StorageError::unavailable(error))?;
        Ok(url.to_string())
    }

    async fn list(&self, filter: &ArtifactFilter) -> Result<Vec<Artifact>> {
        let key_prefix = object_key(&self.prefix, filter.prefix().trim_end_matches('/'));
        let key_prefix = key_prefix.trim_end_matches('/');
        let list_prefix = (!key_prefix.is_empty()).then(|| ObjectPath::from(key_prefix));

        let mut stream = self.client.list(list_prefix.as_ref());
        let mut artifacts = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|error| StorageError::unavailable(error))?;
            let key = meta.location.to_string();
            let path = strip_key_prefix(&self.prefix, &key);
            if path.starts_with(HEALTH_PREFIX) {
                continue;
            }
            artifacts.push(Artifact {
                size: Some(meta.size as u64),
                last_update_time: Some(meta.last_modified),
                ..Artifact::from_path(path)
            });
        }
        Ok(artifacts)
    }

    async fn lock(&self, artifact: &Artifact) -> Result<StoreLock> {
        let guard = self.scope_mutex(&artifact.path).await.lock_owned().await;
        Ok(StoreLock::from_local(guard))
    }

    async fn try_lock(&self, artifact: &Artifact) -> Result<StoreLock> {
        match self.scope_mutex(&artifact.path).await.try_lock_owned() {
            Ok(guard) => Ok(StoreLock::from_local(guard)),
            Err(_) => Err(StorageError::conflict(artifact.path.clone())),
        }
    }

    async fn healthy(&self) -> Result<()> {
        let health_prefix = self.object_path(HEALTH_PREFIX);
        let mut stream = self.client.list(Some(&health_prefix));
        // A single bounded page proves the round-trip; an empty listing is
        // healthy.
        match stream.next().await {
            Some(Err(error)) => Err(StorageError::unavailable(error)),
            _ => Ok(()),
        }
    }

    fn supports_redirect(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use wharf_test_utils::param_test;

    use super::*;

    param_test! {
        object_keys_prepend_the_prefix: [
            no_prefix: ("", "gitrepository/default/app/rev1.tar.gz",
                "gitrepository/default/app/rev1.tar.gz"),
            with_prefix: ("flux", "gitrepository/default/app/rev1.tar.gz",
                "flux/gitrepository/default/app/rev1.tar.gz"),
            nested_prefix: ("team/flux", "bucket/ns/n/rev.tar.gz",
                "team/flux/bucket/ns/n/rev.tar.gz"),
        ]
    }
    fn object_keys_prepend_the_prefix(prefix: &str, path: &str, expected: &str) {
        assert_eq!(object_key(prefix, path), expected);
    }

    param_test! {
        stripping_recovers_the_artifact_path: [
            no_prefix: ("", "gitrepository/default/app/rev1.tar.gz",
                "gitrepository/default/app/rev1.tar.gz"),
            with_prefix: ("flux", "flux/gitrepository/default/app/rev1.tar.gz",
                "gitrepository/default/app/rev1.tar.gz"),
            foreign_key_is_untouched: ("flux", "other/key", "other/key"),
        ]
    }
    fn stripping_recovers_the_artifact_path(prefix: &str, key: &str, expected: &str) {
        assert_eq!(strip_key_prefix(prefix, key), expected);
    }

    #[test]
    fn key_round_trip_is_lossless() {
        let path = "helmchart/team-a/podinfo/podinfo-6.3.5.tgz";
        let key = object_key("some/prefix", path);
        assert_eq!(strip_key_prefix("some/prefix", &key), path);
    }
}
