// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Artifact storage node entry point.
//!
//! Runs the artifact server on top of the configured storage backend. The
//! server runs on every replica; readiness follows backend health, not leader
//! election, so replicas never coordinate to serve.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use wharf_core::DigestAlgorithm;
use wharf_service::{
    config::{FilesystemConfig, S3Config, StorageConfig},
    server::ArtifactServer,
    storage, telemetry, BackendKind,
};

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_BIN_NAME"),
    about = "Artifact storage node of the wharf source controller",
    version,
    rename_all = "kebab-case",
)]
struct Args {
    /// Path to a YAML storage configuration. When set, the storage flags
    /// below are ignored.
    #[arg(long)]
    config: Option<PathBuf>,
    /// The storage backend type.
    #[arg(long, env = "STORAGE_BACKEND", default_value = "filesystem", value_enum)]
    storage_backend: BackendKind,
    /// The address the artifact server binds to.
    #[arg(long, env = "STORAGE_ADDR", default_value = "0.0.0.0:9090")]
    storage_addr: SocketAddr,
    /// The advertised address of the artifact server, used to stamp
    /// filesystem artifact URLs. Derived from the bind address when unset.
    #[arg(long, env = "STORAGE_ADV_ADDR")]
    storage_adv_addr: Option<String>,
    /// The local storage path (required when the backend is filesystem).
    #[arg(long, env = "STORAGE_PATH")]
    storage_path: Option<PathBuf>,
    /// The duration that artifacts from previous reconciliations are kept in
    /// storage before being garbage collected.
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    artifact_retention_ttl: Duration,
    /// The maximum number of artifacts kept in storage per resource after a
    /// garbage collection.
    #[arg(long, default_value_t = 2)]
    artifact_retention_records: usize,
    /// The algorithm used to calculate the digest of artifacts.
    #[arg(long, default_value = "sha256")]
    artifact_digest_algo: DigestAlgorithm,
    /// The S3 bucket name (required when the backend is s3).
    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: Option<String>,
    /// The S3 key prefix for artifacts.
    #[arg(long, env = "S3_PREFIX", default_value = "")]
    s3_prefix: String,
    /// The S3 region.
    #[arg(long, env = "S3_REGION", default_value = "us-east-1")]
    s3_region: String,
    /// A custom S3 endpoint, for MinIO and other S3-compatible stores.
    #[arg(long, env = "S3_ENDPOINT")]
    s3_endpoint: Option<String>,
    /// Force S3 path-style addressing (required for MinIO).
    #[arg(long)]
    s3_force_path_style: bool,
    /// Lifetime of the presigned S3 URLs handed to clients.
    #[arg(long, default_value = "15m", value_parser = humantime::parse_duration)]
    s3_url_expiration: Duration,
    /// The address the metrics endpoint binds to.
    #[arg(long, env = "METRICS_ADDR", default_value = "127.0.0.1:9184")]
    metrics_addr: SocketAddr,
}

impl Args {
    fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            backend: self.storage_backend,
            hostname: self
                .storage_adv_addr
                .clone()
                .unwrap_or_else(|| determine_adv_storage_addr(&self.storage_addr)),
            retention_ttl: self.artifact_retention_ttl,
            retention_records: self.artifact_retention_records,
            digest_algorithm: self.artifact_digest_algo,
            filesystem: self.storage_path.clone().map(|base_path| FilesystemConfig {
                base_path,
            }),
            s3: self.s3_bucket.clone().map(|bucket| S3Config {
                bucket,
                prefix: self.s3_prefix.clone(),
                region: self.s3_region.clone(),
                endpoint: self.s3_endpoint.clone(),
                force_path_style: self.s3_force_path_style,
                url_expiration: self.s3_url_expiration,
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => StorageConfig::load(path)?,
        None => args.storage_config(),
    };

    let store = storage::new_store(&config)
        .await
        .context("unable to initialise the storage provider")?;
    tracing::info!(
        backend = %storage::describe_backend(&config),
        retention_ttl = ?config.retention_ttl,
        retention_records = config.retention_records,
        digest_algorithm = %config.digest_algorithm,
        "storage provider initialised",
    );

    let registry = Registry::new();
    let metrics_listener = tokio::net::TcpListener::bind(args.metrics_addr)
        .await
        .with_context(|| format!("cannot bind metrics address {}", args.metrics_addr))?;
    telemetry::start_prometheus_server(metrics_listener, registry.clone());
    tracing::info!(address = %args.metrics_addr, "started Prometheus HTTP endpoint");

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_token.cancel();
    });

    let server = ArtifactServer::new(store, cancel_token, &registry);
    server
        .run(&args.storage_addr)
        .await
        .context("artifact server error")?;
    Ok(())
}

/// Derives the advertised address from the bind address, replacing wildcard
/// hosts with the `HOSTNAME` environment variable or this machine's hostname.
fn determine_adv_storage_addr(storage_addr: &SocketAddr) -> String {
    let host = if storage_addr.ip().is_unspecified() {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|host| !host.is_empty())
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|name| name.into_string().ok())
                    .filter(|host| !host.is_empty())
            })
            .unwrap_or_else(|| "localhost".to_owned())
    } else {
        storage_addr.ip().to_string()
    };
    format!("{host}:{}", storage_addr.port())
}
