// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Artifact storage and serving for a GitOps source controller.
//!
//! This crate produces content-addressed tar+gzip archives from fetched
//! source trees, persists them in a pluggable backend (local filesystem or an
//! S3-compatible object store), garbage-collects stale revisions, and serves
//! the stored artifacts over HTTP from every replica.

pub mod archive;
pub mod config;
pub mod error;
pub mod retention;
pub mod server;
pub mod storage;
pub mod telemetry;

pub use config::{BackendKind, FilesystemConfig, S3Config, StorageConfig};
pub use error::StorageError;
pub use server::ArtifactServer;
pub use storage::{new_store, ArtifactStore, FilesystemStore, S3Store, StoreLock};
