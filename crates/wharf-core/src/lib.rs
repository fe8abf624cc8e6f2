// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Core model for the wharf artifact store.
//!
//! This crate defines the [`Artifact`] descriptor shared by every storage
//! backend, the path algebra used to address artifacts, and the digest
//! pipeline through which all stored bytes flow.

pub mod artifact;
pub mod digest;

pub use artifact::{
    artifact_path,
    parse_path,
    Artifact,
    ArtifactFilter,
    ArtifactPathParts,
    RetentionPolicy,
};
pub use digest::{DigestAlgorithm, Digester, UnknownAlgorithmError};
