// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Error type shared by all storage backends.

use std::io;

use thiserror::Error;

/// A result type whose error defaults to [`StorageError`].
pub type Result<T, E = StorageError> = std::result::Result<T, E>;

/// Errors surfaced by storage backends and the operations built on them.
///
/// Backends preserve the original cause where one exists; the artifact server
/// maps these onto HTTP statuses and reconcilers decide retryability from the
/// variant alone.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The referenced artifact does not exist in the backend.
    #[error("artifact not found: {path}")]
    NotFound {
        /// The backend-relative artifact path.
        path: String,
    },

    /// The artifact is exclusively held by a concurrent lock holder. Surfaced
    /// by non-blocking lock attempts; publication never reports it because
    /// paths are revision-fresh.
    #[error("conflicting concurrent access to artifact: {path}")]
    Conflict {
        /// The backend-relative artifact path.
        path: String,
    },

    /// The artifact descriptor is malformed, e.g. an empty or traversing path.
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    /// The backend could not be reached or failed mid-operation. Transient.
    #[error("storage backend unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// The operation ran past its deadline or was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The storage configuration is invalid. Only surfaced at startup.
    #[error("invalid storage configuration: {0}")]
    Config(String),

    /// An unexpected internal error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StorageError {
    /// Creates a [`StorageError::NotFound`] for the given artifact path.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates a [`StorageError::Conflict`] for the given artifact path.
    pub fn conflict(path: impl Into<String>) -> Self {
        Self::Conflict { path: path.into() }
    }

    /// Creates a [`StorageError::InvalidArtifact`] with the given reason.
    pub fn invalid_artifact(reason: impl Into<String>) -> Self {
        Self::InvalidArtifact(reason.into())
    }

    /// Creates a [`StorageError::Unavailable`] wrapping the underlying cause.
    pub fn unavailable(cause: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable(cause.into())
    }

    /// Creates a [`StorageError::Config`] with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Whether this error means the artifact does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Maps an I/O error observed while operating on `path`, folding
    /// `ErrorKind::NotFound` into [`StorageError::NotFound`].
    pub(crate) fn from_io(error: io::Error, path: &str) -> Self {
        if error.kind() == io::ErrorKind::NotFound {
            Self::not_found(path)
        } else {
            Self::unavailable(error)
        }
    }
}
