// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Streaming digest pipeline for stored artifact bytes.

use std::{fmt, io, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use thiserror::Error;

/// The hash algorithm used for artifact digests.
///
/// The algorithm is a process-wide choice fixed at startup. Changing it
/// invalidates every previously recorded digest and must be rolled out as a
/// redeployment; per-artifact algorithms are deliberately not supported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256, the default.
    #[default]
    Sha256,
    /// SHA-512.
    Sha512,
}

impl DigestAlgorithm {
    /// The canonical lower-case name, used as the digest prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Creates a fresh digester for this algorithm.
    pub fn digester(self) -> Digester {
        Digester::new(self)
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unsupported digest algorithm name.
#[derive(Debug, Error)]
#[error("unsupported digest algorithm: {0}")]
pub struct UnknownAlgorithmError(String);

impl FromStr for DigestAlgorithm {
    type Err = UnknownAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(UnknownAlgorithmError(other.to_owned())),
        }
    }
}

/// A write sink that hashes and counts every byte passing through it.
///
/// Backends tee stored bytes into a digester while writing them out, so the
/// digest and size recorded on an artifact always describe exactly the bytes
/// that were persisted.
pub struct Digester {
    algorithm: DigestAlgorithm,
    state: State,
    bytes: u64,
}

enum State {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    fn new(algorithm: DigestAlgorithm) -> Self {
        let state = match algorithm {
            DigestAlgorithm::Sha256 => State::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => State::Sha512(Sha512::new()),
        };
        Self {
            algorithm,
            state,
            bytes: 0,
        }
    }

    /// Feeds bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::Sha256(hasher) => hasher.update(data),
            State::Sha512(hasher) => hasher.update(data),
        }
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed into the digester so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Consumes the digester and returns the digest as `<algorithm>:<hex>`.
    pub fn finalize(self) -> String {
        let hex = match self.state {
            State::Sha256(hasher) => hex::encode(hasher.finalize()),
            State::Sha512(hasher) => hex::encode(hasher.finalize()),
        };
        format!("{}:{hex}", self.algorithm)
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digester")
            .field("algorithm", &self.algorithm)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl io::Write for Digester {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use wharf_test_utils::param_test;

    use super::*;

    param_test! {
        algorithm_round_trips_through_names: [
            sha256: ("sha256", DigestAlgorithm::Sha256),
            sha256_mixed_case: ("SHA256", DigestAlgorithm::Sha256),
            sha512: ("sha512", DigestAlgorithm::Sha512),
        ]
    }
    fn algorithm_round_trips_through_names(name: &str, expected: DigestAlgorithm) {
        let parsed: DigestAlgorithm = name.parse().expect("known algorithm");
        assert_eq!(parsed, expected);
        assert_eq!(expected.as_str(), expected.to_string());
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!("md5".parse::<DigestAlgorithm>().is_err());
    }

    #[test]
    fn digester_matches_known_sha256() {
        let mut digester = DigestAlgorithm::Sha256.digester();
        digester.update(b"hello");
        assert_eq!(digester.bytes_written(), 5);
        assert_eq!(
            digester.finalize(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        );
    }

    #[test]
    fn digester_is_incremental() {
        let mut whole = DigestAlgorithm::Sha256.digester();
        whole.update(b"hello world");

        let mut chunked = DigestAlgorithm::Sha256.digester();
        chunked.update(b"hello ");
        chunked.update(b"world");

        assert_eq!(whole.finalize(), chunked.finalize());
    }

    #[test]
    fn digester_acts_as_write_sink() {
        let mut digester = DigestAlgorithm::Sha512.digester();
        digester.write_all(b"hello").expect("infallible sink");
        assert!(digester.finalize().starts_with("sha512:"));
    }
}
