// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! The artifact descriptor and its path algebra.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A versioned, content-addressed blob representing one revision of a source
/// resource.
///
/// The backend exclusively owns the stored bytes; callers own this descriptor
/// and persist it in their own status store. [`Artifact::digest`] and
/// [`Artifact::size`] are only set once the object is fully persisted, so a
/// descriptor with both present always refers to a complete object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Backend-relative key of the form `<kind>/<namespace>/<name>/<file name>`,
    /// with the kind lower-cased.
    pub path: String,
    /// Opaque producer-supplied revision, e.g. a commit SHA or chart version.
    pub revision: String,
    /// Digest of the stored bytes as `<algorithm>:<hex>`, computed at write
    /// time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Byte length of the stored bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Modification time observed on the backend, never producer-supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    /// Externally reachable URL stamped by the backend on publication.
    #[serde(default)]
    pub url: String,
}

impl Artifact {
    /// Creates the descriptor for one revision of the identified resource.
    ///
    /// The path is derived from the resource coordinates; all remaining fields
    /// are filled in by the backend when the artifact is stored.
    pub fn for_resource(
        kind: &str,
        namespace: &str,
        name: &str,
        revision: &str,
        file_name: &str,
    ) -> Self {
        Self {
            path: artifact_path(kind, namespace, name, file_name),
            revision: revision.to_owned(),
            ..Self::default()
        }
    }

    /// Creates a descriptor referring to an existing object by path only.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Splits the path into its scope and file name components, if the path is
    /// scope-qualified.
    pub fn parts(&self) -> Option<ArtifactPathParts> {
        parse_path(&self.path)
    }

    /// Returns true once digest and size have been recorded, i.e. the object
    /// behind this descriptor was fully persisted at some point.
    pub fn is_persisted(&self) -> bool {
        self.digest.is_some() && self.size.is_some()
    }
}

/// Joins resource coordinates into a backend-relative artifact path.
///
/// Forward slashes are used on every backend and the kind is lower-cased, so
/// the same resource always maps to the same key regardless of the platform
/// the controller runs on.
pub fn artifact_path(kind: &str, namespace: &str, name: &str, file_name: &str) -> String {
    format!("{}/{namespace}/{name}/{file_name}", kind.to_lowercase())
}

/// The `(kind, namespace, name, file name)` components of an artifact path.
///
/// The first three components form the resource scope grouping all revisions
/// of one source resource. File names may themselves contain separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPathParts {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub file_name: String,
}

/// Parses an artifact path by splitting on `/` and discarding empty segments.
///
/// Returns `None` when fewer than four segments remain; such paths are not
/// scope-qualified and are only usable as listing prefixes.
pub fn parse_path(path: &str) -> Option<ArtifactPathParts> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 4 {
        return None;
    }
    Some(ArtifactPathParts {
        kind: segments[0].to_owned(),
        namespace: segments[1].to_owned(),
        name: segments[2].to_owned(),
        file_name: segments[3..].join("/"),
    })
}

/// Scope criteria selecting artifacts for listing and garbage collection.
///
/// Narrower fields only take effect when the broader ones are set: a name
/// without a kind and namespace does not constrain the selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactFilter {
    /// Resource kind, matched lower-cased.
    pub kind: Option<String>,
    /// Resource namespace.
    pub namespace: Option<String>,
    /// Resource name.
    pub name: Option<String>,
}

impl ArtifactFilter {
    /// Filter selecting every artifact of one resource.
    pub fn for_scope(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: Some(kind.to_owned()),
            namespace: Some(namespace.to_owned()),
            name: Some(name.to_owned()),
        }
    }

    /// Filter selecting every revision in the same scope as `artifact`.
    ///
    /// Falls back to an unconstrained filter when the artifact path is not
    /// scope-qualified.
    pub fn scope_of(artifact: &Artifact) -> Self {
        match artifact.parts() {
            Some(parts) => Self::for_scope(&parts.kind, &parts.namespace, &parts.name),
            None => Self::default(),
        }
    }

    /// The path prefix implied by this filter, with a trailing separator when
    /// non-empty.
    pub fn prefix(&self) -> String {
        let mut prefix = String::new();
        if let Some(kind) = &self.kind {
            prefix.push_str(&kind.to_lowercase());
            prefix.push('/');
            if let Some(namespace) = &self.namespace {
                prefix.push_str(namespace);
                prefix.push('/');
                if let Some(name) = &self.name {
                    prefix.push_str(name);
                    prefix.push('/');
                }
            }
        }
        prefix
    }

    /// Whether the given artifact path falls under this filter's prefix.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix())
    }
}

/// Age and count bounds applied to one scope when garbage collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Artifacts older than this become eligible for deletion.
    pub ttl: Duration,
    /// Number of most recent artifacts retained regardless of age. The newest
    /// artifact in a scope is always retained, even when this is zero.
    pub max_records: usize,
}

#[cfg(test)]
mod tests {
    use wharf_test_utils::param_test;

    use super::*;

    param_test! {
        artifact_path_joins_and_lowercases: [
            plain: ("GitRepository", "default", "app", "rev1.tar.gz",
                "gitrepository/default/app/rev1.tar.gz"),
            already_lower: ("bucket", "flux-system", "assets", "latest.tar.gz",
                "bucket/flux-system/assets/latest.tar.gz"),
        ]
    }
    fn artifact_path_joins_and_lowercases(
        kind: &str,
        namespace: &str,
        name: &str,
        file_name: &str,
        expected: &str,
    ) {
        assert_eq!(artifact_path(kind, namespace, name, file_name), expected);
    }

    param_test! {
        parse_path_rejects_short_paths: [
            empty: (""),
            one: ("gitrepository"),
            two: ("gitrepository/default"),
            three: ("gitrepository/default/app"),
            three_with_noise: ("//gitrepository//default/app/"),
        ]
    }
    fn parse_path_rejects_short_paths(path: &str) {
        assert_eq!(parse_path(path), None);
    }

    #[test]
    fn parse_path_discards_empty_segments() {
        let parts = parse_path("/gitrepository//default/app/rev1.tar.gz").expect("four segments");
        assert_eq!(parts.kind, "gitrepository");
        assert_eq!(parts.namespace, "default");
        assert_eq!(parts.name, "app");
        assert_eq!(parts.file_name, "rev1.tar.gz");
    }

    #[test]
    fn parse_path_keeps_multi_segment_file_names() {
        let parts = parse_path("helmchart/team-a/podinfo/charts/podinfo-6.3.5.tgz")
            .expect("five segments");
        assert_eq!(parts.file_name, "charts/podinfo-6.3.5.tgz");
    }

    #[test]
    fn for_resource_builds_scoped_path() {
        let artifact = Artifact::for_resource("GitRepository", "default", "app", "abc123", "abc123.tar.gz");
        assert_eq!(artifact.path, "gitrepository/default/app/abc123.tar.gz");
        assert_eq!(artifact.revision, "abc123");
        assert!(!artifact.is_persisted());
    }

    param_test! {
        filter_prefix_nests: [
            unconstrained: (None, None, None, ""),
            kind_only: (Some("GitRepository"), None, None, "gitrepository/"),
            kind_and_namespace: (Some("bucket"), Some("default"), None, "bucket/default/"),
            full_scope: (Some("bucket"), Some("default"), Some("assets"), "bucket/default/assets/"),
            namespace_without_kind: (None, Some("default"), Some("assets"), ""),
        ]
    }
    fn filter_prefix_nests(
        kind: Option<&str>,
        namespace: Option<&str>,
        name: Option<&str>,
        expected: &str,
    ) {
        let filter = ArtifactFilter {
            kind: kind.map(str::to_owned),
            namespace: namespace.map(str::to_owned),
            name: name.map(str::to_owned),
        };
        assert_eq!(filter.prefix(), expected);
    }

    #[test]
    fn scope_filter_matches_only_its_scope() {
        let artifact = Artifact::from_path("gitrepository/default/app/rev1.tar.gz");
        let filter = ArtifactFilter::scope_of(&artifact);
        assert!(filter.matches("gitrepository/default/app/rev2.tar.gz"));
        assert!(!filter.matches("gitrepository/default/other/rev1.tar.gz"));
    }
}
