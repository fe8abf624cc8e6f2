// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Retention policy evaluation over artifact listings.

use chrono::{DateTime, Utc};
use wharf_core::{Artifact, RetentionPolicy};

/// Selects the artifacts of one scope that the policy marks for deletion.
///
/// Artifacts are ordered newest first by `last_update_time`, ties broken by
/// path. An artifact is marked when its age exceeds the TTL or its position
/// falls outside `max_records`. The newest artifact is never marked, so a
/// scope that has ever published keeps at least one serveable artifact.
///
/// Artifacts without a recorded update time sort as oldest.
pub fn evaluate(
    mut artifacts: Vec<Artifact>,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<Artifact> {
    artifacts.sort_by(|a, b| {
        b.last_update_time
            .cmp(&a.last_update_time)
            .then_with(|| a.path.cmp(&b.path))
    });

    artifacts
        .into_iter()
        .enumerate()
        .filter(|(position, artifact)| {
            if *position == 0 {
                return false;
            }
            if *position >= policy.max_records {
                return true;
            }
            match artifact.last_update_time {
                Some(updated) => {
                    let age = now.signed_duration_since(updated);
                    age.to_std().map_or(false, |age| age > policy.ttl)
                }
                None => true,
            }
        })
        .map(|(_, artifact)| artifact)
        .collect()
}
