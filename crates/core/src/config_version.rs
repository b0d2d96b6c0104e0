// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration version reference.

use crate::workspace::WorkspaceId;
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier for an uploaded configuration version.
    pub struct ConfigVersionId("cv");
}

crate::define_id! {
    /// Handle on the uploaded tarball in the artifact store.
    pub struct ArtifactId("art");
}

/// Minimal mirror of a configuration version owned by the artifact store.
/// The tarball itself is opaque and only reachable through `artifact`;
/// scheduling looks at nothing but ownership and speculative-ness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub id: ConfigVersionId,
    pub workspace_id: WorkspaceId,
    /// Runs created from a speculative version default to plan-only
    #[serde(default)]
    pub speculative: bool,
    /// Content to unpack into the workdir. None runs against an empty one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactId>,
    pub created_at_ms: u64,
}

impl ConfigVersion {
    pub fn new(id: ConfigVersionId, workspace_id: WorkspaceId, created_at_ms: u64) -> Self {
        Self {
            id,
            workspace_id,
            speculative: false,
            artifact: None,
            created_at_ms,
        }
    }

    pub fn speculative(mut self) -> Self {
        self.speculative = true;
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactId) -> Self {
        self.artifact = Some(artifact);
        self
    }
}
