// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Configuration tarballs held by the artifact collaborator
//!
//! The scheduler only sees a `ConfigVersion`'s `ArtifactId`. Runners fetch
//! the bytes behind it just before a phase starts.

use crate::error::EngineError;
use async_trait::async_trait;
use ot_core::{ArtifactId, IdGen};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Stores and serves configuration tarballs
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    async fn put(&self, bytes: Vec<u8>) -> Result<ArtifactId, EngineError>;

    /// None when nothing was stored under `id`
    async fn fetch(&self, id: &ArtifactId) -> Result<Option<Vec<u8>>, EngineError>;
}

/// Tarballs kept in memory; the default when no directory is configured
pub struct MemoryArtifacts {
    ids: Arc<dyn IdGen>,
    blobs: Mutex<HashMap<ArtifactId, Vec<u8>>>,
}

impl MemoryArtifacts {
    pub fn new(ids: Arc<dyn IdGen>) -> Self {
        Self {
            ids,
            blobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn put(&self, bytes: Vec<u8>) -> Result<ArtifactId, EngineError> {
        let id = ArtifactId::generate(&*self.ids);
        self.blobs.lock().insert(id.clone(), bytes);
        Ok(id)
    }

    async fn fetch(&self, id: &ArtifactId) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.blobs.lock().get(id).cloned())
    }
}

/// One file per tarball under `root`, shared by every replica that mounts it
pub struct DirArtifacts {
    root: PathBuf,
    ids: Arc<dyn IdGen>,
}

impl DirArtifacts {
    pub fn new(root: impl Into<PathBuf>, ids: Arc<dyn IdGen>) -> Self {
        Self {
            root: root.into(),
            ids,
        }
    }

    fn path(&self, id: &ArtifactId) -> Result<PathBuf, EngineError> {
        let name = id.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(EngineError::Validation(format!("bad artifact id: {name}")));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ArtifactStore for DirArtifacts {
    async fn put(&self, bytes: Vec<u8>) -> Result<ArtifactId, EngineError> {
        let id = ArtifactId::generate(&*self.ids);
        let path = self.path(&id)?;
        let partial = path.with_extension("partial");
        tokio::fs::create_dir_all(&self.root).await.map_err(io)?;
        tokio::fs::write(&partial, &bytes).await.map_err(io)?;
        tokio::fs::rename(&partial, &path).await.map_err(io)?;
        Ok(id)
    }

    async fn fetch(&self, id: &ArtifactId) -> Result<Option<Vec<u8>>, EngineError> {
        match tokio::fs::read(self.path(id)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io(e)),
        }
    }
}

fn io(e: std::io::Error) -> EngineError {
    EngineError::Transient(format!("artifact store: {e}"))
}

#[cfg(test)]
#[path = "artifacts_tests.rs"]
mod tests;
