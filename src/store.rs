//! Diagram persistence boundary
//!
//! The authority hands the store an opaque serialized graph and never asks it
//! to understand diagram semantics.

use crate::config::{StoreConfig, StoreKind};
use crate::errors::{StoreError, SyncError};
use crate::model::DocumentId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait DiagramStore: Send + Sync {
    /// `Ok(None)` means the document has never been saved.
    async fn load_diagram(&self, document_id: &DocumentId) -> Result<Option<String>, StoreError>;

    async fn save_diagram(&self, document_id: &DocumentId, serialized_graph: &str) -> Result<(), StoreError>;
}

/// Build the store selected by configuration.
pub fn from_config(config: &StoreConfig) -> Result<Arc<dyn DiagramStore>, SyncError> {
    match config.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::File => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| SyncError::Config("store.path is required for the file store".into()))?;
            Ok(Arc::new(FileStore::new(path)))
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    diagrams: Mutex<HashMap<DocumentId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_diagram(self, document_id: impl Into<DocumentId>, serialized_graph: impl Into<String>) -> Self {
        self.diagrams.lock().insert(document_id.into(), serialized_graph.into());
        self
    }

    pub fn get(&self, document_id: &DocumentId) -> Option<String> {
        self.diagrams.lock().get(document_id).cloned()
    }
}

#[async_trait]
impl DiagramStore for MemoryStore {
    async fn load_diagram(&self, document_id: &DocumentId) -> Result<Option<String>, StoreError> {
        Ok(self.get(document_id))
    }

    async fn save_diagram(&self, document_id: &DocumentId, serialized_graph: &str) -> Result<(), StoreError> {
        self.diagrams
            .lock()
            .insert(document_id.clone(), serialized_graph.to_string());
        Ok(())
    }
}

/// One JSON file per document under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Document ids come from clients, so anything outside a safe charset is
    /// hex-encoded rather than used as a path component.
    pub fn path_for(&self, document_id: &DocumentId) -> PathBuf {
        let id = document_id.as_str();
        let safe = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let name = if safe {
            format!("{}.json", id)
        } else {
            format!("x-{}.json", hex::encode(id))
        };
        self.root.join(name)
    }

    fn io_error(path: &Path, err: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl DiagramStore for FileStore {
    async fn load_diagram(&self, document_id: &DocumentId) -> Result<Option<String>, StoreError> {
        let path = self.path_for(document_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    async fn save_diagram(&self, document_id: &DocumentId, serialized_graph: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Self::io_error(&self.root, e))?;

        let path = self.path_for(document_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized_graph)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(&path, e))?;

        debug!(document = %document_id, path = %path.display(), "Diagram saved");
        Ok(())
    }
}
