//! DocumentStore trait: the host's document storage and metadata index.
//!
//! Implementations:
//! - `MemoryStore` - For testing
//! - `NativeStore` (in template-daemon) - Markdown files under a vault root

use crate::frontmatter::Properties;
use crate::tags;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Write rejected for {path}: {reason}")]
    WriteRejected { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// What the host's metadata indexer knows about a document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteMetadata {
    /// Tags as reported by the host (inline and frontmatter).
    pub tags: Vec<String>,
    /// Parsed frontmatter properties.
    pub properties: Properties,
}

/// Host document storage.
///
/// Paths are vault-relative with forward slashes (`Templates/Book.md`).
/// `metadata` may lag behind the latest `write` by one indexing cycle.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read the raw text of a document.
    async fn read(&self, path: &str) -> Result<String>;

    /// Replace the raw text of a document.
    async fn write(&self, path: &str, content: &str) -> Result<()>;

    /// All markdown documents, in the host's scan order.
    async fn list(&self) -> Result<Vec<String>>;

    /// Parsed tags and properties, or `None` if the document does not exist.
    async fn metadata(&self, path: &str) -> Result<Option<NoteMetadata>>;
}

/// In-memory store for testing.
///
/// Metadata is indexed from the current text on every call, so it never lags.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, String>>,
    failing: RwLock<HashSet<String>>,
    writes: RwLock<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document without recording a write.
    pub fn insert(&self, path: &str, content: &str) {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), content.to_string());
    }

    pub fn remove(&self, path: &str) {
        self.docs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    /// Reject every subsequent write to `path`.
    pub fn fail_writes_to(&self, path: &str) {
        self.failing
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string());
    }

    /// Paths written through the trait, in order.
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<String> {
        self.text(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        if self
            .failing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
        {
            return Err(StoreError::WriteRejected {
                path: path.to_string(),
                reason: "write failure injected".to_string(),
            });
        }

        self.insert(path, content);
        self.writes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_string());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn metadata(&self, path: &str) -> Result<Option<NoteMetadata>> {
        Ok(self.text(path).map(|text| tags::index_note(&text)))
    }
}

// Lets the engine and a test share one store.
#[async_trait]
impl<T: DocumentStore> DocumentStore for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<String> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        (**self).list().await
    }

    async fn metadata(&self, path: &str) -> Result<Option<NoteMetadata>> {
        (**self).metadata(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_basic_operations() {
        let store = MemoryStore::new();
        store.insert("b.md", "B");
        store.write("a.md", "---\ntags: [mt]\n---\nA").await.unwrap();

        assert_eq!(store.read("a.md").await.unwrap(), "---\ntags: [mt]\n---\nA");
        assert_eq!(store.list().await.unwrap(), vec!["a.md", "b.md"]);
        assert_eq!(store.writes(), vec!["a.md"]);

        let meta = store.metadata("a.md").await.unwrap().unwrap();
        assert_eq!(meta.tags, vec!["mt"]);
        assert!(store.metadata("missing.md").await.unwrap().is_none());
        assert!(matches!(
            store.read("missing.md").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_injected_write_failure() {
        let store = MemoryStore::new();
        store.insert("a.md", "before");
        store.fail_writes_to("a.md");

        let err = store.write("a.md", "after").await.unwrap_err();
        assert!(matches!(err, StoreError::WriteRejected { .. }));
        assert_eq!(store.text("a.md").unwrap(), "before");
        assert!(store.writes().is_empty());
    }
}
