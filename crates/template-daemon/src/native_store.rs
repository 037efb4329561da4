//! Vault-backed document store using tokio::fs.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use template_core::store::{DocumentStore, NoteMetadata, Result, StoreError};
use template_core::tags::index_note;
use tokio::fs;

/// Markdown documents under a vault directory.
///
/// Paths are vault-relative with `/` separators. Hidden files and
/// directories are not listed.
pub struct NativeStore {
    base_path: PathBuf,
}

impl NativeStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::Io(format!("Path escapes the vault: {}", path)));
        }
        Ok(self.base_path.join(relative))
    }
}

fn io_error(path: &str, err: std::io::Error) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(path.to_string())
    } else {
        StoreError::Io(format!("{}: {}", path, err))
    }
}

#[async_trait]
impl DocumentStore for NativeStore {
    async fn read(&self, path: &str) -> Result<String> {
        let full_path = self.full_path(path)?;
        fs::read_to_string(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let full_path = self.full_path(path)?;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut documents = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(dir) = pending.pop() {
            let full_path = self.base_path.join(&dir);
            let mut entries = fs::read_dir(&full_path)
                .await
                .map_err(|e| io_error(&dir, e))?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }

                let relative = if dir.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", dir, name)
                };
                let file_type = entry.file_type().await.map_err(|e| io_error(&relative, e))?;

                if file_type.is_dir() {
                    pending.push(relative);
                } else if file_type.is_file() && name.ends_with(".md") {
                    documents.push(relative);
                }
            }
        }

        documents.sort();
        Ok(documents)
    }

    async fn metadata(&self, path: &str) -> Result<Option<NoteMetadata>> {
        match self.read(path).await {
            Ok(text) => Ok(Some(index_note(&text))),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
