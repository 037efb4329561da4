//! File watcher with debouncing for vault changes.
//!
//! Uses notify-debouncer-mini for change detection. Bursts are further
//! coalesced per document by the engine's `ChangeCoalescer`.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path relative to vault root, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    Deleted,
}

pub struct FileWatcher {
    vault_path: PathBuf,
    /// Must be kept alive for events to flow
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

/// Last seen mtime per document, filters events that changed nothing
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

impl FileWatcher {
    /// Watch `vault_path` recursively with a 200ms debounce.
    pub fn new(vault_path: PathBuf) -> Result<Self> {
        // FSEvents on macOS needs the real path (/private/var/...).
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = vault_path.clone();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(file_event) = Self::process_event(&event, &root, &mtime_cache)
                        {
                            if event_tx.send(file_event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    fn process_event(
        event: &DebouncedEvent,
        vault_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<FileEvent> {
        let path = &event.path;
        let relative = vault_relative(path, vault_path)?;

        if relative.starts_with('.') || relative.contains("/.") || !relative.ends_with(".md") {
            return None;
        }

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        let kind = match std::fs::metadata(path) {
            Ok(metadata) => {
                if let Ok(mtime) = metadata.modified() {
                    if cache.get(&relative) == Some(&mtime) {
                        return None;
                    }
                    cache.insert(relative.clone(), mtime);
                }
                FileEventKind::Modified
            }
            Err(_) => {
                cache.remove(&relative);
                FileEventKind::Deleted
            }
        };

        debug!("File event: {:?} - {}", kind, relative);
        Some(FileEvent {
            path: relative,
            kind,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

/// `path` relative to `root` with `/` separators.
fn vault_relative(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.iter().map(|c| c.to_str()).collect();
    let parts = parts?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
