//! Persisted plugin settings.
//!
//! Loaded from the host's JSON settings file, then optionally overridden from
//! the environment:
//! - `TEMPLATE_SYNC_BASE_TAG`: base tag (default `mt`)
//! - `TEMPLATE_SYNC_TEMPLATE_FOLDER`: folder holding templates
//! - `TEMPLATE_SYNC_PRUNE`: `true`/`1` to prune empty properties when a
//!   template reference is removed

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_TAG: &str = "mt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Tag prefix: `<base>/<name>` references template `<name>`, bare `<base>`
    /// marks a template when no folder is configured.
    pub base_tag: String,
    /// When set, every document under this folder is a template.
    pub template_folder: Option<String>,
    /// Remove empty properties belonging to a template when its reference is
    /// removed from a document.
    pub prune_on_reference_removed: bool,
    /// Quiet period before a burst of change notifications is processed.
    pub quiet_period_ms: u64,
    /// How long a notification caused by our own write is recognized as an echo.
    pub echo_window_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_tag: DEFAULT_BASE_TAG.to_string(),
            template_folder: None,
            prune_on_reference_removed: false,
            quiet_period_ms: 300,
            echo_window_ms: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Settings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(SettingsError::Read {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        };

        let settings: Settings =
            serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(settings.normalized())
    }

    /// Apply `TEMPLATE_SYNC_*` environment overrides.
    pub fn with_env(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(base) = var("TEMPLATE_SYNC_BASE_TAG") {
            self.base_tag = base;
        }
        if let Some(folder) = var("TEMPLATE_SYNC_TEMPLATE_FOLDER") {
            self.template_folder = Some(folder);
        }
        if let Some(prune) = var("TEMPLATE_SYNC_PRUNE") {
            self.prune_on_reference_removed = matches!(prune.trim(), "1" | "true" | "yes");
        }
        self.normalized()
    }

    /// Strip `#` and slashes from the base tag, slashes from the folder, and
    /// treat an empty folder as unconfigured.
    pub fn normalized(mut self) -> Self {
        let base = self.base_tag.trim();
        let base = base.strip_prefix('#').unwrap_or(base).trim_matches('/');
        self.base_tag = if base.is_empty() {
            DEFAULT_BASE_TAG.to_string()
        } else {
            base.to_string()
        };

        self.template_folder = self
            .template_folder
            .take()
            .map(|f| f.trim().trim_matches('/').to_string())
            .filter(|f| !f.is_empty());
        self
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn echo_window(&self) -> Duration {
        Duration::from_millis(self.echo_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.base_tag, "mt");
        assert!(settings.template_folder.is_none());
        assert!(!settings.prune_on_reference_removed);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("data.json")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn load_partial_file_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r##"{"baseTag": "#tpl/", "templateFolder": "/Templates/", "pruneOnReferenceRemoved": true}"##,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.base_tag, "tpl");
        assert_eq!(settings.template_folder.as_deref(), Some("Templates"));
        assert!(settings.prune_on_reference_removed);
        assert_eq!(settings.quiet_period_ms, 300);
    }

    #[test]
    fn load_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Settings::load(&path), Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn overrides_apply_and_empty_folder_is_unconfigured() {
        let vars: HashMap<&str, &str> = [
            ("TEMPLATE_SYNC_BASE_TAG", "meta"),
            ("TEMPLATE_SYNC_TEMPLATE_FOLDER", " / "),
            ("TEMPLATE_SYNC_PRUNE", "true"),
        ]
        .into_iter()
        .collect();

        let settings =
            Settings::default().with_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(settings.base_tag, "meta");
        assert!(settings.template_folder.is_none());
        assert!(settings.prune_on_reference_removed);
    }
}
