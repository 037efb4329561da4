//! TemplateSync: keeps documents consistent with the templates they reference.
//!
//! Driving operations:
//!
//! 1. **Apply**: a document gained `base/<name>` references. Template defaults
//!    are merged in; the document's own values always win.
//! 2. **Propagate**: a template's property keys changed. Added keys are copied
//!    into bound documents that lack them; removed keys are deleted only where
//!    the document left them empty. Deleting a key that had a real template
//!    default needs confirmation; declining reverts the template.
//! 3. **Prune**: a document dropped a reference. Empty properties that belong
//!    to the template are removed.
//!
//! Snapshots and the tag cache only advance after every write of a pass has
//! succeeded, so a failed pass is retried against the same baseline on the
//! next notification.

use crate::confirm::Confirm;
use crate::events::{EventBus, TemplateEvent};
use crate::frontmatter::{self, BlockState, FrontmatterError, ParsedNote, Properties};
use crate::guard::{OperationGuard, OperationKind, RecentWrites};
use crate::merge;
use crate::registry::{self, TemplateRegistry};
use crate::settings::Settings;
use crate::store::{DocumentStore, StoreError};
use crate::tags::{self, TAG_KEYS, TagIndex, TagSet};

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to write {path}: {source}")]
    WriteFailure {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] FrontmatterError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome of an operation, for the UI collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Documents whose text was rewritten.
    pub changed: Vec<String>,
    /// Documents examined but left untouched.
    pub skipped: Vec<String>,
    /// A destructive template edit was declined and reverted.
    pub declined: bool,
}

impl SyncReport {
    fn skipped(path: &str) -> Self {
        Self {
            skipped: vec![path.to_string()],
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: SyncReport) {
        self.changed.extend(other.changed);
        self.skipped.extend(other.skipped);
        self.declined |= other.declined;
    }
}

/// Result of the startup scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub documents: usize,
    pub templates: usize,
}

/// Process-scoped engine state: the tag cache and the template snapshots.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub tags: TagIndex,
    pub templates: TemplateRegistry,
}

pub struct TemplateSync<S, C> {
    store: S,
    confirm: C,
    settings: Settings,
    state: Mutex<SyncState>,
    guard: OperationGuard,
    recent: RecentWrites,
    events: Arc<EventBus>,
}

impl<S: DocumentStore, C: Confirm> TemplateSync<S, C> {
    pub fn new(store: S, confirm: C, settings: Settings) -> Self {
        Self::with_state(store, confirm, settings, SyncState::default())
    }

    /// Start from previously built state instead of an empty one.
    pub fn with_state(store: S, confirm: C, settings: Settings, state: SyncState) -> Self {
        let settings = settings.normalized();
        Self {
            recent: RecentWrites::new(settings.echo_window()),
            store,
            confirm,
            settings,
            state: Mutex::new(state),
            guard: OperationGuard::new(),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// A copy of the current state.
    pub fn state(&self) -> SyncState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed the tag cache and template snapshots from every document.
    ///
    /// Makes no writes. The first template found for a name owns its snapshot.
    pub async fn initialize(&self) -> Result<ScanReport> {
        let mut scan = ScanReport::default();

        for path in self.store.list().await? {
            let Some(meta) = self.store.metadata(&path).await? else {
                continue;
            };
            let current: TagSet = tags::current_tags(&meta).into_iter().collect();

            if registry::is_template(&self.settings, &path, &current) {
                let note = self.read_note(&path).await?;
                if note.block == BlockState::Malformed {
                    warn!("Template {} has malformed frontmatter, not registered", path);
                } else {
                    let mut state = self.lock_state();
                    if state
                        .templates
                        .snapshot(registry::template_name(&path))
                        .is_none()
                    {
                        state.templates.record(&path, note.properties);
                        scan.templates += 1;
                    } else {
                        warn!(
                            "Duplicate template name {}, {} is ignored",
                            registry::template_name(&path),
                            path
                        );
                    }
                }
            }

            self.lock_state().tags.update(&path, current);
            scan.documents += 1;
        }

        info!(
            "Indexed {} documents, {} templates",
            scan.documents, scan.templates
        );
        Ok(scan)
    }

    /// Process a change notification for `path`.
    ///
    /// Echoes of our own writes and notifications for a document that is
    /// already being processed are dropped.
    pub async fn handle_change(&self, path: &str) -> Result<SyncReport> {
        if self.recent.consume(path) {
            debug!("Ignoring echo of our own write to {}", path);
            return Ok(SyncReport::default());
        }

        let Some(_token) = self.guard.try_acquire_idle(OperationKind::Change, path) else {
            debug!("{} is already being processed, dropping notification", path);
            return Ok(SyncReport::default());
        };

        let Some(meta) = self.store.metadata(path).await? else {
            self.on_document_deleted(path);
            return Ok(SyncReport::default());
        };

        let ordered = tags::current_tags(&meta);
        let current: TagSet = ordered.iter().cloned().collect();
        let previous = self.lock_state().tags.previous(path);
        let delta = tags::diff(&previous, &current);
        let base = self.settings.base_tag.as_str();

        let mut report = SyncReport::default();
        if registry::is_template(&self.settings, path, &current) {
            report.absorb(self.propagate_template_change(path).await?);
        } else {
            let was_template = self.lock_state().templates.forget(path).is_some();
            if was_template {
                info!("{} is no longer a template", path);
            }

            let added: Vec<String> = tags::references(&ordered, base)
                .into_iter()
                .filter(|name| delta.added.contains(&format!("{base}/{name}")))
                .collect();
            if !added.is_empty() {
                report.absorb(self.apply_template(path, &added).await?);
            }

            if self.settings.prune_on_reference_removed {
                for name in tags::references(&delta.removed, base) {
                    report.absorb(self.prune_on_reference_removed(path, &name).await?);
                }
            }
        }

        self.lock_state().tags.update(path, current);
        Ok(report)
    }

    /// Bring a freshly opened document up to date with every template it
    /// references, not only newly added ones.
    pub async fn on_document_opened(&self, path: &str) -> Result<SyncReport> {
        if self.guard.is_held(path) {
            debug!("{} is being processed, skipping open", path);
            return Ok(SyncReport::default());
        }

        let Some(meta) = self.store.metadata(path).await? else {
            return Ok(SyncReport::default());
        };
        let ordered = tags::current_tags(&meta);
        let current: TagSet = ordered.iter().cloned().collect();

        if registry::is_template(&self.settings, path, &current) {
            let name = registry::template_name(path);
            let known = self.lock_state().templates.snapshot(name).is_some();
            if !known && self.owns_template_name(path, name).await? {
                let note = self.read_note(path).await?;
                if note.block != BlockState::Malformed {
                    info!("Registered template {} from {}", name, path);
                    self.lock_state().templates.record(path, note.properties);
                }
            }
            return Ok(SyncReport::default());
        }

        let names = tags::references(&ordered, &self.settings.base_tag);
        if names.is_empty() {
            return Ok(SyncReport::default());
        }
        self.apply_template(path, &names).await
    }

    /// Forget everything cached for a deleted document.
    pub fn on_document_deleted(&self, path: &str) {
        let mut state = self.lock_state();
        state.tags.remove(path);
        if state.templates.forget(path).is_some() {
            info!("Template {} deleted", path);
        }
        debug!("Dropped cached state for {}", path);
    }

    /// Merge templates `names` into the document at `path`.
    ///
    /// Earlier names win over later ones; the document's own values win over
    /// all of them. Unknown names are ignored. No write when nothing changes.
    pub async fn apply_template(&self, path: &str, names: &[String]) -> Result<SyncReport> {
        let Some(_token) =
            self.guard
                .try_acquire_unless(OperationKind::Apply, path, &[OperationKind::Propagate])
        else {
            debug!("Apply or propagation already running for {}", path);
            return Ok(SyncReport::skipped(path));
        };

        if self.is_template_path(path).await? {
            debug!("{} is a template, not applying templates to it", path);
            return Ok(SyncReport::skipped(path));
        }

        let mut defaults = Vec::new();
        for name in names {
            match registry::resolve(&self.store, &self.settings, name).await? {
                Some(template) if template.path == path => {
                    debug!("{} references itself, ignoring", path);
                }
                Some(template) => {
                    debug!("Resolved template {} at {}", name, template.path);
                    defaults.push(registry::template_properties(&template.properties));
                }
                None => debug!("No template named {} for {}, reference is inert", name, path),
            }
        }
        if defaults.is_empty() {
            return Ok(SyncReport::skipped(path));
        }

        let doc = self.read_note(path).await?;
        if doc.block == BlockState::Malformed {
            warn!("{} has malformed frontmatter, not applying templates", path);
            return Ok(SyncReport::skipped(path));
        }

        let merged = merge::merge_templates(&doc.properties, &defaults);
        if merged == doc.properties {
            debug!("{} already has every template property", path);
            return Ok(SyncReport::skipped(path));
        }

        self.write_note(path, &merged, &doc.body).await?;
        let report = SyncReport {
            changed: vec![path.to_string()],
            ..SyncReport::default()
        };
        self.emit_changed("apply", &report);
        Ok(report)
    }

    /// Push the property keys a template gained or lost since its snapshot
    /// into every document referencing it.
    ///
    /// The first time a template is seen its snapshot is only recorded.
    pub async fn propagate_template_change(&self, path: &str) -> Result<SyncReport> {
        let Some(_token) = self.guard.try_acquire(OperationKind::Propagate, path) else {
            debug!("Propagation already running for {}", path);
            return Ok(SyncReport::skipped(path));
        };

        let template = self.read_note(path).await?;
        if template.block == BlockState::Malformed {
            warn!("Template {} has malformed frontmatter, not propagating", path);
            return Ok(SyncReport::skipped(path));
        }

        let name = registry::template_name(path);
        let previous = self.lock_state().templates.snapshot(name).cloned();
        let Some(previous) = previous else {
            if !self.owns_template_name(path, name).await? {
                warn!("Duplicate template name {}, {} is ignored", name, path);
                return Ok(SyncReport::skipped(path));
            }
            info!("Registered template {} from {}", name, path);
            self.lock_state().templates.record(path, template.properties);
            return Ok(SyncReport::default());
        };
        if previous.path != path {
            warn!(
                "Duplicate template name {}, {} is ignored in favor of {}",
                name, path, previous.path
            );
            return Ok(SyncReport::skipped(path));
        }

        let diff = registry::diff_properties(&previous.properties, &template.properties, &TAG_KEYS);
        if diff.is_empty() {
            self.lock_state().templates.record(path, template.properties);
            return Ok(SyncReport::default());
        }
        info!(
            "Template {} changed: added {:?}, removed {:?}",
            name, diff.added, diff.removed
        );

        let old_defaults = registry::template_properties(&previous.properties);
        let new_defaults = registry::template_properties(&template.properties);
        let bound = self.bound_documents(name, path).await?;
        let mut report = SyncReport::default();

        // Removed keys whose template default carried a real value.
        let destructive: Vec<String> = diff
            .removed
            .iter()
            .filter(|k| {
                old_defaults
                    .get(k.as_str())
                    .is_some_and(|v| !merge::is_empty_value(v))
            })
            .cloned()
            .collect();

        if !destructive.is_empty() {
            let mut affected = 0;
            for doc_path in &bound {
                let doc = self.read_note(doc_path).await?;
                if doc.block != BlockState::Malformed
                    && !merge::lost_keys(&doc.properties, &destructive).is_empty()
                {
                    affected += 1;
                }
            }

            if affected > 0 {
                let message = format!(
                    "Removing {} from template \"{}\" will delete {} from {} document(s). Continue?",
                    destructive.join(", "),
                    name,
                    if destructive.len() == 1 { "it" } else { "them" },
                    affected
                );
                if !self.confirm.confirm_destructive_change(&message).await {
                    info!("Change to template {} declined, reverting", name);
                    let mut reverted = previous.properties.clone();
                    for key in TAG_KEYS {
                        match template.properties.get(key) {
                            Some(value) => {
                                reverted.insert(key.to_string(), value.clone());
                            }
                            None => {
                                reverted.shift_remove(key);
                            }
                        }
                    }
                    self.write_note(path, &reverted, &template.body).await?;

                    report.changed.push(path.to_string());
                    report.declined = true;
                    self.events.emit(TemplateEvent::ChangeDeclined {
                        template: name.to_string(),
                        properties: destructive,
                    });
                    self.emit_changed("revert", &report);
                    return Ok(report);
                }
            }
        }

        let mut complete = true;
        for doc_path in &bound {
            // Skipped while any other operation holds the document.
            let Some(_doc_token) = self.guard.try_acquire_idle(OperationKind::Propagate, doc_path)
            else {
                debug!("{} is busy, will retry on the next change", doc_path);
                report.skipped.push(doc_path.clone());
                complete = false;
                continue;
            };

            let doc = self.read_note(doc_path).await?;
            if doc.block == BlockState::Malformed {
                warn!("{} has malformed frontmatter, not propagating to it", doc_path);
                report.skipped.push(doc_path.clone());
                continue;
            }

            let mut properties = doc.properties.clone();
            if !merge::apply_delta(&mut properties, &new_defaults, &diff) {
                report.skipped.push(doc_path.clone());
                continue;
            }

            self.write_note(doc_path, &properties, &doc.body).await?;
            report.changed.push(doc_path.clone());
        }

        if complete {
            self.lock_state().templates.record(path, template.properties);
        } else {
            debug!("Snapshot of {} not advanced, propagation incomplete", name);
        }

        self.emit_changed("propagate", &report);
        Ok(report)
    }

    /// Remove from `path` every property of template `name` it left empty.
    pub async fn prune_on_reference_removed(&self, path: &str, name: &str) -> Result<SyncReport> {
        let Some(_token) =
            self.guard
                .try_acquire_unless(OperationKind::Prune, path, &[OperationKind::Propagate])
        else {
            debug!("Prune or propagation already running for {}", path);
            return Ok(SyncReport::skipped(path));
        };

        let Some(template) = registry::resolve(&self.store, &self.settings, name).await? else {
            debug!("No template named {}, nothing to prune from {}", name, path);
            return Ok(SyncReport::skipped(path));
        };
        if template.path == path {
            return Ok(SyncReport::skipped(path));
        }

        let doc = self.read_note(path).await?;
        if doc.block == BlockState::Malformed {
            warn!("{} has malformed frontmatter, not pruning", path);
            return Ok(SyncReport::skipped(path));
        }

        let mut properties = doc.properties.clone();
        let defaults = registry::template_properties(&template.properties);
        if !merge::prune_empty(&mut properties, &defaults) {
            return Ok(SyncReport::skipped(path));
        }

        self.write_note(path, &properties, &doc.body).await?;
        let report = SyncReport {
            changed: vec![path.to_string()],
            ..SyncReport::default()
        };
        self.emit_changed("prune", &report);
        Ok(report)
    }

    /// Non-template documents referencing template `name`, in scan order.
    async fn bound_documents(&self, name: &str, template_path: &str) -> Result<Vec<String>> {
        let base = self.settings.base_tag.as_str();
        let mut bound = Vec::new();

        for doc_path in self.store.list().await? {
            if doc_path == template_path {
                continue;
            }
            let Some(meta) = self.store.metadata(&doc_path).await? else {
                continue;
            };
            let ordered = tags::current_tags(&meta);
            if !tags::references(&ordered, base).iter().any(|n| n == name) {
                continue;
            }
            let current: TagSet = ordered.into_iter().collect();
            if registry::is_template(&self.settings, &doc_path, &current) {
                continue;
            }
            bound.push(doc_path);
        }

        Ok(bound)
    }

    /// Whether `path` is the template `name` resolves to.
    async fn owns_template_name(&self, path: &str, name: &str) -> Result<bool> {
        let resolved = registry::resolve(&self.store, &self.settings, name).await?;
        Ok(resolved.is_some_and(|t| t.path == path))
    }

    async fn is_template_path(&self, path: &str) -> Result<bool> {
        let Some(meta) = self.store.metadata(path).await? else {
            return Ok(false);
        };
        let current: TagSet = tags::current_tags(&meta).into_iter().collect();
        Ok(registry::is_template(&self.settings, path, &current))
    }

    async fn read_note(&self, path: &str) -> Result<ParsedNote> {
        let text = self.store.read(path).await?;
        Ok(frontmatter::parse(&text))
    }

    async fn write_note(&self, path: &str, properties: &Properties, body: &str) -> Result<()> {
        let text = frontmatter::serialize(properties, body)?;

        // Marked before writing: the host may notify before write() returns.
        self.recent.mark(path);
        if let Err(source) = self.store.write(path, &text).await {
            self.recent.forget(path);
            error!("Failed to write {}: {}", path, source);
            return Err(SyncError::WriteFailure {
                path: path.to_string(),
                source,
            });
        }

        info!("Updated frontmatter of {}", path);
        Ok(())
    }

    fn emit_changed(&self, operation: &str, report: &SyncReport) {
        if report.changed.is_empty() {
            return;
        }
        self.events.emit(TemplateEvent::DocumentsChanged {
            operation: operation.to_string(),
            paths: report.changed.clone(),
        });
    }
}
