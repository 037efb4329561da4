//! Template discovery and per-template snapshots.
//!
//! A document is a template when it lives under the configured template
//! folder, or, with no folder configured, when it carries the bare base tag.
//! Its name is the file stem: `Templates/Book.md` is template `Book`.

use crate::frontmatter::{self, BlockState, Properties};
use crate::settings::Settings;
use crate::store::{DocumentStore, Result};
use crate::tags::{self, TAG_KEYS, TagSet};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// A resolved template and its current properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub path: String,
    pub name: String,
    pub properties: Properties,
}

/// Last fully propagated property set of a template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSnapshot {
    /// The template document the snapshot was taken from.
    pub path: String,
    pub properties: Properties,
}

/// Property keys added to and removed from a template between two revisions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl PropertyDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Template name derived from a document path.
pub fn template_name(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.strip_suffix(".md").unwrap_or(file)
}

pub fn is_template(settings: &Settings, path: &str, tags: &TagSet) -> bool {
    match &settings.template_folder {
        Some(folder) => in_folder(path, folder),
        None => tags.contains(&settings.base_tag),
    }
}

fn in_folder(path: &str, folder: &str) -> bool {
    path.strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Properties a template contributes to documents: everything except the
/// tag-carrying keys.
pub fn template_properties(properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(k, _)| !TAG_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Key-set difference between two revisions of a template, ignoring
/// `ignored` keys. Value changes on a surviving key are not reported.
pub fn diff_properties(old: &Properties, new: &Properties, ignored: &[&str]) -> PropertyDiff {
    let keep = |k: &&String| !ignored.contains(&k.as_str());
    let old_keys: BTreeSet<&String> = old.keys().filter(keep).collect();
    let new_keys: BTreeSet<&String> = new.keys().filter(keep).collect();

    PropertyDiff {
        added: new
            .keys()
            .filter(keep)
            .filter(|k| !old_keys.contains(k))
            .cloned()
            .collect(),
        removed: old
            .keys()
            .filter(keep)
            .filter(|k| !new_keys.contains(k))
            .cloned()
            .collect(),
    }
}

/// Find template `name`, first match in scan order.
///
/// With a folder configured only documents under it are considered; otherwise
/// any document whose stem matches and which carries the bare base tag.
pub async fn resolve<S: DocumentStore + ?Sized>(
    store: &S,
    settings: &Settings,
    name: &str,
) -> Result<Option<Template>> {
    for path in store.list().await? {
        if template_name(&path) != name {
            continue;
        }

        let is_match = match &settings.template_folder {
            Some(folder) => in_folder(&path, folder),
            None => match store.metadata(&path).await? {
                Some(meta) => {
                    let current: TagSet = tags::current_tags(&meta).into_iter().collect();
                    is_template(settings, &path, &current)
                }
                None => false,
            },
        };
        if !is_match {
            continue;
        }

        let parsed = frontmatter::parse(&store.read(&path).await?);
        if parsed.block == BlockState::Malformed {
            debug!("Template {} has malformed frontmatter, skipping", path);
            continue;
        }

        return Ok(Some(Template {
            name: name.to_string(),
            path,
            properties: parsed.properties,
        }));
    }

    Ok(None)
}

/// Snapshots keyed by template name.
#[derive(Debug, Default, Clone)]
pub struct TemplateRegistry {
    snapshots: HashMap<String, TemplateSnapshot>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, name: &str) -> Option<&TemplateSnapshot> {
        self.snapshots.get(name)
    }

    /// Record the property set a template was last fully propagated with.
    pub fn record(&mut self, path: &str, properties: Properties) {
        self.snapshots.insert(
            template_name(path).to_string(),
            TemplateSnapshot {
                path: path.to_string(),
                properties,
            },
        );
    }

    /// Forget the snapshot taken from `path`. A snapshot of a same-named
    /// template elsewhere is left alone.
    pub fn forget(&mut self, path: &str) -> Option<TemplateSnapshot> {
        let name = template_name(path);
        if self.snapshots.get(name).is_some_and(|s| s.path == path) {
            self.snapshots.remove(name)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
