//! Template-driven metadata synchronization for Markdown vaults.
//!
//! A template is a document carrying the base tag (or living in the template
//! folder). Documents reference it with a `base/<name>` tag and receive its
//! frontmatter properties; later edits to the template's property keys are
//! propagated to every referencing document without clobbering values the
//! user filled in.
//!
//! The host supplies storage through [`DocumentStore`] and destructive-edit
//! confirmation through [`Confirm`]; [`TemplateSync`] does the rest.

pub mod confirm;
pub mod engine;
pub mod events;
pub mod frontmatter;
pub mod guard;
pub mod merge;
pub mod registry;
pub mod settings;
pub mod store;
pub mod tags;

pub use confirm::{AutoConfirm, Confirm};
pub use engine::{ScanReport, SyncError, SyncReport, SyncState, TemplateSync};
pub use events::{EventBus, Subscription, TemplateEvent};
pub use frontmatter::{BlockState, ParsedNote, Properties};
pub use guard::ChangeCoalescer;
pub use settings::{Settings, SettingsError};
pub use store::{DocumentStore, MemoryStore, NoteMetadata, StoreError};
pub use tags::index_note;
