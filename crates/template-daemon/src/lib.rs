//! template-daemon library: the native host pieces, exposed for testing.

pub mod native_store;
pub mod prompt;
pub mod watcher;

pub use native_store::NativeStore;
pub use prompt::{ConfirmMode, StdinConfirm};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
