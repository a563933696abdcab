//! X-Plane Plugin Manager Core Library
//!
//! Lifecycle management for the plugin folders of an X-Plane installation:
//! install from archives or folders, enable/disable, back up to ZIP, restore,
//! remove.
//!
//! # Architecture
//!
//! This library is the core behind a desktop shell. The shell calls into
//! [`Manager`] one command at a time, either from Rust or through the C ABI in
//! the `ffi` module, and shows the [`OperationRecord`] stream as its audit
//! view.
//!
//! ## Plugin Model (`plugin` module)
//! - `PluginsRoot` - Validated `<X-Plane>/Resources/plugins` folder
//! - `PluginEntry` - A plugin folder and its enabled/disabled state
//! - `classify()` / `directory_name()` - The ` (disabled)` naming convention
//! - `BackupArchive` - A backup ZIP and the plugin it came from
//!
//! ## Plugin Discovery (`registry` module)
//! - `scan()` - List installed plugins
//! - `set_state()` - Enable/disable with a single rename
//!
//! ## Archives (`archive` module)
//! - `pack()` / `unpack()` - All-or-nothing ZIP codec with traversal checks
//! - `list_contents()` - Lazy listing of archive entries
//!
//! ## Plugin Management (`operations` module)
//! - `Manager::install()` - From a `.zip` or a folder, with collision policy
//! - `Manager::backup()` / `Manager::restore()` - Timestamped ZIP backups
//! - `Manager::remove()` - Delete a plugin
//!
//! ## Audit Trail (`journal` module)
//! - `OperationLog` - Append-only operation records, persisted as JSON lines

pub mod archive;
pub mod error;
pub mod ffi;
pub mod journal;
pub mod operations;
pub mod plugin;
pub mod progress;
pub mod registry;
pub mod settings;
pub mod tree;

pub use error::{ErrorKind, ErrorReport, PluginError, Result};
pub use journal::{Action, OperationLog, OperationRecord, Outcome};
pub use operations::{InstallSource, Manager};
pub use plugin::{classify, directory_name, BackupArchive, PluginEntry, PluginState, PluginsRoot};
pub use progress::{CancelFlag, Control, Progress};
pub use settings::Settings;
