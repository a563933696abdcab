//! Persistent settings for the plugin manager.
//!
//! The shell owns these values (X-Plane folder, backup folder); the core only
//! consumes them already resolved. Stored as JSON in the platform
//! configuration directory.

use crate::error::{IoContext, PluginError, Result};
use crate::journal::OperationLog;
use crate::operations::Manager;
use crate::plugin::PluginsRoot;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";
const JOURNAL_FILE: &str = "operations.jsonl";
const DEFAULT_HISTORY_LIMIT: usize = 1000;

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// X-Plane installation folder; plugins live in `Resources/plugins`.
    #[serde(default)]
    pub xplane_folder: Option<PathBuf>,
    /// Where backups go. Defaults to `<X-Plane>/Resources/plugin-backups`.
    #[serde(default)]
    pub backup_folder: Option<PathBuf>,
    /// Operation journal. Defaults to `operations.jsonl` next to the settings.
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
    /// How many records of earlier sessions are loaded from the journal.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            xplane_folder: None,
            backup_folder: None,
            journal_path: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Get the configuration directory for the plugin manager
pub fn config_dir() -> Result<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let home = env_path("HOME")?;
        Ok(home.join("Library/Application Support/XPlanePluginManager"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata = env_path("APPDATA")?;
        Ok(appdata.join("XPlanePluginManager"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if let Ok(xdg) = env_path("XDG_CONFIG_HOME") {
            return Ok(xdg.join("xplane-plugin-manager"));
        }
        let home = env_path("HOME")?;
        Ok(home.join(".config/xplane-plugin-manager"))
    }
}

fn env_path(var: &str) -> Result<PathBuf> {
    match std::env::var_os(var) {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => Err(PluginError::NotFound(format!("{} environment variable not set", var))),
    }
}

impl Settings {
    pub fn default_path() -> Result<PathBuf> {
        Ok(config_dir()?.join(SETTINGS_FILE))
    }

    /// Loads settings from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(PluginError::io(format!("Failed to read settings {:?}", path), e)),
        };
        serde_json::from_str(&content).map_err(|e| {
            PluginError::io(
                format!("Failed to parse settings {:?}", path),
                io::Error::new(io::ErrorKind::InvalidData, e),
            )
        })
    }

    /// Writes settings atomically (temporary file, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).with_path("Failed to create settings directory", parent)?;

        let content = serde_json::to_string_pretty(self).map_err(|e| {
            PluginError::io("Failed to encode settings", io::Error::new(io::ErrorKind::InvalidData, e))
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .with_path("Failed to create temporary settings file in", parent)?;
        tmp.write_all(content.as_bytes())
            .with_path("Failed to write settings", tmp.path())?;
        tmp.persist(path)
            .map_err(|e| PluginError::io(format!("Failed to save settings {:?}", path), e.error))?;
        Ok(())
    }

    fn xplane_folder(&self) -> Result<&Path> {
        self.xplane_folder
            .as_deref()
            .ok_or_else(|| PluginError::NotFound("X-Plane folder is not configured".to_string()))
    }

    pub fn plugins_root(&self) -> Result<PluginsRoot> {
        PluginsRoot::from_xplane_folder(self.xplane_folder()?)
    }

    pub fn backup_root(&self) -> Result<PathBuf> {
        match &self.backup_folder {
            Some(folder) => Ok(folder.clone()),
            None => Ok(self.xplane_folder()?.join("Resources").join("plugin-backups")),
        }
    }

    pub fn journal_path(&self) -> Result<PathBuf> {
        match &self.journal_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join(JOURNAL_FILE)),
        }
    }

    /// Builds a manager for the configured folders, with a journal-backed
    /// operation log.
    pub fn open_manager(&self) -> Result<Manager> {
        let root = self.plugins_root()?;
        let log = OperationLog::open(self.journal_path()?, self.history_limit)?;
        Ok(Manager::new(root, self.backup_root()?, log))
    }
}
