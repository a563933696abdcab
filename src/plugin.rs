//! Plugin directory model: names, states, the plugins root and backup archives.
//!
//! The enable/disable convention lives here and nowhere else. An enabled
//! plugin `Name` is the directory `<root>/Name`; a disabled one is
//! `<root>/Name (disabled)`. [`classify`] and [`directory_name`] are inverses
//! and both the registry and the manager go through them.

use crate::error::{IoContext, PluginError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Reserved suffix marking a disabled plugin directory.
pub const DISABLED_SUFFIX: &str = " (disabled)";

/// Timestamp layout used in backup file names (ISO 8601 basic, UTC).
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginState {
    Enabled,
    Disabled,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginState::Enabled => f.write_str("enabled"),
            PluginState::Disabled => f.write_str("disabled"),
        }
    }
}

/// Splits a top-level directory name into the plugin name and its state.
pub fn classify(dir_name: &str) -> (&str, PluginState) {
    match dir_name.strip_suffix(DISABLED_SUFFIX) {
        Some(name) if !name.is_empty() => (name, PluginState::Disabled),
        _ => (dir_name, PluginState::Enabled),
    }
}

/// Directory name a plugin called `name` has when in `state`.
pub fn directory_name(name: &str, state: PluginState) -> String {
    match state {
        PluginState::Enabled => name.to_string(),
        PluginState::Disabled => format!("{}{}", name, DISABLED_SUFFIX),
    }
}

/// A plugin as seen by the last scan. Never cached across mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    pub path: PathBuf,
    pub state: PluginState,
}

impl PluginEntry {
    pub fn is_enabled(&self) -> bool {
        self.state == PluginState::Enabled
    }
}

/// The validated X-Plane plugins directory, passed explicitly to every
/// registry and manager call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginsRoot(PathBuf);

impl PluginsRoot {
    /// Opens `path` as the plugins root. It must exist, be a directory and be
    /// writable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let resolved = match fs::canonicalize(path) {
            Ok(p) => p,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PluginError::NotFound(format!(
                    "plugins folder {:?}",
                    path
                )))
            }
            Err(e) => return Err(PluginError::io(format!("Failed to resolve {:?}", path), e)),
        };

        let metadata = fs::metadata(&resolved).with_path("Failed to inspect plugins folder", &resolved)?;
        if !metadata.is_dir() {
            return Err(PluginError::NotFound(format!(
                "plugins folder {:?} is not a directory",
                resolved
            )));
        }
        if metadata.permissions().readonly() {
            return Err(PluginError::io(
                format!("Plugins folder is not writable: {:?}", resolved),
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }

        Ok(PluginsRoot(resolved))
    }

    /// Opens `<xplane_folder>/Resources/plugins`.
    pub fn from_xplane_folder(xplane_folder: impl AsRef<Path>) -> Result<Self> {
        Self::open(xplane_folder.as_ref().join("Resources").join("plugins"))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Where a plugin called `name` lives when in `state`.
    pub fn plugin_path(&self, name: &str, state: PluginState) -> PathBuf {
        self.0.join(directory_name(name, state))
    }
}

impl AsRef<Path> for PluginsRoot {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Metadata stored as JSON in a backup archive's ZIP comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub plugin: String,
    pub created_at: DateTime<Utc>,
    pub state: PluginState,
    pub digest: String,
}

impl BackupManifest {
    pub fn parse(comment: &[u8]) -> Option<Self> {
        if comment.is_empty() {
            return None;
        }
        serde_json::from_slice(comment).ok()
    }
}

/// A backup produced by the manager, or an archive picked up from the backup
/// folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArchive {
    pub source_plugin_name: String,
    pub archive_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Tree digest recorded at backup time, if the archive carries a manifest.
    pub digest: Option<String>,
}

impl BackupArchive {
    /// Reconstructs the backup description of an archive on disk: manifest
    /// first, then the `<Name>_<timestamp>.zip` file name, then the bare file
    /// stem with the file's modification time.
    pub fn from_path(archive_path: impl AsRef<Path>) -> Result<Self> {
        let archive_path = archive_path.as_ref();
        if !archive_path.is_file() {
            return Err(PluginError::NotFound(format!("archive {:?}", archive_path)));
        }

        let comment = crate::archive::read_comment(archive_path)?;
        if let Some(manifest) = BackupManifest::parse(&comment) {
            return Ok(BackupArchive {
                source_plugin_name: manifest.plugin,
                archive_path: archive_path.to_path_buf(),
                created_at: manifest.created_at,
                digest: Some(manifest.digest),
            });
        }

        let stem = archive_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| PluginError::NotFound(format!("archive name of {:?}", archive_path)))?;

        if let Some((name, created_at)) = parse_backup_stem(&stem) {
            return Ok(BackupArchive {
                source_plugin_name: name.to_string(),
                archive_path: archive_path.to_path_buf(),
                created_at,
                digest: None,
            });
        }

        let modified = fs::metadata(archive_path)
            .and_then(|m| m.modified())
            .with_path("Failed to read archive metadata", archive_path)?;
        Ok(BackupArchive {
            source_plugin_name: stem,
            archive_path: archive_path.to_path_buf(),
            created_at: DateTime::<Utc>::from(modified),
            digest: None,
        })
    }
}

/// File stem (without `.zip`) for a backup of `name` taken at `at`; `counter`
/// disambiguates backups taken within the same second.
pub fn backup_stem(name: &str, at: DateTime<Utc>, counter: u32) -> String {
    let stamp = at.format(BACKUP_TIMESTAMP_FORMAT);
    if counter == 0 {
        format!("{}_{}", name, stamp)
    } else {
        format!("{}_{}_{}", name, stamp, counter)
    }
}

pub(crate) fn parse_backup_stem(stem: &str) -> Option<(&str, DateTime<Utc>)> {
    let parse = |s: &str| {
        NaiveDateTime::parse_from_str(s, BACKUP_TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    };

    let (head, tail) = stem.rsplit_once('_')?;
    if let Some(at) = parse(tail) {
        return (!head.is_empty()).then_some((head, at));
    }

    // `<Name>_<timestamp>_<counter>`
    if tail.parse::<u32>().is_ok() {
        let (name, stamp) = head.rsplit_once('_')?;
        let at = parse(stamp)?;
        return (!name.is_empty()).then_some((name, at));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn classify_and_directory_name_are_inverses() {
        for (name, state) in [
            ("FlyWithLua", PluginState::Enabled),
            ("FlyWithLua", PluginState::Disabled),
            ("Better Pushback", PluginState::Disabled),
        ] {
            let dir = directory_name(name, state);
            assert_eq!(classify(&dir), (name, state));
        }
    }

    #[test]
    fn bare_suffix_is_not_a_disabled_plugin() {
        assert_eq!(classify(" (disabled)"), (" (disabled)", PluginState::Enabled));
        assert_eq!(classify("AutoGate"), ("AutoGate", PluginState::Enabled));
    }

    #[test]
    fn backup_stem_round_trips_through_parser() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 5).unwrap();
        let stem = backup_stem("FlyWithLua", at, 0);
        assert_eq!(stem, "FlyWithLua_20261018T093005Z");
        assert_eq!(parse_backup_stem(&stem), Some(("FlyWithLua", at)));

        let stem = backup_stem("X_Camera", at, 2);
        assert_eq!(stem, "X_Camera_20261018T093005Z_2");
        assert_eq!(parse_backup_stem(&stem), Some(("X_Camera", at)));
    }

    #[test]
    fn unrelated_stems_do_not_parse() {
        assert_eq!(parse_backup_stem("AutoGate"), None);
        assert_eq!(parse_backup_stem("Some_Plugin"), None);
        assert_eq!(parse_backup_stem("_20261018T093005Z"), None);
    }

    #[test]
    fn open_rejects_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = PluginsRoot::open(tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[test]
    fn open_rejects_files() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plugins");
        fs::write(&file, b"").unwrap();
        assert!(matches!(PluginsRoot::open(&file), Err(PluginError::NotFound(_))));
    }

    #[test]
    fn from_xplane_folder_resolves_resources_plugins() {
        let tmp = TempDir::new().unwrap();
        let plugins = tmp.path().join("Resources").join("plugins");
        fs::create_dir_all(&plugins).unwrap();

        let root = PluginsRoot::from_xplane_folder(tmp.path()).unwrap();
        assert_eq!(root.path(), fs::canonicalize(&plugins).unwrap());
        assert_eq!(
            root.plugin_path("AutoGate", PluginState::Disabled),
            root.path().join("AutoGate (disabled)")
        );
    }

    #[test]
    fn archive_without_manifest_falls_back_to_stem() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();

        let archive = tmp.path().join("AutoGate.zip");
        crate::archive::pack(&src, &archive, &Default::default(), &Default::default()).unwrap();

        let backup = BackupArchive::from_path(&archive).unwrap();
        assert_eq!(backup.source_plugin_name, "AutoGate");
        assert_eq!(backup.digest, None);
    }
}
