//! Plugin management operations (install, backup, restore, enable/disable,
//! remove).
//!
//! [`Manager`] is the command interface the UI shell talks to. It owns the
//! session context (plugins root, backup root, operation log) and enforces
//! three rules on every mutating call:
//!
//! - Only one mutating operation runs at a time; a second one fails with
//!   [`PluginError::Busy`].
//! - Results are assembled in a hidden staging directory inside the plugins
//!   root and moved into place with a single rename, so a failure or a
//!   cancellation never leaves a partial plugin behind.
//! - Exactly one [`OperationRecord`] is appended per call, success or not.
//!   The `*_named` / `*_path` variants resolve their argument inside the
//!   recorded call, so an unknown plugin or a missing archive is recorded
//!   too.

use crate::archive::{self, ArchiveContents, PackOptions};
use crate::error::{ErrorReport, IoContext, PluginError, Result};
use crate::journal::{Action, OperationLog, OperationRecord};
use crate::plugin::{
    backup_stem, classify, parse_backup_stem, BackupArchive, BackupManifest, PluginEntry, PluginState,
    PluginsRoot,
};
use crate::progress::Control;
use crate::registry;
use crate::tree;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

const STAGING_PREFIX: &str = ".xpm-staging-";
const MAX_BACKUP_SUFFIX: u32 = 1000;

/// Top-level folders some archivers add that are never part of a plugin.
const ARCHIVE_NOISE: &[&str] = &["__MACOSX"];

/// Where a plugin is installed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Archive(PathBuf),
    Directory(PathBuf),
}

impl InstallSource {
    /// Picks the source kind from what is on disk: a directory, or a `.zip`
    /// file.
    pub fn detect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            return Ok(InstallSource::Directory(path.to_path_buf()));
        }
        if path.is_file() {
            let is_zip = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false);
            if is_zip {
                return Ok(InstallSource::Archive(path.to_path_buf()));
            }
            return Err(PluginError::io(
                format!("Not a plugin folder or .zip archive: {:?}", path),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
        Err(PluginError::NotFound(format!("{:?}", path)))
    }

    pub fn path(&self) -> &Path {
        match self {
            InstallSource::Archive(p) | InstallSource::Directory(p) => p,
        }
    }
}

pub struct Manager {
    root: PluginsRoot,
    backup_root: PathBuf,
    log: Mutex<OperationLog>,
    busy: AtomicBool,
}

/// Hidden scratch directory inside the plugins root. Extracted trees may
/// carry read-only directory modes, so they are lifted before deletion.
struct Staging {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl Staging {
    fn path(&self) -> &Path {
        &self.path
    }

    fn close(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => {
                if let Err(e) = tree::unlock(&self.path) {
                    tracing::debug!("Failed to unlock {:?}: {}", self.path, e);
                }
                dir.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = tree::unlock(&self.path) {
                tracing::debug!("Failed to unlock {:?}: {}", self.path, e);
            }
            drop(dir);
        }
    }
}

/// Clears the operation-in-progress flag when dropped.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Manager {
    pub fn new(root: PluginsRoot, backup_root: impl Into<PathBuf>, log: OperationLog) -> Self {
        Self {
            root,
            backup_root: backup_root.into(),
            log: Mutex::new(log),
            busy: AtomicBool::new(false),
        }
    }

    pub fn plugins_root(&self) -> &PluginsRoot {
        &self.root
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn scan(&self) -> Result<Vec<PluginEntry>> {
        registry::scan(&self.root)
    }

    pub fn find(&self, name: &str) -> Result<PluginEntry> {
        registry::find(&self.root, name)
    }

    pub fn list_files(&self, entry: &PluginEntry) -> Result<Vec<String>> {
        registry::list_files(entry)
    }

    pub fn list_contents(&self, archive_path: &Path) -> Result<ArchiveContents> {
        archive::list_contents(archive_path)
    }

    /// Every `.zip` in the backup folder, newest first. Archives that cannot
    /// be read are skipped with a warning.
    pub fn list_backups(&self) -> Result<Vec<BackupArchive>> {
        let entries = match fs::read_dir(&self.backup_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PluginError::io(
                    format!("Failed to read backup folder {:?}", self.backup_root),
                    e,
                ))
            }
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.with_path("Failed to read entry in", &self.backup_root)?;
            let path = entry.path();
            let is_zip = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false);
            if !is_zip || !path.is_file() {
                continue;
            }
            match BackupArchive::from_path(&path) {
                Ok(backup) => backups.push(backup),
                Err(e) => tracing::warn!("Skipping unreadable backup {:?}: {}", path, e),
            }
        }

        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.archive_path.cmp(&b.archive_path))
        });
        Ok(backups)
    }

    /// Snapshot of the operation log, in insertion order.
    pub fn records(&self, action: Option<Action>, target: Option<&str>) -> Vec<OperationRecord> {
        self.log().query(action, target).cloned().collect()
    }

    /// Why the operation journal is currently not being written, if it isn't.
    /// Cleared by the next successful write.
    pub fn journal_error(&self) -> Option<ErrorReport> {
        self.log().persist_error().cloned()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Installs a plugin from an archive or a folder.
    ///
    /// An existing plugin of the same name is only replaced when
    /// `allow_overwrite` is set, and then keeps its enabled/disabled state.
    pub fn install(&self, source: &InstallSource, allow_overwrite: bool, control: &Control) -> Result<PluginEntry> {
        self.run(Action::Install, source_label(source.path()), || {
            self.install_from(source, allow_overwrite, control)
        })
    }

    /// Like [`Manager::install`], detecting the source kind from `path`.
    pub fn install_path(&self, path: &Path, allow_overwrite: bool, control: &Control) -> Result<PluginEntry> {
        self.run(Action::Install, source_label(path), || {
            let source = InstallSource::detect(path)?;
            self.install_from(&source, allow_overwrite, control)
        })
    }

    fn install_from(
        &self,
        source: &InstallSource,
        allow_overwrite: bool,
        control: &Control,
    ) -> Result<(String, String, PluginEntry)> {
        let staging = self.staging()?;
        let (staged, name) = match source {
            InstallSource::Directory(dir) => {
                let name = plugin_name_of_dir(dir)?;
                if !allow_overwrite {
                    self.ensure_free(&name)?;
                }
                ensure_has_files(dir)?;
                let staged = staging.path().join("plugin");
                tree::copy(dir, &staged, control)?;
                (staged, name)
            }
            InstallSource::Archive(path) => {
                let unpacked = staging.path().join("unpacked");
                archive::unpack(path, &unpacked, control)?;
                resolve_layout(&unpacked, path)?
            }
        };

        let entry = self.commit(&staged, &name, allow_overwrite)?;
        close_staging(staging);
        let detail = format!("installed from {:?} ({})", source.path(), entry.state);
        Ok((entry.name.clone(), detail, entry))
    }

    /// Packs a plugin into `<backup root>/<Name>_<timestamp>.zip`.
    pub fn backup(&self, entry: &PluginEntry, control: &Control) -> Result<BackupArchive> {
        self.run(Action::Backup, entry.name.clone(), || self.backup_of(entry, control))
    }

    /// Backs up the plugin called `name`.
    pub fn backup_named(&self, name: &str, control: &Control) -> Result<BackupArchive> {
        self.run(Action::Backup, name.to_string(), || {
            let entry = registry::find(&self.root, name)?;
            self.backup_of(&entry, control)
        })
    }

    fn backup_of(&self, entry: &PluginEntry, control: &Control) -> Result<(String, String, BackupArchive)> {
        let source = self.existing_path(entry)?;
        fs::create_dir_all(&self.backup_root)
            .with_path("Failed to create backup folder", &self.backup_root)?;

        let created_at = Utc::now();
        let digest = tree::digest(&source)?;
        let manifest = BackupManifest {
            plugin: entry.name.clone(),
            created_at,
            state: entry.state,
            digest: digest.clone(),
        };
        let options = PackOptions {
            overwrite: false,
            comment: Some(serde_json::to_string(&manifest).map_err(|e| {
                PluginError::io(
                    "Failed to encode backup manifest",
                    io::Error::new(io::ErrorKind::InvalidData, e),
                )
            })?),
        };

        let mut counter = 0;
        let (archive_path, summary) = loop {
            let candidate = self
                .backup_root
                .join(format!("{}.zip", backup_stem(&entry.name, created_at, counter)));
            if candidate.exists() && counter < MAX_BACKUP_SUFFIX {
                counter += 1;
                continue;
            }
            match archive::pack(&source, &candidate, &options, control) {
                Ok(summary) => break (candidate, summary),
                // Lost a race with another writer of the same name.
                Err(PluginError::Io { ref source, .. })
                    if source.kind() == io::ErrorKind::AlreadyExists && counter < MAX_BACKUP_SUFFIX =>
                {
                    counter += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let detail = format!(
            "{} files, {} bytes -> {:?} ({} bytes)",
            summary.files, summary.total_size, archive_path, summary.archive_size
        );
        let backup = BackupArchive {
            source_plugin_name: entry.name.clone(),
            archive_path,
            created_at,
            digest: Some(digest),
        };
        Ok((entry.name.clone(), detail, backup))
    }

    /// Recreates a plugin from a backup archive. An existing plugin of the
    /// same name keeps its enabled/disabled state; otherwise the restored
    /// plugin is enabled.
    pub fn restore(&self, backup: &BackupArchive, allow_overwrite: bool, control: &Control) -> Result<PluginEntry> {
        self.run(Action::Restore, backup.source_plugin_name.clone(), || {
            self.restore_from(backup, allow_overwrite, control)
        })
    }

    /// Like [`Manager::restore`], reading the backup details from the archive
    /// at `archive_path`.
    pub fn restore_path(&self, archive_path: &Path, allow_overwrite: bool, control: &Control) -> Result<PluginEntry> {
        let target = archive_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .map(|stem| parse_backup_stem(&stem).map_or(stem.clone(), |(name, _)| name.to_string()))
            .unwrap_or_else(|| archive_path.display().to_string());
        self.run(Action::Restore, target, || {
            let backup = BackupArchive::from_path(archive_path)?;
            self.restore_from(&backup, allow_overwrite, control)
        })
    }

    fn restore_from(
        &self,
        backup: &BackupArchive,
        allow_overwrite: bool,
        control: &Control,
    ) -> Result<(String, String, PluginEntry)> {
        let name = &backup.source_plugin_name;
        validate_name(name)?;
        if !backup.archive_path.is_file() {
            return Err(PluginError::NotFound(format!("archive {:?}", backup.archive_path)));
        }
        if !allow_overwrite {
            self.ensure_free(name)?;
        }

        let staging = self.staging()?;
        let staged = staging.path().join("plugin");
        archive::unpack(&backup.archive_path, &staged, control)?;
        if !tree::walk(&staged)?.iter().any(|e| e.is_file()) {
            return Err(PluginError::corrupt(&backup.archive_path, "archive holds no files"));
        }

        if let Some(expected) = &backup.digest {
            let actual = tree::digest(&staged)?;
            if &actual != expected {
                return Err(PluginError::corrupt(
                    &backup.archive_path,
                    format!("content digest {} does not match manifest {}", actual, expected),
                ));
            }
        }

        let entry = self.commit(&staged, name, allow_overwrite)?;
        close_staging(staging);
        let detail = format!("restored from {:?} ({})", backup.archive_path, entry.state);
        Ok((entry.name.clone(), detail, entry))
    }

    /// Enables or disables a plugin.
    pub fn set_state(&self, entry: &PluginEntry, state: PluginState) -> Result<PluginEntry> {
        self.run(state_action(state), entry.name.clone(), || {
            validate_name(&entry.name)?;
            let moved = registry::set_state(&self.root, entry, state)?;
            let detail = format!("now at {:?}", moved.path);
            Ok((moved.name.clone(), detail, moved))
        })
    }

    /// Enables or disables the plugin called `name`.
    pub fn set_state_named(&self, name: &str, state: PluginState) -> Result<PluginEntry> {
        self.run(state_action(state), name.to_string(), || {
            let entry = registry::find(&self.root, name)?;
            let moved = registry::set_state(&self.root, &entry, state)?;
            let detail = format!("now at {:?}", moved.path);
            Ok((moved.name.clone(), detail, moved))
        })
    }

    /// Deletes a plugin. Irreversible; offering a backup first is up to the
    /// caller.
    pub fn remove(&self, entry: &PluginEntry) -> Result<()> {
        self.run(Action::Remove, entry.name.clone(), || self.remove_of(entry))
    }

    /// Deletes the plugin called `name`.
    pub fn remove_named(&self, name: &str) -> Result<()> {
        self.run(Action::Remove, name.to_string(), || {
            let entry = registry::find(&self.root, name)?;
            self.remove_of(&entry)
        })
    }

    fn remove_of(&self, entry: &PluginEntry) -> Result<(String, String, ())> {
        let path = self.existing_path(entry)?;

        // Move out of sight first so a failed delete cannot leave a
        // half-removed plugin visible to scans.
        let trash = self.staging()?;
        let parked = trash.path().join("removed");
        fs::rename(&path, &parked).with_path("Failed to move plugin out of", &path)?;
        trash
            .close()
            .map_err(|e| PluginError::io(format!("Failed to delete plugin {:?}", entry.name), e))?;

        Ok((entry.name.clone(), format!("deleted {:?}", path), ()))
    }

    /// Deletes a backup archive from disk.
    pub fn delete_backup(&self, backup: &BackupArchive) -> Result<()> {
        let target = backup
            .archive_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| backup.source_plugin_name.clone());
        self.run(Action::DeleteBackup, target.clone(), || {
            if !backup.archive_path.is_file() {
                return Err(PluginError::NotFound(format!("archive {:?}", backup.archive_path)));
            }
            fs::remove_file(&backup.archive_path)
                .with_path("Failed to delete backup", &backup.archive_path)?;
            Ok((target.clone(), format!("deleted {:?}", backup.archive_path), ()))
        })
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Runs one mutating operation under the busy flag and records its
    /// outcome. `op` returns the record target, a detail line and the value.
    fn run<T>(
        &self,
        action: Action,
        target: String,
        op: impl FnOnce() -> Result<(String, String, T)>,
    ) -> Result<T> {
        let result = self.begin().and_then(|_guard| op());

        let (record, result) = match result {
            Ok((target, detail, value)) => (OperationRecord::success(action, target, detail), Ok(value)),
            Err(e) => (OperationRecord::failure(action, target, &e), Err(e)),
        };
        // A failed journal write is reported by the log itself.
        let _ = self.log().append(record);
        result
    }

    fn begin(&self) -> Result<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| PluginError::Busy)?;
        Ok(BusyGuard(&self.busy))
    }

    fn log(&self) -> MutexGuard<'_, OperationLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn staging(&self) -> Result<Staging> {
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(self.root.path())
            .with_path("Failed to create staging directory in", self.root.path())?;
        Ok(Staging {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    /// The on-disk location of `entry`, derived from the naming convention
    /// rather than trusted from the entry.
    fn existing_path(&self, entry: &PluginEntry) -> Result<PathBuf> {
        validate_name(&entry.name)?;
        let path = self.root.plugin_path(&entry.name, entry.state);
        if path.is_dir() {
            return Ok(path);
        }
        // Stale entry: the plugin may have changed state since the scan.
        registry::find(&self.root, &entry.name).map(|found| found.path)
    }

    /// Paths currently holding a plugin called `name`, enabled first.
    fn occupants(&self, name: &str) -> Vec<(PathBuf, PluginState)> {
        [PluginState::Enabled, PluginState::Disabled]
            .into_iter()
            .map(|state| (self.root.plugin_path(name, state), state))
            .filter(|(path, _)| fs::symlink_metadata(path).is_ok())
            .collect()
    }

    fn ensure_free(&self, name: &str) -> Result<()> {
        match self.occupants(name).into_iter().next() {
            Some((path, _)) => Err(PluginError::NameCollision {
                name: name.to_string(),
                path,
            }),
            None => Ok(()),
        }
    }

    /// Moves a staged plugin tree into the plugins root as `name`.
    ///
    /// With `allow_overwrite`, anything already holding the name is parked
    /// in a trash directory, the new tree renamed in, and the old one deleted.
    /// If the final rename fails the old plugin is put back.
    fn commit(&self, staged: &Path, name: &str, allow_overwrite: bool) -> Result<PluginEntry> {
        validate_name(name)?;
        let occupants = self.occupants(name);

        if let Some((path, _)) = occupants.first() {
            if !allow_overwrite {
                return Err(PluginError::NameCollision {
                    name: name.to_string(),
                    path: path.clone(),
                });
            }
        }

        let state = occupants
            .first()
            .map(|(_, state)| *state)
            .unwrap_or(PluginState::Enabled);
        let target = self.root.plugin_path(name, state);

        let trash = self.staging()?;
        let mut parked = Vec::new();
        for (i, (path, _)) in occupants.iter().enumerate() {
            let slot = trash.path().join(i.to_string());
            if let Err(e) = fs::rename(path, &slot) {
                restore_parked(&parked);
                return Err(PluginError::io(format!("Failed to move aside {:?}", path), e));
            }
            parked.push((slot, path.clone()));
        }

        if let Err(e) = fs::rename(staged, &target) {
            restore_parked(&parked);
            return Err(PluginError::io(format!("Failed to move plugin into {:?}", target), e));
        }

        if !parked.is_empty() {
            tracing::info!(plugin = %name, "replaced existing plugin");
        }
        close_staging(trash);

        Ok(PluginEntry {
            name: name.to_string(),
            path: target,
            state,
        })
    }
}

fn state_action(state: PluginState) -> Action {
    match state {
        PluginState::Enabled => Action::Enable,
        PluginState::Disabled => Action::Disable,
    }
}

fn restore_parked(parked: &[(PathBuf, PathBuf)]) {
    for (slot, original) in parked.iter().rev() {
        if let Err(e) = fs::rename(slot, original) {
            tracing::error!("Failed to put {:?} back after a failed install: {}", original, e);
        }
    }
}

fn close_staging(staging: Staging) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        tracing::warn!("Failed to clean up staging directory {:?}: {}", path, e);
    }
}

/// Plugin names become top-level directory names, so they must be a single
/// visible path component.
fn validate_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name == ".."
        || classify(name).0 != name;
    if bad {
        return Err(PluginError::io(
            format!("Not a valid plugin name: {:?}", name),
            io::Error::from(io::ErrorKind::InvalidInput),
        ));
    }
    Ok(())
}

fn plugin_name_of_dir(dir: &Path) -> Result<String> {
    let dir_name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| PluginError::NotFound(format!("plugin folder name of {:?}", dir)))?;
    let name = classify(&dir_name).0.to_string();
    validate_name(&name)?;
    Ok(name)
}

fn ensure_has_files(dir: &Path) -> Result<()> {
    if tree::walk(dir)?.iter().any(|e| e.is_file()) {
        Ok(())
    } else {
        Err(PluginError::io(
            format!("Plugin folder contains no files: {:?}", dir),
            io::Error::from(io::ErrorKind::InvalidInput),
        ))
    }
}

fn source_label(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|n| classify(&n.to_string_lossy()).0.to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Works out which part of an unpacked archive is the plugin.
///
/// - An archive carrying a backup manifest is rooted at the plugin and named
///   by the manifest.
/// - A single top-level folder and nothing else is the plugin; its name
///   (disabled suffix stripped) is the plugin name.
/// - Anything else is a plugin rooted at the archive root, named after the
///   archive file.
fn resolve_layout(unpacked: &Path, archive_path: &Path) -> Result<(PathBuf, String)> {
    for noise in ARCHIVE_NOISE {
        tree::remove(&unpacked.join(noise))?;
    }

    let mut children = Vec::new();
    for entry in fs::read_dir(unpacked).with_path("Failed to read directory", unpacked)? {
        let entry = entry.with_path("Failed to read directory entry in", unpacked)?;
        children.push(entry.path());
    }
    if children.is_empty() || !tree::walk(unpacked)?.iter().any(|e| e.is_file()) {
        return Err(PluginError::corrupt(archive_path, "archive holds no files"));
    }

    let comment = archive::read_comment(archive_path)?;
    if let Some(manifest) = BackupManifest::parse(&comment) {
        return Ok((unpacked.to_path_buf(), manifest.plugin));
    }

    if let [only] = children.as_slice() {
        if only.is_dir() {
            let name = plugin_name_of_dir(only)?;
            return Ok((only.clone(), name));
        }
    }

    let name = source_label(archive_path);
    validate_name(&name)?;
    Ok((unpacked.to_path_buf(), name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Outcome;
    use crate::progress::CancelFlag;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    struct Fixture {
        _tmp: tempfile::TempDir,
        manager: Manager,
        scratch: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::TempDir::new().unwrap();
        let plugins = tmp.path().join("Resources").join("plugins");
        let scratch = tmp.path().join("scratch");
        fs::create_dir_all(&plugins).unwrap();
        fs::create_dir_all(&scratch).unwrap();

        let root = PluginsRoot::open(&plugins).unwrap();
        let manager = Manager::new(root, tmp.path().join("backups"), OperationLog::in_memory());
        Fixture {
            _tmp: tmp,
            manager,
            scratch,
        }
    }

    fn write_plugin(dir: &Path, marker: &str) {
        fs::create_dir_all(dir.join("64")).unwrap();
        fs::write(dir.join("64").join("lin.xpl"), marker.as_bytes()).unwrap();
        fs::write(dir.join("README.txt"), b"readme").unwrap();
    }

    fn zip_with(path: &Path, files: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(fs::File::create(path).unwrap());
        for (name, body) in files {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }

    fn root_listing(manager: &Manager) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(manager.plugins_root().path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn install_from_folder_copies_and_records() {
        let f = fixture();
        let src = f.scratch.join("AutoGate");
        write_plugin(&src, "v1");

        let entry = f
            .manager
            .install(&InstallSource::Directory(src.clone()), false, &Control::new())
            .unwrap();
        assert_eq!(entry.name, "AutoGate");
        assert_eq!(entry.state, PluginState::Enabled);
        assert_eq!(fs::read(entry.path.join("64/lin.xpl")).unwrap(), b"v1");
        assert!(src.is_dir(), "source folder is copied, not moved");

        let records = f.manager.records(Some(Action::Install), None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Success);
        assert_eq!(records[0].target, "AutoGate");
        assert_eq!(root_listing(&f.manager), vec!["AutoGate"]);
    }

    #[test]
    fn install_collision_leaves_existing_plugin_untouched() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate"), "original");
        let src = f.scratch.join("AutoGate");
        write_plugin(&src, "new");

        let err = f
            .manager
            .install(&InstallSource::Directory(src), false, &Control::new())
            .unwrap_err();
        assert!(matches!(err, PluginError::NameCollision { .. }));

        let existing = f.manager.plugins_root().path().join("AutoGate/64/lin.xpl");
        assert_eq!(fs::read(existing).unwrap(), b"original");
        assert_eq!(root_listing(&f.manager), vec!["AutoGate"]);

        let records = f.manager.records(None, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, Outcome::Failure);
        assert!(records[0].detail.starts_with("NameCollision"));
    }

    #[test]
    fn overwrite_replaces_and_keeps_disabled_state() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate (disabled)"), "old");
        let src = f.scratch.join("AutoGate");
        write_plugin(&src, "new");

        let entry = f
            .manager
            .install(&InstallSource::Directory(src), true, &Control::new())
            .unwrap();
        assert_eq!(entry.state, PluginState::Disabled);
        assert_eq!(fs::read(entry.path.join("64/lin.xpl")).unwrap(), b"new");
        assert_eq!(root_listing(&f.manager), vec!["AutoGate (disabled)"]);
    }

    #[test]
    fn cancelled_install_leaves_no_partial_plugin() {
        let f = fixture();
        let src = f.scratch.join("BigPlugin");
        write_plugin(&src, "x");
        for i in 0..20 {
            fs::write(src.join(format!("data{i}.bin")), vec![i as u8; 1024]).unwrap();
        }

        let flag = CancelFlag::new();
        let trip = flag.clone();
        let control = Control::new().with_cancel(flag).with_progress(move |p| {
            if p.done == 5 {
                trip.cancel();
            }
        });

        let err = f
            .manager
            .install(&InstallSource::Directory(src), false, &control)
            .unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));
        assert!(root_listing(&f.manager).is_empty());
        assert_eq!(f.manager.records(None, None)[0].outcome, Outcome::Failure);
    }

    #[test]
    fn install_from_archive_with_single_top_folder() {
        let f = fixture();
        let archive = f.scratch.join("download-v2.zip");
        zip_with(
            &archive,
            &[
                ("Better Pushback/64/lin.xpl", b"bp"),
                ("Better Pushback/README.txt", b"hi"),
                ("__MACOSX/._README.txt", b"junk"),
            ],
        );

        let entry = f
            .manager
            .install(&InstallSource::Archive(archive), false, &Control::new())
            .unwrap();
        assert_eq!(entry.name, "Better Pushback");
        assert!(entry.path.join("64/lin.xpl").is_file());
        assert_eq!(root_listing(&f.manager), vec!["Better Pushback"]);
    }

    #[test]
    fn install_from_flat_archive_uses_archive_name() {
        let f = fixture();
        let archive = f.scratch.join("XCamera.zip");
        zip_with(&archive, &[("64/lin.xpl", b"x"), ("readme.txt", b"r")]);

        let entry = f
            .manager
            .install(&InstallSource::Archive(archive), false, &Control::new())
            .unwrap();
        assert_eq!(entry.name, "XCamera");
        assert!(entry.path.join("readme.txt").is_file());
    }

    #[test]
    fn traversal_archive_fails_install_cleanly() {
        let f = fixture();
        let archive = f.scratch.join("evil.zip");
        zip_with(&archive, &[("evil/ok.txt", b"ok"), ("../../escape.txt", b"bad")]);

        let err = f
            .manager
            .install(&InstallSource::Archive(archive), false, &Control::new())
            .unwrap_err();
        assert!(matches!(err, PluginError::PathTraversal { .. }));
        assert!(root_listing(&f.manager).is_empty());
    }

    #[test]
    fn backup_names_and_manifest() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("FlyWithLua"), "fwl");
        let entry = f.manager.find("FlyWithLua").unwrap();

        let first = f.manager.backup(&entry, &Control::new()).unwrap();
        let second = f.manager.backup(&entry, &Control::new()).unwrap();
        assert_ne!(first.archive_path, second.archive_path);

        let file_name = first.archive_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("FlyWithLua_"));
        assert!(file_name.ends_with(".zip"));

        let reread = BackupArchive::from_path(&first.archive_path).unwrap();
        assert_eq!(reread.source_plugin_name, "FlyWithLua");
        assert_eq!(reread.digest, first.digest);

        let listed = f.manager.list_backups().unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn restore_preserves_disabled_state_when_overwriting() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate"), "v1");
        let entry = f.manager.find("AutoGate").unwrap();
        let backup = f.manager.backup(&entry, &Control::new()).unwrap();

        let disabled = f.manager.set_state(&entry, PluginState::Disabled).unwrap();
        fs::write(disabled.path.join("64/lin.xpl"), b"v2").unwrap();

        let err = f.manager.restore(&backup, false, &Control::new()).unwrap_err();
        assert!(matches!(err, PluginError::NameCollision { .. }));

        let restored = f.manager.restore(&backup, true, &Control::new()).unwrap();
        assert_eq!(restored.state, PluginState::Disabled);
        assert_eq!(fs::read(restored.path.join("64/lin.xpl")).unwrap(), b"v1");
        assert_eq!(root_listing(&f.manager), vec!["AutoGate (disabled)"]);
    }

    #[test]
    fn restore_rejects_digest_mismatch() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate"), "v1");
        let entry = f.manager.find("AutoGate").unwrap();
        let mut backup = f.manager.backup(&entry, &Control::new()).unwrap();
        f.manager.remove(&entry).unwrap();

        backup.digest = Some("0".repeat(32));
        let err = f.manager.restore(&backup, false, &Control::new()).unwrap_err();
        assert!(matches!(err, PluginError::CorruptArchive { .. }));
        assert!(root_listing(&f.manager).is_empty());
    }

    #[test]
    fn busy_flag_rejects_overlapping_operations() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate"), "v1");
        let entry = f.manager.find("AutoGate").unwrap();

        let guard = f.manager.begin().unwrap();
        let err = f.manager.set_state(&entry, PluginState::Disabled).unwrap_err();
        assert!(matches!(err, PluginError::Busy));
        drop(guard);

        f.manager.set_state(&entry, PluginState::Disabled).unwrap();
        let outcomes: Vec<_> = f.manager.records(Some(Action::Disable), None).iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Failure, Outcome::Success]);
    }

    #[test]
    fn remove_deletes_plugin_and_staging() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate (disabled)"), "v1");
        let entry = f.manager.find("AutoGate").unwrap();

        f.manager.remove(&entry).unwrap();
        assert!(root_listing(&f.manager).is_empty());
        assert!(matches!(f.manager.remove(&entry), Err(PluginError::NotFound(_))));
        assert_eq!(f.manager.records(Some(Action::Remove), Some("AutoGate")).len(), 2);
    }

    #[test]
    fn delete_backup_removes_archive() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate"), "v1");
        let entry = f.manager.find("AutoGate").unwrap();
        let backup = f.manager.backup(&entry, &Control::new()).unwrap();

        f.manager.delete_backup(&backup).unwrap();
        assert!(!backup.archive_path.exists());
        assert!(f.manager.list_backups().unwrap().is_empty());
    }

    #[test]
    fn detect_source_kinds() {
        let f = fixture();
        let dir = f.scratch.join("Plugin");
        write_plugin(&dir, "x");
        let zip = f.scratch.join("Plugin.ZIP");
        zip_with(&zip, &[("a.txt", b"a")]);
        let txt = f.scratch.join("notes.txt");
        fs::write(&txt, b"x").unwrap();

        assert_eq!(InstallSource::detect(&dir).unwrap(), InstallSource::Directory(dir.clone()));
        assert_eq!(InstallSource::detect(&zip).unwrap(), InstallSource::Archive(zip.clone()));
        assert!(matches!(InstallSource::detect(&txt), Err(PluginError::Io { .. })));
        assert!(matches!(
            InstallSource::detect(f.scratch.join("missing")),
            Err(PluginError::NotFound(_))
        ));
    }

    #[test]
    fn archive_install_failing_after_unpack_leaves_no_staging() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate"), "original");

        // Layout resolution rejects a hidden top-level folder.
        let hidden = f.scratch.join("hidden.zip");
        zip_with(&hidden, &[(".secret/64/lin.xpl", b"x")]);
        let err = f
            .manager
            .install(&InstallSource::Archive(hidden), false, &Control::new())
            .unwrap_err();
        assert!(matches!(err, PluginError::Io { .. }));
        assert_eq!(root_listing(&f.manager), vec!["AutoGate"]);

        // Commit refuses to replace an existing plugin.
        let clash = f.scratch.join("AutoGate.zip");
        zip_with(&clash, &[("AutoGate/64/lin.xpl", b"new")]);
        let err = f
            .manager
            .install(&InstallSource::Archive(clash), false, &Control::new())
            .unwrap_err();
        assert!(matches!(err, PluginError::NameCollision { .. }));
        assert_eq!(root_listing(&f.manager), vec!["AutoGate"]);
        let kept = f.manager.plugins_root().path().join("AutoGate/64/lin.xpl");
        assert_eq!(fs::read(kept).unwrap(), b"original");
    }

    #[test]
    fn lookups_by_name_or_path_are_recorded_when_they_fail() {
        let f = fixture();
        let missing = f.scratch.join("Ghost_20260101T000000Z.zip");

        assert!(matches!(f.manager.remove_named("Ghost"), Err(PluginError::NotFound(_))));
        assert!(f.manager.set_state_named("Ghost", PluginState::Enabled).is_err());
        assert!(f.manager.backup_named("Ghost", &Control::new()).is_err());
        assert!(f.manager.restore_path(&missing, false, &Control::new()).is_err());
        assert!(f.manager.install_path(&missing, false, &Control::new()).is_err());

        let records = f.manager.records(None, None);
        let summary: Vec<_> = records.iter().map(|r| (r.action, r.target.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (Action::Remove, "Ghost"),
                (Action::Enable, "Ghost"),
                (Action::Backup, "Ghost"),
                (Action::Restore, "Ghost"),
                (Action::Install, "Ghost_20260101T000000Z"),
            ]
        );
        assert!(records.iter().all(|r| r.outcome == Outcome::Failure));
    }

    #[test]
    fn named_operations_resolve_current_state() {
        let f = fixture();
        write_plugin(&f.manager.plugins_root().path().join("AutoGate (disabled)"), "v1");

        let entry = f.manager.set_state_named("AutoGate", PluginState::Enabled).unwrap();
        assert!(entry.is_enabled());
        let backup = f.manager.backup_named("AutoGate", &Control::new()).unwrap();
        f.manager.remove_named("AutoGate").unwrap();
        assert!(root_listing(&f.manager).is_empty());

        let restored = f.manager.restore_path(&backup.archive_path, false, &Control::new()).unwrap();
        assert_eq!(restored.name, "AutoGate");
        assert_eq!(fs::read(restored.path.join("64/lin.xpl")).unwrap(), b"v1");
    }

    #[cfg(unix)]
    #[test]
    fn links_survive_backup_and_restore() {
        let f = fixture();
        let plugin = f.manager.plugins_root().path().join("XPLM");
        fs::create_dir_all(plugin.join("mac_x64/XPLM.framework/Versions/C")).unwrap();
        fs::write(plugin.join("mac_x64/XPLM.framework/Versions/C/XPLM"), b"mach-o").unwrap();
        tree::symlink(Path::new("C"), &plugin.join("mac_x64/XPLM.framework/Versions/Current")).unwrap();
        tree::symlink(Path::new("nowhere.cfg"), &plugin.join("dangling.cfg")).unwrap();

        let entry = f.manager.find("XPLM").unwrap();
        let backup = f.manager.backup(&entry, &Control::new()).unwrap();
        f.manager.remove(&entry).unwrap();
        f.manager.restore(&backup, false, &Control::new()).unwrap();

        let current = plugin.join("mac_x64/XPLM.framework/Versions/Current");
        assert!(fs::symlink_metadata(&current).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&current).unwrap(), PathBuf::from("C"));
        assert_eq!(fs::read_link(plugin.join("dangling.cfg")).unwrap(), PathBuf::from("nowhere.cfg"));
    }

    #[cfg(unix)]
    #[test]
    fn read_only_directories_do_not_strand_staging() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        let src = f.scratch.join("AutoGate");
        write_plugin(&src, "v1");
        fs::set_permissions(src.join("64"), fs::Permissions::from_mode(0o555)).unwrap();
        let archive = f.scratch.join("AutoGate.zip");
        archive::pack(&src, &archive, &PackOptions::default(), &Control::new()).unwrap();

        let entry = f
            .manager
            .install(&InstallSource::Archive(archive.clone()), false, &Control::new())
            .unwrap();
        let mode = fs::metadata(entry.path.join("64")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o555);

        // Overwrite parks the read-only tree in trash, then deletes it.
        f.manager
            .install(&InstallSource::Archive(archive), true, &Control::new())
            .unwrap();
        assert_eq!(root_listing(&f.manager), vec!["AutoGate"]);

        f.manager.remove(&entry).unwrap();
        assert!(root_listing(&f.manager).is_empty());
    }

    #[test]
    fn journal_failures_are_visible_to_the_shell() {
        let tmp = tempfile::TempDir::new().unwrap();
        let plugins = tmp.path().join("plugins");
        fs::create_dir_all(&plugins).unwrap();
        write_plugin(&plugins.join("AutoGate"), "v1");

        let journal = tmp.path().join("operations.jsonl");
        let log = OperationLog::open(&journal, 10).unwrap();
        fs::create_dir(&journal).unwrap();
        let manager = Manager::new(PluginsRoot::open(&plugins).unwrap(), tmp.path().join("backups"), log);

        assert!(manager.journal_error().is_none());
        manager.set_state_named("AutoGate", PluginState::Disabled).unwrap();
        let report = manager.journal_error().unwrap();
        assert_eq!(report.kind, crate::error::ErrorKind::Io);
        assert_eq!(manager.records(None, None).len(), 1);
    }

    #[test]
    fn names_must_be_single_visible_components() {
        assert!(validate_name("FlyWithLua").is_ok());
        assert!(validate_name("X Camera").is_ok());
        for bad in ["", ".hidden", "a/b", "a\\b", "Foo (disabled)"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
