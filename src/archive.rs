//! ZIP codec for plugin directory trees.
//!
//! Archives hold the plugin's tree rooted at the archive root, `/`-separated,
//! with directory entries so empty folders survive a round trip. Unix
//! permissions and modification times (at ZIP's two-second resolution) are
//! carried in the entry headers. Symbolic links are stored as link entries
//! (unix mode `S_IFLNK`, body is the target) and must point inside the tree.
//!
//! Both directions are all-or-nothing: [`pack`] writes a temporary file next
//! to the destination and persists it at the end, [`unpack`] validates every
//! entry name up front and extracts into a hidden staging directory that is
//! only moved into place once complete.

use crate::error::{IoContext, PluginError, Result};
use crate::progress::Control;
use crate::tree;
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Replace an existing file at the destination.
    pub overwrite: bool,
    /// Archive comment, used for the backup manifest.
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackSummary {
    pub files: usize,
    pub total_size: u64,
    pub archive_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackSummary {
    pub files: usize,
    pub directories: usize,
    pub links: usize,
}

/// What an archive entry becomes on disk.
enum Planned {
    Dir,
    File,
    Link(PathBuf),
}

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Writes every file and directory under `source_dir` into `dest`.
pub fn pack(
    source_dir: &Path,
    dest: &Path,
    options: &PackOptions,
    control: &Control,
) -> Result<PackSummary> {
    let entries = tree::walk(source_dir)?;
    let files = entries.iter().filter(|e| e.is_file()).count();
    if files == 0 {
        return Err(PluginError::io(
            format!("Nothing to archive in {:?}", source_dir),
            io::Error::new(io::ErrorKind::InvalidInput, "source folder contains no files"),
        ));
    }

    if dest.exists() && !options.overwrite {
        return Err(PluginError::io(
            format!("Archive already exists: {:?}", dest),
            io::Error::from(io::ErrorKind::AlreadyExists),
        ));
    }

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = tempfile::Builder::new()
        .prefix(".xpm-pack-")
        .suffix(".zip.part")
        .tempfile_in(parent)
        .with_path("Failed to create temporary archive in", parent)?;

    let total_size: u64 = entries.iter().map(|e| e.len).sum();
    tracing::debug!(
        source = %source_dir.display(),
        archive = %dest.display(),
        files,
        total_size,
        "packing archive"
    );

    let mut writer = ZipWriter::new(tmp);
    let total = entries.len();
    for (i, entry) in entries.iter().enumerate() {
        control.checkpoint()?;

        if let Some(link) = &entry.link {
            let target = link.to_string_lossy().replace('\\', "/");
            safe_link_target(Path::new(&entry.relative), &target)?;
            writer
                .add_symlink(entry.relative.as_str(), target, FileOptions::default().unix_permissions(0o777))
                .map_err(|e| zip_write_error(dest, e))?;
            control.report(i + 1, total, &entry.relative);
            continue;
        }

        let metadata = fs::metadata(&entry.path).with_path("Failed to inspect", &entry.path)?;
        let file_options = entry_options(&metadata);

        if entry.is_dir {
            writer
                .add_directory(entry.relative.as_str(), file_options)
                .map_err(|e| zip_write_error(dest, e))?;
        } else {
            writer
                .start_file(entry.relative.as_str(), file_options)
                .map_err(|e| zip_write_error(dest, e))?;
            let mut source = File::open(&entry.path).with_path("Failed to open", &entry.path)?;
            io::copy(&mut source, &mut writer).with_path("Failed to archive", &entry.path)?;
        }

        control.report(i + 1, total, &entry.relative);
    }

    if let Some(comment) = &options.comment {
        writer.set_comment(comment.clone());
    }

    let tmp = writer.finish().map_err(|e| zip_write_error(dest, e))?;
    tmp.as_file()
        .sync_all()
        .with_path("Failed to flush archive", tmp.path())?;

    let persisted = if options.overwrite {
        tmp.persist(dest)
    } else {
        tmp.persist_noclobber(dest)
    };
    persisted.map_err(|e| PluginError::io(format!("Failed to move archive into place: {:?}", dest), e.error))?;

    let archive_size = fs::metadata(dest)
        .with_path("Failed to inspect archive", dest)?
        .len();
    if total_size > 0 {
        let ratio = (1.0 - archive_size as f64 / total_size as f64) * 100.0;
        tracing::debug!(archive_size, "compression ratio {:.2}%", ratio);
    }

    Ok(PackSummary {
        files,
        total_size,
        archive_size,
    })
}

/// Extracts `archive_path` into `dest_dir`, creating it if absent.
///
/// Fails with [`PluginError::PathTraversal`] before touching the filesystem
/// if any entry would land outside `dest_dir`.
pub fn unpack(archive_path: &Path, dest_dir: &Path, control: &Control) -> Result<UnpackSummary> {
    let mut archive = open(archive_path)?;

    let mut plan = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| PluginError::from_zip(archive_path, e))?;
        let relative = safe_relative_path(file.name())?;
        let kind = if file.is_dir() {
            Planned::Dir
        } else if file.unix_mode().map_or(false, |m| m & S_IFMT == S_IFLNK) {
            let mut target = String::new();
            file.read_to_string(&mut target)
                .map_err(|e| PluginError::corrupt(archive_path, e.to_string()))?;
            Planned::Link(safe_link_target(&relative, &target)?)
        } else {
            Planned::File
        };
        plan.push((relative, kind));
    }

    if dest_dir.exists() && !dest_dir.is_dir() {
        return Err(PluginError::io(
            format!("Destination is not a directory: {:?}", dest_dir),
            io::Error::from(io::ErrorKind::AlreadyExists),
        ));
    }

    let parent = match dest_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_path("Failed to create directory", parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".xpm-unpack-")
        .tempdir_in(parent)
        .with_path("Failed to create staging directory in", parent)?;

    let mut summary = UnpackSummary {
        files: 0,
        directories: 0,
        links: 0,
    };
    let mut dir_modes = Vec::new();
    let total = plan.len();

    for (i, (relative, kind)) in plan.iter().enumerate() {
        control.checkpoint()?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        let mut file = archive
            .by_index(i)
            .map_err(|e| PluginError::from_zip(archive_path, e))?;
        let out = staging.path().join(relative);

        match kind {
            Planned::Dir => {
                fs::create_dir_all(&out).with_path("Failed to create directory", &out)?;
                dir_modes.push((out, file.unix_mode()));
                summary.directories += 1;
            }
            Planned::Link(target) => {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent).with_path("Failed to create directory", parent)?;
                }
                tree::symlink(target, &out).with_path("Failed to create link", &out)?;
                summary.links += 1;
            }
            Planned::File => {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent).with_path("Failed to create directory", parent)?;
                }
                let mut out_file = File::create(&out).with_path("Failed to create file", &out)?;
                copy_entry(&mut file, &mut out_file, archive_path, &out)?;

                if let Some(modified) = zip_time_to_system(file.last_modified()) {
                    if let Err(e) = out_file.set_modified(modified) {
                        tracing::warn!("Failed to restore modification time of {:?}: {}", out, e);
                    }
                }
                drop(out_file);
                apply_mode(&out, file.unix_mode());
                summary.files += 1;
            }
        }

        control.report(i + 1, total, &relative.to_string_lossy());
    }

    // Directory modes last, a read-only directory would block its children.
    for (dir, mode) in dir_modes.into_iter().rev() {
        apply_mode(&dir, mode);
    }

    if let Err(e) = control.checkpoint().and_then(|()| place_tree(staging.path(), dest_dir)) {
        // Restored read-only modes would keep the staging tree from being
        // deleted.
        if let Err(unlock_err) = tree::unlock(staging.path()) {
            tracing::warn!("Failed to clean up {:?}: {}", staging.path(), unlock_err);
        }
        return Err(e);
    }
    Ok(summary)
}

/// Lazily lists the relative paths held by an archive. Every call re-opens
/// the archive, so the listing can be restarted at will.
pub fn list_contents(archive_path: &Path) -> Result<ArchiveContents> {
    Ok(ArchiveContents {
        archive: open(archive_path)?,
        path: archive_path.to_path_buf(),
        next: 0,
    })
}

pub struct ArchiveContents {
    archive: ZipArchive<File>,
    path: PathBuf,
    next: usize,
}

impl Iterator for ArchiveContents {
    type Item = Result<PathBuf>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.archive.len() {
            return None;
        }
        let index = self.next;
        self.next += 1;

        let path = &self.path;
        let item = match self.archive.by_index(index) {
            Ok(file) => safe_relative_path(file.name()),
            Err(e) => Err(PluginError::from_zip(path, e)),
        };
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.archive.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

/// Raw archive comment bytes; empty when the archive has none.
pub fn read_comment(archive_path: &Path) -> Result<Vec<u8>> {
    Ok(open(archive_path)?.comment().to_vec())
}

fn open(archive_path: &Path) -> Result<ZipArchive<File>> {
    let file = match File::open(archive_path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PluginError::NotFound(format!("archive {:?}", archive_path)))
        }
        Err(e) => return Err(PluginError::io(format!("Failed to open archive {:?}", archive_path), e)),
    };
    ZipArchive::new(file).map_err(|e| PluginError::from_zip(archive_path, e))
}

/// Turns an entry name into a path relative to the extraction root. Parent
/// segments, absolute paths and drive prefixes are rejected; `\` counts as a
/// separator so Windows-made archives cannot smuggle `..\` through.
pub fn safe_relative_path(name: &str) -> Result<PathBuf> {
    let traversal = || PluginError::PathTraversal {
        entry: name.to_string(),
    };

    if name.starts_with('/') || name.starts_with('\\') {
        return Err(traversal());
    }

    let mut out = PathBuf::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(traversal()),
            p if p.contains(':') => return Err(traversal()),
            p => out.push(p),
        }
    }
    Ok(out)
}

/// Checks that a link stored at `entry` points inside the tree it belongs
/// to and returns its target with native separators. Absolute targets and
/// targets climbing above the tree root are rejected.
pub fn safe_link_target(entry: &Path, target: &str) -> Result<PathBuf> {
    let traversal = || PluginError::PathTraversal {
        entry: format!("{} -> {}", entry.display(), target),
    };

    if target.is_empty() || target.starts_with('/') || target.starts_with('\\') {
        return Err(traversal());
    }

    let mut depth = entry.components().count().saturating_sub(1);
    let mut out = PathBuf::new();
    for part in target.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => {
                depth = depth.checked_sub(1).ok_or_else(|| traversal())?;
                out.push("..");
            }
            p if p.contains(':') => return Err(traversal()),
            p => {
                depth += 1;
                out.push(p);
            }
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    Ok(out)
}

/// Moves a finished staging tree to `dest`. A missing `dest` is a single
/// rename; an existing one receives the staged top-level children, after
/// checking that none of them would replace something.
fn place_tree(staged: &Path, dest: &Path) -> Result<()> {
    if !dest.exists() {
        return fs::rename(staged, dest).with_path("Failed to move extracted tree to", dest);
    }

    let mut children = Vec::new();
    for entry in fs::read_dir(staged).with_path("Failed to read directory", staged)? {
        let entry = entry.with_path("Failed to read directory entry in", staged)?;
        let target = dest.join(entry.file_name());
        if fs::symlink_metadata(&target).is_ok() {
            return Err(PluginError::NameCollision {
                name: entry.file_name().to_string_lossy().to_string(),
                path: target,
            });
        }
        children.push((entry.path(), target));
    }

    for (from, to) in children {
        fs::rename(&from, &to).with_path("Failed to move extracted entry to", &to)?;
    }
    Ok(())
}

/// Copies an entry body, telling read failures (archive corruption, CRC
/// mismatch) apart from write failures.
fn copy_entry(reader: &mut impl Read, writer: &mut impl Write, archive: &Path, out: &Path) -> Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PluginError::corrupt(archive, e.to_string())),
        };
        writer.write_all(&buf[..n]).with_path("Failed to write", out)?;
        written += n as u64;
    }
    Ok(written)
}

fn entry_options(metadata: &fs::Metadata) -> FileOptions {
    let mut options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(metadata.len() >= u32::MAX as u64);

    if let Some(time) = metadata.modified().ok().and_then(system_time_to_zip) {
        options = options.last_modified_time(time);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode() & 0o7777);
    }

    options
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let mode = mode & 0o7777;
        if mode != 0 {
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
                tracing::warn!("Failed to restore permissions of {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: Option<u32>) {}

/// ZIP timestamps are local wall-clock time, from 1980 onwards.
fn system_time_to_zip(time: SystemTime) -> Option<zip::DateTime> {
    let local = DateTime::<Local>::from(time);
    zip::DateTime::from_date_and_time(
        u16::try_from(local.year()).ok()?,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .ok()
}

fn zip_time_to_system(time: zip::DateTime) -> Option<SystemTime> {
    let naive = NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)?
        .and_hms_opt(time.hour() as u32, time.minute() as u32, time.second() as u32)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(SystemTime::from)
}

fn zip_write_error(dest: &Path, err: zip::result::ZipError) -> PluginError {
    match err {
        zip::result::ZipError::Io(source) => {
            PluginError::io(format!("Failed to write archive {:?}", dest), source)
        }
        other => PluginError::io(
            format!("Failed to write archive {:?}", dest),
            io::Error::new(io::ErrorKind::Other, other),
        ),
    }
}
