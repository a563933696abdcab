//! Directory tree helpers: recursive enumeration, copying and content digest.
//!
//! Symbolic links inside a tree are never followed. They are reported as
//! entries of their own carrying the link target, copied as links, and
//! hashed by target.

use crate::error::{IoContext, PluginError, Result};
use crate::progress::Control;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// One file or directory below a tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path relative to the root, `/`-separated.
    pub relative: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub len: u64,
    /// Target of a symbolic link, as stored in the link.
    pub link: Option<PathBuf>,
}

impl TreeEntry {
    /// A regular file, neither a directory nor a link.
    pub fn is_file(&self) -> bool {
        !self.is_dir && self.link.is_none()
    }
}

/// Recursively enumerates everything below `root`, sorted by relative path.
/// The root itself is not included.
pub fn walk(root: &Path) -> Result<Vec<TreeEntry>> {
    match fs::metadata(root) {
        Ok(m) if m.is_dir() => {}
        Ok(_) => {
            return Err(PluginError::io(
                format!("Not a directory: {:?}", root),
                io::Error::from(io::ErrorKind::InvalidInput),
            ))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PluginError::NotFound(format!("{:?}", root)))
        }
        Err(e) => return Err(PluginError::io(format!("Failed to inspect {:?}", root), e)),
    }

    let mut entries = Vec::new();
    walk_into(root, "", &mut entries)?;
    entries.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(entries)
}

fn walk_into(dir: &Path, prefix: &str, out: &mut Vec<TreeEntry>) -> Result<()> {
    let entries = fs::read_dir(dir).with_path("Failed to read directory", dir)?;

    for entry in entries {
        let entry = entry.with_path("Failed to read directory entry in", dir)?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };

        let file_type = entry.file_type().with_path("Failed to inspect", &path)?;
        if file_type.is_symlink() {
            let target = fs::read_link(&path).with_path("Failed to read link", &path)?;
            out.push(TreeEntry {
                relative,
                path,
                is_dir: false,
                len: 0,
                link: Some(target),
            });
        } else if file_type.is_dir() {
            out.push(TreeEntry {
                relative: relative.clone(),
                path: path.clone(),
                is_dir: true,
                len: 0,
                link: None,
            });
            walk_into(&path, &relative, out)?;
        } else {
            let metadata = entry.metadata().with_path("Failed to inspect", &path)?;
            out.push(TreeEntry {
                relative,
                path,
                is_dir: false,
                len: metadata.len(),
                link: None,
            });
        }
    }

    Ok(())
}

/// Copies the tree at `source` into `dest` (which must not exist yet),
/// checking for cancellation between entries. Returns the number of files
/// copied. On error `dest` may be partially written; callers copy into
/// staging so the partial tree is discarded with it.
pub fn copy(source: &Path, dest: &Path, control: &Control) -> Result<usize> {
    let entries = walk(source)?;
    fs::create_dir(dest).with_path("Failed to create directory", dest)?;

    let total = entries.len();
    let mut files = 0;
    for (i, entry) in entries.iter().enumerate() {
        control.checkpoint()?;

        let target = dest.join(&entry.relative);
        if entry.is_dir {
            fs::create_dir_all(&target).with_path("Failed to create directory", &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).with_path("Failed to create directory", parent)?;
            }
            match &entry.link {
                Some(link) => symlink(link, &target).with_path("Failed to create link", &target)?,
                None => {
                    fs::copy(&entry.path, &target).with_path("Failed to copy", &entry.path)?;
                    files += 1;
                }
            }
        }

        control.report(i + 1, total, &entry.relative);
    }

    Ok(files)
}

/// MD5 over every relative path and file body in the tree, in sorted order.
/// Two trees with the same digest hold the same names and bytes.
pub fn digest(root: &Path) -> Result<String> {
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];

    for entry in walk(root)? {
        ctx.consume(entry.relative.as_bytes());
        if entry.is_dir {
            ctx.consume(b"/\0");
            continue;
        }
        if let Some(link) = &entry.link {
            ctx.consume(b"@");
            ctx.consume(link.to_string_lossy().replace('\\', "/").as_bytes());
            ctx.consume(b"\0");
            continue;
        }
        ctx.consume(b"\0");

        let mut file = fs::File::open(&entry.path).with_path("Failed to open", &entry.path)?;
        loop {
            let n = file.read(&mut buf).with_path("Failed to read", &entry.path)?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
        }
        ctx.consume(b"\0");
    }

    Ok(format!("{:x}", ctx.compute()))
}

/// Deletes a file or directory tree, lifting read-only directory modes if
/// they get in the way. A missing path is not an error.
pub fn remove(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PluginError::io(format!("Failed to inspect {:?}", path), e)),
    };

    if metadata.is_dir() {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(_) => {
                unlock(path)?;
                fs::remove_dir_all(path).with_path("Failed to remove directory", path)
            }
        }
    } else {
        fs::remove_file(path).with_path("Failed to remove file", path)
    }
}

/// Creates a symbolic link at `link` pointing to `target`.
#[cfg(unix)]
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Creates a symbolic link at `link` pointing to `target`. Windows needs to
/// know whether the target is a directory.
#[cfg(windows)]
pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
    if resolved.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

#[cfg(not(any(unix, windows)))]
pub fn symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symbolic links are not supported"))
}

/// Gives the owner write access to every directory in the tree (and clears
/// read-only files on Windows) so the tree can be deleted. Extracted plugins
/// may carry read-only directory modes.
pub fn unlock(root: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(root) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(PluginError::io(format!("Failed to inspect {:?}", root), e)),
    };
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    let mut permissions = metadata.permissions();
    if make_writable(&mut permissions, metadata.is_dir()) {
        fs::set_permissions(root, permissions).with_path("Failed to change permissions of", root)?;
    }

    if metadata.is_dir() {
        for entry in fs::read_dir(root).with_path("Failed to read directory", root)? {
            let entry = entry.with_path("Failed to read directory entry in", root)?;
            unlock(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_writable(permissions: &mut fs::Permissions, is_dir: bool) -> bool {
    use std::os::unix::fs::PermissionsExt;
    let mode = permissions.mode();
    if !is_dir || mode & 0o700 == 0o700 {
        return false;
    }
    permissions.set_mode(mode | 0o700);
    true
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(permissions: &mut fs::Permissions, _is_dir: bool) -> bool {
    if !permissions.readonly() {
        return false;
    }
    permissions.set_readonly(false);
    true
}
