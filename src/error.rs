//! Error taxonomy shared by every plugin operation.
//!
//! Library code returns [`PluginError`]; the shell receives it either directly
//! or as an [`ErrorReport`] (kind + message) through the FFI layer.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PluginError>;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt archive {path:?}: {reason}")]
    CorruptArchive { path: PathBuf, reason: String },

    #[error("archive entry {entry:?} escapes the destination directory")]
    PathTraversal { entry: String },

    #[error("{name:?} is already occupied at {path:?}")]
    NameCollision { name: String, path: PathBuf },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("another operation is already in progress")]
    Busy,
}

/// Discriminant of [`PluginError`] for shells that branch on the error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Io,
    CorruptArchive,
    PathTraversal,
    NameCollision,
    NotFound,
    Cancelled,
    Busy,
}

/// Structured error handed to the UI shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl PluginError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        PluginError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        PluginError::CorruptArchive {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::Io { .. } => ErrorKind::Io,
            PluginError::CorruptArchive { .. } => ErrorKind::CorruptArchive,
            PluginError::PathTraversal { .. } => ErrorKind::PathTraversal,
            PluginError::NameCollision { .. } => ErrorKind::NameCollision,
            PluginError::NotFound(_) => ErrorKind::NotFound,
            PluginError::Cancelled => ErrorKind::Cancelled,
            PluginError::Busy => ErrorKind::Busy,
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Maps a zip error onto the taxonomy: I/O stays I/O, everything else is
    /// a structural problem with the archive.
    pub(crate) fn from_zip(path: &Path, err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(source)
                if !matches!(
                    source.kind(),
                    io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
                ) =>
            {
                PluginError::io(format!("Failed to read archive {:?}", path), source)
            }
            other => PluginError::corrupt(path, other.to_string()),
        }
    }
}

/// Attaches a path-bearing context to `std::io` results, in the spirit of
/// `anyhow::Context` but producing a [`PluginError::Io`].
pub(crate) trait IoContext<T> {
    fn with_path(self, what: &str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_path(self, what: &str, path: &Path) -> Result<T> {
        self.map_err(|e| PluginError::io(format!("{}: {:?}", what, path), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_kind_and_message() {
        let err = PluginError::NameCollision {
            name: "AutoGate".to_string(),
            path: PathBuf::from("/xp/Resources/plugins/AutoGate"),
        };
        let report = err.to_report();
        assert_eq!(report.kind, ErrorKind::NameCollision);
        assert!(report.message.contains("AutoGate"));

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"NameCollision\""));
    }

    #[test]
    fn io_context_names_the_path() {
        let res: io::Result<()> = Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"));
        let err = res.with_path("Failed to open", Path::new("/tmp/x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("/tmp/x"));
    }

    #[test]
    fn checksum_failures_are_corruption() {
        let err = PluginError::from_zip(
            Path::new("a.zip"),
            zip::result::ZipError::Io(io::Error::new(io::ErrorKind::InvalidData, "Invalid checksum")),
        );
        assert_eq!(err.kind(), ErrorKind::CorruptArchive);

        let err = PluginError::from_zip(
            Path::new("a.zip"),
            zip::result::ZipError::InvalidArchive("bad magic"),
        );
        assert_eq!(err.kind(), ErrorKind::CorruptArchive);
    }
}
