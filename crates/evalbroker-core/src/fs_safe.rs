//! Atomic file I/O primitives for the broker's directory protocol.
//!
//! Every document the broker publishes (responses, failure mirrors, the
//! durable state map, the advisory snapshot, lock records) goes through
//! [`atomic_write`]: write to a temp file in the destination directory, fsync
//! the data, rename into place, then fsync the parent directory. A reader
//! therefore never observes a partial document; a crash leaves either the old
//! complete file or the new complete file.
//!
//! Reads of client-authored documents go through [`bounded_read_json`], which
//! checks the size on the open handle before allocating and refuses symlinks
//! and non-regular files. Request directories are writable by external
//! clients, so a crafted FIFO or symlink at a `.json` path must not block or
//! redirect the broker.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Size cap applied to every client-authored document the broker parses.
///
/// Requests are small JSON records; 1 MiB is generous while preventing
/// memory exhaustion from an oversized or adversarial file.
pub const MAX_DOCUMENT_SIZE: u64 = 1_048_576;

/// Errors from filesystem primitives.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// File exceeds the configured size cap.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual file size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },

    /// The target path is a symlink or not a regular file.
    #[error("not a regular file: {}", path.display())]
    NotRegularFile {
        /// Offending path.
        path: std::path::PathBuf,
    },

    /// The destination path has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path with no parent.
        path: std::path::PathBuf,
    },

    /// JSON serialization failed.
    #[error("json serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("json deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the failing operation.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Writes `data` to `path` atomically via temp-file + fsync + rename.
///
/// The temp file is created in the same directory as `path` so the rename
/// stays on one filesystem. After the rename, the parent directory is
/// fsynced so the directory entry itself is durable.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsError> {
    let parent = path.parent().ok_or_else(|| FsError::NoParentDirectory {
        path: path.to_path_buf(),
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| FsError::io("write temp file", e))?;
    tmp.flush().map_err(|e| FsError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FsError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| FsError::io("rename into place", e.error))?;

    fsync_dir(parent)
}

/// Serializes `value` as pretty JSON and writes it atomically to `path`.
///
/// Serialization happens in memory before any file I/O, so a serialization
/// failure never leaves a partial document on disk.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsError> {
    let json = serde_json::to_vec_pretty(value).map_err(FsError::Serialize)?;
    atomic_write(path, &json)
}

/// Reads the raw bytes of a regular file with a size cap.
///
/// The path is opened with `O_NOFOLLOW` on Unix so a symlink planted at the
/// path is refused by the kernel, and the size is checked on the open handle
/// (no stat-then-open race). A post-read check catches files that grow
/// between stat and read.
pub fn bounded_read(path: &Path, max_size: u64) -> Result<Vec<u8>, FsError> {
    let mut file = open_regular(path)?;

    let metadata = file
        .metadata()
        .map_err(|e| FsError::io("stat after open", e))?;
    if !metadata.is_file() {
        return Err(FsError::NotRegularFile {
            path: path.to_path_buf(),
        });
    }
    if metadata.len() > max_size {
        return Err(FsError::FileTooLarge {
            size: metadata.len(),
            max: max_size,
        });
    }

    let mut buf = Vec::with_capacity(usize::try_from(metadata.len()).unwrap_or(0));
    let read = std::io::Read::by_ref(&mut file)
        .take(max_size.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| FsError::io("read file", e))?;
    if read as u64 > max_size {
        return Err(FsError::FileTooLarge {
            size: read as u64,
            max: max_size,
        });
    }

    Ok(buf)
}

/// Reads and deserializes a JSON document with a size cap.
pub fn bounded_read_json<T: DeserializeOwned>(path: &Path, max_size: u64) -> Result<T, FsError> {
    let bytes = bounded_read(path, max_size)?;
    serde_json::from_slice(&bytes).map_err(FsError::Deserialize)
}

/// Appends a line of text to a log file, creating it if absent.
///
/// Log appends are best-effort observability and do not use the atomic
/// protocol; partial trailing lines after a crash are acceptable in
/// append-only logs.
pub fn append_line(path: &Path, line: &str) -> Result<(), FsError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| FsError::io("open log for append", e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| FsError::io("append log line", e))?;
    file.write_all(b"\n")
        .map_err(|e| FsError::io("append log newline", e))
}

#[cfg(unix)]
fn open_regular(path: &Path) -> Result<File, FsError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = OpenOptions::new();
    options.read(true);
    options.custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK);
    match options.open(path) {
        Ok(file) => {
            // O_NONBLOCK keeps a FIFO planted at the path from blocking the
            // open; the regular-file check in bounded_read rejects it before
            // any read. On regular files the flag has no effect.
            Ok(file)
        },
        Err(e) if e.raw_os_error() == Some(libc::ELOOP) => Err(FsError::NotRegularFile {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(FsError::io("open file", e)),
    }
}

#[cfg(not(unix))]
fn open_regular(path: &Path) -> Result<File, FsError> {
    let meta =
        std::fs::symlink_metadata(path).map_err(|e| FsError::io("symlink_metadata", e))?;
    if meta.file_type().is_symlink() {
        return Err(FsError::NotRegularFile {
            path: path.to_path_buf(),
        });
    }
    File::open(path).map_err(|e| FsError::io("open file", e))
}

fn fsync_dir(dir: &Path) -> Result<(), FsError> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| FsError::io("open parent directory", e))?;
        handle
            .sync_all()
            .map_err(|e| FsError::io("fsync parent directory", e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    #[test]
    fn atomic_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.json");
        let doc = Doc {
            name: "r1".to_string(),
            count: 3,
        };

        atomic_write_json(&path, &doc).expect("write");
        let back: Doc = bounded_read_json(&path, MAX_DOCUMENT_SIZE).expect("read");
        assert_eq!(back, doc);
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.json");

        atomic_write(&path, b"{\"v\":1}").expect("first write");
        atomic_write(&path, b"{\"v\":2}").expect("second write");

        let bytes = bounded_read(&path, MAX_DOCUMENT_SIZE).expect("read");
        assert_eq!(bytes, b"{\"v\":2}");
    }

    #[test]
    fn bounded_read_rejects_oversized_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.json");
        fs::write(&path, vec![b'x'; 64]).expect("write");

        let result = bounded_read(&path, 16);
        assert!(matches!(result, Err(FsError::FileTooLarge { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn bounded_read_refuses_symlink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("target.json");
        fs::write(&target, b"{}").expect("write target");
        let link = dir.path().join("link.json");
        std::os::unix::fs::symlink(&target, &link).expect("symlink");

        let result = bounded_read(&link, MAX_DOCUMENT_SIZE);
        assert!(matches!(result, Err(FsError::NotRegularFile { .. })));
    }

    #[test]
    fn append_line_accumulates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("trail.log");

        append_line(&path, "first").expect("append");
        append_line(&path, "second").expect("append");

        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content, "first\nsecond\n");
    }
}
