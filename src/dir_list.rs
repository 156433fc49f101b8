//! Directory listing inside the sandbox.
//!
//! [`list_directory`] returns the immediate children of one directory with
//! their metadata, hiding the sandward state directory. [`walk_files`]
//! recursively collects the regular files beneath the root for manifest
//! generation.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DirListError {
    #[error("IO error: {0}")]
    Io(std::io::Error),
    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}

impl DirListError {
    fn from_io(path: &Path, e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            DirListError::PermissionDenied(path.to_path_buf())
        } else {
            DirListError::Io(e)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// File name within the listed directory.
    pub name: PathBuf,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryMetadata {
    File { size: u64 },
    Dir,
    Symlink { target: PathBuf },
    Other,
}

impl EntryMetadata {
    pub fn kind(&self) -> &'static str {
        match self {
            EntryMetadata::File { .. } => "file",
            EntryMetadata::Dir => "dir",
            EntryMetadata::Symlink { .. } => "symlink",
            EntryMetadata::Other => "other",
        }
    }
}

/// Lists the immediate children of `dir`, sorted by name. An entry named
/// `hidden` is skipped.
pub fn list_directory(dir: &Path, hidden: Option<&OsStr>) -> Result<Vec<FsEntry>, DirListError> {
    let metadata = std::fs::metadata(dir).map_err(|e| DirListError::from_io(dir, e))?;
    if !metadata.is_dir() {
        return Err(DirListError::NotADirectory(dir.to_path_buf()));
    }

    let read_dir = std::fs::read_dir(dir).map_err(|e| DirListError::from_io(dir, e))?;

    let mut entries = Vec::new();

    for entry in read_dir {
        let entry = entry.map_err(DirListError::Io)?;
        let name = entry.file_name();

        if Some(name.as_os_str()) == hidden {
            continue;
        }

        let path = entry.path();
        let metadata =
            std::fs::symlink_metadata(&path).map_err(|e| DirListError::from_io(&path, e))?;
        let file_type = metadata.file_type();

        let entry_metadata = if file_type.is_symlink() {
            let target = std::fs::read_link(&path).map_err(|e| DirListError::from_io(&path, e))?;
            EntryMetadata::Symlink { target }
        } else if file_type.is_dir() {
            EntryMetadata::Dir
        } else if file_type.is_file() {
            EntryMetadata::File {
                size: metadata.len(),
            }
        } else {
            EntryMetadata::Other
        };

        entries.push(FsEntry {
            name: name.into(),
            metadata: entry_metadata,
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(entries)
}

/// Root-relative paths of every regular file under `root`, sorted.
///
/// Symlinks are not followed, and nothing at or below an `exclude` path is
/// visited.
pub fn walk_files(root: &Path, exclude: &[PathBuf]) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if exclude.iter().any(|e| path.starts_with(e)) {
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    files.push(relative.to_string_lossy().into_owned());
                }
            }
        }
    }

    files.sort();

    Ok(files)
}
