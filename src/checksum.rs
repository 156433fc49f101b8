use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("File modified during checksumming: {}", .0.display())]
    ConcurrentModification(PathBuf),
}

impl ChecksumError {
    fn from_io(path: &Path, e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ChecksumError::PermissionDenied(path.to_path_buf())
        } else {
            ChecksumError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    }

    /// True when the file being hashed does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ChecksumError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

pub struct FileChecksum {
    /// Hex encoded.
    pub sha256: String,
    /// File size in bytes.
    pub size: u64,
}

/// Hex-encoded SHA-256 of an in-memory byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Computes the SHA-256 checksum of a file with concurrent modification detection.
///
/// # Behavior
/// - Records the file's modification time before reading
/// - Reads the file in chunks and computes SHA-256
/// - Verifies the modification time hasn't changed after reading
/// - Returns an error if the file was modified during checksumming
///
/// # Errors
/// - `ChecksumError::Io`: File doesn't exist or other I/O errors
/// - `ChecksumError::PermissionDenied`: Insufficient permissions to read the file
/// - `ChecksumError::ConcurrentModification`: File was detected as being modified while
///   checksumming. Note that the absence of this error is *not* a guarantee that the
///   file was *not* modified.
pub fn checksum_file(path: &Path) -> Result<FileChecksum, ChecksumError> {
    let metadata_before =
        std::fs::metadata(path).map_err(|e| ChecksumError::from_io(path, e))?;
    let mtime_before = metadata_before
        .modified()
        .map_err(|e| ChecksumError::from_io(path, e))?;

    let mut file = File::open(path).map_err(|e| ChecksumError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ChecksumError::from_io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let metadata_after = std::fs::metadata(path).map_err(|e| ChecksumError::from_io(path, e))?;
    let mtime_after = metadata_after
        .modified()
        .map_err(|e| ChecksumError::from_io(path, e))?;

    if mtime_before != mtime_after {
        return Err(ChecksumError::ConcurrentModification(path.to_path_buf()));
    }

    let sha256 = format!("{:x}", hasher.finalize());

    debug!("Checksum of {} is {}", path.display(), sha256);

    Ok(FileChecksum {
        sha256,
        size: metadata_after.len(),
    })
}
