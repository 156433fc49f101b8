use std::io::Write;
use std::path::Path;

/// Writes `bytes` to `path` atomically: a temporary file in the same
/// directory is written, fsynced and renamed over the target.
///
/// With `mode` set, the file gets exactly those permission bits on Unix.
/// Otherwise it is created as `0o666` and the process umask applies. The
/// parent directory must already exist.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut builder = tempfile::Builder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    let mut temp_file = builder.tempfile_in(parent)?;
    temp_file.write_all(bytes)?;
    temp_file.flush()?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_file() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.txt");

        write_atomic(&target, b"hello", None).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"hello");
    }

    #[test]
    fn test_write_atomic_replaces_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("out.txt");
        fs::write(&target, "old contents that are longer").unwrap();

        write_atomic(&target, b"new", None).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "new");
        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.txt")]);
    }

    #[test]
    #[cfg(unix)]
    fn test_write_atomic_applies_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = temp.path().join("script.sh");

        write_atomic(&target, b"#!/bin/sh\n", Some(0o750)).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn test_write_atomic_missing_parent_fails_without_side_effects() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("missing/out.txt");

        assert!(write_atomic(&target, b"x", None).is_err());
        assert!(!temp.path().join("missing").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_write_atomic_without_mode_creates_plain_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = temp.path().join("plain.txt");

        write_atomic(&target, b"x", None).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode & 0o111, 0);
        assert_eq!(mode & 0o600, 0o600);
    }

    #[test]
    fn test_failed_rename_keeps_target_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("inner.txt"), "keep").unwrap();

        // The temp file is fully written before the rename onto a non-empty
        // directory fails.
        assert!(write_atomic(&target, b"replacement", None).is_err());

        assert!(target.is_dir());
        assert_eq!(fs::read_to_string(target.join("inner.txt")).unwrap(), "keep");
        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("occupied")]);
    }
}
