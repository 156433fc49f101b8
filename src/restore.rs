use crate::checksum::sha256_hex;
use crate::manifest::Manifest;
use crate::path_guard::{PathGuard, PathGuardError, clean_relative};
use crate::util::atomic::write_atomic;
use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("Manifest declares no reference tarball")]
    NoTarball,
    #[error("Reference tarball hash mismatch: expected {expected}, actual {actual}")]
    TarballHashMismatch { expected: String, actual: String },
    #[error("Unsafe tar entry: {0:?}")]
    UnsafeTarEntry(String),
    #[error("Path traversal detected: {0:?}")]
    PathTraversal(String),
    #[error("Archive member {path} does not match the manifest (expected {expected}, actual {actual})")]
    EntryHashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RestoreError + '_ {
    move |source| RestoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A restore that stopped early. `restored` lists what was written first.
#[derive(Debug, thiserror::Error)]
#[error("{error} ({} file(s) restored before the failure)", .restored.len())]
pub struct RestoreFailure {
    pub restored: Vec<String>,
    #[source]
    pub error: RestoreError,
}

/// Restores `targets` (root-relative paths) from the manifest's reference
/// tarball into the guard's root. Returns the paths written, in archive
/// order. Archive members not named in `targets` are never touched.
pub fn restore_from_tarball(
    manifest: &Manifest,
    guard: &PathGuard,
    targets: &[String],
) -> Result<Vec<String>, RestoreFailure> {
    let mut restored = Vec::new();

    if targets.is_empty() {
        return Ok(restored);
    }

    match restore_entries(manifest, guard, targets, &mut restored) {
        Ok(()) => Ok(restored),
        Err(error) => Err(RestoreFailure { restored, error }),
    }
}

fn restore_entries(
    manifest: &Manifest,
    guard: &PathGuard,
    targets: &[String],
    restored: &mut Vec<String>,
) -> Result<(), RestoreError> {
    let tarball = manifest.tarball.as_ref().ok_or(RestoreError::NoTarball)?;
    let tarball_path = tarball.resolve_in(guard.root());

    // Hash and extract the same bytes, so the archive cannot change in
    // between.
    let archive_bytes = std::fs::read(&tarball_path).map_err(io_error(&tarball_path))?;
    let actual = sha256_hex(&archive_bytes);
    if actual != tarball.hash {
        warn!("Reference tarball {} hash mismatch", tarball_path.display());
        return Err(RestoreError::TarballHashMismatch {
            expected: tarball.hash.clone(),
            actual,
        });
    }

    let wanted: HashSet<PathBuf> = targets
        .iter()
        .filter_map(|t| clean_relative(Path::new(t)))
        .collect();

    let mut written: HashSet<PathBuf> = HashSet::new();

    let mut archive = tar::Archive::new(GzDecoder::new(archive_bytes.as_slice()));
    let entries = archive.entries().map_err(io_error(&tarball_path))?;

    for entry in entries {
        let mut entry = entry.map_err(io_error(&tarball_path))?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            continue;
        }

        let raw_path = entry
            .path()
            .map_err(io_error(&tarball_path))?
            .into_owned();
        let name = raw_path.to_string_lossy().into_owned();

        let clean = match clean_relative(&raw_path) {
            Some(clean) if !clean.as_os_str().is_empty() => clean,
            _ => {
                warn!("Rejected unsafe tar entry {:?}", name);
                return Err(RestoreError::UnsafeTarEntry(name));
            }
        };

        if !wanted.contains(&clean) {
            continue;
        }

        if !entry_type.is_file() {
            debug!("Skipping non-file tar entry {}", name);
            continue;
        }

        if written.contains(&clean) {
            debug!("Skipping duplicate tar entry {}", name);
            continue;
        }

        let destination = guard
            .resolve(&clean.to_string_lossy())
            .map_err(|e| match e {
                PathGuardError::Io { path, source } => RestoreError::Io { path, source },
                _ => RestoreError::PathTraversal(name.clone()),
            })?;

        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(io_error(&tarball_path))?;

        let display_path = destination.display();
        if let Some(expected) = manifest.entry(&display_path) {
            let actual = sha256_hex(&bytes);
            if actual != expected.hash {
                return Err(RestoreError::EntryHashMismatch {
                    path: display_path,
                    expected: expected.hash.clone(),
                    actual,
                });
            }
        }

        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
        let path = destination.as_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        write_atomic(path, &bytes, Some(mode)).map_err(io_error(path))?;

        info!("Restored {}", display_path);
        restored.push(display_path);
        written.insert(clean);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ManifestEntry, SCHEMA_VERSION, TarballRef};
    use chrono::Utc;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    struct Member<'a> {
        name: &'a [u8],
        data: &'a [u8],
        mode: u32,
    }

    fn file(name: &'static str, data: &'static str) -> Member<'static> {
        Member {
            name: name.as_bytes(),
            data: data.as_bytes(),
            mode: 0o644,
        }
    }

    /// Writes member names straight into the header so unsafe names can be
    /// produced.
    fn build_tarball(members: &[Member<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for member in members {
            let mut header = tar::Header::new_gnu();
            header.as_old_mut().name[..member.name.len()].copy_from_slice(member.name);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(member.data.len() as u64);
            header.set_mode(member.mode);
            header.set_cksum();
            builder.append(&header, member.data).unwrap();
        }
        let tar_bytes = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn setup(members: &[Member<'_>]) -> (TempDir, PathGuard, Manifest) {
        let temp = TempDir::new().unwrap();
        let guard = PathGuard::new(temp.path()).unwrap();
        let gz = build_tarball(members);
        fs::write(guard.root().join("ref.tar.gz"), &gz).unwrap();

        let entries = members
            .iter()
            .filter_map(|m| {
                let name = std::str::from_utf8(m.name).unwrap();
                clean_relative(Path::new(name)).map(|clean| ManifestEntry {
                    hash: sha256_hex(m.data),
                    size: m.data.len() as u64,
                    mode: m.mode,
                    mod_time: Utc::now(),
                    file_path: clean.to_string_lossy().into_owned(),
                })
            })
            .collect();

        let manifest = Manifest {
            version: "0.1.0".to_string(),
            schema_version: SCHEMA_VERSION,
            root_id: "test".to_string(),
            tarball: Some(TarballRef {
                hash: sha256_hex(&gz),
                size: gz.len() as u64,
                path: PathBuf::from("ref.tar.gz"),
            }),
            entries,
        };

        (temp, guard, manifest)
    }

    fn targets(paths: &[&str]) -> Vec<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_empty_targets_is_a_no_op() {
        let (_temp, guard, mut manifest) = setup(&[file("a.go", "a")]);
        manifest.tarball = None;

        assert_eq!(
            restore_from_tarball(&manifest, &guard, &[]).unwrap(),
            Vec::<String>::new()
        );
    }

    #[test]
    fn test_selective_restore() {
        let (temp, guard, manifest) = setup(&[file("a.go", "package a"), file("b.go", "package b")]);
        fs::write(temp.path().join("b.go"), "local edits").unwrap();

        let restored = restore_from_tarball(&manifest, &guard, &targets(&["a.go"])).unwrap();

        assert_eq!(restored, vec!["a.go"]);
        assert_eq!(
            fs::read_to_string(temp.path().join("a.go")).unwrap(),
            "package a"
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("b.go")).unwrap(),
            "local edits"
        );
    }

    #[test]
    fn test_restore_creates_parents_and_overwrites() {
        let (temp, guard, manifest) = setup(&[file("./src/deep/lib.rs", "pub fn f() {}\n")]);
        fs::create_dir_all(temp.path().join("src")).unwrap();

        let restored =
            restore_from_tarball(&manifest, &guard, &targets(&["src/deep/lib.rs"])).unwrap();

        assert_eq!(restored, vec!["src/deep/lib.rs"]);
        assert_eq!(
            fs::read_to_string(temp.path().join("src/deep/lib.rs")).unwrap(),
            "pub fn f() {}\n"
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_restore_applies_entry_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, guard, manifest) = setup(&[Member {
            name: b"run.sh",
            data: b"#!/bin/sh\n",
            mode: 0o750,
        }]);

        restore_from_tarball(&manifest, &guard, &targets(&["run.sh"])).unwrap();

        let mode = fs::metadata(temp.path().join("run.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn test_parent_dir_entry_is_rejected() {
        let (temp, guard, manifest) =
            setup(&[file("a.txt", "a"), file("../outside.txt", "evil")]);

        let failure =
            restore_from_tarball(&manifest, &guard, &targets(&["a.txt", "outside.txt"]))
                .unwrap_err();

        assert!(matches!(failure.error, RestoreError::UnsafeTarEntry(_)));
        assert_eq!(failure.restored, vec!["a.txt"]);
        assert!(!temp.path().parent().unwrap().join("outside.txt").exists());
    }

    #[test]
    fn test_absolute_entry_is_rejected() {
        let (_temp, guard, manifest) = setup(&[file("/tmp/sandward-absolute.txt", "evil")]);

        let failure =
            restore_from_tarball(&manifest, &guard, &targets(&["tmp/sandward-absolute.txt"]))
                .unwrap_err();

        assert!(matches!(failure.error, RestoreError::UnsafeTarEntry(_)));
        assert!(failure.restored.is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinked_destination_is_path_traversal() {
        let outside = TempDir::new().unwrap();
        let (temp, guard, manifest) = setup(&[file("linked/x.txt", "x")]);
        std::os::unix::fs::symlink(outside.path(), temp.path().join("linked")).unwrap();

        let failure =
            restore_from_tarball(&manifest, &guard, &targets(&["linked/x.txt"])).unwrap_err();

        assert!(matches!(failure.error, RestoreError::PathTraversal(_)));
        assert!(!outside.path().join("x.txt").exists());
    }

    #[test]
    fn test_tampered_tarball_is_refused() {
        let (temp, guard, manifest) = setup(&[file("a.txt", "a")]);
        fs::write(
            temp.path().join("ref.tar.gz"),
            build_tarball(&[file("a.txt", "forged")]),
        )
        .unwrap();

        let failure =
            restore_from_tarball(&manifest, &guard, &targets(&["a.txt"])).unwrap_err();

        assert!(matches!(
            failure.error,
            RestoreError::TarballHashMismatch { .. }
        ));
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn test_member_not_matching_manifest_is_refused() {
        let (temp, guard, mut manifest) = setup(&[file("a.txt", "a")]);
        manifest.entries[0].hash = sha256_hex(b"something else");

        let failure =
            restore_from_tarball(&manifest, &guard, &targets(&["a.txt"])).unwrap_err();

        assert!(matches!(
            failure.error,
            RestoreError::EntryHashMismatch { .. }
        ));
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn test_missing_tarball_is_io_error() {
        let (temp, guard, manifest) = setup(&[file("a.txt", "a")]);
        fs::remove_file(temp.path().join("ref.tar.gz")).unwrap();

        let failure =
            restore_from_tarball(&manifest, &guard, &targets(&["a.txt"])).unwrap_err();

        assert!(matches!(failure.error, RestoreError::Io { .. }));
    }

    #[test]
    fn test_duplicate_members_are_restored_once() {
        let (temp, guard, manifest) =
            setup(&[file("a.go", "package a"), file("a.go", "package a")]);

        let restored = restore_from_tarball(&manifest, &guard, &targets(&["a.go"])).unwrap();

        assert_eq!(restored, vec!["a.go"]);
        assert_eq!(
            fs::read_to_string(temp.path().join("a.go")).unwrap(),
            "package a"
        );
    }
}
