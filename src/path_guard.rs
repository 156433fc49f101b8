use std::ffi::{OsStr, OsString};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PathGuardError {
    #[error("Path is outside the sandbox root: {0:?}")]
    OutsideRoot(String),
    #[error("Symlink escapes the sandbox root: {} -> {}", .link.display(), .target.display())]
    SymlinkEscape { link: PathBuf, target: PathBuf },
    #[error("Sandbox root is not a directory: {}", .0.display())]
    RootNotDirectory(PathBuf),
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A path that has been validated to lie within the sandbox root.
///
/// This is a value, not a handle: the file may change or disappear after
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    absolute: PathBuf,
    relative: PathBuf,
}

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.absolute
    }

    /// Root-relative form; empty for the root itself.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    /// Root-relative path for humans, `.` for the root.
    pub fn display(&self) -> String {
        if self.relative.as_os_str().is_empty() {
            ".".to_string()
        } else {
            self.relative.to_string_lossy().into_owned()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// Creates a guard for `root`, which is canonicalized once here and is
    /// immutable afterwards.
    pub fn new(root: &Path) -> Result<Self, PathGuardError> {
        let root = root.canonicalize().map_err(|e| PathGuardError::Io {
            path: root.to_path_buf(),
            source: e,
        })?;

        if !root.is_dir() {
            return Err(PathGuardError::RootNotDirectory(root));
        }

        Ok(PathGuard { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an untrusted path against the sandbox root.
    ///
    /// Relative paths are cleaned lexically and joined onto the root; a
    /// cleaned path that climbs above the root is rejected. Absolute paths are
    /// accepted only when they already lie under the root. Each existing
    /// segment of the result is then checked: a symlink anywhere along the
    /// way must point back inside the root.
    pub fn resolve(&self, untrusted: &str) -> Result<ResolvedPath, PathGuardError> {
        if untrusted.is_empty() {
            return Err(PathGuardError::OutsideRoot(untrusted.to_string()));
        }

        let requested = Path::new(untrusted);
        let relative = if requested.is_absolute() {
            normalize_absolute(requested)
                .strip_prefix(&self.root)
                .ok()
                .and_then(clean_relative)
        } else {
            clean_relative(requested)
        };

        let Some(relative) = relative else {
            warn!("Rejected path outside sandbox: {:?}", untrusted);
            return Err(PathGuardError::OutsideRoot(untrusted.to_string()));
        };

        self.check_symlinks(&relative)?;

        let absolute = if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(&relative)
        };

        if !is_within_root(&self.root, &absolute) {
            warn!("Rejected path outside sandbox: {:?}", untrusted);
            return Err(PathGuardError::OutsideRoot(untrusted.to_string()));
        }

        debug!("Resolved {:?} to {}", untrusted, absolute.display());

        Ok(ResolvedPath { absolute, relative })
    }

    /// Walks the existing prefix of `relative` below the root and rejects any
    /// symlink whose destination lies outside the root. Stops at the first
    /// segment that does not exist.
    fn check_symlinks(&self, relative: &Path) -> Result<(), PathGuardError> {
        let mut current = self.root.clone();

        for part in relative.components() {
            current.push(part);

            let metadata = match std::fs::symlink_metadata(&current) {
                Ok(m) => m,
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                    break;
                }
                Err(e) => {
                    return Err(PathGuardError::Io {
                        path: current,
                        source: e,
                    });
                }
            };

            if metadata.file_type().is_symlink() {
                let target = self.symlink_destination(&current)?;
                if !is_within_root(&self.root, &target) {
                    warn!(
                        "Symlink {} escapes sandbox to {}",
                        current.display(),
                        target.display()
                    );
                    return Err(PathGuardError::SymlinkEscape {
                        link: current,
                        target,
                    });
                }
            }
        }

        Ok(())
    }

    /// Where an absolute `path` leads once every existing symlink along it,
    /// including a dangling final link, has been followed. Trailing segments
    /// that do not exist yet are appended unchanged.
    pub fn real_path(&self, path: &Path) -> Result<PathBuf, PathGuardError> {
        let mut existing = path.to_path_buf();
        let mut missing: Vec<OsString> = Vec::new();

        loop {
            match existing.canonicalize() {
                Ok(mut real) => {
                    real.extend(missing.iter().rev());
                    return Ok(real);
                }
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                    if let Ok(link) = std::fs::read_link(&existing) {
                        let base = existing.parent().unwrap_or(&self.root).to_path_buf();
                        existing = normalize_absolute(&base.join(link));
                        continue;
                    }
                    let Some(name) = existing.file_name().map(OsStr::to_os_string) else {
                        return Err(PathGuardError::Io {
                            path: path.to_path_buf(),
                            source: e,
                        });
                    };
                    missing.push(name);
                    existing.pop();
                }
                Err(e) => {
                    return Err(PathGuardError::Io {
                        path: existing,
                        source: e,
                    });
                }
            }
        }
    }

    fn symlink_destination(&self, link: &Path) -> Result<PathBuf, PathGuardError> {
        match link.canonicalize() {
            Ok(target) => Ok(target),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Dangling link: a write through it would create the literal
                // target, so judge that.
                let target = std::fs::read_link(link).map_err(|e| PathGuardError::Io {
                    path: link.to_path_buf(),
                    source: e,
                })?;
                let base = link.parent().unwrap_or(&self.root);
                Ok(normalize_absolute(&base.join(target)))
            }
            Err(e) => Err(PathGuardError::Io {
                path: link.to_path_buf(),
                source: e,
            }),
        }
    }
}

/// True when `candidate` equals `root` or lies beneath it with no `..`
/// component in between.
pub fn is_within_root(root: &Path, candidate: &Path) -> bool {
    match candidate.strip_prefix(root) {
        Ok(rest) => !rest
            .components()
            .any(|c| matches!(c, Component::ParentDir)),
        Err(_) => false,
    }
}

/// Lexically cleans a relative path: drops `.`, folds `name/..` pairs.
///
/// Returns `None` for absolute paths and for paths whose cleaned form would
/// begin with `..`.
pub(crate) fn clean_relative(path: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&OsStr> = Vec::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(parts.iter().collect())
}

/// Lexically normalizes an absolute path. `..` at the filesystem root stays
/// at the root.
fn normalize_absolute(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }

    normalized
}
