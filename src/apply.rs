use crate::checksum::{checksum_file, sha256_hex};
use crate::path_guard::{PathGuard, PathGuardError, ResolvedPath};
use crate::proposal::{Proposal, ProposalError, ProposalStore, read_existing};
use crate::diffing::replacement_diff;
use crate::util::atomic::write_atomic;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Path(#[from] PathGuardError),
    #[error("Drift detected on {path}: expected base {expected}, found {actual}")]
    DriftDetected {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMethod {
    GitPatch,
    AtomicWrite,
}

impl fmt::Display for ApplyMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMethod::GitPatch => write!(f, "git-patch"),
            ApplyMethod::AtomicWrite => write!(f, "atomic-write"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ApplyMethod),
    /// The target already held the proposed content; nothing was written.
    AlreadyApplied,
}

#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    pub use_git: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions { use_git: true }
    }
}

/// Applies the stored proposal `id` to its target.
///
/// # Errors
/// - `ProposalError::NotFound` (wrapped): no record for `id`
/// - `ApplyError::Path`: the stored path no longer resolves inside the root
/// - `ApplyError::DriftDetected`: the target changed since staging
/// - `ProposalError::NotRegularFile` (wrapped): the target is not a regular file
/// - `ProposalError::TamperedRecord` (wrapped): the stored record was altered
/// - `ProposalError::ReservedPath` (wrapped): the target now leads into the
///   state directory
pub fn apply(
    guard: &PathGuard,
    store: &ProposalStore,
    id: &str,
    options: &ApplyOptions,
) -> Result<ApplyOutcome, ApplyError> {
    let proposal = store.load(id)?;
    let target = guard.resolve(&proposal.path)?;
    store.ensure_not_reserved(guard, &target)?;

    let current = read_existing(&target)?;
    let current_hash = current.as_deref().map(sha256_hex);

    if current_hash.as_deref() == Some(proposal.content_hash.as_str()) {
        info!("Proposal {} already applied to {}", id, proposal.path);
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    check_drift(&proposal, current_hash.as_deref())?;
    check_diff(&proposal, current.as_deref())?;

    if options.use_git && !proposal.is_new_file && try_git_apply(guard.root(), &proposal, &target)
    {
        info!("Applied proposal {} to {} via git", id, proposal.path);
        return Ok(ApplyOutcome::Applied(ApplyMethod::GitPatch));
    }

    write_content(&proposal, &target)?;

    info!("Applied proposal {} to {}", id, proposal.path);

    Ok(ApplyOutcome::Applied(ApplyMethod::AtomicWrite))
}

fn check_drift(proposal: &Proposal, current_hash: Option<&str>) -> Result<(), ApplyError> {
    let drifted = match current_hash {
        None => !proposal.is_new_file,
        Some(hash) => proposal.is_new_file || hash != proposal.base_hash,
    };

    if drifted {
        let actual = current_hash.unwrap_or("<absent>").to_string();
        let expected = if proposal.is_new_file {
            "<absent>".to_string()
        } else {
            proposal.base_hash.clone()
        };
        warn!(
            "Refusing to apply {}: {} changed since it was proposed",
            proposal.id, proposal.path
        );
        return Err(ApplyError::DriftDetected {
            path: proposal.path.clone(),
            expected,
            actual,
        });
    }

    Ok(())
}

/// The stored diff is what `git apply` consumes, so it must be exactly the
/// diff from the unchanged base to the proposed content.
fn check_diff(proposal: &Proposal, base: Option<&[u8]>) -> Result<(), ApplyError> {
    let old_text = base.map(String::from_utf8_lossy);
    let expected = replacement_diff(&proposal.path, old_text.as_deref(), &proposal.content);

    if proposal.diff != expected {
        warn!("Stored diff of proposal {} does not match its content", proposal.id);
        return Err(ProposalError::TamperedRecord {
            id: proposal.id.clone(),
            reason: "diff does not match base and content",
        }
        .into());
    }

    Ok(())
}

fn write_content(proposal: &Proposal, target: &ResolvedPath) -> Result<(), ApplyError> {
    let path = target.as_path();
    let io_error = |source| ApplyError::Io {
        path: path.to_path_buf(),
        source,
    };

    // New files get the umask default; existing files keep their mode.
    let mode = if proposal.is_new_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ApplyError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        None
    } else {
        existing_mode(path).map_err(io_error)?
    };

    write_atomic(path, proposal.content.as_bytes(), mode).map_err(io_error)
}

#[cfg(unix)]
fn existing_mode(path: &Path) -> std::io::Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    Ok(Some(std::fs::metadata(path)?.permissions().mode() & 0o7777))
}

#[cfg(not(unix))]
fn existing_mode(_path: &Path) -> std::io::Result<Option<u32>> {
    Ok(None)
}

/// Attempts to apply the stored diff with `git apply`. Any failure, including
/// a result that does not hash to the proposed content, returns false and
/// leaves the atomic write to finish the job.
fn try_git_apply(root: &Path, proposal: &Proposal, target: &ResolvedPath) -> bool {
    let prefix = match Command::new("git")
        .args(["rev-parse", "--show-prefix"])
        .current_dir(root)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
    {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(_) => {
            debug!("{} is not inside a git work tree", root.display());
            return false;
        }
        Err(e) => {
            debug!("git unavailable: {}", e);
            return false;
        }
    };

    let mut command = Command::new("git");
    command.args(["apply", "-p0", "--whitespace=nowarn"]);
    if !prefix.is_empty() {
        command.arg(format!("--directory={prefix}"));
    }
    command
        .arg("-")
        .current_dir(root)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            debug!("Failed to run git apply: {}", e);
            return false;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(proposal.diff.as_bytes()) {
            debug!("Failed to send diff to git apply: {}", e);
        }
    }

    let output = match child.wait_with_output() {
        Ok(o) => o,
        Err(e) => {
            debug!("git apply did not finish: {}", e);
            return false;
        }
    };

    if !output.status.success() {
        debug!(
            "git apply failed for {}: {}",
            proposal.path,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return false;
    }

    match checksum_file(target.as_path()) {
        Ok(checksum) if checksum.sha256 == proposal.content_hash => true,
        Ok(_) => {
            warn!(
                "git apply left {} with unexpected content, rewriting",
                proposal.path
            );
            false
        }
        Err(e) => {
            debug!("Cannot verify git apply result: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const NO_GIT: ApplyOptions = ApplyOptions { use_git: false };

    fn setup() -> (TempDir, PathGuard, ProposalStore) {
        let temp = TempDir::new().unwrap();
        let guard = PathGuard::new(temp.path()).unwrap();
        let store = ProposalStore::new(&guard.root().join(".sandward"));
        (temp, guard, store)
    }

    #[test]
    fn test_apply_new_file() {
        let (temp, guard, store) = setup();
        let proposal = store.propose(&guard, "nested/dir/new.txt", "hello\n").unwrap();

        let outcome = apply(&guard, &store, &proposal.id, &NO_GIT).unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied(ApplyMethod::AtomicWrite));
        assert_eq!(
            fs::read(temp.path().join("nested/dir/new.txt")).unwrap(),
            b"hello\n"
        );
    }

    #[test]
    fn test_apply_existing_file() {
        let (temp, guard, store) = setup();
        let target = temp.path().join("a.txt");
        fs::write(&target, "old\n").unwrap();
        let proposal = store.propose(&guard, "a.txt", "new\n").unwrap();

        apply(&guard, &store, &proposal.id, &NO_GIT).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "new\n");
    }

    #[test]
    fn test_apply_leaves_no_temp_files() {
        let (temp, guard, store) = setup();
        fs::write(temp.path().join("a.txt"), "old").unwrap();
        let proposal = store.propose(&guard, "a.txt", "new").unwrap();

        apply(&guard, &store, &proposal.id, &NO_GIT).unwrap();

        let mut names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec![".sandward", "a.txt"]);
    }

    #[test]
    fn test_apply_twice_is_idempotent() {
        let (temp, guard, store) = setup();
        let proposal = store.propose(&guard, "a.txt", "content").unwrap();

        apply(&guard, &store, &proposal.id, &NO_GIT).unwrap();
        let second = apply(&guard, &store, &proposal.id, &NO_GIT).unwrap();

        assert_eq!(second, ApplyOutcome::AlreadyApplied);
        assert_eq!(
            fs::read_to_string(temp.path().join("a.txt")).unwrap(),
            "content"
        );
    }

    #[test]
    fn test_drift_is_detected_and_file_untouched() {
        let (temp, guard, store) = setup();
        let target = temp.path().join("a.txt");
        fs::write(&target, "A").unwrap();
        let proposal = store.propose(&guard, "a.txt", "C").unwrap();
        fs::write(&target, "B").unwrap();

        let result = apply(&guard, &store, &proposal.id, &NO_GIT);

        match result {
            Err(ApplyError::DriftDetected {
                expected, actual, ..
            }) => {
                assert_eq!(expected, sha256_hex(b"A"));
                assert_eq!(actual, sha256_hex(b"B"));
            }
            other => panic!("Expected drift, got {:?}", other),
        }
        assert_eq!(fs::read_to_string(&target).unwrap(), "B");
    }

    #[test]
    fn test_new_file_appearing_is_drift() {
        let (temp, guard, store) = setup();
        let proposal = store.propose(&guard, "a.txt", "mine").unwrap();
        fs::write(temp.path().join("a.txt"), "theirs").unwrap();

        assert!(matches!(
            apply(&guard, &store, &proposal.id, &NO_GIT),
            Err(ApplyError::DriftDetected { .. })
        ));
        assert_eq!(
            fs::read_to_string(temp.path().join("a.txt")).unwrap(),
            "theirs"
        );
    }

    #[test]
    fn test_deleted_base_is_drift() {
        let (temp, guard, store) = setup();
        fs::write(temp.path().join("a.txt"), "A").unwrap();
        let proposal = store.propose(&guard, "a.txt", "B").unwrap();
        fs::remove_file(temp.path().join("a.txt")).unwrap();

        assert!(matches!(
            apply(&guard, &store, &proposal.id, &NO_GIT),
            Err(ApplyError::DriftDetected { .. })
        ));
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let (_temp, guard, store) = setup();

        assert!(matches!(
            apply(&guard, &store, &"f".repeat(64), &NO_GIT),
            Err(ApplyError::Proposal(ProposalError::NotFound(_)))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_apply_preserves_existing_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, guard, store) = setup();
        let target = temp.path().join("script.sh");
        fs::write(&target, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o751)).unwrap();
        let proposal = store.propose(&guard, "script.sh", "#!/bin/sh\nexit 0\n").unwrap();

        apply(&guard, &store, &proposal.id, &NO_GIT).unwrap();

        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o751);
    }

    #[test]
    #[cfg(unix)]
    fn test_apply_rejects_symlink_escape_planted_after_staging() {
        let (temp, guard, store) = setup();
        let outside = TempDir::new().unwrap();
        let proposal = store.propose(&guard, "sub/file.txt", "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("sub")).unwrap();

        assert!(matches!(
            apply(&guard, &store, &proposal.id, &NO_GIT),
            Err(ApplyError::Path(PathGuardError::SymlinkEscape { .. }))
        ));
        assert!(!outside.path().join("file.txt").exists());
    }

    #[test]
    fn test_failed_write_preserves_original_state() {
        let (temp, guard, store) = setup();
        let proposal = store.propose(&guard, "blocked/new.txt", "x").unwrap();
        // A plain file where the parent directory should be.
        fs::write(temp.path().join("blocked"), "not a dir").unwrap();

        assert!(apply(&guard, &store, &proposal.id, &NO_GIT).is_err());
        assert_eq!(
            fs::read_to_string(temp.path().join("blocked")).unwrap(),
            "not a dir"
        );
    }

    #[test]
    fn test_git_patch_path_in_work_tree() {
        let git_available = Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !git_available {
            return;
        }

        let (temp, guard, store) = setup();
        let init = Command::new("git")
            .args(["init", "-q"])
            .current_dir(temp.path())
            .status()
            .unwrap();
        assert!(init.success());
        fs::write(temp.path().join("a.txt"), "one\ntwo\n").unwrap();
        let proposal = store.propose(&guard, "a.txt", "one\nthree\n").unwrap();

        let outcome = apply(&guard, &store, &proposal.id, &ApplyOptions::default()).unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied(ApplyMethod::GitPatch));
        assert_eq!(
            fs::read_to_string(temp.path().join("a.txt")).unwrap(),
            "one\nthree\n"
        );
    }

    #[test]
    fn test_git_enabled_outside_work_tree_falls_back() {
        let (temp, guard, store) = setup();
        fs::write(temp.path().join("a.txt"), "old").unwrap();
        let proposal = store.propose(&guard, "a.txt", "new").unwrap();

        apply(&guard, &store, &proposal.id, &ApplyOptions::default()).unwrap();

        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).unwrap(), "new");
    }

    fn rewrite_record(store: &ProposalStore, id: &str, from: &str, to: &str) {
        let path = store.dir().join(format!("{id}.toml"));
        let record = fs::read_to_string(&path).unwrap();
        assert!(record.contains(from));
        fs::write(&path, record.replace(from, to)).unwrap();
    }

    #[test]
    fn test_apply_refuses_swapped_content() {
        let (temp, guard, store) = setup();
        let proposal = store.propose(&guard, "a.txt", "reviewed content").unwrap();
        rewrite_record(&store, &proposal.id, "reviewed content", "EVIL content");

        assert!(matches!(
            apply(&guard, &store, &proposal.id, &NO_GIT),
            Err(ApplyError::Proposal(ProposalError::TamperedRecord { .. }))
        ));
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn test_apply_refuses_swapped_diff() {
        let (temp, guard, store) = setup();
        let target = temp.path().join("a.txt");
        fs::write(&target, "old\n").unwrap();
        let proposal = store.propose(&guard, "a.txt", "new\n").unwrap();
        rewrite_record(&store, &proposal.id, "+new", "+sneaky");

        assert!(matches!(
            apply(&guard, &store, &proposal.id, &ApplyOptions::default()),
            Err(ApplyError::Proposal(ProposalError::TamperedRecord { .. }))
        ));
        assert_eq!(fs::read_to_string(&target).unwrap(), "old\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_apply_refuses_symlink_into_state_dir_planted_after_staging() {
        let (temp, guard, store) = setup();
        let proposal = store.propose(&guard, "alias/manifest", "VERSION 1 1 forged\n").unwrap();
        std::os::unix::fs::symlink(".sandward", temp.path().join("alias")).unwrap();

        assert!(matches!(
            apply(&guard, &store, &proposal.id, &NO_GIT),
            Err(ApplyError::Proposal(ProposalError::ReservedPath(_)))
        ));
        assert!(!temp.path().join(".sandward/manifest").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_apply_new_file_gets_plain_mode() {
        use std::os::unix::fs::PermissionsExt;

        let (temp, guard, store) = setup();
        let proposal = store.propose(&guard, "fresh.txt", "x").unwrap();

        apply(&guard, &store, &proposal.id, &NO_GIT).unwrap();

        let mode = fs::metadata(temp.path().join("fresh.txt"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0);
    }
}
