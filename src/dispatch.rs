use crate::apply::{ApplyError, ApplyOptions, ApplyOutcome, apply};
use crate::diffing::format_size;
use crate::dir_list::{DirListError, EntryMetadata, FsEntry, list_directory};
use crate::manifest::{self, Manifest, ManifestError};
use crate::path_guard::{PathGuard, PathGuardError};
use crate::proposal::{Proposal, ProposalError, ProposalStore, read_existing};
use crate::restore::{RestoreFailure, restore_from_tarball};
use crate::verify::{VerifyError, VerifyReport, verify};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_STATE_DIR: &str = ".sandward";
const MANIFEST_FILENAME: &str = "manifest";
const TARBALL_FILENAME: &str = "reference.tar.gz";

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Path(#[from] PathGuardError),
    #[error(transparent)]
    Proposal(#[from] ProposalError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Restore(#[from] RestoreFailure),
    #[error(transparent)]
    DirList(#[from] DirListError),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Nothing to restore from: {0}")]
    RestoreUnavailable(String),
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub root: PathBuf,
    /// Relative to the root.
    pub state_dir: PathBuf,
    /// Absolute, or relative to the root. Defaults to `<state_dir>/manifest`.
    pub manifest: Option<PathBuf>,
}

impl SandboxConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SandboxConfig {
            root: root.into(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            manifest: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTargets {
    /// Whatever verification reports as missing or modified.
    Flagged,
    Paths(Vec<String>),
}

#[derive(Debug, Clone)]
pub enum Request {
    Resolve {
        path: String,
    },
    Read {
        path: String,
    },
    List {
        path: String,
    },
    Propose {
        path: String,
        content: String,
    },
    Apply {
        id: String,
        options: ApplyOptions,
    },
    Proposals,
    Discard {
        id: String,
    },
    Verify,
    Restore {
        targets: RestoreTargets,
        dry_run: bool,
    },
    GenerateManifest {
        /// Absolute, or relative to the root. Defaults to
        /// `<state_dir>/reference.tar.gz`.
        tarball: Option<PathBuf>,
        files: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub enum Response {
    Resolved {
        path: String,
        absolute: PathBuf,
    },
    Read {
        path: String,
        content: String,
        size: u64,
    },
    Listed {
        path: String,
        entries: Vec<FsEntry>,
    },
    Proposed(Proposal),
    Applied {
        id: String,
        path: String,
        outcome: ApplyOutcome,
    },
    Proposals(Vec<Proposal>),
    Discarded {
        id: String,
    },
    Verified(VerifyReport),
    Restored {
        restored: Vec<String>,
    },
    WouldRestore {
        pending: Vec<String>,
    },
    ManifestWritten {
        manifest_path: PathBuf,
        tarball_path: PathBuf,
        files: usize,
        root_id: String,
    },
}

impl Response {
    /// False when the operation succeeded but found something that needs
    /// attention.
    pub fn is_clean(&self) -> bool {
        match self {
            Response::Verified(report) => report.is_clean(),
            Response::WouldRestore { pending } => pending.is_empty(),
            _ => true,
        }
    }

    /// Key/value rendering for display.
    pub fn fields(&self) -> BTreeMap<&'static str, String> {
        let mut fields = BTreeMap::new();

        match self {
            Response::Resolved { path, absolute } => {
                fields.insert("path", path.clone());
                fields.insert("absolute", absolute.display().to_string());
            }
            Response::Read {
                path,
                content,
                size,
            } => {
                fields.insert("path", path.clone());
                fields.insert("content", content.clone());
                fields.insert("size", size.to_string());
            }
            Response::Listed { path, entries } => {
                fields.insert("path", path.clone());
                fields.insert("entries", format_entries(entries));
            }
            Response::Proposed(proposal) => {
                fields.insert("id", proposal.id.clone());
                fields.insert("path", proposal.path.clone());
                fields.insert("is_new_file", proposal.is_new_file.to_string());
                fields.insert("diff", proposal.diff.clone());
                fields.insert("generated_at", proposal.generated_at_rfc3339());
            }
            Response::Applied { id, path, outcome } => {
                fields.insert("id", id.clone());
                fields.insert("path", path.clone());
                let status = match outcome {
                    ApplyOutcome::Applied(method) => format!("applied ({method})"),
                    ApplyOutcome::AlreadyApplied => "already applied".to_string(),
                };
                fields.insert("status", status);
            }
            Response::Proposals(proposals) => {
                let lines: Vec<String> = proposals
                    .iter()
                    .map(|p| format!("{} {} {}", p.id, p.generated_at_rfc3339(), p.path))
                    .collect();
                fields.insert("proposals", lines.join("\n"));
                fields.insert("count", proposals.len().to_string());
            }
            Response::Discarded { id } => {
                fields.insert("id", id.clone());
                fields.insert("status", "discarded".to_string());
            }
            Response::Verified(report) => {
                if let Some(result) = &report.result {
                    fields.insert("total_files", result.total_files.to_string());
                    fields.insert("verified_files", result.verified_files.to_string());
                    fields.insert("missing_files", result.missing_files.join("\n"));
                    let modified: Vec<&str> =
                        result.modified_files.iter().map(|m| m.path.as_str()).collect();
                    fields.insert("modified_files", modified.join("\n"));
                }
            }
            Response::Restored { restored } => {
                fields.insert("restored", restored.join("\n"));
                fields.insert("count", restored.len().to_string());
            }
            Response::WouldRestore { pending } => {
                fields.insert("would_restore", pending.join("\n"));
                fields.insert("count", pending.len().to_string());
            }
            Response::ManifestWritten {
                manifest_path,
                tarball_path,
                files,
                root_id,
            } => {
                fields.insert("manifest", manifest_path.display().to_string());
                fields.insert("tarball", tarball_path.display().to_string());
                fields.insert("files", files.to_string());
                fields.insert("root_id", root_id.clone());
            }
        }

        fields
    }
}

fn format_entries(entries: &[FsEntry]) -> String {
    entries
        .iter()
        .map(|e| {
            let detail = match &e.metadata {
                EntryMetadata::File { size, .. } => format!(" ({})", format_size(*size)),
                EntryMetadata::Symlink { target } => format!(" -> {}", target.display()),
                EntryMetadata::Dir | EntryMetadata::Other => String::new(),
            };
            format!("{:<7} {}{}", e.metadata.kind(), e.name.display(), detail)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    guard: PathGuard,
    store: ProposalStore,
    state_dir: PathBuf,
    manifest_path: PathBuf,
}

impl Sandbox {
    /// Canonicalizes the root and locates the state directory, which must lie
    /// inside the root. Nothing is created on disk.
    pub fn open(config: &SandboxConfig) -> Result<Self, DispatchError> {
        let guard = PathGuard::new(&config.root)?;
        let state_dir = guard
            .resolve(&config.state_dir.to_string_lossy())?
            .as_path()
            .to_path_buf();

        let manifest_path = match &config.manifest {
            Some(path) => rooted(guard.root(), path),
            None => state_dir.join(MANIFEST_FILENAME),
        };

        Ok(Sandbox {
            store: ProposalStore::new(&state_dir),
            guard,
            state_dir,
            manifest_path,
        })
    }

    #[cfg(test)]
    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    pub fn dispatch(&self, request: Request) -> Result<Response, DispatchError> {
        match request {
            Request::Resolve { path } => {
                let resolved = self.guard.resolve(&path)?;
                Ok(Response::Resolved {
                    path: resolved.display(),
                    absolute: resolved.as_path().to_path_buf(),
                })
            }
            Request::Read { path } => self.read(&path),
            Request::List { path } => self.list(&path),
            Request::Propose { path, content } => Ok(Response::Proposed(
                self.store.propose(&self.guard, &path, &content)?,
            )),
            Request::Apply { id, options } => {
                let outcome = apply(&self.guard, &self.store, &id, &options)?;
                let path = self.store.load(&id)?.path;
                Ok(Response::Applied { id, path, outcome })
            }
            Request::Proposals => Ok(Response::Proposals(self.store.list()?)),
            Request::Discard { id } => {
                self.store.discard(&id)?;
                Ok(Response::Discarded { id })
            }
            Request::Verify => Ok(Response::Verified(verify(
                &self.manifest_path,
                self.guard.root(),
            )?)),
            Request::Restore { targets, dry_run } => self.restore(targets, dry_run),
            Request::GenerateManifest { tarball, files } => {
                self.generate_manifest(tarball.as_deref(), &files)
            }
        }
    }

    fn read(&self, path: &str) -> Result<Response, DispatchError> {
        let resolved = self.guard.resolve(path)?;
        let bytes = read_existing(&resolved)?
            .ok_or_else(|| DispatchError::NotFound(resolved.display()))?;

        Ok(Response::Read {
            path: resolved.display(),
            size: bytes.len() as u64,
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    fn list(&self, path: &str) -> Result<Response, DispatchError> {
        let resolved = self.guard.resolve(path)?;

        let hidden = if Some(resolved.as_path()) == self.state_dir.parent() {
            self.state_dir.file_name()
        } else {
            None
        };

        Ok(Response::Listed {
            path: resolved.display(),
            entries: list_directory(resolved.as_path(), hidden)?,
        })
    }

    fn restore(&self, targets: RestoreTargets, dry_run: bool) -> Result<Response, DispatchError> {
        let (manifest, targets) = match targets {
            RestoreTargets::Flagged => {
                let report = verify(&self.manifest_path, self.guard.root())?;
                let flagged = report.flagged_paths();
                match (report.manifest, report.result) {
                    (Some(manifest), Some(_)) => (manifest, flagged),
                    _ => {
                        let reason = report
                            .issues
                            .first()
                            .map(|i| i.message.clone())
                            .unwrap_or_default();
                        return Err(DispatchError::RestoreUnavailable(reason));
                    }
                }
            }
            RestoreTargets::Paths(paths) => (Manifest::load(&self.manifest_path)?, paths),
        };

        if dry_run {
            return Ok(Response::WouldRestore { pending: targets });
        }

        let restored = restore_from_tarball(&manifest, &self.guard, &targets)?;

        info!("Restored {} file(s)", restored.len());

        Ok(Response::Restored { restored })
    }

    fn generate_manifest(
        &self,
        tarball: Option<&Path>,
        files: &[String],
    ) -> Result<Response, DispatchError> {
        let tarball_path = match tarball {
            Some(path) => rooted(self.guard.root(), path),
            None => self.state_dir.join(TARBALL_FILENAME),
        };

        let exclude = [
            self.state_dir.clone(),
            self.manifest_path.clone(),
            tarball_path.clone(),
        ];
        let manifest = manifest::generate(&self.guard, files, &exclude, &tarball_path)?;
        manifest.save(&self.manifest_path)?;

        info!(
            "Wrote manifest {} tracking {} file(s)",
            self.manifest_path.display(),
            manifest.entries.len()
        );

        Ok(Response::ManifestWritten {
            manifest_path: self.manifest_path.clone(),
            tarball_path,
            files: manifest.entries.len(),
            root_id: manifest.root_id,
        })
    }
}

fn rooted(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
