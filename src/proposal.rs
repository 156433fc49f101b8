use crate::checksum::sha256_hex;
use crate::diffing::replacement_diff;
use crate::path_guard::{PathGuard, PathGuardError, ResolvedPath};
use crate::util::atomic::write_atomic;
use crate::util::hashing::{finish_hex, hash_bool_field, hash_field, hash_path_field};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "toml";

#[derive(Debug, thiserror::Error)]
pub enum ProposalError {
    #[error(transparent)]
    Path(#[from] PathGuardError),
    #[error("Not a regular file: {0}")]
    NotRegularFile(String),
    #[error("No change proposed: {0} already has this content")]
    NoChangeProposed(String),
    #[error("Path is reserved for sandward state: {0}")]
    ReservedPath(String),
    #[error("Proposal not found: {0}")]
    NotFound(String),
    #[error("Invalid proposal id: {0:?}")]
    InvalidId(String),
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Unsupported proposal record version: {0}")]
    UnsupportedVersion(u32),
    #[error("Proposal record {id} has been altered: {reason}")]
    TamperedRecord { id: String, reason: &'static str },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProposalError + '_ {
    move |source| ProposalError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A staged, content-addressed write intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Proposal {
    pub id: String,
    /// Root-relative target path.
    pub path: String,
    pub is_new_file: bool,
    /// Empty when the target did not exist at staging time.
    pub base_hash: String,
    pub content_hash: String,
    pub content: String,
    pub diff: String,
    pub generated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn generated_at_rfc3339(&self) -> String {
        self.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Checks that the record still addresses itself: the content hashes to
    /// `content_hash` and the id is derived from the stored fields.
    fn check_integrity(&self, id: &str) -> Result<(), ProposalError> {
        let tampered = |reason: &'static str| -> Result<(), ProposalError> {
            warn!("Proposal record {} failed its integrity check: {}", id, reason);
            Err(ProposalError::TamperedRecord {
                id: id.to_string(),
                reason,
            })
        };

        if self.id != id {
            return tampered("stored id differs from the record name");
        }
        if sha256_hex(self.content.as_bytes()) != self.content_hash {
            return tampered("content does not match content_hash");
        }
        if self.is_new_file != self.base_hash.is_empty() {
            return tampered("base_hash disagrees with is_new_file");
        }
        let derived = proposal_id(
            Path::new(&self.path),
            self.is_new_file,
            &self.base_hash,
            &self.content_hash,
        );
        if derived != id {
            return tampered("id is not derived from the stored fields");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Metadata {
    version: u32,
}

/// Only the metadata table, so the version can be checked before the body
/// is parsed strictly.
#[derive(Debug, Deserialize)]
struct MetadataOnly {
    metadata: Metadata,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProposalRecord {
    metadata: Metadata,
    proposal: Proposal,
}

impl ProposalRecord {
    const SUPPORTED_VERSION: u32 = 1;

    fn from_toml(content: &str) -> Result<Self, ProposalError> {
        let metadata_only: MetadataOnly = toml::from_str(content)?;

        if metadata_only.metadata.version != Self::SUPPORTED_VERSION {
            return Err(ProposalError::UnsupportedVersion(
                metadata_only.metadata.version,
            ));
        }

        Ok(toml::from_str(content)?)
    }
}

/// Computes the content-addressed id of a write intent.
pub fn proposal_id(path: &Path, is_new_file: bool, base_hash: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hash_path_field(&mut hasher, path);
    hash_bool_field(&mut hasher, is_new_file);
    hash_field(&mut hasher, base_hash.as_bytes());
    hash_field(&mut hasher, content_hash.as_bytes());
    finish_hex(hasher)
}

fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Reads the current bytes of a resolved target.
///
/// Returns `Ok(None)` when nothing exists at the path and `NotRegularFile`
/// when something other than a regular file does.
pub(crate) fn read_existing(target: &ResolvedPath) -> Result<Option<Vec<u8>>, ProposalError> {
    let path = target.as_path();

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };

    if !metadata.is_file() {
        return Err(ProposalError::NotRegularFile(target.display()));
    }

    std::fs::read(path).map(Some).map_err(io_error(path))
}

/// Directory of proposal records, one TOML file per proposal id.
#[derive(Debug, Clone)]
pub struct ProposalStore {
    dir: PathBuf,
    state_dir: PathBuf,
}

impl ProposalStore {
    /// `state_dir` is the absolute sandward state directory; records live in
    /// its `proposals` subdirectory. Proposals may not target anything inside
    /// `state_dir`.
    pub fn new(state_dir: &Path) -> Self {
        ProposalStore {
            dir: state_dir.join("proposals"),
            state_dir: state_dir.to_path_buf(),
        }
    }

    #[cfg(test)]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    /// Stages a write of `content` to `path` without touching the target.
    ///
    /// Fails with `NoChangeProposed` if the target already holds exactly this
    /// content. Identical repeated proposals return the already stored record.
    pub fn propose(
        &self,
        guard: &PathGuard,
        path: &str,
        content: &str,
    ) -> Result<Proposal, ProposalError> {
        let target = guard.resolve(path)?;
        self.ensure_not_reserved(guard, &target)?;

        let existing = read_existing(&target)?;
        let is_new_file = existing.is_none();

        if existing.as_deref() == Some(content.as_bytes()) {
            return Err(ProposalError::NoChangeProposed(target.display()));
        }

        let base_hash = existing
            .as_deref()
            .map(sha256_hex)
            .unwrap_or_default();
        let content_hash = sha256_hex(content.as_bytes());
        let id = proposal_id(target.relative(), is_new_file, &base_hash, &content_hash);

        match self.load(&id) {
            Ok(stored) => {
                debug!("Proposal {} already staged", id);
                return Ok(stored);
            }
            Err(ProposalError::NotFound(_) | ProposalError::TamperedRecord { .. }) => {}
            Err(e) => return Err(e),
        }

        let display_path = target.display();
        let old_text = existing.as_deref().map(String::from_utf8_lossy);
        let diff = replacement_diff(&display_path, old_text.as_deref(), content);

        let proposal = Proposal {
            id,
            path: display_path,
            is_new_file,
            base_hash,
            content_hash,
            content: content.to_string(),
            diff,
            generated_at: Utc::now(),
        };

        self.save(&proposal)?;

        info!("Staged proposal {} for {}", proposal.id, proposal.path);

        Ok(proposal)
    }

    /// Fails with `ReservedPath` if `target`, lexically or after following
    /// symlinks, lies inside the state directory.
    pub(crate) fn ensure_not_reserved(
        &self,
        guard: &PathGuard,
        target: &ResolvedPath,
    ) -> Result<(), ProposalError> {
        let reserved = target.as_path().starts_with(&self.state_dir)
            || guard
                .real_path(target.as_path())?
                .starts_with(guard.real_path(&self.state_dir)?);

        if reserved {
            warn!("Rejected write into sandward state: {}", target.display());
            return Err(ProposalError::ReservedPath(target.display()));
        }

        Ok(())
    }

    /// Loads a stored proposal by id, rejecting records whose fields no
    /// longer match their id.
    pub fn load(&self, id: &str) -> Result<Proposal, ProposalError> {
        if !is_valid_id(id) {
            return Err(ProposalError::InvalidId(id.to_string()));
        }

        let path = self.record_path(id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProposalError::NotFound(id.to_string()));
            }
            Err(e) => return Err(io_error(&path)(e)),
        };

        let proposal = ProposalRecord::from_toml(&content)?.proposal;
        proposal.check_integrity(id)?;

        Ok(proposal)
    }

    /// Writes a proposal record atomically.
    pub fn save(&self, proposal: &Proposal) -> Result<(), ProposalError> {
        std::fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let record = ProposalRecord {
            metadata: Metadata {
                version: ProposalRecord::SUPPORTED_VERSION,
            },
            proposal: proposal.clone(),
        };
        let content = toml::to_string_pretty(&record)?;
        let path = self.record_path(&proposal.id);

        write_atomic(&path, content.as_bytes(), None).map_err(io_error(&path))
    }

    /// All stored proposals, oldest first. Unreadable or altered records are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<Proposal>, ProposalError> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir)(e)),
        };

        let mut proposals = Vec::new();
        for entry in read_dir {
            let path = entry.map_err(io_error(&self.dir))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_id(id) {
                continue;
            }
            match self.load(id) {
                Ok(proposal) => proposals.push(proposal),
                Err(e @ ProposalError::Io { .. }) => return Err(e),
                Err(e) => warn!("Skipping proposal record {}: {}", path.display(), e),
            }
        }

        proposals.sort_by(|a, b| {
            a.generated_at
                .cmp(&b.generated_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(proposals)
    }

    /// Deletes an abandoned proposal record.
    pub fn discard(&self, id: &str) -> Result<(), ProposalError> {
        if !is_valid_id(id) {
            return Err(ProposalError::InvalidId(id.to_string()));
        }

        let path = self.record_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!("Discarded proposal {}", id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ProposalError::NotFound(id.to_string()))
            }
            Err(e) => Err(io_error(&path)(e)),
        }
    }
}
