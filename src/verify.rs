use crate::checksum::{ChecksumError, checksum_file};
use crate::diffing::truncate_hash;
use crate::manifest::Manifest;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ISSUE_HASH_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    /// Suggested remediation.
    pub strategy: Option<String>,
}

impl Issue {
    fn new(severity: Severity, message: impl Into<String>, strategy: Option<&str>) -> Self {
        Issue {
            severity,
            message: message.into(),
            strategy: strategy.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifiedFile {
    pub path: String,
    pub expected_hash: String,
    /// Empty when the path exists but is not a regular file.
    pub actual_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationResult {
    pub total_files: usize,
    pub verified_files: usize,
    pub missing_files: Vec<String>,
    pub modified_files: Vec<ModifiedFile>,
}

impl VerificationResult {
    /// Paths that a restore would need to touch, in manifest order.
    pub fn flagged_paths(&self) -> Vec<String> {
        let mut paths = self.missing_files.clone();
        paths.extend(self.modified_files.iter().map(|m| m.path.clone()));
        paths
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub issues: Vec<Issue>,
    /// Present only when per-file verification ran.
    pub result: Option<VerificationResult>,
    /// Present when the manifest parsed.
    pub manifest: Option<Manifest>,
}

impl VerifyReport {
    fn stop(issue: Issue, manifest: Option<Manifest>) -> Self {
        VerifyReport {
            issues: vec![issue],
            result: None,
            manifest,
        }
    }

    /// True when nothing worse than an informational issue was raised.
    pub fn is_clean(&self) -> bool {
        self.issues.iter().all(|i| i.severity == Severity::Info)
    }

    pub fn flagged_paths(&self) -> Vec<String> {
        self.result
            .as_ref()
            .map(VerificationResult::flagged_paths)
            .unwrap_or_default()
    }
}

pub fn verify(manifest_path: &Path, repo_root: &Path) -> Result<VerifyReport, VerifyError> {
    let manifest = match Manifest::load(manifest_path) {
        Ok(m) => m,
        Err(e) if e.is_not_found() => {
            warn!("No manifest at {}", manifest_path.display());
            return Ok(VerifyReport::stop(
                Issue::new(
                    Severity::Warn,
                    format!("No integrity manifest at {}", manifest_path.display()),
                    Some("Generate one with `sandward manifest --tarball <PATH>`"),
                ),
                None,
            ));
        }
        Err(e) => {
            return Ok(VerifyReport::stop(
                Issue::new(
                    Severity::Error,
                    format!("Cannot read manifest {}: {e}", manifest_path.display()),
                    Some("Regenerate the manifest"),
                ),
                None,
            ));
        }
    };

    let Some(tarball) = manifest.tarball.clone() else {
        return Ok(VerifyReport::stop(
            Issue::new(
                Severity::Error,
                "Manifest declares no reference tarball",
                Some("Regenerate the manifest with a reference tarball"),
            ),
            Some(manifest),
        ));
    };

    let tarball_path = tarball.resolve_in(repo_root);
    match checksum_file(&tarball_path) {
        Ok(checksum) if checksum.sha256 == tarball.hash && checksum.size == tarball.size => {
            debug!("Reference tarball {} verified", tarball_path.display());
        }
        Ok(checksum) => {
            warn!("Reference tarball {} hash mismatch", tarball_path.display());
            return Ok(VerifyReport::stop(
                Issue::new(
                    Severity::Error,
                    format!(
                        "Reference tarball {} does not match the manifest (expected {}, actual {})",
                        tarball_path.display(),
                        truncate_hash(&tarball.hash, ISSUE_HASH_LEN),
                        truncate_hash(&checksum.sha256, ISSUE_HASH_LEN)
                    ),
                    Some("Obtain a trusted copy of the tarball or regenerate the manifest"),
                ),
                Some(manifest),
            ));
        }
        Err(e) if e.is_not_found() => {
            return Ok(VerifyReport::stop(
                Issue::new(
                    Severity::Error,
                    format!("Reference tarball {} is missing", tarball_path.display()),
                    Some("Obtain a trusted copy of the tarball or regenerate the manifest"),
                ),
                Some(manifest),
            ));
        }
        Err(e) => return Err(e.into()),
    }

    let result = verify_entries(&manifest, repo_root)?;
    let issues = summarize(&result);

    Ok(VerifyReport {
        issues,
        result: Some(result),
        manifest: Some(manifest),
    })
}

fn verify_entries(manifest: &Manifest, repo_root: &Path) -> Result<VerificationResult, VerifyError> {
    let mut result = VerificationResult {
        total_files: manifest.entries.len(),
        ..Default::default()
    };

    for entry in &manifest.entries {
        let path = repo_root.join(&entry.file_path);

        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Missing: {}", entry.file_path);
                result.missing_files.push(entry.file_path.clone());
                continue;
            }
            Err(source) => return Err(VerifyError::Io { path, source }),
        };

        let actual_hash = if metadata.is_file() {
            checksum_file(&path)?.sha256
        } else {
            String::new()
        };

        if actual_hash == entry.hash {
            result.verified_files += 1;
        } else {
            debug!("Modified: {}", entry.file_path);
            result.modified_files.push(ModifiedFile {
                path: entry.file_path.clone(),
                expected_hash: entry.hash.clone(),
                actual_hash,
            });
        }
    }

    Ok(result)
}

fn summarize(result: &VerificationResult) -> Vec<Issue> {
    let mut issues = Vec::new();

    if !result.missing_files.is_empty() {
        issues.push(Issue::new(
            Severity::Error,
            format!(
                "{} tracked file(s) missing: {}",
                result.missing_files.len(),
                result.missing_files.join(", ")
            ),
            Some("Restore them with `sandward restore`"),
        ));
    }

    if !result.modified_files.is_empty() {
        let details: Vec<String> = result
            .modified_files
            .iter()
            .map(|m| {
                format!(
                    "{} (expected {}, actual {})",
                    m.path,
                    truncate_hash(&m.expected_hash, ISSUE_HASH_LEN),
                    if m.actual_hash.is_empty() {
                        "not a regular file"
                    } else {
                        truncate_hash(&m.actual_hash, ISSUE_HASH_LEN)
                    }
                )
            })
            .collect();
        issues.push(Issue::new(
            Severity::Error,
            format!(
                "{} tracked file(s) modified:\n{}",
                details.len(),
                details.join("\n")
            ),
            Some("Restore them with `sandward restore`"),
        ));
    }

    if issues.is_empty() {
        issues.push(Issue::new(
            Severity::Info,
            format!("All {} tracked file(s) verified", result.verified_files),
            None,
        ));
    }

    issues
}
