//! Integrity manifest: the recorded state of a tracked file set, pinned to a
//! hash-verified reference tarball.
//!
//! The on-disk form is line oriented:
//!
//! ```text
//! # comment
//! VERSION <version> <schema_version> <root_id>
//! TARBALL <sha256> <size> <path>
//! FILE <sha256> <size> <octal-mode> <rfc3339-mtime> <path>
//! ```
//!
//! The path is always the last field and may contain spaces.

use crate::checksum::sha256_hex;
use crate::dir_list::walk_files;
use crate::path_guard::{PathGuard, PathGuardError, clean_relative};
use crate::util::atomic::write_atomic;
use crate::util::hashing::{finish_hex, hash_field};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Manifest line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("Manifest has no VERSION line")]
    MissingVersion,
    #[error("Unsupported manifest schema version: {0}")]
    UnsupportedSchema(u32),
    #[error(transparent)]
    Path(#[from] PathGuardError),
    #[error("Not a regular file: {0}")]
    NotRegularFile(String),
}

impl ManifestError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ManifestError::Io { source, .. } if source.kind() == ErrorKind::NotFound)
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ManifestError + '_ {
    move |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reference to the archive holding known-good copies of tracked files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballRef {
    pub hash: String,
    pub size: u64,
    /// Absolute, or relative to the repo root.
    pub path: PathBuf,
}

impl TarballRef {
    pub fn resolve_in(&self, repo_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            repo_root.join(&self.path)
        }
    }
}

/// Recorded state of one tracked file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub hash: String,
    pub size: u64,
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    /// Repo-relative, always clean.
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: String,
    pub schema_version: u32,
    pub root_id: String,
    pub tarball: Option<TarballRef>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        let mut version = None;
        let mut tarball = None;
        let mut entries = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            // Paths are the last field and may end in whitespace.
            let line = raw.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parse_err = |message: String| ManifestError::Parse {
                line: line_no,
                message,
            };

            let (directive, rest) = match line.find(char::is_whitespace) {
                Some(end) => (&line[..end], line[end..].trim_start()),
                None => (line, ""),
            };

            match directive {
                "VERSION" => {
                    if version.is_some() {
                        return Err(parse_err("duplicate VERSION".to_string()));
                    }
                    let fields: Vec<&str> = rest.split_whitespace().collect();
                    let [v, schema, root_id] = fields.as_slice() else {
                        return Err(parse_err(format!(
                            "VERSION expects 3 fields, got {}",
                            fields.len()
                        )));
                    };
                    let schema = schema
                        .parse::<u32>()
                        .map_err(|e| parse_err(format!("invalid schema version: {e}")))?;
                    version = Some((v.to_string(), schema, root_id.to_string()));
                }
                "TARBALL" => {
                    if tarball.is_some() {
                        return Err(parse_err("duplicate TARBALL".to_string()));
                    }
                    let fields = split_fields(rest, 3)
                        .ok_or_else(|| parse_err("TARBALL expects 3 fields".to_string()))?;
                    tarball = Some(TarballRef {
                        hash: parse_hash(fields[0]).map_err(parse_err)?,
                        size: parse_size(fields[1]).map_err(parse_err)?,
                        path: PathBuf::from(fields[2]),
                    });
                }
                "FILE" => {
                    let fields = split_fields(rest, 5)
                        .ok_or_else(|| parse_err("FILE expects 5 fields".to_string()))?;
                    let mode = u32::from_str_radix(fields[2], 8)
                        .map_err(|e| parse_err(format!("invalid mode {:?}: {e}", fields[2])))?;
                    let mod_time = DateTime::parse_from_rfc3339(fields[3])
                        .map_err(|e| parse_err(format!("invalid mtime {:?}: {e}", fields[3])))?
                        .with_timezone(&Utc);
                    let file_path = parse_file_path(fields[4]).map_err(parse_err)?;
                    entries.push(ManifestEntry {
                        hash: parse_hash(fields[0]).map_err(parse_err)?,
                        size: parse_size(fields[1]).map_err(parse_err)?,
                        mode,
                        mod_time,
                        file_path,
                    });
                }
                other => return Err(parse_err(format!("unknown directive {other:?}"))),
            }
        }

        let Some((version, schema_version, root_id)) = version else {
            return Err(ManifestError::MissingVersion);
        };

        if schema_version != SCHEMA_VERSION {
            return Err(ManifestError::UnsupportedSchema(schema_version));
        }

        Ok(Manifest {
            version,
            schema_version,
            root_id,
            tarball,
            entries,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# sandward integrity manifest\n");

        out.push_str(&format!(
            "VERSION {} {} {}\n",
            self.version, self.schema_version, self.root_id
        ));

        if let Some(tarball) = &self.tarball {
            out.push_str(&format!(
                "TARBALL {} {} {}\n",
                tarball.hash,
                tarball.size,
                tarball.path.display()
            ));
        }

        for entry in &self.entries {
            out.push_str(&format!(
                "FILE {} {} {:04o} {} {}\n",
                entry.hash,
                entry.size,
                entry.mode,
                entry.mod_time.to_rfc3339_opts(SecondsFormat::Secs, true),
                entry.file_path
            ));
        }

        out
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(io_error(path))?;
        Self::parse(&content)
    }

    /// Saves the manifest atomically, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        write_atomic(path, self.render().as_bytes(), None).map_err(io_error(path))
    }

    pub fn entry(&self, file_path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.file_path == file_path)
    }
}

/// Takes `count - 1` whitespace-separated fields, then the remainder of the
/// line as the final field.
fn split_fields(line: &str, count: usize) -> Option<Vec<&str>> {
    let mut fields = Vec::with_capacity(count);
    let mut rest = line.trim_start();

    for _ in 1..count {
        let end = rest.find(char::is_whitespace)?;
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }

    if rest.is_empty() {
        return None;
    }
    fields.push(rest);

    Some(fields)
}

fn parse_hash(field: &str) -> Result<String, String> {
    if field.len() == 64 && field.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(field.to_ascii_lowercase())
    } else {
        Err(format!("invalid sha256 {field:?}"))
    }
}

fn parse_size(field: &str) -> Result<u64, String> {
    field
        .parse::<u64>()
        .map_err(|e| format!("invalid size {field:?}: {e}"))
}

fn parse_file_path(field: &str) -> Result<String, String> {
    match clean_relative(Path::new(field)) {
        Some(clean) if !clean.as_os_str().is_empty() => Ok(clean.to_string_lossy().into_owned()),
        _ => Err(format!("unsafe file path {field:?}")),
    }
}

/// Identity of a tracked file set: a digest over every entry's path and hash.
pub fn compute_root_id(entries: &[ManifestEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hash_field(&mut hasher, entry.file_path.as_bytes());
        hash_field(&mut hasher, entry.hash.as_bytes());
    }
    finish_hex(hasher)
}

/// Builds a reference tarball and the manifest describing it.
///
/// `files` are root-relative paths resolved through `guard`; when empty,
/// every regular file under the root is tracked except those at or below an
/// `exclude` path. The tarball is written atomically to `tarball_path`, which is
/// recorded relative to the root when it lies inside it.
pub fn generate(
    guard: &PathGuard,
    files: &[String],
    exclude: &[PathBuf],
    tarball_path: &Path,
) -> Result<Manifest, ManifestError> {
    let root = guard.root();

    let mut selected: Vec<String> = if files.is_empty() {
        walk_files(root, exclude).map_err(io_error(root))?
    } else {
        files.to_vec()
    };
    selected.sort();
    selected.dedup();

    let mut builder = tar::Builder::new(Vec::new());
    let mut entries = Vec::with_capacity(selected.len());

    for file in &selected {
        let resolved = guard.resolve(file)?;
        let path = resolved.as_path();

        let metadata = std::fs::metadata(path).map_err(io_error(path))?;
        if !metadata.is_file() {
            return Err(ManifestError::NotRegularFile(resolved.display()));
        }

        let bytes = std::fs::read(path).map_err(io_error(path))?;
        let mode = file_mode(&metadata);
        let mtime_secs = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mod_time = Utc
            .timestamp_opt(i64::try_from(mtime_secs).unwrap_or(i64::MAX), 0)
            .single()
            .unwrap_or_default();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(mode);
        header.set_mtime(mtime_secs);
        builder
            .append_data(&mut header, resolved.relative(), bytes.as_slice())
            .map_err(io_error(path))?;

        debug!("Tracking {}", resolved.display());

        entries.push(ManifestEntry {
            hash: sha256_hex(&bytes),
            size: bytes.len() as u64,
            mode,
            mod_time,
            file_path: resolved.display(),
        });
    }

    let tar_bytes = builder.into_inner().map_err(io_error(tarball_path))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).map_err(io_error(tarball_path))?;
    let gz_bytes = encoder.finish().map_err(io_error(tarball_path))?;

    if let Some(parent) = tarball_path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    write_atomic(tarball_path, &gz_bytes, None).map_err(io_error(tarball_path))?;

    let recorded_path = tarball_path
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| tarball_path.to_path_buf());

    info!(
        "Wrote reference tarball {} with {} files",
        tarball_path.display(),
        entries.len()
    );

    Ok(Manifest {
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: SCHEMA_VERSION,
        root_id: compute_root_id(&entries),
        tarball: Some(TarballRef {
            hash: sha256_hex(&gz_bytes),
            size: gz_bytes.len() as u64,
            path: recorded_path,
        }),
        entries,
    })
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
