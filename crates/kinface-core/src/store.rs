//! Durable roster storage.
//!
//! The roster lives in a single versioned JSON file that is replaced
//! atomically (write temp file, fsync, rename) on every mutation. The file
//! records the model profile it was built with and a SHA-256 checksum of
//! its persons, so a roster from another embedding model or a damaged file
//! is rejected at load instead of producing silent mismatches.

use crate::types::{ModelProfile, PersonRecord, PersonSummary, Roster};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Highest roster file format this build reads and the one it writes.
pub const ROSTER_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("roster i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("roster file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("roster file {path} was built with {found}, this service uses {expected}")]
    IncompatibleModel {
        path: PathBuf,
        found: ModelProfile,
        expected: ModelProfile,
    },
    #[error("roster file {path} has format version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
    #[error("invalid person id {id} (roster has {len} persons)")]
    InvalidId { id: usize, len: usize },
    #[error("invalid person record: {0}")]
    InvalidRecord(String),
    #[error("mutation cancelled before it was written")]
    Cancelled,
    #[error("roster serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors that mean the file on disk cannot be trusted.
    ///
    /// These are fatal at startup; recovery is an explicit operator reset.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupt { .. }
                | StoreError::IncompatibleModel { .. }
                | StoreError::UnsupportedVersion { .. }
        )
    }
}

/// On-disk envelope. Person ids are positional and never written.
#[derive(Serialize, Deserialize)]
struct RosterFile {
    format_version: u32,
    model: String,
    dimension: usize,
    checksum: String,
    persons: Vec<PersonRecord>,
}

/// Read before the full parse so newer files fail with a version error.
#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

/// Owner of the roster: in-memory copy plus its durable file.
///
/// All mutations are serialized behind one lock and follow
/// clone → modify → save → swap, so a failed save changes nothing.
pub struct RosterStore {
    path: PathBuf,
    profile: ModelProfile,
    roster: Mutex<Roster>,
}

impl RosterStore {
    /// Load the roster at `path` (empty if the file does not exist).
    pub fn open(path: impl Into<PathBuf>, profile: ModelProfile) -> Result<Self, StoreError> {
        let path = path.into();
        let roster = Self::load(&path, &profile)?;
        tracing::info!(
            path = %path.display(),
            persons = roster.len(),
            profile = %profile,
            "roster opened"
        );
        Ok(Self {
            path,
            profile,
            roster: Mutex::new(roster),
        })
    }

    /// Read durable state. A missing file is an empty roster, not an error.
    pub fn load(path: &Path, profile: &ModelProfile) -> Result<Roster, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no roster file; starting empty");
                return Ok(Roster::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let probe: VersionProbe =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("unreadable header: {e}")))?;
        if probe.format_version > ROSTER_FORMAT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: probe.format_version,
                supported: ROSTER_FORMAT_VERSION,
            });
        }

        let file: RosterFile =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("unreadable body: {e}")))?;

        let found = ModelProfile::new(file.model, file.dimension);
        if &found != profile {
            return Err(StoreError::IncompatibleModel {
                path: path.to_path_buf(),
                found,
                expected: profile.clone(),
            });
        }

        let actual = checksum(&file.persons)?;
        if actual != file.checksum {
            return Err(corrupt(format!(
                "checksum mismatch (stored {}, computed {actual})",
                file.checksum
            )));
        }

        for (id, person) in file.persons.iter().enumerate() {
            validate_record(person, profile).map_err(|reason| corrupt(format!("person {id}: {reason}")))?;
        }

        Ok(Roster::new(file.persons))
    }

    /// Atomically replace the whole roster, on disk and in memory.
    pub fn save(&self, roster: Roster) -> Result<(), StoreError> {
        for person in roster.persons() {
            validate_record(person, &self.profile).map_err(StoreError::InvalidRecord)?;
        }
        let mut guard = self.lock();
        write_roster(&self.path, &self.profile, &roster)?;
        *guard = roster;
        Ok(())
    }

    /// Append a person; returns the new person's id.
    pub fn append(&self, record: PersonRecord) -> Result<usize, StoreError> {
        validate_record(&record, &self.profile).map_err(StoreError::InvalidRecord)?;
        let name = record.name.clone();
        let id = self.mutate(|roster| Ok(roster.push(record)))?;
        tracing::info!(id, name = %name, "person appended to roster");
        Ok(id)
    }

    /// Append a person unless `cancel` fires before the write begins.
    ///
    /// The token is checked while holding the roster lock, so a cancelled
    /// caller never commits after a concurrent writer finishes.
    pub fn append_unless_cancelled(
        &self,
        record: PersonRecord,
        cancel: &CancellationToken,
    ) -> Result<usize, StoreError> {
        validate_record(&record, &self.profile).map_err(StoreError::InvalidRecord)?;
        let name = record.name.clone();
        let id = self.mutate(|roster| {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            Ok(roster.push(record))
        })?;
        tracing::info!(id, name = %name, "person appended to roster");
        Ok(id)
    }

    /// Remove the person at `id`; later ids shift down by one.
    pub fn remove(&self, id: usize) -> Result<PersonRecord, StoreError> {
        let removed = self.mutate(|roster| {
            let len = roster.len();
            roster.remove(id).ok_or(StoreError::InvalidId { id, len })
        })?;
        tracing::info!(id, name = %removed.name, "person removed from roster");
        Ok(removed)
    }

    pub fn list(&self) -> Vec<PersonSummary> {
        self.lock().summaries()
    }

    /// Run `f` against the current roster while holding the lock.
    pub fn read<R>(&self, f: impl FnOnce(&Roster) -> R) -> R {
        f(&self.lock())
    }

    pub fn snapshot(&self) -> Roster {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the file at `path` with an empty roster.
    ///
    /// Operator recovery for a corrupt or incompatible roster. Never called
    /// implicitly.
    pub fn reset(path: &Path, profile: &ModelProfile) -> Result<(), StoreError> {
        write_roster(path, profile, &Roster::default())?;
        tracing::warn!(path = %path.display(), profile = %profile, "roster reset to empty");
        Ok(())
    }

    fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Roster) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        write_roster(&self.path, &self.profile, &next)?;
        *guard = next;
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, Roster> {
        // The roster is only swapped after a successful save, so the state
        // behind a poisoned lock is still consistent.
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Structural checks applied on append and on load.
pub fn validate_record(person: &PersonRecord, profile: &ModelProfile) -> Result<(), String> {
    if person.name.trim().is_empty() {
        return Err("empty name".into());
    }
    if person.relation.trim().is_empty() {
        return Err("empty relation".into());
    }
    if person.embeddings.is_empty() {
        return Err("no embeddings".into());
    }
    for (i, e) in person.embeddings.iter().enumerate() {
        if e.dimension() != profile.dimension {
            return Err(format!(
                "embedding {i} has dimension {}, expected {}",
                e.dimension(),
                profile.dimension
            ));
        }
        if !e.is_finite() {
            return Err(format!("embedding {i} has non-finite values"));
        }
    }
    Ok(())
}

fn checksum(persons: &[PersonRecord]) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(persons)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn write_roster(path: &Path, profile: &ModelProfile, roster: &Roster) -> Result<(), StoreError> {
    let file = RosterFile {
        format_version: ROSTER_FORMAT_VERSION,
        model: profile.model.clone(),
        dimension: profile.dimension,
        checksum: checksum(roster.persons())?,
        persons: roster.persons().to_vec(),
    };
    let data = serde_json::to_vec(&file)?;
    write_atomic(path, &data)?;
    tracing::debug!(
        path = %path.display(),
        persons = roster.len(),
        bytes = data.len(),
        "roster saved"
    );
    Ok(())
}

/// Write `data` next to `path` and rename it into place.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| StoreError::Io { path, source }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let tmp_path = temp_path(path);
    let written = fs::File::create(&tmp_path).and_then(|mut f| {
        f.write_all(data)?;
        f.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(&tmp_path)(e));
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(io_err(path)(e));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(OsString::from(".tmp"));
    PathBuf::from(name)
}
