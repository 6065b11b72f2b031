use crawler::{Reference, ReferenceSet};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::form_urlencoded;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to encode {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reference -> processed flag, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedRecord {
    entries: IndexMap<Reference, bool>,
}

impl PersistedRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Processed flag for `reference`, if it is recorded.
    pub fn get(&self, reference: &str) -> Option<bool> {
        self.entries.get(reference).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Reference, bool)> {
        self.entries.iter().map(|(reference, flag)| (reference, *flag))
    }
}

impl FromIterator<(Reference, bool)> for PersistedRecord {
    fn from_iter<T: IntoIterator<Item = (Reference, bool)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Fold `discovered` into `existing`.
///
/// Existing entries keep their position and flag; unseen references are
/// appended unprocessed in discovery order. Returns the updated record and
/// the number of entries added.
pub fn merge(existing: PersistedRecord, discovered: &ReferenceSet) -> (PersistedRecord, usize) {
    let mut updated = existing;
    let mut added = 0;

    for reference in discovered {
        if !updated.entries.contains_key(reference.as_str()) {
            updated.entries.insert(reference.clone(), false);
            added += 1;
        }
    }

    (updated, added)
}

/// What was found on disk before a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordLoad {
    Loaded(PersistedRecord),
    Missing,
    /// The file exists but does not decode as a record.
    Corrupt { reason: String },
}

impl RecordLoad {
    /// Missing and corrupt files both start from an empty record.
    pub fn into_record(self) -> PersistedRecord {
        match self {
            RecordLoad::Loaded(record) => record,
            RecordLoad::Missing | RecordLoad::Corrupt { .. } => PersistedRecord::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, RecordLoad::Loaded(_))
    }
}

pub fn load_record(path: &Path) -> Result<RecordLoad, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(RecordLoad::Missing),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(record) => Ok(RecordLoad::Loaded(record)),
        Err(e) => Ok(RecordLoad::Corrupt {
            reason: e.to_string(),
        }),
    }
}

/// Serialize `value` as pretty JSON and replace `path` in one step.
///
/// The data goes to a temporary file in the same directory, is synced, and
/// is then renamed over the target, so readers see either the old or the
/// new content.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let write_err = |source: io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    tmp.write_all(b"\n").map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    debug!("Wrote {}", path.display());
    Ok(())
}

/// File name stem for a task id.
///
/// The id is form-urlencoded, so distinct ids always get distinct stems and
/// no path separator survives. `*` is escaped as well since some
/// filesystems reject it.
pub fn file_stem_for(task_id: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(task_id.trim().as_bytes())
        .collect::<String>()
        .replace('*', "%2A");

    match encoded.as_str() {
        // a lone '%' never comes out of the encoder
        "" => "%".to_string(),
        _ => encoded,
    }
}

/// Result of committing one crawl's references to disk.
#[derive(Debug, Clone)]
pub struct CommitReport {
    pub path: PathBuf,
    pub added: usize,
    pub total: usize,
    pub prior: RecordLoad,
    /// False when nothing changed and the file was left untouched.
    pub written: bool,
}

/// One record file per task under a directory.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(task_id)))
    }

    pub fn load(&self, task_id: &str) -> Result<RecordLoad, StoreError> {
        load_record(&self.path_for(task_id))
    }

    /// Merge `discovered` into the task's record file.
    ///
    /// An unreadable file is moved aside to `<name>.json.corrupt` before the
    /// fresh record is written.
    pub fn commit(&self, task_id: &str, discovered: &ReferenceSet) -> Result<CommitReport, StoreError> {
        let path = self.path_for(task_id);
        let prior = load_record(&path)?;

        match &prior {
            RecordLoad::Loaded(record) => {
                debug!("Loaded {} existing entries from {}", record.len(), path.display())
            }
            RecordLoad::Missing => debug!("No record at {}, starting fresh", path.display()),
            RecordLoad::Corrupt { reason } => {
                warn!(
                    "Record {} is unreadable ({}), starting fresh",
                    path.display(),
                    reason
                );
                let aside = path.with_extension("json.corrupt");
                fs::rename(&path, &aside).map_err(|source| StoreError::Write {
                    path: aside.clone(),
                    source,
                })?;
                warn!("Moved unreadable record to {}", aside.display());
            }
        }

        let (updated, added) = merge(prior.clone().into_record(), discovered);
        let written = added > 0 || !prior.is_loaded();
        if written {
            write_json_atomic(&path, &updated)?;
            info!(
                "Saved {} references to {} ({} new)",
                updated.len(),
                path.display(),
                added
            );
        } else {
            info!("No new references for {}", task_id);
        }

        Ok(CommitReport {
            path,
            added,
            total: updated.len(),
            prior,
            written,
        })
    }
}
