//! File-backed snapshot persistence.
//!
//! The snapshot lives in a single JSON object at `<root>/state.json`.
//!
//! # Reads
//!
//! Absent state is valid initial state, so [`StateStore::load`] never fails:
//! - Missing file (return empty snapshot)
//! - Empty file (return empty snapshot)
//! - Corrupt JSON or a non-object document (return empty snapshot, log warning)
//!
//! # Merge Semantics
//!
//! [`StateStore::merge`] is a full read-modify-write against disk on every
//! call. Merges are serialized by one lock so concurrent tasks cannot lose
//! each other's updates.
//!
//! # Atomic Writes
//!
//! Uses temp file + rename so a concurrent reader never sees a half-written
//! document.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs_err as fs;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{PulseError, Result};
use crate::snapshot::Snapshot;

#[derive(Debug)]
pub struct StateStore {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(file_path: &Path) -> Self {
        StateStore {
            file_path: file_path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn load(&self) -> Snapshot {
        read_snapshot(&self.file_path)
    }

    /// Applies `patch` to the stored snapshot and persists the result.
    ///
    /// Returns the merged snapshot as written.
    pub fn merge(&self, patch: &Snapshot) -> Result<Snapshot> {
        let _guard = self.lock();

        let mut snapshot = read_snapshot(&self.file_path);
        snapshot.apply(patch);
        write_snapshot(&self.file_path, &snapshot)?;
        Ok(snapshot)
    }

    /// Removes the state file. A missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock();

        match fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(PulseError::io("remove state file", err)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`; a panic mid-merge leaves nothing to repair.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_snapshot(path: &Path) -> Snapshot {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Snapshot::new(),
        Err(err) => {
            warn!(error = %err, "Failed to read state file, using empty snapshot");
            return Snapshot::new();
        }
    };

    if content.trim().is_empty() {
        return Snapshot::new();
    }

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Snapshot::from(map),
        Ok(other) => {
            warn!(
                kind = json_kind(&other),
                path = %path.display(),
                "State file is not a JSON object, using empty snapshot"
            );
            Snapshot::new()
        }
        Err(err) => {
            warn!(
                error = %err,
                path = %path.display(),
                "Failed to parse state file, using empty snapshot"
            );
            Snapshot::new()
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| PulseError::NoParentDir(path.to_path_buf()))?;
    fs::create_dir_all(parent_dir).map_err(|err| PulseError::io("create state dir", err))?;

    let content = serde_json::to_string_pretty(snapshot)
        .map_err(|err| PulseError::json("serialize snapshot", err))?;

    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|err| PulseError::io("create temp state file", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| PulseError::io("write temp state file", err))?;
    temp_file
        .flush()
        .map_err(|err| PulseError::io("flush temp state file", err))?;
    temp_file
        .persist(path)
        .map_err(|err| PulseError::Persist {
            path: path.to_path_buf(),
            source: err.error,
        })?;

    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
