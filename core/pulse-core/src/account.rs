//! Account credentials persisted after a successful login.
//!
//! Stored as `<root>/account.json`. The record keeps the password so the
//! node can log in again on its own while it runs; the file is therefore
//! written owner-only on Unix.

use std::io::{ErrorKind, Write};
use std::path::Path;

use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{PulseError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountRecord {
    pub email: String,
    pub password: String,
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub personal_code: Option<String>,
}

impl AccountRecord {
    /// Whether the record carries enough to log in again unattended.
    pub fn can_relogin(&self) -> bool {
        !self.email.trim().is_empty() && !self.password.is_empty()
    }
}

/// Loads the account record. Missing or unreadable files yield `None`.
pub fn load_account(path: &Path) -> Option<AccountRecord> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(error = %err, "Failed to read account file");
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Failed to parse account file");
            None
        }
    }
}

pub fn save_account(path: &Path, record: &AccountRecord) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| PulseError::NoParentDir(path.to_path_buf()))?;
    fs::create_dir_all(parent_dir).map_err(|err| PulseError::io("create account dir", err))?;

    let content = serde_json::to_string_pretty(record)
        .map_err(|err| PulseError::json("serialize account", err))?;

    // NamedTempFile is created 0600 on Unix, so the rename keeps it private.
    let mut temp_file = NamedTempFile::new_in(parent_dir)
        .map_err(|err| PulseError::io("create temp account file", err))?;
    temp_file
        .write_all(content.as_bytes())
        .map_err(|err| PulseError::io("write temp account file", err))?;
    temp_file
        .persist(path)
        .map_err(|err| PulseError::Persist {
            path: path.to_path_buf(),
            source: err.error,
        })?;
    Ok(())
}

pub fn clear_account(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PulseError::io("remove account file", err)),
    }
}
