//! Credential pair storage
//!
//! Holds the session's access/refresh token pair: one slot, replaced
//! wholesale on login or refresh, emptied on teardown. All writes use atomic
//! temp-file + rename to prevent corruption on crash. A tokio Mutex
//! serializes concurrent access from the request pipeline and the refresh
//! leader.
//!
//! The pair is serialized as a single JSON value (`null` when logged out),
//! so readers can never observe one token without the other.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// The session's token pair.
///
/// Immutable once issued. A refresh produces a whole new pair; there is no
/// field-level patching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    /// Bearer token attached to every outbound call
    #[serde(rename = "access_token")]
    pub access: String,
    /// Longer-lived token exchanged for a new pair
    #[serde(rename = "refresh_token")]
    pub refresh: String,
}

/// Thread-safe single-slot credential file manager.
///
/// The Mutex serializes all access. Reads acquire the lock briefly to clone
/// the in-memory slot, so pipeline reads don't block on refresh writes.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<Option<Credential>>,
}

impl CredentialStore {
    /// Load the credential slot from the given file path.
    ///
    /// If the file doesn't exist, creates it as `null` (no session). The
    /// pipeline fails calls with `Unauthenticated` until a login populates
    /// the slot.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credential: Option<Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(
                path = %path.display(),
                present = credential.is_some(),
                "loaded credential slot"
            );
            credential
        } else {
            info!(path = %path.display(), "credential file not found, starting logged out");
            // Create the empty file so future loads don't need the cold-start path
            write_atomic(&path, &None).await?;
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Get a clone of the current credential pair, if a session exists.
    pub async fn get(&self) -> Option<Credential> {
        let state = self.state.lock().await;
        state.clone()
    }

    /// Replace the credential pair wholesale and persist to disk.
    ///
    /// The in-memory slot is updated before the disk write, so a failed
    /// write leaves the new pair visible to readers (the error is still
    /// returned for the caller to log).
    pub async fn set(&self, credential: Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = Some(credential);
        debug!("replaced credential pair");
        write_atomic(&self.path, &state).await
    }

    /// Empty the slot and persist to disk.
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = None;
        debug!("cleared credential pair");
        write_atomic(&self.path, &state).await
    }

    /// Whether no session is stored.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_none()
    }
}

/// Write the credential slot to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. This prevents corruption if the process crashes mid-write.
/// Sets file permissions to 0600 (owner read/write only) since the file
/// contains bearer tokens.
async fn write_atomic(path: &Path, data: &Option<Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credential.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    // Set 0600 permissions (unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential slot");
    Ok(())
}
