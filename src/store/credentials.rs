//! Credential storage
//!
//! `CredentialStore` is the seam between the ceremony engine and whatever
//! keeps credentials. `MemoryCredentialStore` keeps them in a map and can
//! mirror every mutation to a JSON snapshot on disk.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use crate::webauthn::{CounterPolicy, Credential, Identity, WebAuthnError};

const SNAPSHOT_VERSION: u32 = 1;

/// Credential store failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("credential not found")]
    NotFound,
    #[error("credential id is already registered")]
    DuplicateCredentialId,
    #[error("signature counter regression (stored {stored}, presented {presented})")]
    CounterRegression { stored: u32, presented: u32 },
    #[error("credential persistence failed: {0}")]
    Persistence(String),
}

impl From<StoreError> for WebAuthnError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::UnknownCredential,
            StoreError::DuplicateCredentialId => Self::DuplicateCredentialId,
            StoreError::CounterRegression { stored, presented } => {
                Self::CounterRegression { stored, presented }
            }
            StoreError::Persistence(message) => Self::Storage(message),
        }
    }
}

/// Storage for registered credentials
pub trait CredentialStore: Send + Sync {
    /// # Errors
    ///
    /// Returns `NotFound` if no credential has this id
    fn find(&self, credential_id: &[u8]) -> Result<Credential, StoreError>;

    /// All credentials owned by `identity`, oldest first
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the backing store cannot be read
    fn find_all_by_identity(&self, identity: &Identity) -> Result<Vec<Credential>, StoreError>;

    /// # Errors
    ///
    /// Returns `DuplicateCredentialId` if the id is taken, or `Persistence`
    /// if the write cannot be made durable
    fn insert(&self, credential: Credential) -> Result<(), StoreError>;

    /// Compare-and-set the signature counter and stamp `last_used`
    ///
    /// Accepts `new_counter > stored`, or `new_counter == stored == 0` for
    /// authenticators that do not count.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `CounterRegression` or `Persistence`
    fn update_counter(&self, credential_id: &[u8], new_counter: u32) -> Result<(), StoreError>;

    /// User handle already assigned to `identity`, if it has any credential
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the backing store cannot be read
    fn user_handle_for(&self, identity: &Identity) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .find_all_by_identity(identity)?
            .into_iter()
            .map(|credential| credential.user_handle)
            .find(|handle| !handle.is_empty()))
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    credentials: Vec<Credential>,
}

/// In-memory credential store with optional JSON persistence
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<Vec<u8>, Credential>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryCredentialStore {
    /// Store that lives only in memory
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Open a store backed by the JSON snapshot at `path`
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first write.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if the file exists but cannot be read or parsed
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let credentials = match fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::Persistence(format!("invalid snapshot {}: {e}", path.display()))
                })?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(StoreError::Persistence(format!(
                        "unsupported snapshot version {}",
                        snapshot.version
                    )));
                }
                snapshot
                    .credentials
                    .into_iter()
                    .map(|credential| (credential.credential_id.clone(), credential))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(StoreError::Persistence(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };

        log::info!(
            "Loaded {} credential(s) from {}",
            credentials.len(),
            path.display()
        );
        Ok(Self {
            credentials: RwLock::new(credentials),
            snapshot_path: Some(path),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Called with the write lock held so snapshots are written in order.
    fn persist(&self, credentials: &HashMap<Vec<u8>, Credential>) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let mut list: Vec<Credential> = credentials.values().cloned().collect();
        list.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.credential_id.cmp(&b.credential_id))
        });
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            credentials: list,
        };
        let json = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;

        write_atomically(path, &json)
            .map_err(|e| StoreError::Persistence(format!("cannot write {}: {e}", path.display())))
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn find(&self, credential_id: &[u8]) -> Result<Credential, StoreError> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(credential_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn find_all_by_identity(&self, identity: &Identity) -> Result<Vec<Credential>, StoreError> {
        let mut owned: Vec<Credential> = self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|credential| &credential.owner == identity)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(owned)
    }

    fn insert(&self, credential: Credential) -> Result<(), StoreError> {
        let mut credentials = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if credentials.contains_key(&credential.credential_id) {
            return Err(StoreError::DuplicateCredentialId);
        }

        let id = credential.credential_id.clone();
        credentials.insert(id.clone(), credential);
        if let Err(e) = self.persist(&credentials) {
            credentials.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn update_counter(&self, credential_id: &[u8], new_counter: u32) -> Result<(), StoreError> {
        let mut credentials = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let credential = credentials
            .get_mut(credential_id)
            .ok_or(StoreError::NotFound)?;

        // The configured policy was applied by the verifier; this is the floor
        let stored = credential.signature_counter;
        if !CounterPolicy::AllowZeroReuse.accepts(stored, new_counter) {
            return Err(StoreError::CounterRegression {
                stored,
                presented: new_counter,
            });
        }

        let previous_last_used = credential.last_used;
        credential.signature_counter = new_counter;
        credential.last_used = Some(Utc::now());

        if let Err(e) = self.persist(&credentials) {
            if let Some(credential) = credentials.get_mut(credential_id) {
                credential.signature_counter = stored;
                credential.last_used = previous_last_used;
            }
            return Err(e);
        }
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file and rename it over `path`
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    // Unique per write so concurrent writers never share a temp file
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{:08x}.tmp", rand::random::<u32>()));
    let tmp = PathBuf::from(tmp);
    let result = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
