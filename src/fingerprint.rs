//! Content fingerprint store
//!
//! Maps content hashes to already-downloaded files for duplicate
//! suppression. The content SHA-256 is the authoritative key; the platform
//! file uid (and a platform-supplied hash, when present) serve as fast-path
//! pre-checks that avoid transferring bytes at all.

use crate::error::Result;
use crate::storage::Storage;
use crate::types::JobId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Hex-encoded SHA-256 content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an existing lowercase hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_lowercase())
    }

    /// Hash a full byte slice (small inputs and tests; streaming callers
    /// use [`Digester`])
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex_digest(hasher))
    }

    /// The hex digest string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental SHA-256 digester for streaming transfers
#[derive(Default)]
pub struct Digester {
    inner: Sha256,
}

impl Digester {
    /// Start a fresh digest
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Finish and produce the fingerprint
    pub fn finalize(self) -> Fingerprint {
        Fingerprint(hex_digest(self.inner))
    }
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Record of one successfully downloaded piece of content.
///
/// Append-only: created the moment a transfer completes, never mutated,
/// removed only by an explicit purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintRecord {
    /// Content fingerprint (primary key)
    pub fingerprint: Fingerprint,
    /// Platform file uid of the first download
    pub source_uid: String,
    /// Where the first copy landed
    pub path: PathBuf,
    /// Job that downloaded it
    pub job_id: JobId,
    /// When the record was created
    pub recorded_at: DateTime<Utc>,
}

/// Process-wide duplicate-suppression index.
///
/// An in-memory index fronts the storage layer so lookups on the hot path
/// never touch the database: reads take a shared lock, writes briefly take
/// the map exclusively and then persist outside any lock.
pub struct FingerprintStore {
    by_hash: RwLock<HashMap<String, FingerprintRecord>>,
    by_uid: RwLock<HashMap<String, String>>,
    storage: Arc<dyn Storage>,
}

impl FingerprintStore {
    /// Load the index from storage
    pub async fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let records = storage.load_fingerprints().await?;
        let mut by_hash = HashMap::with_capacity(records.len());
        let mut by_uid = HashMap::with_capacity(records.len());
        for record in records {
            by_uid.insert(
                record.source_uid.clone(),
                record.fingerprint.as_str().to_string(),
            );
            by_hash.insert(record.fingerprint.as_str().to_string(), record);
        }
        Ok(Self {
            by_hash: RwLock::new(by_hash),
            by_uid: RwLock::new(by_uid),
            storage,
        })
    }

    /// Fast-path pre-check before any bytes move: is this source (by uid,
    /// or by a platform-supplied content hash) already downloaded?
    pub fn check_source(
        &self,
        source_uid: &str,
        platform_hash: Option<&str>,
    ) -> Option<FingerprintRecord> {
        // Never hold both map locks at once
        let known_hash = self.by_uid.read().get(source_uid).cloned();
        if let Some(hash) = known_hash {
            if let Some(record) = self.by_hash.read().get(&hash) {
                return Some(record.clone());
            }
        }
        if let Some(hash) = platform_hash {
            if let Some(record) = self.by_hash.read().get(&hash.to_lowercase()) {
                return Some(record.clone());
            }
        }
        None
    }

    /// Authoritative post-download check by content fingerprint
    pub fn check_content(&self, fingerprint: &Fingerprint) -> Option<FingerprintRecord> {
        self.by_hash.read().get(fingerprint.as_str()).cloned()
    }

    /// Record a completed download. First writer for a fingerprint wins;
    /// a second record for the same content is ignored.
    pub async fn record(&self, record: FingerprintRecord) -> Result<()> {
        {
            let mut by_hash = self.by_hash.write();
            if by_hash.contains_key(record.fingerprint.as_str()) {
                return Ok(());
            }
            by_hash.insert(record.fingerprint.as_str().to_string(), record.clone());
        }
        self.by_uid.write().insert(
            record.source_uid.clone(),
            record.fingerprint.as_str().to_string(),
        );
        self.storage.insert_fingerprint(&record).await
    }

    /// Number of known fingerprints
    pub fn len(&self) -> usize {
        self.by_hash.read().len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.by_hash.read().is_empty()
    }

    /// Drop every record, in memory and in storage
    pub async fn purge(&self) -> Result<()> {
        self.by_hash.write().clear();
        self.by_uid.write().clear();
        self.storage.purge_fingerprints().await
    }
}
