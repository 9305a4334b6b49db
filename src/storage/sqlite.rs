//! SQLite Storage Implementation
//!
//! Provides persistent storage using SQLite with WAL mode for crash safety.

use super::Storage;
use crate::client::SessionInfo;
use crate::error::{ManagerError, Result};
use crate::fingerprint::{Fingerprint, FingerprintRecord};
use crate::ledger::LedgerEntry;
use crate::types::{
    FileTransfer, JobCounters, JobId, JobSnapshot, JobState, TransferId, TransferState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// SQLite-based storage for manager persistence
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Create a new SQLite storage at the given path
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ManagerError::Database(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)?;

            // WAL mode for better concurrency and crash safety
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;

            migrate(&conn)?;

            Ok(conn)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to initialize database: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory SQLite database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            migrate(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| {
            ManagerError::Database(format!("Failed to create in-memory database: {}", e))
        })??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// Current schema version; bump when adding migrations
const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Database schema v1
const SCHEMA_V1: &str = r#"
-- Jobs table
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    channel TEXT NOT NULL,
    state TEXT NOT NULL,
    error_message TEXT,
    priority TEXT NOT NULL DEFAULT 'normal',

    -- Filter
    kinds_json TEXT NOT NULL DEFAULT '[]',
    max_files INTEGER,
    skip_duplicates INTEGER NOT NULL DEFAULT 1,

    -- Counters
    total_files INTEGER NOT NULL DEFAULT 0,
    completed_files INTEGER NOT NULL DEFAULT 0,
    failed_files INTEGER NOT NULL DEFAULT 0,
    skipped_files INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    downloaded_bytes INTEGER NOT NULL DEFAULT 0,

    -- Scan state
    cursor INTEGER,
    scan_complete INTEGER NOT NULL DEFAULT 0,

    save_dir TEXT NOT NULL,

    -- Timestamps
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

-- Transfers table
CREATE TABLE IF NOT EXISTS transfers (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,

    -- Source reference
    message_id INTEGER NOT NULL,
    file_uid TEXT NOT NULL,
    name TEXT NOT NULL,
    declared_size INTEGER,
    mime TEXT,
    content_hash TEXT,

    target_path TEXT NOT NULL,
    expected_size INTEGER,
    bytes_transferred INTEGER NOT NULL DEFAULT 0,
    fingerprint TEXT,
    state TEXT NOT NULL,
    error_message TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE,
    UNIQUE (job_id, file_uid)
);

-- Resume ledger: committed byte offsets per (job, source)
CREATE TABLE IF NOT EXISTS ledger (
    job_id TEXT NOT NULL,
    file_uid TEXT NOT NULL,
    offset INTEGER NOT NULL,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (job_id, file_uid)
);

-- Fingerprint index: content hash -> first download
CREATE TABLE IF NOT EXISTS fingerprints (
    fingerprint TEXT PRIMARY KEY,
    file_uid TEXT NOT NULL,
    path TEXT NOT NULL,
    job_id TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

-- Platform sessions
CREATE TABLE IF NOT EXISTS sessions (
    phone TEXT PRIMARY KEY,
    session_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used TEXT NOT NULL
);

-- Indexes for common queries
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
CREATE INDEX IF NOT EXISTS idx_transfers_job ON transfers(job_id);
CREATE INDEX IF NOT EXISTS idx_transfers_state ON transfers(state);
CREATE INDEX IF NOT EXISTS idx_fingerprints_uid ON fingerprints(file_uid);
"#;

/// Run schema migrations to bring the database up to `CURRENT_SCHEMA_VERSION`.
///
/// Uses SQLite's `PRAGMA user_version` to track the current version. Each
/// migration is applied in order, and the version is bumped after each step.
/// The function is idempotent: calling it on an already-current database is
/// a no-op.
fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    debug_assert_eq!(
        conn.pragma_query_value(None, "user_version", |row| row.get::<_, u32>(0))
            .unwrap(),
        CURRENT_SCHEMA_VERSION
    );

    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_job(&self, job: &JobSnapshot) -> Result<()> {
        let conn = self.conn.clone();
        let job = job.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();

            let (state_str, error_msg) = match &job.state {
                JobState::Failed { message } => ("failed", Some(message.clone())),
                other => (other.as_str(), None),
            };

            let kinds_json =
                serde_json::to_string(&job.filter.kinds).unwrap_or_else(|_| "[]".to_string());

            conn.execute(
                r#"
                INSERT INTO jobs (
                    id, channel, state, error_message, priority,
                    kinds_json, max_files, skip_duplicates,
                    total_files, completed_files, failed_files, skipped_files,
                    total_bytes, downloaded_bytes,
                    cursor, scan_complete, save_dir,
                    created_at, updated_at, completed_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7, ?8,
                    ?9, ?10, ?11, ?12,
                    ?13, ?14,
                    ?15, ?16, ?17,
                    ?18, ?19, ?20
                )
                ON CONFLICT(id) DO UPDATE SET
                    state = excluded.state,
                    error_message = excluded.error_message,
                    priority = excluded.priority,
                    total_files = excluded.total_files,
                    completed_files = excluded.completed_files,
                    failed_files = excluded.failed_files,
                    skipped_files = excluded.skipped_files,
                    total_bytes = excluded.total_bytes,
                    downloaded_bytes = excluded.downloaded_bytes,
                    cursor = excluded.cursor,
                    scan_complete = excluded.scan_complete,
                    updated_at = excluded.updated_at,
                    completed_at = excluded.completed_at
                "#,
                params![
                    job.id.as_uuid().to_string(),
                    job.channel,
                    state_str,
                    error_msg,
                    job.priority.to_string(),
                    kinds_json,
                    job.filter.max_files.map(|n| n as i64),
                    job.skip_duplicates,
                    job.counters.total_files as i64,
                    job.counters.completed_files as i64,
                    job.counters.failed_files as i64,
                    job.counters.skipped_files as i64,
                    job.counters.total_bytes as i64,
                    job.counters.downloaded_bytes as i64,
                    job.cursor,
                    job.scan_complete,
                    job.save_dir.to_string_lossy().to_string(),
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339()),
                ],
            )?;

            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to save job: {}", e)))?
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobSnapshot>> {
        let conn = self.conn.clone();
        let id_str = id.as_uuid().to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<JobSnapshot>> {
            let conn = conn.blocking_lock();

            let result = conn
                .query_row(
                    &format!("{} WHERE id = ?1", JOB_SELECT),
                    params![id_str],
                    row_to_job,
                )
                .optional()?;

            Ok(result)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to load job: {}", e)))?
    }

    async fn load_jobs(&self) -> Result<Vec<JobSnapshot>> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<JobSnapshot>> {
            let conn = conn.blocking_lock();

            let mut stmt = conn.prepare(&format!("{} ORDER BY created_at DESC", JOB_SELECT))?;
            let iter = stmt.query_map([], row_to_job)?;

            let mut results = Vec::new();
            for job in iter {
                results.push(job?);
            }

            Ok(results)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to load jobs: {}", e)))?
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        let conn = self.conn.clone();
        let id_str = id.as_uuid().to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id_str])?;
            // Ledger rows are keyed separately, clean them up too
            conn.execute("DELETE FROM ledger WHERE job_id = ?1", params![id_str])?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to delete job: {}", e)))?
    }

    async fn save_transfer(&self, transfer: &FileTransfer) -> Result<()> {
        let conn = self.conn.clone();
        let transfer = transfer.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();

            let (state_str, error_msg) = match &transfer.state {
                TransferState::Failed { message } => ("failed", Some(message.clone())),
                other => (other.as_str(), None),
            };

            conn.execute(
                r#"
                INSERT INTO transfers (
                    id, job_id,
                    message_id, file_uid, name, declared_size, mime, content_hash,
                    target_path, expected_size, bytes_transferred, fingerprint,
                    state, error_message, attempts,
                    created_at, updated_at
                ) VALUES (
                    ?1, ?2,
                    ?3, ?4, ?5, ?6, ?7, ?8,
                    ?9, ?10, ?11, ?12,
                    ?13, ?14, ?15,
                    ?16, ?17
                )
                ON CONFLICT(id) DO UPDATE SET
                    expected_size = excluded.expected_size,
                    bytes_transferred = excluded.bytes_transferred,
                    fingerprint = excluded.fingerprint,
                    state = excluded.state,
                    error_message = excluded.error_message,
                    attempts = excluded.attempts,
                    updated_at = excluded.updated_at
                "#,
                params![
                    transfer.id.as_uuid().to_string(),
                    transfer.job_id.as_uuid().to_string(),
                    transfer.source.message_id,
                    transfer.source.file_uid,
                    transfer.source.name,
                    transfer.source.size.map(|s| s as i64),
                    transfer.source.mime,
                    transfer.source.content_hash,
                    transfer.target_path.to_string_lossy().to_string(),
                    transfer.expected_size.map(|s| s as i64),
                    transfer.bytes_transferred as i64,
                    transfer.fingerprint,
                    state_str,
                    error_msg,
                    transfer.attempts as i64,
                    transfer.created_at.to_rfc3339(),
                    transfer.updated_at.to_rfc3339(),
                ],
            )?;

            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to save transfer: {}", e)))?
    }

    async fn load_transfers(&self, job: JobId) -> Result<Vec<FileTransfer>> {
        let conn = self.conn.clone();
        let id_str = job.as_uuid().to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<FileTransfer>> {
            let conn = conn.blocking_lock();

            let mut stmt = conn.prepare(&format!(
                "{} WHERE job_id = ?1 ORDER BY created_at, message_id",
                TRANSFER_SELECT
            ))?;
            let iter = stmt.query_map(params![id_str], row_to_transfer)?;

            let mut results = Vec::new();
            for transfer in iter {
                results.push(transfer?);
            }

            Ok(results)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to load transfers: {}", e)))?
    }

    async fn delete_transfer(&self, id: TransferId) -> Result<()> {
        let conn = self.conn.clone();
        let id_str = id.as_uuid().to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM transfers WHERE id = ?1", params![id_str])?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to delete transfer: {}", e)))?
    }

    async fn delete_job_transfers(&self, job: JobId) -> Result<()> {
        let conn = self.conn.clone();
        let id_str = job.as_uuid().to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM transfers WHERE job_id = ?1", params![id_str])?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to delete transfers: {}", e)))?
    }

    async fn upsert_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        let conn = self.conn.clone();
        let entry = entry.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                r#"
                INSERT INTO ledger (job_id, file_uid, offset, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(job_id, file_uid) DO UPDATE SET
                    offset = excluded.offset,
                    updated_at = excluded.updated_at
                "#,
                params![
                    entry.job_id.as_uuid().to_string(),
                    entry.source_uid,
                    entry.offset as i64,
                    entry.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to upsert ledger entry: {}", e)))?
    }

    async fn delete_ledger(&self, job: JobId, source_uid: &str) -> Result<()> {
        let conn = self.conn.clone();
        let id_str = job.as_uuid().to_string();
        let uid = source_uid.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM ledger WHERE job_id = ?1 AND file_uid = ?2",
                params![id_str, uid],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to delete ledger entry: {}", e)))?
    }

    async fn delete_job_ledger(&self, job: JobId) -> Result<()> {
        let conn = self.conn.clone();
        let id_str = job.as_uuid().to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM ledger WHERE job_id = ?1", params![id_str])?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to delete job ledger: {}", e)))?
    }

    async fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<LedgerEntry>> {
            let conn = conn.blocking_lock();

            let mut stmt =
                conn.prepare("SELECT job_id, file_uid, offset, updated_at FROM ledger")?;
            let iter = stmt.query_map([], |row| {
                let job_str: String = row.get(0)?;
                let file_uid: String = row.get(1)?;
                let offset: i64 = row.get(2)?;
                let updated_at_str: String = row.get(3)?;

                let uuid = uuid::Uuid::parse_str(&job_str).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;

                Ok(LedgerEntry {
                    job_id: JobId::from_uuid(uuid),
                    source_uid: file_uid,
                    offset: offset as u64,
                    updated_at: parse_timestamp(&updated_at_str),
                })
            })?;

            let mut results = Vec::new();
            for entry in iter {
                results.push(entry?);
            }

            Ok(results)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to load ledger: {}", e)))?
    }

    async fn insert_fingerprint(&self, record: &FingerprintRecord) -> Result<()> {
        let conn = self.conn.clone();
        let record = record.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            // First writer wins: the index is append-only
            conn.execute(
                r#"
                INSERT OR IGNORE INTO fingerprints (fingerprint, file_uid, path, job_id, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    record.fingerprint.as_str(),
                    record.source_uid,
                    record.path.to_string_lossy().to_string(),
                    record.job_id.as_uuid().to_string(),
                    record.recorded_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to insert fingerprint: {}", e)))?
    }

    async fn load_fingerprints(&self) -> Result<Vec<FingerprintRecord>> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<FingerprintRecord>> {
            let conn = conn.blocking_lock();

            let mut stmt = conn.prepare(
                "SELECT fingerprint, file_uid, path, job_id, recorded_at FROM fingerprints",
            )?;
            let iter = stmt.query_map([], |row| {
                let fingerprint: String = row.get(0)?;
                let file_uid: String = row.get(1)?;
                let path: String = row.get(2)?;
                let job_str: String = row.get(3)?;
                let recorded_at_str: String = row.get(4)?;

                let uuid = uuid::Uuid::parse_str(&job_str).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;

                Ok(FingerprintRecord {
                    fingerprint: Fingerprint::from_hex(fingerprint),
                    source_uid: file_uid,
                    path: PathBuf::from(path),
                    job_id: JobId::from_uuid(uuid),
                    recorded_at: parse_timestamp(&recorded_at_str),
                })
            })?;

            let mut results = Vec::new();
            for record in iter {
                results.push(record?);
            }

            Ok(results)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to load fingerprints: {}", e)))?
    }

    async fn purge_fingerprints(&self) -> Result<()> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("DELETE FROM fingerprints", [])?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to purge fingerprints: {}", e)))?
    }

    async fn save_session(&self, session: &SessionInfo) -> Result<()> {
        let conn = self.conn.clone();
        let session = session.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute(
                r#"
                INSERT INTO sessions (phone, session_data, created_at, last_used)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(phone) DO UPDATE SET
                    session_data = excluded.session_data,
                    last_used = excluded.last_used
                "#,
                params![
                    session.phone,
                    session.session_data,
                    session.created_at.to_rfc3339(),
                    session.last_used.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to save session: {}", e)))?
    }

    async fn load_session(&self, phone: &str) -> Result<Option<SessionInfo>> {
        let conn = self.conn.clone();
        let phone = phone.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<SessionInfo>> {
            let conn = conn.blocking_lock();

            let result = conn
                .query_row(
                    "SELECT phone, session_data, created_at, last_used FROM sessions WHERE phone = ?1",
                    params![phone],
                    |row| {
                        let phone: String = row.get(0)?;
                        let session_data: String = row.get(1)?;
                        let created_at_str: String = row.get(2)?;
                        let last_used_str: String = row.get(3)?;
                        Ok(SessionInfo {
                            phone,
                            session_data,
                            created_at: parse_timestamp(&created_at_str),
                            last_used: parse_timestamp(&last_used_str),
                        })
                    },
                )
                .optional()?;

            Ok(result)
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Failed to load session: {}", e)))?
    }

    async fn health_check(&self) -> Result<()> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            let _: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Health check failed: {}", e)))?
    }

    async fn compact(&self) -> Result<()> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            conn.execute("VACUUM", [])?;
            Ok(())
        })
        .await
        .map_err(|e| ManagerError::Database(format!("Compact failed: {}", e)))?
    }
}

const JOB_SELECT: &str = r#"
SELECT
    id, channel, state, error_message, priority,
    kinds_json, max_files, skip_duplicates,
    total_files, completed_files, failed_files, skipped_files,
    total_bytes, downloaded_bytes,
    cursor, scan_complete, save_dir,
    created_at, updated_at, completed_at
FROM jobs
"#;

const TRANSFER_SELECT: &str = r#"
SELECT
    id, job_id,
    message_id, file_uid, name, declared_size, mime, content_hash,
    target_path, expected_size, bytes_transferred, fingerprint,
    state, error_message, attempts,
    created_at, updated_at
FROM transfers
"#;

/// Convert a database row to a JobSnapshot
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobSnapshot> {
    let id_str: String = row.get(0)?;
    let channel: String = row.get(1)?;
    let state_str: String = row.get(2)?;
    let error_msg: Option<String> = row.get(3)?;
    let priority_str: String = row.get(4)?;
    let kinds_json: String = row.get(5)?;
    let max_files: Option<i64> = row.get(6)?;
    let skip_duplicates: bool = row.get(7)?;
    let total_files: i64 = row.get(8)?;
    let completed_files: i64 = row.get(9)?;
    let failed_files: i64 = row.get(10)?;
    let skipped_files: i64 = row.get(11)?;
    let total_bytes: i64 = row.get(12)?;
    let downloaded_bytes: i64 = row.get(13)?;
    let cursor: Option<i64> = row.get(14)?;
    let scan_complete: bool = row.get(15)?;
    let save_dir: String = row.get(16)?;
    let created_at_str: String = row.get(17)?;
    let updated_at_str: String = row.get(18)?;
    let completed_at_str: Option<String> = row.get(19)?;

    let uuid = uuid::Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    // CRASH RECOVERY: unknown state strings (database corruption or schema
    // drift) default to Paused, a safe state that holds the job for an
    // explicit user decision instead of silently re-running it.
    let state = match state_str.as_str() {
        "pending" => JobState::Pending,
        "active" => JobState::Active,
        "paused" => JobState::Paused,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed {
            message: error_msg.unwrap_or_default(),
        },
        "cancelled" => JobState::Cancelled,
        _ => {
            tracing::warn!(
                "Unknown job state '{}' for job {}, defaulting to Paused",
                state_str,
                id_str
            );
            JobState::Paused
        }
    };

    let priority = priority_str.parse().unwrap_or_default();

    let kinds = serde_json::from_str(&kinds_json).unwrap_or_default();

    Ok(JobSnapshot {
        id: JobId::from_uuid(uuid),
        channel,
        state,
        priority,
        filter: crate::types::JobFilter {
            kinds,
            max_files: max_files.map(|n| n as usize),
        },
        skip_duplicates,
        counters: JobCounters {
            total_files: total_files as u64,
            completed_files: completed_files as u64,
            failed_files: failed_files as u64,
            skipped_files: skipped_files as u64,
            total_bytes: total_bytes as u64,
            downloaded_bytes: downloaded_bytes as u64,
        },
        cursor,
        scan_complete,
        save_dir: PathBuf::from(save_dir),
        created_at: parse_timestamp(&created_at_str),
        updated_at: parse_timestamp(&updated_at_str),
        completed_at: completed_at_str.as_deref().and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
    })
}

/// Convert a database row to a FileTransfer
fn row_to_transfer(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileTransfer> {
    let id_str: String = row.get(0)?;
    let job_str: String = row.get(1)?;
    let message_id: i64 = row.get(2)?;
    let file_uid: String = row.get(3)?;
    let name: String = row.get(4)?;
    let declared_size: Option<i64> = row.get(5)?;
    let mime: Option<String> = row.get(6)?;
    let content_hash: Option<String> = row.get(7)?;
    let target_path: String = row.get(8)?;
    let expected_size: Option<i64> = row.get(9)?;
    let bytes_transferred: i64 = row.get(10)?;
    let fingerprint: Option<String> = row.get(11)?;
    let state_str: String = row.get(12)?;
    let error_msg: Option<String> = row.get(13)?;
    let attempts: i64 = row.get(14)?;
    let created_at_str: String = row.get(15)?;
    let updated_at_str: String = row.get(16)?;

    let id_uuid = uuid::Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let job_uuid = uuid::Uuid::parse_str(&job_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;

    // CRASH RECOVERY SEMANTICS:
    //
    // - "downloading" -> Queued: a transfer marked as downloading means the
    //   process died mid-transfer. `bytes_transferred` preserves how far it
    //   got; the ledger holds the committed resume offset. Resetting to
    //   Queued re-enqueues the transfer so it continues from that offset.
    //
    // - Unknown states -> Queued: corruption or schema drift should lead to
    //   a re-download, never to a transfer being silently skipped.
    let state = match state_str.as_str() {
        "queued" => TransferState::Queued,
        "downloading" => TransferState::Queued,
        "paused" => TransferState::Paused,
        "done" => TransferState::Done,
        "duplicate_skipped" => TransferState::DuplicateSkipped,
        "failed" => TransferState::Failed {
            message: error_msg.unwrap_or_default(),
        },
        _ => {
            tracing::warn!(
                "Unknown transfer state '{}' for transfer {}, defaulting to Queued",
                state_str,
                id_str
            );
            TransferState::Queued
        }
    };

    Ok(FileTransfer {
        id: TransferId::from_uuid(id_uuid),
        job_id: JobId::from_uuid(job_uuid),
        source: crate::client::FileRef {
            message_id,
            file_uid,
            name,
            size: declared_size.map(|s| s as u64),
            mime,
            content_hash,
        },
        target_path: PathBuf::from(target_path),
        expected_size: expected_size.map(|s| s as u64),
        bytes_transferred: bytes_transferred as u64,
        fingerprint,
        state,
        attempts: attempts as u32,
        created_at: parse_timestamp(&created_at_str),
        updated_at: parse_timestamp(&updated_at_str),
    })
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FileRef;
    use crate::types::{FileKind, JobFilter, JobPriority};

    fn create_test_job() -> JobSnapshot {
        JobSnapshot {
            id: JobId::new(),
            channel: "ebooks_channel".to_string(),
            state: JobState::Active,
            priority: JobPriority::Normal,
            filter: JobFilter {
                kinds: vec![FileKind::Pdf, FileKind::Epub],
                max_files: Some(10),
            },
            skip_duplicates: true,
            counters: JobCounters {
                total_files: 5,
                completed_files: 2,
                failed_files: 0,
                skipped_files: 1,
                total_bytes: 5000,
                downloaded_bytes: 2000,
            },
            cursor: Some(120),
            scan_complete: false,
            save_dir: PathBuf::from("/tmp/downloads"),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    fn create_test_transfer(job: JobId) -> FileTransfer {
        FileTransfer {
            id: TransferId::new(),
            job_id: job,
            source: FileRef {
                message_id: 42,
                file_uid: "file-42".to_string(),
                name: "book.pdf".to_string(),
                size: Some(1000),
                mime: Some("application/pdf".to_string()),
                content_hash: None,
            },
            target_path: PathBuf::from("/tmp/downloads/j/book.pdf"),
            expected_size: Some(1000),
            bytes_transferred: 400,
            fingerprint: None,
            state: TransferState::Downloading,
            attempts: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sqlite_save_load_job() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let job = create_test_job();
        let id = job.id;

        storage.save_job(&job).await.unwrap();

        let loaded = storage.load_job(id).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert_eq!(loaded.channel, "ebooks_channel");
        assert_eq!(loaded.counters.completed_files, 2);
        assert_eq!(loaded.counters.skipped_files, 1);
        assert_eq!(loaded.cursor, Some(120));
        assert_eq!(loaded.filter.kinds, vec![FileKind::Pdf, FileKind::Epub]);
        assert_eq!(loaded.filter.max_files, Some(10));
        assert!(loaded.skip_duplicates);
    }

    #[tokio::test]
    async fn test_sqlite_job_update() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut job = create_test_job();
        let id = job.id;

        storage.save_job(&job).await.unwrap();

        job.state = JobState::Completed;
        job.counters.completed_files = 4;
        job.scan_complete = true;
        job.completed_at = Some(Utc::now());
        storage.save_job(&job).await.unwrap();

        let loaded = storage.load_job(id).await.unwrap().unwrap();
        assert!(matches!(loaded.state, JobState::Completed));
        assert_eq!(loaded.counters.completed_files, 4);
        assert!(loaded.scan_complete);
        assert!(loaded.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_sqlite_failed_state_round_trip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let mut job = create_test_job();
        job.state = JobState::Failed {
            message: "channel unreachable".to_string(),
        };
        storage.save_job(&job).await.unwrap();

        let loaded = storage.load_job(job.id).await.unwrap().unwrap();
        match loaded.state {
            JobState::Failed { message } => assert_eq!(message, "channel unreachable"),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sqlite_transfers_and_cascade() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let job = create_test_job();
        storage.save_job(&job).await.unwrap();

        let transfer = create_test_transfer(job.id);
        storage.save_transfer(&transfer).await.unwrap();

        let loaded = storage.load_transfers(job.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].source.file_uid, "file-42");
        assert_eq!(loaded[0].bytes_transferred, 400);

        // Deleting the job cascades to its transfers
        storage.delete_job(job.id).await.unwrap();
        assert!(storage.load_transfers(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_downloading_rows_load_as_queued() {
        // A transfer persisted as Downloading means the process died
        // mid-transfer; it must come back as Queued for re-enqueueing.
        let storage = SqliteStorage::in_memory().await.unwrap();
        let job = create_test_job();
        storage.save_job(&job).await.unwrap();

        let transfer = create_test_transfer(job.id);
        assert!(matches!(transfer.state, TransferState::Downloading));
        storage.save_transfer(&transfer).await.unwrap();

        let loaded = storage.load_transfers(job.id).await.unwrap();
        assert!(matches!(loaded[0].state, TransferState::Queued));
        assert_eq!(loaded[0].bytes_transferred, 400);
    }

    #[tokio::test]
    async fn test_sqlite_ledger_round_trip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let job = JobId::new();

        let entry = LedgerEntry {
            job_id: job,
            source_uid: "file-42".to_string(),
            offset: 4096,
            updated_at: Utc::now(),
        };
        storage.upsert_ledger(&entry).await.unwrap();

        let all = storage.load_ledger().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].offset, 4096);

        // Upsert overwrites
        let entry2 = LedgerEntry {
            offset: 8192,
            ..entry.clone()
        };
        storage.upsert_ledger(&entry2).await.unwrap();
        let all = storage.load_ledger().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].offset, 8192);

        storage.delete_ledger(job, "file-42").await.unwrap();
        assert!(storage.load_ledger().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_fingerprint_first_writer_wins() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let record = FingerprintRecord {
            fingerprint: Fingerprint::from_hex("ab".repeat(32)),
            source_uid: "file-1".to_string(),
            path: PathBuf::from("/tmp/a.pdf"),
            job_id: JobId::new(),
            recorded_at: Utc::now(),
        };
        storage.insert_fingerprint(&record).await.unwrap();

        let mut second = record.clone();
        second.path = PathBuf::from("/tmp/elsewhere.pdf");
        storage.insert_fingerprint(&second).await.unwrap();

        let all = storage.load_fingerprints().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].path, PathBuf::from("/tmp/a.pdf"));

        storage.purge_fingerprints().await.unwrap();
        assert!(storage.load_fingerprints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_session_round_trip() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let session = SessionInfo {
            phone: "+15551234".to_string(),
            session_data: "opaque-blob".to_string(),
            created_at: Utc::now(),
            last_used: Utc::now(),
        };
        storage.save_session(&session).await.unwrap();

        let loaded = storage.load_session("+15551234").await.unwrap().unwrap();
        assert_eq!(loaded.session_data, "opaque-blob");

        // Upsert replaces the blob
        let refreshed = SessionInfo {
            session_data: "new-blob".to_string(),
            ..session
        };
        storage.save_session(&refreshed).await.unwrap();
        let loaded = storage.load_session("+15551234").await.unwrap().unwrap();
        assert_eq!(loaded.session_data, "new-blob");
    }

    #[tokio::test]
    async fn test_sqlite_health_check() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_schema_versioning() {
        let storage = SqliteStorage::in_memory().await.unwrap();

        let conn = storage.conn.lock().await;
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        // Running migrate again is idempotent
        migrate(&conn).unwrap();
        let version2: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version2, CURRENT_SCHEMA_VERSION);
    }
}
