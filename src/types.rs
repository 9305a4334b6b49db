//! Core types for chanfetch
//!
//! Identifiers, state enums, and the job/transfer data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short 16-char hex form used in paths and logs.
    ///
    /// This is a **lossy** projection: only the first 8 bytes of the 16-byte
    /// UUID are encoded. Use [`matches_short`](Self::matches_short) to check
    /// whether a given short form corresponds to this `JobId` without
    /// assuming a lossless round-trip.
    pub fn short(&self) -> String {
        hex_encode(&self.0.as_bytes()[0..8])
    }

    /// Check whether this `JobId`'s first 8 bytes match the given short form.
    pub fn matches_short(&self, short: &str) -> bool {
        self.short() == short
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Unique identifier for a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Create a new random transfer ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex_encode(&self.0.as_bytes()[0..8]))
    }
}

/// Current state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    /// Created, scheduler has not accepted a task yet
    Pending,
    /// Scanning and/or transferring
    Active,
    /// Paused by user (or automatically after a storage error)
    Paused,
    /// Scan finished and every transfer settled
    Completed,
    /// The channel scan itself could not proceed
    Failed { message: String },
    /// Cancelled by user
    Cancelled,
}

impl JobState {
    /// Check if the job is still running or runnable
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Active)
    }

    /// Check if the job has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Cancelled)
    }

    /// Stable string name for persistence and display
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current state of a single file transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferState {
    /// Waiting for a worker slot
    Queued,
    /// Bytes are moving
    Downloading,
    /// Halted at a flush checkpoint; ledger entry and partial file kept
    Paused,
    /// All bytes on disk, fingerprint recorded
    Done,
    /// Suppressed by the fingerprint store, no bytes transferred (or a
    /// post-download content match)
    DuplicateSkipped,
    /// Permanently failed (retries exhausted or non-retryable error)
    Failed { message: String },
}

impl TransferState {
    /// Check if the transfer has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::DuplicateSkipped | Self::Failed { .. }
        )
    }

    /// Stable string name for persistence and display
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Done => "done",
            Self::DuplicateSkipped => "duplicate_skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority levels for jobs
///
/// Default ordering is FIFO by creation time within a level; pinning a job
/// raises it above everything else.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(i8)]
pub enum JobPriority {
    /// Low priority - scheduled last
    Low = -1,
    /// Normal priority - default
    #[default]
    Normal = 0,
    /// High priority - scheduled before normal
    High = 1,
    /// Pinned - scheduled first
    Pinned = 2,
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Pinned => write!(f, "pinned"),
        }
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "-1" => Ok(Self::Low),
            "normal" | "0" => Ok(Self::Normal),
            "high" | "1" => Ok(Self::High),
            "pinned" | "2" => Ok(Self::Pinned),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// File-type tags accepted by a job filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Epub,
    Mobi,
    Azw3,
    Djvu,
    Fb2,
    Txt,
    Doc,
    Docx,
}

impl FileKind {
    /// All supported kinds
    pub const ALL: [FileKind; 9] = [
        Self::Pdf,
        Self::Epub,
        Self::Mobi,
        Self::Azw3,
        Self::Djvu,
        Self::Fb2,
        Self::Txt,
        Self::Doc,
        Self::Docx,
    ];

    /// Canonical file extension (without the dot)
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Epub => "epub",
            Self::Mobi => "mobi",
            Self::Azw3 => "azw3",
            Self::Djvu => "djvu",
            Self::Fb2 => "fb2",
            Self::Txt => "txt",
            Self::Doc => "doc",
            Self::Docx => "docx",
        }
    }

    /// Match a filename extension (case-insensitive, with or without dot)
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_lowercase();
        Self::ALL.iter().copied().find(|k| k.extension() == ext)
    }

    /// Fast-path match on a MIME type where the platform provides one
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "application/pdf" => Some(Self::Pdf),
            "application/epub+zip" => Some(Self::Epub),
            "application/x-mobipocket-ebook" => Some(Self::Mobi),
            "image/vnd.djvu" | "image/x-djvu" => Some(Self::Djvu),
            "text/plain" => Some(Self::Txt),
            "application/msword" => Some(Self::Doc),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            _ => None,
        }
    }

    /// Classify a file reference by extension, falling back to MIME
    pub fn of_file(name: &str, mime: Option<&str>) -> Option<Self> {
        std::path::Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
            .or_else(|| mime.and_then(Self::from_mime))
    }
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.extension())
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("Unknown file kind: {}", s))
    }
}

/// Which files of a channel a job accepts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Accepted kinds; empty means every supported kind
    #[serde(default)]
    pub kinds: Vec<FileKind>,
    /// Stop scanning after this many accepted files
    pub max_files: Option<usize>,
}

impl JobFilter {
    /// Does a file with this name/MIME pass the kind filter?
    pub fn accepts(&self, name: &str, mime: Option<&str>) -> bool {
        match FileKind::of_file(name, mime) {
            Some(kind) => self.kinds.is_empty() || self.kinds.contains(&kind),
            None => false,
        }
    }
}

/// Request for a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Channel reference (opaque to the manager)
    pub channel: String,
    /// File filter
    #[serde(default)]
    pub filter: JobFilter,
    /// Suppress files whose content is already downloaded
    #[serde(default = "default_true")]
    pub skip_duplicates: bool,
    /// Scheduling priority
    #[serde(default)]
    pub priority: JobPriority,
    /// Override the configured download directory for this job
    pub save_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl JobRequest {
    /// Request everything from a channel with default options
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            filter: JobFilter::default(),
            skip_duplicates: true,
            priority: JobPriority::Normal,
            save_dir: None,
        }
    }
}

/// Aggregate progress counters for a job
///
/// `total_files` is a monotonically non-decreasing estimate while the scan
/// runs; completion logic consults the job's `scan_complete` flag, never this
/// counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    /// Files discovered so far (grows while the scan runs)
    pub total_files: u64,
    /// Transfers that reached `Done`
    pub completed_files: u64,
    /// Transfers that permanently failed
    pub failed_files: u64,
    /// Transfers suppressed as duplicates
    pub skipped_files: u64,
    /// Sum of declared sizes of discovered files
    pub total_bytes: u64,
    /// Bytes landed for completed transfers
    pub downloaded_bytes: u64,
}

impl JobCounters {
    /// Number of transfers that have settled one way or another
    pub fn settled(&self) -> u64 {
        self.completed_files + self.failed_files + self.skipped_files
    }
}

/// Full snapshot of a job, as exposed to callers and persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Unique identifier
    pub id: JobId,
    /// Channel reference
    pub channel: String,
    /// Current state
    pub state: JobState,
    /// Scheduling priority
    #[serde(default)]
    pub priority: JobPriority,
    /// File filter
    pub filter: JobFilter,
    /// Duplicate suppression flag
    pub skip_duplicates: bool,
    /// Progress counters
    pub counters: JobCounters,
    /// Last channel position the scan processed
    pub cursor: Option<i64>,
    /// The scan reached the end of the channel (or the max_files cap)
    pub scan_complete: bool,
    /// Directory files land in
    pub save_dir: PathBuf,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// Last persisted change
    pub updated_at: DateTime<Utc>,
    /// When the job completed (if completed)
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Short hex form of the id, used for the per-job directory name
    pub fn short_id(&self) -> String {
        self.id.short()
    }
}

/// One file's download within a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Unique identifier
    pub id: TransferId,
    /// Owning job
    pub job_id: JobId,
    /// Platform source reference
    pub source: crate::client::FileRef,
    /// Deterministic filesystem destination
    pub target_path: PathBuf,
    /// Declared size, if the platform knows it
    pub expected_size: Option<u64>,
    /// Bytes committed so far
    pub bytes_transferred: u64,
    /// Hex SHA-256 of the content, filled at completion
    pub fingerprint: Option<String>,
    /// Current state
    pub state: TransferState,
    /// Attempts consumed by retries
    pub attempts: u32,
    /// When the transfer record was created
    pub created_at: DateTime<Utc>,
    /// Last persisted change
    pub updated_at: DateTime<Utc>,
}

impl FileTransfer {
    /// Path of the in-progress partial file
    pub fn part_path(&self) -> PathBuf {
        let mut os = self.target_path.clone().into_os_string();
        os.push(".part");
        PathBuf::from(os)
    }
}

// Helper for hex encoding (used by the id types)
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_16_char_hex() {
        let id = JobId::new();
        let short = id.short();
        assert_eq!(short.len(), 16);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(id.matches_short(&short));
        assert!(!JobId::new().matches_short(&short));
    }

    #[test]
    fn job_state_terminality() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(JobState::Failed {
            message: "x".into()
        }
        .is_terminal());
        assert!(!JobState::Paused.is_terminal());
        assert!(JobState::Active.is_active());
        assert!(JobState::Pending.is_active());
        assert!(!JobState::Paused.is_active());
    }

    #[test]
    fn transfer_state_terminality() {
        assert!(TransferState::Done.is_terminal());
        assert!(TransferState::DuplicateSkipped.is_terminal());
        assert!(TransferState::Failed {
            message: "x".into()
        }
        .is_terminal());
        assert!(!TransferState::Paused.is_terminal());
        assert!(!TransferState::Queued.is_terminal());
    }

    #[test]
    fn priority_ordering() {
        assert!(JobPriority::Pinned > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn priority_from_str() {
        assert_eq!("low".parse::<JobPriority>().unwrap(), JobPriority::Low);
        assert_eq!(
            "pinned".parse::<JobPriority>().unwrap(),
            JobPriority::Pinned
        );
        assert!("urgent".parse::<JobPriority>().is_err());
    }

    #[test]
    fn file_kind_from_extension() {
        assert_eq!(FileKind::from_extension("pdf"), Some(FileKind::Pdf));
        assert_eq!(FileKind::from_extension(".EPUB"), Some(FileKind::Epub));
        assert_eq!(FileKind::from_extension("exe"), None);
    }

    #[test]
    fn file_kind_of_file_prefers_extension() {
        assert_eq!(
            FileKind::of_file("book.pdf", Some("application/epub+zip")),
            Some(FileKind::Pdf)
        );
        assert_eq!(
            FileKind::of_file("noext", Some("application/pdf")),
            Some(FileKind::Pdf)
        );
        assert_eq!(FileKind::of_file("noext", None), None);
    }

    #[test]
    fn filter_accepts() {
        let all = JobFilter::default();
        assert!(all.accepts("a.pdf", None));
        assert!(all.accepts("a.epub", None));
        assert!(!all.accepts("a.zip", None));

        let pdf_only = JobFilter {
            kinds: vec![FileKind::Pdf],
            max_files: None,
        };
        assert!(pdf_only.accepts("a.pdf", None));
        assert!(!pdf_only.accepts("a.epub", None));
    }

    #[test]
    fn counters_settled() {
        let c = JobCounters {
            total_files: 5,
            completed_files: 2,
            failed_files: 1,
            skipped_files: 1,
            ..Default::default()
        };
        assert_eq!(c.settled(), 4);
        assert!(c.settled() <= c.total_files);
    }

    #[test]
    fn part_path_appends_suffix() {
        let t = FileTransfer {
            id: TransferId::new(),
            job_id: JobId::new(),
            source: crate::client::FileRef {
                message_id: 1,
                file_uid: "u".into(),
                name: "book.pdf".into(),
                size: None,
                mime: None,
                content_hash: None,
            },
            target_path: PathBuf::from("/tmp/j/book.pdf"),
            expected_size: None,
            bytes_transferred: 0,
            fingerprint: None,
            state: TransferState::Queued,
            attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(t.part_path(), PathBuf::from("/tmp/j/book.pdf.part"));
    }
}
