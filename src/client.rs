//! Messaging-platform client surface
//!
//! The manager never speaks the platform's wire protocol. Everything it
//! needs (authentication, channel paging, ranged file fetches) comes
//! through the [`ChannelClient`] trait, implemented by callers over their
//! platform SDK.

use crate::error::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Chunked byte stream returned by [`ChannelClient::fetch_file`]
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Reference to one downloadable file in a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Message the file is attached to (scan cursor positions are message ids)
    pub message_id: i64,
    /// Platform-stable file identifier, unique within the platform
    pub file_uid: String,
    /// Declared filename
    pub name: String,
    /// Declared size in bytes, if the platform knows it
    pub size: Option<u64>,
    /// Declared MIME type
    pub mime: Option<String>,
    /// Content hash supplied by the platform, if any (hex SHA-256)
    pub content_hash: Option<String>,
}

/// One page of a channel scan
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    /// Document-bearing messages in this page, oldest first
    pub files: Vec<FileRef>,
    /// Cursor to request the next page from; `None` means the channel is
    /// exhausted
    pub next_cursor: Option<i64>,
}

/// Basic information about a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Platform channel id
    pub id: i64,
    /// Display title
    pub title: String,
    /// Public handle, if the channel has one
    pub username: Option<String>,
}

/// Outcome of starting authentication
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// A stored session is already valid
    Authorized,
    /// The platform sent a verification code; confirm it to proceed
    CodeRequired(AuthChallenge),
}

/// Pending authentication challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthChallenge {
    /// Phone number the code was sent to
    pub phone: String,
    /// Opaque platform token tying the code to this request
    pub token: String,
}

/// An authenticated platform session, persisted across restarts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Phone number the session belongs to
    pub phone: String,
    /// Opaque serialized session state
    pub session_data: String,
    /// When the session was first established
    pub created_at: DateTime<Utc>,
    /// Last time the session was used
    pub last_used: DateTime<Utc>,
}

/// Opaque fetch-by-reference capability over the messaging platform.
///
/// `fetch_messages` must be finite and restartable from any previously
/// returned cursor. `fetch_file` must honor the byte offset when the
/// platform supports ranged fetches; an implementation that cannot resume
/// should error on non-zero offsets so the worker restarts from zero.
#[async_trait::async_trait]
pub trait ChannelClient: Send + Sync {
    /// Begin authentication for a phone number
    async fn authenticate(&self, phone: &str) -> Result<AuthOutcome>;

    /// Confirm a verification code, yielding a persistent session
    async fn confirm(&self, challenge: &AuthChallenge, code: &str) -> Result<SessionInfo>;

    /// Look up a channel by its opaque reference
    async fn channel_info(&self, channel: &str) -> Result<ChannelInfo>;

    /// Fetch the next page of document-bearing messages after `cursor`
    async fn fetch_messages(
        &self,
        channel: &str,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<MessagePage>;

    /// Open a byte stream for a file, starting at `offset`
    async fn fetch_file(&self, file: &FileRef, offset: u64) -> Result<ByteStream>;
}
