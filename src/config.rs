//! Manager configuration
//!
//! This module contains all configuration options for the download manager.

use crate::error::{ManagerError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the download manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory to save downloads (each job gets a subdirectory)
    pub download_dir: PathBuf,

    /// Maximum concurrent file transfers across all jobs
    pub max_concurrent_transfers: usize,

    /// Messages requested per scan page
    pub scan_page_size: usize,

    /// Bytes between ledger flushes / progress events during a transfer
    pub flush_interval_bytes: u64,

    /// Retry policy for transient transfer failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Database path for session persistence; `None` uses the platform
    /// data directory
    pub database_path: Option<PathBuf>,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

/// Retry policy for transient transfer failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per transfer before it is marked failed
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Exponential backoff delay for the given attempt (1-based), capped
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_transfers: 3,
            scan_page_size: 100,
            flush_interval_bytes: 1024 * 1024, // 1 MiB
            retry: RetryConfig::default(),
            database_path: None,
            event_capacity: 1024,
        }
    }
}

impl ManagerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set maximum concurrent transfers
    pub fn max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max;
        self
    }

    /// Set the scan page size
    pub fn scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    /// Set the ledger flush interval in bytes
    pub fn flush_interval_bytes(mut self, bytes: u64) -> Self {
        self.flush_interval_bytes = bytes;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the database path for persistence
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.download_dir.exists() {
            return Err(ManagerError::invalid_input(
                "download_dir",
                format!("Directory does not exist: {:?}", self.download_dir),
            ));
        }

        if !self.download_dir.is_dir() {
            return Err(ManagerError::invalid_input(
                "download_dir",
                format!("Path is not a directory: {:?}", self.download_dir),
            ));
        }

        if self.max_concurrent_transfers == 0 {
            return Err(ManagerError::invalid_input(
                "max_concurrent_transfers",
                "Must be at least 1",
            ));
        }

        if self.scan_page_size == 0 {
            return Err(ManagerError::invalid_input(
                "scan_page_size",
                "Must be at least 1",
            ));
        }

        if self.flush_interval_bytes == 0 {
            return Err(ManagerError::invalid_input(
                "flush_interval_bytes",
                "Must be at least 1",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ManagerError::invalid_input(
                "retry.max_attempts",
                "Must be at least 1",
            ));
        }

        Ok(())
    }

    /// Get the database path, using the platform default if not set
    pub fn get_database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chanfetch")
                .join("chanfetch.db")
        })
    }
}
