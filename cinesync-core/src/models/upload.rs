use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::id::{StorageHandle, UploadId};
use crate::{Error, Result};

/// Lifecycle state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::Internal(format!("Unknown upload status: {other}"))),
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// The durable record of a single resumable upload.
///
/// `bytes_received` is monotonically non-decreasing and always equals
/// the size the media store last committed for the storage handle.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: UploadId,
    pub upload_url: String,
    pub expected_bytes: i64,
    pub bytes_received: i64,
    pub filename: String,
    pub mime_type: String,
    pub storage_handle: StorageHandle,
    pub pin_scope: Option<String>,
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl UploadSession {
    #[must_use]
    pub fn new(
        expected_bytes: i64,
        filename: String,
        mime_type: String,
        storage_handle: StorageHandle,
        pin_scope: Option<String>,
    ) -> Self {
        let id = UploadId::new();
        let now = Utc::now();
        Self {
            id,
            upload_url: format!("/tus/{id}"),
            expected_bytes,
            bytes_received: 0,
            filename,
            mime_type,
            storage_handle,
            pin_scope,
            status: UploadStatus::InProgress,
            created_at: now,
            last_updated_at: now,
        }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.bytes_received >= self.expected_bytes
    }

    /// When this session becomes eligible for expiry cleanup.
    #[must_use]
    pub fn expires_at(&self, expiry_hours: u64) -> DateTime<Utc> {
        self.last_updated_at + Duration::hours(expiry_hours as i64)
    }
}
