use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::models::{StorageHandle, UploadId, UploadSession, UploadStatus};
use crate::{Error, Result};

const COLUMNS: &str = "upload_id, upload_url, expected_bytes, bytes_received, filename, \
                       mime_type, storage_handle, pin_scope, status, created_at, last_updated_at";

/// Durable store for upload sessions.
///
/// The only component with persistent state; everything else recovers
/// from configuration and from this table.
#[derive(Clone)]
pub struct UploadSessionRepository {
    pool: SqlitePool,
}

impl UploadSessionRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent schema setup. A failure here means the upload
    /// endpoint must not start.
    pub async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS upload_sessions (
                 upload_id TEXT PRIMARY KEY,
                 upload_url TEXT NOT NULL,
                 expected_bytes INTEGER NOT NULL,
                 bytes_received INTEGER NOT NULL DEFAULT 0,
                 filename TEXT NOT NULL,
                 mime_type TEXT NOT NULL,
                 storage_handle TEXT NOT NULL,
                 pin_scope TEXT,
                 status TEXT NOT NULL,
                 created_at TEXT NOT NULL,
                 last_updated_at TEXT NOT NULL
             )",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_upload_sessions_storage_handle
             ON upload_sessions (storage_handle)",
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Insert a new session; unique-violation on the storage handle
    /// (or id) surfaces as `AlreadyExists`.
    pub async fn create(&self, session: &UploadSession) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO upload_sessions ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ))
        .bind(session.id.to_string())
        .bind(&session.upload_url)
        .bind(session.expected_bytes)
        .bind(session.bytes_received)
        .bind(&session.filename)
        .bind(&session.mime_type)
        .bind(session.storage_handle.as_str())
        .bind(session.pin_scope.as_deref())
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.last_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn lookup(&self, id: &UploadId) -> Result<Option<UploadSession>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM upload_sessions WHERE upload_id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_session).transpose()
    }

    pub async fn lookup_by_storage_handle(
        &self,
        handle: &StorageHandle,
    ) -> Result<Option<UploadSession>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM upload_sessions WHERE storage_handle = ?1"
        ))
        .bind(handle.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_session).transpose()
    }

    /// Atomically bump bytes-received and last-updated-at. The update
    /// refuses to move backwards and only applies to in-progress rows.
    pub async fn update_progress(&self, id: &UploadId, bytes: i64) -> Result<UploadSession> {
        let row = sqlx::query(&format!(
            "UPDATE upload_sessions
             SET bytes_received = ?2, last_updated_at = ?3
             WHERE upload_id = ?1 AND status = 'in_progress' AND bytes_received <= ?2
             RETURNING {COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(bytes)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => row_to_session(row),
            None => Err(Error::Internal(format!(
                "Progress update rejected for upload {id}"
            ))),
        }
    }

    /// Move a session into a terminal state.
    pub async fn terminate(&self, id: &UploadId, status: UploadStatus) -> Result<()> {
        sqlx::query(
            "UPDATE upload_sessions SET status = ?2, last_updated_at = ?3 WHERE upload_id = ?1",
        )
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// In-progress rows idle since before `cutoff`.
    pub async fn list_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM upload_sessions
             WHERE status = 'in_progress' AND last_updated_at < ?1"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_session).collect()
    }

    /// Rows in any terminal state.
    pub async fn list_finished(&self) -> Result<Vec<UploadSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM upload_sessions WHERE status != 'in_progress'"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_session).collect()
    }

    pub async fn delete(&self, id: &UploadId) -> Result<()> {
        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every storage handle with a row, for the orphan sweep.
    pub async fn all_storage_handles(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT storage_handle FROM upload_sessions")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("storage_handle").map_err(Error::from))
            .collect()
    }
}

impl std::fmt::Debug for UploadSessionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSessionRepository").finish()
    }
}

fn row_to_session(row: SqliteRow) -> Result<UploadSession> {
    let id: String = row.try_get("upload_id")?;
    let status: String = row.try_get("status")?;
    Ok(UploadSession {
        id: UploadId::parse(&id)
            .map_err(|e| Error::Internal(format!("Corrupt upload_id {id}: {e}")))?,
        upload_url: row.try_get("upload_url")?,
        expected_bytes: row.try_get("expected_bytes")?,
        bytes_received: row.try_get("bytes_received")?,
        filename: row.try_get("filename")?,
        mime_type: row.try_get("mime_type")?,
        storage_handle: StorageHandle::from_string(row.try_get("storage_handle")?),
        pin_scope: row.try_get("pin_scope")?,
        status: UploadStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_repo() -> UploadSessionRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        UploadSessionRepository::migrate(&pool).await.unwrap();
        UploadSessionRepository::new(pool)
    }

    fn session(handle: &str) -> UploadSession {
        UploadSession::new(
            1_024,
            "movie.mp4".to_string(),
            "video/mp4".to_string(),
            StorageHandle::from_string(handle.to_string()),
            None,
        )
    }

    #[tokio::test]
    async fn create_and_lookup_round_trip() {
        let repo = memory_repo().await;
        let created = session("h1");
        repo.create(&created).await.unwrap();

        let found = repo.lookup(&created.id).await.unwrap().unwrap();
        assert_eq!(found.expected_bytes, 1_024);
        assert_eq!(found.bytes_received, 0);
        assert_eq!(found.status, UploadStatus::InProgress);
        assert_eq!(found.storage_handle.as_str(), "h1");

        let by_handle = repo
            .lookup_by_storage_handle(&created.storage_handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_handle.id, created.id);

        assert!(repo.lookup(&UploadId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn storage_handle_is_unique() {
        let repo = memory_repo().await;
        repo.create(&session("h1")).await.unwrap();

        let duplicate = session("h1");
        match repo.create(&duplicate).await {
            Err(Error::AlreadyExists(_)) => {}
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let repo = memory_repo().await;
        let created = session("h1");
        repo.create(&created).await.unwrap();

        let updated = repo.update_progress(&created.id, 512).await.unwrap();
        assert_eq!(updated.bytes_received, 512);
        assert!(updated.last_updated_at >= created.last_updated_at);

        // Moving backwards is refused.
        assert!(repo.update_progress(&created.id, 100).await.is_err());
        let still = repo.lookup(&created.id).await.unwrap().unwrap();
        assert_eq!(still.bytes_received, 512);
    }

    #[tokio::test]
    async fn terminated_sessions_reject_progress() {
        let repo = memory_repo().await;
        let created = session("h1");
        repo.create(&created).await.unwrap();
        repo.terminate(&created.id, UploadStatus::Cancelled)
            .await
            .unwrap();

        assert!(repo.update_progress(&created.id, 10).await.is_err());
        let found = repo.lookup(&created.id).await.unwrap().unwrap();
        assert_eq!(found.status, UploadStatus::Cancelled);
    }

    #[tokio::test]
    async fn expiry_scan_finds_only_stale_in_progress_rows() {
        let repo = memory_repo().await;
        let stale = session("h-stale");
        let fresh = session("h-fresh");
        let done = session("h-done");
        repo.create(&stale).await.unwrap();
        repo.create(&fresh).await.unwrap();
        repo.create(&done).await.unwrap();
        repo.terminate(&done.id, UploadStatus::Completed).await.unwrap();

        // A cutoff in the future catches the stale and fresh rows but
        // never the completed one; a cutoff in the past catches none.
        let future = Utc::now() + chrono::Duration::hours(1);
        let expired = repo.list_expired(future).await.unwrap();
        assert_eq!(expired.len(), 2);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(repo.list_expired(past).await.unwrap().is_empty());

        let finished = repo.list_finished().await.unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].id, done.id);
    }

    #[tokio::test]
    async fn delete_removes_row_and_handle() {
        let repo = memory_repo().await;
        let created = session("h1");
        repo.create(&created).await.unwrap();
        repo.delete(&created.id).await.unwrap();

        assert!(repo.lookup(&created.id).await.unwrap().is_none());
        assert!(repo.all_storage_handles().await.unwrap().is_empty());
    }
}
