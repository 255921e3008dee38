//! Resumable upload service.
//!
//! Business logic behind the TUS endpoint: admission checks, streamed
//! PATCH writes with transactional offset commits, termination, and
//! the expiry/orphan cleanup pass. HTTP framing lives in the api
//! crate; everything here speaks models and errors.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::repository::UploadSessionRepository;
use crate::config::UploadConfig;
use crate::media_store::MediaStore;
use crate::models::{UploadId, UploadSession, UploadStatus};
use crate::{Error, Result};

/// PATCH bodies are committed to the store in chunks of at least this.
const FLUSH_THRESHOLD: usize = 256 * 1024;

/// Allowed extensions for uploaded files.
const ALLOWED_EXTENSIONS: [&str; 2] = ["mp4", "mkv"];

/// Result of one cleanup pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpireSummary {
    pub expired: usize,
    pub finished_removed: usize,
    pub orphans_removed: usize,
}

/// TUS upload service over the durable session store and the host
/// media store.
pub struct UploadService {
    repo: UploadSessionRepository,
    media: Arc<dyn MediaStore>,
    config: UploadConfig,
    /// Session-scoped upload PIN; None disables authentication.
    pin: RwLock<Option<String>>,
    /// Serializes PATCHes per upload-id.
    patch_locks: DashMap<UploadId, Arc<tokio::sync::Mutex<()>>>,
    /// Ids whose rows were cleaned or cancelled this process run;
    /// lets HEAD answer 410 instead of 404 after removal.
    swept: DashSet<UploadId>,
}

impl UploadService {
    #[must_use]
    pub fn new(
        repo: UploadSessionRepository,
        media: Arc<dyn MediaStore>,
        config: UploadConfig,
    ) -> Self {
        Self {
            repo,
            media,
            config,
            pin: RwLock::new(None),
            patch_locks: DashMap::new(),
            swept: DashSet::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Install or clear the session-scoped PIN.
    pub fn set_pin(&self, pin: Option<String>) {
        *self.pin.write() = pin;
    }

    /// Validate the PIN presented on a non-OPTIONS request.
    pub fn check_pin(&self, presented: Option<&str>) -> Result<()> {
        match self.pin.read().as_deref() {
            None => Ok(()),
            Some(expected) if presented == Some(expected) => Ok(()),
            Some(_) => Err(Error::Unauthorized("Missing or invalid upload PIN".to_string())),
        }
    }

    /// Advertised Tus-Max-Size: configured cap, or free bytes minus
    /// the reserve.
    pub async fn max_size(&self) -> u64 {
        if let Some(cap) = self.config.max_upload_bytes {
            return cap;
        }
        match self.media.free_bytes().await {
            Ok(free) => free.saturating_sub(self.config.reserve_bytes),
            Err(e) => {
                warn!("Media store free-bytes probe failed: {e}");
                0
            }
        }
    }

    /// Admit a new upload: validate, create the pending media entry,
    /// persist the session row.
    pub async fn create(
        &self,
        upload_length: i64,
        metadata: &HashMap<String, String>,
    ) -> Result<UploadSession> {
        if upload_length <= 0 {
            return Err(Error::InvalidInput("Upload-Length must be positive".to_string()));
        }
        let filename = metadata
            .get("filename")
            .ok_or_else(|| Error::InvalidInput("Metadata key filename is required".to_string()))?;
        let filetype = metadata
            .get("filetype")
            .ok_or_else(|| Error::InvalidInput("Metadata key filetype is required".to_string()))?;

        let extension = filename
            .rsplit('.')
            .next()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(Error::InvalidInput(format!(
                "Unsupported file extension .{extension}; expected mp4 or mkv"
            )));
        }

        if upload_length as u64 > self.max_size().await {
            return Err(Error::StorageExhausted(format!(
                "Upload of {upload_length} bytes exceeds the advertised maximum"
            )));
        }
        let free = self.media.free_bytes().await?;
        if free < upload_length as u64 + self.config.reserve_bytes {
            return Err(Error::StorageExhausted(format!(
                "Upload of {upload_length} bytes would leave less than the reserve free"
            )));
        }

        let handle = self.media.create_pending(filename, filetype).await?;
        let session = UploadSession::new(
            upload_length,
            filename.clone(),
            filetype.clone(),
            handle.clone(),
            self.pin.read().clone(),
        );
        if let Err(e) = self.repo.create(&session).await {
            // Roll the pending entry back; an upload is either fully
            // admitted or absent.
            if let Err(del) = self.media.delete(&handle).await {
                warn!("Rollback of pending entry {handle} failed: {del}");
            }
            return Err(e);
        }

        info!(
            upload_id = %session.id,
            filename = %session.filename,
            expected_bytes = session.expected_bytes,
            "Upload session created"
        );
        Ok(session)
    }

    /// Current state for HEAD: 404 unknown, 410 cancelled or cleaned.
    pub async fn head(&self, id: &UploadId) -> Result<UploadSession> {
        match self.repo.lookup(id).await? {
            Some(session) if session.status == UploadStatus::Cancelled => {
                Err(Error::Gone(format!("Upload {id} was cancelled")))
            }
            Some(session) if session.status == UploadStatus::Failed => {
                Err(Error::Gone(format!("Upload {id} failed and cannot resume")))
            }
            Some(session) => self.reconciled(session).await,
            None if self.swept.contains(id) => {
                Err(Error::Gone(format!("Upload {id} was cleaned up")))
            }
            None => Err(Error::NotFound(format!("Unknown upload {id}"))),
        }
    }

    /// Apply one PATCH. Returns the new committed offset.
    ///
    /// Body bytes stream to the storage handle's append sink through a
    /// 256 KiB buffer; every flush commits the offset to the session
    /// row, so a crash costs at most one chunk of progress. Bytes past
    /// the advertised length are truncated and reported as
    /// storage-exhausted. Storage write failures terminate the
    /// session; a full device surfaces as storage exhaustion too,
    /// anything else as a plain I/O error.
    pub async fn patch<S>(&self, id: &UploadId, offset: i64, mut body: S) -> Result<i64>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
    {
        let lock = self
            .patch_locks
            .entry(*id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        let session = match self.repo.lookup(id).await? {
            Some(session) => session,
            None if self.swept.contains(id) => {
                return Err(Error::Gone(format!("Upload {id} was cleaned up")))
            }
            None => return Err(Error::NotFound(format!("Unknown upload {id}"))),
        };
        if session.status.is_terminal() {
            return Err(Error::Gone(format!(
                "Upload {id} is {}",
                session.status.as_str()
            )));
        }
        let session = self.reconciled(session).await?;
        if offset != session.bytes_received {
            return Err(Error::OffsetConflict {
                expected: session.bytes_received,
                got: offset,
            });
        }

        let limit = session.expected_bytes - session.bytes_received;
        let mut sink = self.media.append_stream(&session.storage_handle).await?;
        let mut committed = session.bytes_received;
        let mut unflushed: usize = 0;
        let mut truncated = false;

        while let Some(chunk) = body.next().await {
            // A network read error is not a storage failure: committed
            // progress stays durable and the client simply resumes.
            let chunk = chunk?;
            let remaining = (limit - (committed - offset) - unflushed as i64).max(0) as usize;
            let write_len = chunk.len().min(remaining);
            if write_len > 0 {
                if let Err(e) = sink.write_all(&chunk[..write_len]).await {
                    self.fail_upload(&session, &e).await;
                    return Err(Error::storage_write(e));
                }
                unflushed += write_len;
            }
            if chunk.len() > write_len {
                truncated = true;
            }
            if unflushed >= FLUSH_THRESHOLD {
                if let Err(e) = sink.flush().await {
                    self.fail_upload(&session, &e).await;
                    return Err(Error::storage_write(e));
                }
                committed += unflushed as i64;
                unflushed = 0;
                self.repo.update_progress(id, committed).await?;
            }
            if truncated {
                break;
            }
        }

        if let Err(e) = sink.flush().await {
            self.fail_upload(&session, &e).await;
            return Err(Error::storage_write(e));
        }
        if let Err(e) = sink.shutdown().await {
            self.fail_upload(&session, &e).await;
            return Err(Error::storage_write(e));
        }
        if unflushed > 0 {
            committed += unflushed as i64;
            self.repo.update_progress(id, committed).await?;
        } else if committed == offset {
            // Zero-byte PATCH still refreshes last-updated-at.
            self.repo.update_progress(id, committed).await?;
        }

        if committed >= session.expected_bytes {
            let url = self.media.finalize(&session.storage_handle).await?;
            self.repo.terminate(id, UploadStatus::Completed).await?;
            info!(upload_id = %id, url = %url, "Upload completed");
        }

        if truncated {
            return Err(Error::StorageExhausted(
                "Request body exceeds the declared Upload-Length; write truncated".to_string(),
            ));
        }
        debug!(upload_id = %id, committed, "PATCH applied");
        Ok(committed)
    }

    /// Terminate an upload. Idempotent on sessions already cancelled
    /// or cleaned; unknown ids are an error.
    pub async fn cancel(&self, id: &UploadId) -> Result<()> {
        let Some(session) = self.repo.lookup(id).await? else {
            if self.swept.contains(id) {
                return Ok(());
            }
            return Err(Error::NotFound(format!("Unknown upload {id}")));
        };

        if session.status == UploadStatus::InProgress {
            if let Err(e) = self.media.delete(&session.storage_handle).await {
                warn!(
                    upload_id = %id,
                    "Pending entry delete during cancel failed: {e}"
                );
            }
        }
        self.repo.delete(id).await?;
        self.swept.insert(*id);
        self.patch_locks.remove(id);
        info!(upload_id = %id, "Upload cancelled");
        Ok(())
    }

    /// One cleanup pass: expire stale in-progress sessions, drop
    /// finished rows, sweep orphaned pending entries.
    pub async fn expire(&self) -> Result<ExpireSummary> {
        let mut summary = ExpireSummary::default();
        let cutoff = Utc::now() - chrono::Duration::hours(self.config.session_expiry_hours as i64);

        for session in self.repo.list_expired(cutoff).await? {
            if let Err(e) = self.media.delete(&session.storage_handle).await {
                warn!(upload_id = %session.id, "Expired entry delete failed: {e}");
            }
            self.sweep_scratch(&session.id).await;
            self.repo.delete(&session.id).await?;
            self.swept.insert(session.id);
            self.patch_locks.remove(&session.id);
            summary.expired += 1;
            info!(upload_id = %session.id, "Expired stale upload session");
        }

        for session in self.repo.list_finished().await? {
            self.repo.delete(&session.id).await?;
            self.swept.insert(session.id);
            summary.finished_removed += 1;
        }

        // Pending entries with no session row cannot ever complete.
        let known = self.repo.all_storage_handles().await?;
        for handle in self.media.list_pending().await? {
            if !known.contains(handle.as_str()) {
                if let Err(e) = self.media.delete(&handle).await {
                    warn!("Orphaned entry {handle} delete failed: {e}");
                } else {
                    summary.orphans_removed += 1;
                }
            }
        }

        debug!(
            expired = summary.expired,
            finished_removed = summary.finished_removed,
            orphans_removed = summary.orphans_removed,
            "Cleanup pass finished"
        );
        Ok(summary)
    }

    /// The store is the source of truth for committed bytes; pull the
    /// row forward when it lags (at most one chunk after a crash).
    async fn reconciled(&self, session: UploadSession) -> Result<UploadSession> {
        if session.status != UploadStatus::InProgress {
            return Ok(session);
        }
        match self.media.size(&session.storage_handle).await {
            Ok(actual) if actual as i64 > session.bytes_received => {
                debug!(
                    upload_id = %session.id,
                    row = session.bytes_received,
                    store = actual,
                    "Reconciling offset from media store"
                );
                self.repo.update_progress(&session.id, actual as i64).await
            }
            Ok(_) => Ok(session),
            Err(e) => {
                debug!(upload_id = %session.id, "Size probe failed during reconcile: {e}");
                Ok(session)
            }
        }
    }

    async fn fail_upload(&self, session: &UploadSession, cause: &io::Error) {
        error!(
            upload_id = %session.id,
            "Storage write failed, releasing upload: {cause}"
        );
        if let Err(e) = self.repo.terminate(&session.id, UploadStatus::Failed).await {
            error!(upload_id = %session.id, "Failed-state transition did not persist: {e}");
        }
        if let Err(e) = self.media.delete(&session.storage_handle).await {
            warn!(upload_id = %session.id, "Storage handle release failed: {e}");
        }
    }

    /// Remove scratch files whose names embed the upload id.
    async fn sweep_scratch(&self, id: &UploadId) {
        let Some(dir) = self.config.scratch_dir.as_ref() else {
            return;
        };
        let needle = id.to_string();
        let Ok(mut entries) = tokio::fs::read_dir(Path::new(dir)).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().contains(&needle) {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!("Scratch file {:?} removal failed: {e}", entry.path());
                }
            }
        }
    }
}

impl std::fmt::Debug for UploadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadService").finish()
    }
}

/// Run cleanup now and then on the configured cadence.
pub fn spawn_cleanup(service: Arc<UploadService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(service.config.cleanup_interval_hours * 3_600);
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            if let Err(e) = service.expire().await {
                error!("Upload cleanup pass failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryMediaStore;
    use futures::stream;
    use sqlx::sqlite::SqlitePoolOptions;

    struct Fixture {
        service: UploadService,
        media: Arc<MemoryMediaStore>,
    }

    async fn fixture() -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        UploadSessionRepository::migrate(&pool).await.unwrap();
        let media = Arc::new(MemoryMediaStore::new());
        let service = UploadService::new(
            UploadSessionRepository::new(pool),
            media.clone(),
            UploadConfig::default(),
        );
        Fixture { service, media }
    }

    fn metadata(filename: &str) -> HashMap<String, String> {
        HashMap::from([
            ("filename".to_string(), filename.to_string()),
            ("filetype".to_string(), "video/mp4".to_string()),
        ])
    }

    fn body(bytes: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Unpin + Send {
        stream::iter(vec![Ok(Bytes::copy_from_slice(bytes))])
    }

    #[tokio::test]
    async fn create_validates_extension_and_metadata() {
        let f = fixture().await;

        let err = f.service.create(100, &metadata("virus.exe")).await;
        assert!(matches!(err, Err(Error::InvalidInput(_))));

        let mut missing = metadata("a.mp4");
        missing.remove("filetype");
        assert!(matches!(
            f.service.create(100, &missing).await,
            Err(Error::InvalidInput(_))
        ));

        assert!(matches!(
            f.service.create(0, &metadata("a.mp4")).await,
            Err(Error::InvalidInput(_))
        ));

        assert!(f.service.create(100, &metadata("a.mkv")).await.is_ok());
    }

    #[tokio::test]
    async fn create_enforces_free_space_reserve() {
        let f = fixture().await;
        // 1 MiB free, 500 MiB reserve: nothing fits.
        f.media.set_free_bytes(1024 * 1024);
        assert!(matches!(
            f.service.create(100, &metadata("a.mp4")).await,
            Err(Error::StorageExhausted(_))
        ));
        assert_eq!(f.media.entry_count(), 0, "no pending entry may leak");
    }

    #[tokio::test]
    async fn patch_commits_and_completes() {
        let f = fixture().await;
        let payload = vec![7u8; 600 * 1024];
        let session = f
            .service
            .create(payload.len() as i64, &metadata("movie.mp4"))
            .await
            .unwrap();

        let offset = f.service.patch(&session.id, 0, body(&payload)).await.unwrap();
        assert_eq!(offset, payload.len() as i64);

        let stored = f.media.contents(&session.storage_handle).unwrap();
        assert_eq!(stored, payload);
        assert_eq!(f.media.is_pending(&session.storage_handle), Some(false));

        // Completed sessions stay readable until cleanup removes them.
        let head = f.service.head(&session.id).await.unwrap();
        assert_eq!(head.status, UploadStatus::Completed);
        assert_eq!(head.bytes_received, payload.len() as i64);
    }

    #[tokio::test]
    async fn patch_in_two_chunks_resumes_at_offset() {
        let f = fixture().await;
        let session = f
            .service
            .create(10, &metadata("movie.mp4"))
            .await
            .unwrap();

        assert_eq!(
            f.service.patch(&session.id, 0, body(b"hello")).await.unwrap(),
            5
        );
        assert_eq!(
            f.service.patch(&session.id, 5, body(b"world")).await.unwrap(),
            10
        );
        assert_eq!(
            f.media.contents(&session.storage_handle).unwrap(),
            b"helloworld"
        );
    }

    #[tokio::test]
    async fn patch_with_wrong_offset_conflicts_and_changes_nothing() {
        let f = fixture().await;
        let session = f.service.create(10, &metadata("movie.mp4")).await.unwrap();
        f.service.patch(&session.id, 0, body(b"hello")).await.unwrap();

        match f.service.patch(&session.id, 3, body(b"zzz")).await {
            Err(Error::OffsetConflict { expected, got }) => {
                assert_eq!(expected, 5);
                assert_eq!(got, 3);
            }
            other => panic!("expected OffsetConflict, got {other:?}"),
        }
        let head = f.service.head(&session.id).await.unwrap();
        assert_eq!(head.bytes_received, 5);
    }

    #[tokio::test]
    async fn over_length_body_is_truncated_and_reported() {
        let f = fixture().await;
        let session = f.service.create(4, &metadata("movie.mp4")).await.unwrap();

        match f.service.patch(&session.id, 0, body(b"too many bytes")).await {
            Err(Error::StorageExhausted(_)) => {}
            other => panic!("expected StorageExhausted, got {other:?}"),
        }
        // Exactly the declared length was written, and the upload
        // completed with it.
        assert_eq!(f.media.contents(&session.storage_handle).unwrap(), b"too ");
        let head = f.service.head(&session.id).await.unwrap();
        assert_eq!(head.status, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn storage_write_failure_releases_the_upload() {
        let f = fixture().await;
        let session = f.service.create(10, &metadata("movie.mp4")).await.unwrap();
        f.media.set_fail_writes(true);

        assert!(matches!(
            f.service.patch(&session.id, 0, body(b"hello")).await,
            Err(Error::Io(_))
        ));
        assert!(f.media.contents(&session.storage_handle).is_none());
        assert!(matches!(
            f.service.head(&session.id).await,
            Err(Error::Gone(_))
        ));
    }

    #[tokio::test]
    async fn full_device_surfaces_as_storage_exhaustion() {
        let f = fixture().await;
        let session = f.service.create(10, &metadata("movie.mp4")).await.unwrap();
        f.media.set_storage_full(true);

        match f.service.patch(&session.id, 0, body(b"hello")).await {
            Err(Error::StorageExhausted(_)) => {}
            other => panic!("expected StorageExhausted, got {other:?}"),
        }
        // The upload is released like any other write failure.
        assert!(f.media.contents(&session.storage_handle).is_none());
        assert!(matches!(
            f.service.head(&session.id).await,
            Err(Error::Gone(_))
        ));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_leaves_nothing() {
        let f = fixture().await;
        let session = f.service.create(10, &metadata("movie.mp4")).await.unwrap();

        f.service.cancel(&session.id).await.unwrap();
        assert_eq!(f.media.entry_count(), 0);
        assert!(matches!(
            f.service.head(&session.id).await,
            Err(Error::Gone(_))
        ));

        // Terminal already; still 204-equivalent.
        f.service.cancel(&session.id).await.unwrap();

        // A genuinely unknown id is an error.
        assert!(matches!(
            f.service.cancel(&UploadId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn pin_gates_when_set() {
        let f = fixture().await;
        assert!(f.service.check_pin(None).is_ok());

        f.service.set_pin(Some("4812".to_string()));
        assert!(f.service.check_pin(None).is_err());
        assert!(f.service.check_pin(Some("0000")).is_err());
        assert!(f.service.check_pin(Some("4812")).is_ok());
    }

    #[tokio::test]
    async fn expire_removes_stale_rows_and_orphans() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        UploadSessionRepository::migrate(&pool).await.unwrap();
        let media = Arc::new(MemoryMediaStore::new());
        let mut config = UploadConfig::default();
        config.session_expiry_hours = 0; // everything is stale
        let service = UploadService::new(
            UploadSessionRepository::new(pool),
            media.clone(),
            config,
        );

        let session = service.create(10, &metadata("movie.mp4")).await.unwrap();
        // An orphaned pending entry with no session row.
        media.create_pending("orphan.mp4", "video/mp4").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let summary = service.expire().await.unwrap();
        assert_eq!(summary.expired, 1);
        assert_eq!(summary.orphans_removed, 1);
        assert_eq!(media.entry_count(), 0);

        // The row is gone and HEAD answers Gone, not NotFound.
        assert!(matches!(service.head(&session.id).await, Err(Error::Gone(_))));
    }
}
