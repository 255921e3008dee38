//! Host media store contract.
//!
//! Uploaded bytes flow through this interface exclusively; read-side
//! indexing of finished files belongs to the host. The store is the
//! source of truth for file contents, so the upload-session table only
//! has to record the offset the store last committed.

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::models::StorageHandle;
use crate::Result;

/// A writable byte sink appending to one pending entry.
pub type AppendSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Device-managed media storage.
///
/// Appends are serialized per storage handle by the host; callers
/// still serialize PATCHes per upload-id on top.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Create a pending entry and return its opaque handle.
    async fn create_pending(&self, name: &str, mime: &str) -> Result<StorageHandle>;

    /// Open an append stream positioned at the entry's current end.
    async fn append_stream(&self, handle: &StorageHandle) -> Result<AppendSink>;

    /// Committed size of the entry in bytes.
    async fn size(&self, handle: &StorageHandle) -> Result<u64>;

    /// Mark the entry not-pending and return its published URL.
    async fn finalize(&self, handle: &StorageHandle) -> Result<String>;

    /// Delete the entry, pending or not. Unknown handles are an error.
    async fn delete(&self, handle: &StorageHandle) -> Result<()>;

    /// All handles still pending in this app's storage subtree.
    async fn list_pending(&self) -> Result<Vec<StorageHandle>>;

    /// Free bytes available to new entries.
    async fn free_bytes(&self) -> Result<u64>;
}
