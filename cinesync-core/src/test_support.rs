//! Fakes for the host collaborators, shared by unit and integration
//! tests across the workspace.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;

use crate::media_store::{AppendSink, MediaStore};
use crate::models::{generate_id, StorageHandle};
use crate::probe::NetworkProbe;
use crate::{Error, Result};

#[derive(Debug, Default)]
struct MemoryEntry {
    data: Vec<u8>,
    pending: bool,
}

/// In-memory media store. Byte-faithful: `size` reports exactly what
/// sinks have written, which the upload service treats as the
/// committed offset.
#[derive(Debug, Default)]
pub struct MemoryMediaStore {
    entries: DashMap<String, Arc<Mutex<MemoryEntry>>>,
    free_bytes: Mutex<u64>,
    fail_writes: Mutex<Option<io::ErrorKind>>,
}

impl MemoryMediaStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            free_bytes: Mutex::new(64 * 1024 * 1024 * 1024),
            fail_writes: Mutex::new(None),
        }
    }

    pub fn set_free_bytes(&self, bytes: u64) {
        *self.free_bytes.lock() = bytes;
    }

    /// Make every subsequent sink write fail, simulating the device
    /// storage dying mid-upload.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail.then_some(io::ErrorKind::Other);
    }

    /// Make every subsequent sink write fail as a full device
    /// (ENOSPC-class).
    pub fn set_storage_full(&self, full: bool) {
        *self.fail_writes.lock() = full.then_some(io::ErrorKind::StorageFull);
    }

    #[must_use]
    pub fn contents(&self, handle: &StorageHandle) -> Option<Vec<u8>> {
        self.entries
            .get(handle.as_str())
            .map(|entry| entry.lock().data.clone())
    }

    #[must_use]
    pub fn is_pending(&self, handle: &StorageHandle) -> Option<bool> {
        self.entries
            .get(handle.as_str())
            .map(|entry| entry.lock().pending)
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

struct MemorySink {
    entry: Arc<Mutex<MemoryEntry>>,
    fail: Option<io::ErrorKind>,
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(kind) = self.fail {
            return Poll::Ready(Err(io::Error::new(kind, "simulated write failure")));
        }
        self.entry.lock().data.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn create_pending(&self, name: &str, _mime: &str) -> Result<StorageHandle> {
        let handle = StorageHandle::from_string(format!("{}-{name}", generate_id()));
        self.entries.insert(
            handle.as_str().to_string(),
            Arc::new(Mutex::new(MemoryEntry {
                data: Vec::new(),
                pending: true,
            })),
        );
        Ok(handle)
    }

    async fn append_stream(&self, handle: &StorageHandle) -> Result<AppendSink> {
        let entry = self
            .entries
            .get(handle.as_str())
            .map(|e| e.clone())
            .ok_or_else(|| Error::NotFound(format!("No media entry {handle}")))?;
        Ok(Box::new(MemorySink {
            entry,
            fail: *self.fail_writes.lock(),
        }))
    }

    async fn size(&self, handle: &StorageHandle) -> Result<u64> {
        self.entries
            .get(handle.as_str())
            .map(|entry| entry.lock().data.len() as u64)
            .ok_or_else(|| Error::NotFound(format!("No media entry {handle}")))
    }

    async fn finalize(&self, handle: &StorageHandle) -> Result<String> {
        let entry = self
            .entries
            .get(handle.as_str())
            .ok_or_else(|| Error::NotFound(format!("No media entry {handle}")))?;
        entry.lock().pending = false;
        Ok(format!("memory://{handle}"))
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        self.entries
            .remove(handle.as_str())
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("No media entry {handle}")))
    }

    async fn list_pending(&self) -> Result<Vec<StorageHandle>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.value().lock().pending)
            .map(|entry| StorageHandle::from_string(entry.key().clone()))
            .collect())
    }

    async fn free_bytes(&self) -> Result<u64> {
        Ok(*self.free_bytes.lock())
    }
}

/// Probe with fixed answers; tests run on loopback.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    pub ipv4: Option<String>,
    pub wifi: bool,
}

impl FixedProbe {
    #[must_use]
    pub fn connected(ip: &str) -> Self {
        Self {
            ipv4: Some(ip.to_string()),
            wifi: true,
        }
    }

    #[must_use]
    pub fn offline() -> Self {
        Self {
            ipv4: None,
            wifi: false,
        }
    }
}

impl NetworkProbe for FixedProbe {
    fn local_ipv4(&self) -> Option<String> {
        self.ipv4.clone()
    }

    fn is_wifi_connected(&self) -> bool {
        self.wifi
    }
}
