//! Filesystem-backed media store.
//!
//! Pending entries live under `<root>/.pending/<handle>`; finalize
//! moves them into the root. The handle embeds the original file name
//! so the cleanup sweep and finalize can both recover it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sysinfo::Disks;
use tracing::debug;

use cinesync_core::media_store::{AppendSink, MediaStore};
use cinesync_core::models::StorageHandle;
use cinesync_core::{Error, Result};

const PENDING_DIR: &str = ".pending";

pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(PENDING_DIR)).await?;
        Ok(Self { root })
    }

    fn pending_path(&self, handle: &StorageHandle) -> PathBuf {
        self.root.join(PENDING_DIR).join(handle.as_str())
    }

    fn sanitize(name: &str) -> String {
        name.chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '\0' => '_',
                c => c,
            })
            .collect()
    }
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn create_pending(&self, name: &str, _mime: &str) -> Result<StorageHandle> {
        let handle = StorageHandle::from_string(format!(
            "{}-{}",
            nanoid::nanoid!(8),
            Self::sanitize(name)
        ));
        tokio::fs::File::create(self.pending_path(&handle)).await?;
        debug!(handle = %handle, "Created pending entry");
        Ok(handle)
    }

    async fn append_stream(&self, handle: &StorageHandle) -> Result<AppendSink> {
        let path = self.pending_path(handle);
        if !tokio::fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!("No pending entry {handle}")));
        }
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await?;
        Ok(Box::new(file))
    }

    async fn size(&self, handle: &StorageHandle) -> Result<u64> {
        let metadata = tokio::fs::metadata(self.pending_path(handle))
            .await
            .map_err(|_| Error::NotFound(format!("No pending entry {handle}")))?;
        Ok(metadata.len())
    }

    async fn finalize(&self, handle: &StorageHandle) -> Result<String> {
        let source = self.pending_path(handle);
        if !tokio::fs::try_exists(&source).await? {
            return Err(Error::NotFound(format!("No pending entry {handle}")));
        }
        // The name after the nanoid prefix is the original file name.
        let name = handle
            .as_str()
            .split_once('-')
            .map_or(handle.as_str(), |(_, name)| name);
        let mut destination = self.root.join(name);
        if tokio::fs::try_exists(&destination).await? {
            destination = self.root.join(handle.as_str());
        }
        tokio::fs::rename(&source, &destination).await?;
        Ok(format!("file://{}", destination.display()))
    }

    async fn delete(&self, handle: &StorageHandle) -> Result<()> {
        let path = self.pending_path(handle);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| Error::NotFound(format!("No pending entry {handle}")))
    }

    async fn list_pending(&self) -> Result<Vec<StorageHandle>> {
        let mut handles = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join(PENDING_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            handles.push(StorageHandle::from_string(
                entry.file_name().to_string_lossy().into_owned(),
            ));
        }
        Ok(handles)
    }

    async fn free_bytes(&self) -> Result<u64> {
        Ok(available_space(&self.root))
    }
}

/// Available bytes on the disk holding `path`: the mounted disk with
/// the longest mount-point prefix wins.
fn available_space(path: &Path) -> u64 {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map_or(0, sysinfo::Disk::available_space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn pending_entry_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMediaStore::open(dir.path()).await.unwrap();

        let handle = store.create_pending("movie.mp4", "video/mp4").await.unwrap();
        assert_eq!(store.size(&handle).await.unwrap(), 0);
        assert_eq!(store.list_pending().await.unwrap().len(), 1);

        let mut sink = store.append_stream(&handle).await.unwrap();
        sink.write_all(b"abcdef").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        assert_eq!(store.size(&handle).await.unwrap(), 6);

        // Appending twice continues at the end.
        let mut sink = store.append_stream(&handle).await.unwrap();
        sink.write_all(b"ghi").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);
        assert_eq!(store.size(&handle).await.unwrap(), 9);

        let url = store.finalize(&handle).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("movie.mp4"));
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_pending_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMediaStore::open(dir.path()).await.unwrap();

        let handle = store.create_pending("a.mkv", "video/x-matroska").await.unwrap();
        store.delete(&handle).await.unwrap();
        assert!(store.delete(&handle).await.is_err());
        assert!(store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMediaStore::open(dir.path()).await.unwrap();

        let handle = store
            .create_pending("../../etc/passwd.mp4", "video/mp4")
            .await
            .unwrap();
        assert!(!handle.as_str().contains('/'));
        assert_eq!(store.size(&handle).await.unwrap(), 0);
    }
}
