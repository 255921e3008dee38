use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use super::id::MovieId;

/// A local file published through the range streamer.
///
/// Registrations are immutable: path and length are fixed at register
/// time, so an in-flight read keeps working after deregistration.
#[derive(Debug, Clone)]
pub struct RegisteredVideo {
    pub movie_id: MovieId,
    pub path: PathBuf,
    pub length: u64,
    pub content_type: String,
}

/// MIME type for a video file name, by extension.
#[must_use]
pub fn content_type_for(name: &str) -> &'static str {
    let extension = name.rsplit('.').next().map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        Some("ts") | Some("m2ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// The registered-videos map.
///
/// A single writer lock guards mutation; readers get `Arc` snapshots,
/// so `register`/`unregister`/`get` are linearizable and deregistering
/// a video never cancels a request already holding its snapshot.
#[derive(Debug, Clone, Default)]
pub struct VideoCatalog {
    inner: Arc<RwLock<HashMap<MovieId, Arc<RegisteredVideo>>>>,
}

impl VideoCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, video: RegisteredVideo) -> Arc<RegisteredVideo> {
        let video = Arc::new(video);
        self.inner
            .write()
            .insert(video.movie_id.clone(), video.clone());
        video
    }

    pub fn unregister(&self, movie_id: &MovieId) -> Option<Arc<RegisteredVideo>> {
        self.inner.write().remove(movie_id)
    }

    #[must_use]
    pub fn get(&self, movie_id: &MovieId) -> Option<Arc<RegisteredVideo>> {
        self.inner.read().get(movie_id).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<RegisteredVideo>> {
        self.inner.read().values().cloned().collect()
    }

    /// Drop every registration; used at session end.
    pub fn clear(&self) {
        self.inner.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(id: &str) -> RegisteredVideo {
        RegisteredVideo {
            movie_id: MovieId::from_string(id.to_string()),
            path: PathBuf::from(format!("/media/{id}.mp4")),
            length: 1_000,
            content_type: "video/mp4".to_string(),
        }
    }

    #[test]
    fn register_and_get() {
        let catalog = VideoCatalog::new();
        let id = MovieId::from_string("m1".to_string());
        catalog.register(video("m1"));

        let found = catalog.get(&id).unwrap();
        assert_eq!(found.length, 1_000);
        assert!(catalog.get(&MovieId::from_string("m2".to_string())).is_none());
    }

    #[test]
    fn snapshot_survives_unregister() {
        let catalog = VideoCatalog::new();
        let id = MovieId::from_string("m1".to_string());
        catalog.register(video("m1"));

        let held = catalog.get(&id).unwrap();
        catalog.unregister(&id);

        // The in-flight reader still has a usable registration.
        assert_eq!(held.path, PathBuf::from("/media/m1.mp4"));
        assert!(catalog.get(&id).is_none());
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("movie.mp4"), "video/mp4");
        assert_eq!(content_type_for("movie.MKV"), "video/x-matroska");
        assert_eq!(content_type_for("movie"), "application/octet-stream");
    }
}
