use std::sync::Arc;

use cinesync_core::models::{Session, VideoCatalog};
use cinesync_core::sync::SyncCoordinator;
use cinesync_core::upload::UploadService;
use cinesync_proto::SessionSnapshot;

use crate::hub::SessionHub;

/// Shared state behind the HTTP and WebSocket routers of one session.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub coordinator: Arc<SyncCoordinator>,
    pub hub: SessionHub,
    pub catalog: VideoCatalog,
    /// Absent when the upload endpoint refused to start (durable
    /// store unavailable); streaming and sync still run.
    pub uploads: Option<Arc<UploadService>>,
}

impl AppState {
    /// Wire-level session snapshot: identity, URLs, and the current
    /// roster.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        let clients = self
            .coordinator
            .roster_snapshot()
            .into_iter()
            .map(|status| status.descriptor.to_info())
            .collect();
        SessionSnapshot {
            session_id: self.session.id.to_string(),
            movie_id: self
                .session
                .movie_id
                .as_ref()
                .map(|id| id.as_str().to_string()),
            stream_url: self.session.stream_url.clone(),
            command_url: self.session.command_url.clone(),
            master: self.session.master.to_info(),
            clients,
            created_at: self.session.created_at.timestamp_millis(),
        }
    }
}
