//! Session registry: hosting, PIN minting, server lifecycle.
//!
//! `host` brings a session fully live or not at all: Wi‑Fi and file
//! checks first, then both listeners are bound (the stream/upload
//! server and the sync channel server) before anything is spawned, so
//! a failed bind rolls the other listener back by dropping it. `end`
//! closes the sync channel with code 1000, drains HTTP connections
//! for a bounded grace period, and stops every background task.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cinesync_core::config::Config;
use cinesync_core::engine::PlaybackEngine;
use cinesync_core::media_store::MediaStore;
use cinesync_core::models::{
    content_type_for, mint_pin, DeviceDescriptor, MovieId, RegisteredVideo, Session, SessionId,
    VideoCatalog,
};
use cinesync_core::probe::NetworkProbe;
use cinesync_core::sync::SyncCoordinator;
use cinesync_core::upload::{spawn_cleanup, UploadService, UploadSessionRepository};

use crate::error::HostError;
use crate::http;
use crate::hub::SessionHub;
use crate::state::AppState;
use crate::ws;

/// Grace period for draining in-flight HTTP connections at session end.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

struct ActiveSession {
    session: Session,
    state: AppState,
    http_shutdown: watch::Sender<bool>,
    ws_shutdown: watch::Sender<bool>,
    http_task: JoinHandle<()>,
    ws_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

/// Creates sessions, mints PINs, owns the server lifecycle.
pub struct SessionRegistry {
    config: Config,
    probe: Arc<dyn NetworkProbe>,
    engine: Arc<dyn PlaybackEngine>,
    media: Arc<dyn MediaStore>,
    /// Absent when the durable store failed to initialize; the upload
    /// endpoint then stays down while streaming and sync run.
    upload_repo: Option<UploadSessionRepository>,
    used_pins: Mutex<HashSet<String>>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(
        config: Config,
        probe: Arc<dyn NetworkProbe>,
        engine: Arc<dyn PlaybackEngine>,
        media: Arc<dyn MediaStore>,
        upload_repo: Option<UploadSessionRepository>,
    ) -> Self {
        Self {
            config,
            probe,
            engine,
            media,
            upload_repo,
            used_pins: Mutex::new(HashSet::new()),
            active: tokio::sync::Mutex::new(None),
        }
    }

    /// Host a new session around a local video file.
    pub async fn host(
        &self,
        video_path: &Path,
        master: DeviceDescriptor,
    ) -> Result<Session, HostError> {
        if !self.probe.is_wifi_connected() {
            return Err(HostError::NoWifi);
        }
        let ip = self.probe.local_ipv4().ok_or(HostError::NoWifi)?;

        let metadata = tokio::fs::metadata(video_path)
            .await
            .map_err(|_| HostError::FileMissing)?;
        if !metadata.is_file() {
            return Err(HostError::FileMissing);
        }

        // One session per master process; a new host action supersedes
        // the previous session.
        if self.active.lock().await.is_some() {
            info!("Ending previous session before hosting a new one");
            self.end_active().await;
        }

        let server = &self.config.server;
        let (http_listener, http_port) = bind_with_fallback(
            &server.host,
            server.http_port,
            &server.http_fallback_ports,
            None,
        )
        .await
        .ok_or(HostError::PortsExhausted)?;
        // A ws bind failure drops the HTTP listener with it: the
        // session comes up fully or not at all.
        let (ws_listener, ws_port) = bind_with_fallback(
            &server.host,
            server.ws_port,
            &server.ws_fallback_ports,
            Some(http_port),
        )
        .await
        .ok_or(HostError::PortsExhausted)?;

        let pin = self.mint_unique_pin(self.config.sync.pin_digits);
        let upload_pin = self
            .upload_repo
            .as_ref()
            .map(|_| self.mint_unique_pin(self.config.upload.pin_digits));

        let movie_id = MovieId::new();
        let file_name = video_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let catalog = VideoCatalog::new();
        catalog.register(RegisteredVideo {
            movie_id: movie_id.clone(),
            path: video_path.to_path_buf(),
            length: metadata.len(),
            content_type: content_type_for(&file_name).to_string(),
        });

        let stream_url = format!("http://{ip}:{http_port}/video/{movie_id}");
        let command_url = format!("ws://{ip}:{ws_port}/sync");
        let session = Session {
            id: SessionId::new(),
            pin: pin.clone(),
            upload_pin: upload_pin.clone(),
            master: master.clone(),
            movie_id: Some(movie_id.clone()),
            stream_url: Some(stream_url.clone()),
            command_url: command_url.clone(),
            created_at: Utc::now(),
        };

        let hub = SessionHub::new();
        let coordinator = Arc::new(SyncCoordinator::new(
            master.device_id.clone(),
            self.config.sync.clone(),
            self.engine.clone(),
            Arc::new(hub.clone()),
        ));
        let uploads = self.upload_repo.clone().map(|repo| {
            let service = Arc::new(UploadService::new(
                repo,
                self.media.clone(),
                self.config.upload.clone(),
            ));
            service.set_pin(upload_pin.clone());
            service
        });

        let state = AppState {
            session: Arc::new(session.clone()),
            coordinator: coordinator.clone(),
            hub: hub.clone(),
            catalog,
            uploads: uploads.clone(),
        };

        // The master's own engine serves straight from the local file.
        self.engine
            .prepare(&video_path.to_string_lossy(), 0);
        coordinator.load(&movie_id, &stream_url);

        let (http_shutdown, http_shutdown_rx) = watch::channel(false);
        let http_app = http::router(state.clone());
        let http_task = tokio::spawn(async move {
            let mut rx = http_shutdown_rx;
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = axum::serve(http_listener, http_app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("HTTP server error: {e}");
            }
        });

        let (ws_shutdown, ws_shutdown_rx) = watch::channel(false);
        let ws_app = ws::server::router(state.clone());
        let ws_task = tokio::spawn(async move {
            let mut rx = ws_shutdown_rx;
            let shutdown = async move {
                let _ = rx.changed().await;
            };
            if let Err(e) = axum::serve(
                ws_listener,
                ws_app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
            {
                error!("Sync channel server error: {e}");
            }
        });

        let mut background = coordinator.spawn_tasks();
        if let Some(service) = &uploads {
            background.push(spawn_cleanup(service.clone()));
        }

        info!(
            session_id = %session.id,
            pin = %pin,
            stream_url = %stream_url,
            command_url = %command_url,
            "Session hosted"
        );

        *self.active.lock().await = Some(ActiveSession {
            session: session.clone(),
            state,
            http_shutdown,
            ws_shutdown,
            http_task,
            ws_task,
            background,
        });
        Ok(session)
    }

    /// End a session by id. Returns false when no such session is
    /// live.
    pub async fn end(&self, session_id: &SessionId) -> bool {
        let matches = self
            .active
            .lock()
            .await
            .as_ref()
            .is_some_and(|active| active.session.id == *session_id);
        if !matches {
            return false;
        }
        self.end_active().await;
        true
    }

    /// The live session, if any.
    pub async fn session(&self) -> Option<Session> {
        self.active.lock().await.as_ref().map(|a| a.session.clone())
    }

    /// Shared state of the live session, for UI adapters and tests.
    pub async fn active_state(&self) -> Option<AppState> {
        self.active.lock().await.as_ref().map(|a| a.state.clone())
    }

    async fn end_active(&self) {
        let Some(active) = self.active.lock().await.take() else {
            return;
        };
        let ActiveSession {
            session,
            state,
            http_shutdown,
            ws_shutdown,
            mut http_task,
            mut ws_task,
            background,
        } = active;

        info!(session_id = %session.id, "Ending session");

        // Close every sync channel with code 1000, then let both
        // servers drain.
        state.hub.shutdown_all();
        let _ = http_shutdown.send(true);
        let _ = ws_shutdown.send(true);

        if tokio::time::timeout(DRAIN_GRACE, &mut http_task).await.is_err() {
            warn!("HTTP drain grace elapsed, aborting connections");
            http_task.abort();
        }
        if tokio::time::timeout(DRAIN_GRACE, &mut ws_task).await.is_err() {
            warn!("Sync channel drain grace elapsed, aborting");
            ws_task.abort();
        }
        for task in background {
            task.abort();
        }

        state.catalog.clear();
        self.engine.stop();
    }

    /// PINs never repeat within one process run.
    fn mint_unique_pin(&self, digits: u32) -> String {
        let mut used = self.used_pins.lock();
        loop {
            let pin = mint_pin(digits);
            if used.insert(pin.clone()) {
                return pin;
            }
        }
    }
}

/// Bind the primary port, then each fallback in order. Returns the
/// listener and the actual bound port (meaningful when the requested
/// port is 0).
async fn bind_with_fallback(
    host: &str,
    primary: u16,
    fallbacks: &[u16],
    skip: Option<u16>,
) -> Option<(TcpListener, u16)> {
    for port in std::iter::once(primary).chain(fallbacks.iter().copied()) {
        if skip == Some(port) && port != 0 {
            continue;
        }
        match TcpListener::bind((host, port)).await {
            Ok(listener) => match listener.local_addr() {
                Ok(addr) => return Some((listener, addr.port())),
                Err(e) => {
                    warn!(port, "Bound listener has no local address: {e}");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(port, "Port in use, trying fallback");
            }
            Err(e) => {
                warn!(port, "Bind failed: {e}");
            }
        }
    }
    None
}
