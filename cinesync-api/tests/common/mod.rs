//! Shared fixtures for the HTTP and sync-channel integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use cinesync_api::hub::SessionHub;
use cinesync_api::AppState;
use cinesync_core::config::{SyncConfig, UploadConfig};
use cinesync_core::engine::ClockEngine;
use cinesync_core::models::{DeviceDescriptor, DeviceId, Session, SessionId};
use cinesync_core::sync::SyncCoordinator;
use cinesync_core::test_support::MemoryMediaStore;
use cinesync_core::upload::{UploadService, UploadSessionRepository};

pub fn test_session() -> Session {
    Session {
        id: SessionId::new(),
        pin: "123456".to_string(),
        upload_pin: None,
        master: DeviceDescriptor::new(
            DeviceId::from_string("master".to_string()),
            "Master",
            "127.0.0.1",
        ),
        movie_id: None,
        stream_url: None,
        command_url: "ws://127.0.0.1:0/sync".to_string(),
        created_at: Utc::now(),
    }
}

pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite")
}

pub async fn file_pool(path: &std::path::Path) -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
        )
        .await
        .expect("file-backed sqlite")
}

pub async fn upload_service(pool: SqlitePool, media: Arc<MemoryMediaStore>) -> Arc<UploadService> {
    UploadSessionRepository::migrate(&pool).await.expect("migrate");
    Arc::new(UploadService::new(
        UploadSessionRepository::new(pool),
        media,
        UploadConfig::default(),
    ))
}

pub fn test_state(uploads: Option<Arc<UploadService>>) -> AppState {
    let hub = SessionHub::new();
    let coordinator = Arc::new(SyncCoordinator::new(
        DeviceId::from_string("master".to_string()),
        SyncConfig::default(),
        Arc::new(ClockEngine::new(7_200_000)),
        Arc::new(hub.clone()),
    ));
    AppState {
        session: Arc::new(test_session()),
        coordinator,
        hub,
        catalog: cinesync_core::models::VideoCatalog::new(),
        uploads,
    }
}
