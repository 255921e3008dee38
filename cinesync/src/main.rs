mod media_store;
mod probe;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info, warn};

use cinesync_api::{join, SessionRegistry};
use cinesync_core::engine::ClockEngine;
use cinesync_core::logging;
use cinesync_core::models::{DeviceDescriptor, DeviceId};
use cinesync_core::probe::NetworkProbe;
use cinesync_core::upload::UploadSessionRepository;
use cinesync_core::Config;

use media_store::FsMediaStore;
use probe::SystemProbe;

/// Headless "watch together" host and client.
#[derive(Parser)]
#[command(name = "cinesync", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a session around a local video file.
    Host {
        /// Path to the video to stream.
        video: PathBuf,
        /// Display name announced to clients.
        #[arg(long, default_value = "CineSync Master")]
        name: String,
        /// Directory for uploaded media.
        #[arg(long, default_value = "media")]
        media_dir: PathBuf,
        /// Issue the synchronized start as soon as every client is
        /// ready.
        #[arg(long)]
        autostart: bool,
    },
    /// Join a hosted session.
    Join {
        /// Sync channel base URL, e.g. ws://10.0.0.2:8081
        server: String,
        /// Session PIN shown on the master.
        pin: String,
        /// Display name announced to the master.
        #[arg(long, default_value = "CineSync Client")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    logging::init(&config.logging)?;

    match cli.command {
        Command::Host {
            video,
            name,
            media_dir,
            autostart,
        } => host(config, video, name, media_dir, autostart).await,
        Command::Join { server, pin, name } => join_session(config, server, pin, name).await,
    }
}

async fn host(
    config: Config,
    video: PathBuf,
    name: String,
    media_dir: PathBuf,
    autostart: bool,
) -> Result<()> {
    let probe = Arc::new(SystemProbe);
    let media = Arc::new(
        FsMediaStore::open(&media_dir)
            .await
            .context("Failed to open media directory")?,
    );
    let engine = Arc::new(ClockEngine::new(0));

    // The durable store is the only correctness-fatal dependency, and
    // only for uploads: when it refuses to start, streaming and sync
    // still run.
    let upload_repo = match open_upload_store(&config).await {
        Ok(repo) => Some(repo),
        Err(e) => {
            error!("Upload endpoint disabled, durable store unavailable: {e:#}");
            None
        }
    };

    let master = DeviceDescriptor::new(
        DeviceId::new(),
        name,
        probe.local_ipv4().unwrap_or_else(|| "0.0.0.0".to_string()),
    );
    let registry = Arc::new(SessionRegistry::new(
        config,
        probe,
        engine,
        media,
        upload_repo,
    ));

    let session = registry.host(&video, master).await?;
    info!("Session PIN: {}", session.pin);
    if let Some(upload_pin) = &session.upload_pin {
        info!("Upload PIN: {upload_pin}");
    }
    info!("Stream URL: {}", session.stream_url.as_deref().unwrap_or("-"));
    info!("Sync URL:   {}", session.command_url);

    if autostart {
        let registry = registry.clone();
        let session_id = session.id;
        tokio::spawn(async move {
            let mut started = false;
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let Some(state) = registry.active_state().await else {
                    break;
                };
                if state.session.id != session_id {
                    break;
                }
                let coordinator = &state.coordinator;
                if !started
                    && coordinator.roster_len() > 0
                    && coordinator.all_ready()
                {
                    let target = coordinator.start();
                    info!(target, "All clients ready, starting playback");
                    started = true;
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    registry.end(&session.id).await;
    Ok(())
}

async fn join_session(config: Config, server: String, pin: String, name: String) -> Result<()> {
    let probe = SystemProbe;
    let descriptor = DeviceDescriptor::new(
        DeviceId::new(),
        name,
        probe.local_ipv4().unwrap_or_else(|| "0.0.0.0".to_string()),
    );
    let engine = Arc::new(ClockEngine::new(0));

    let joined = join(&server, &pin, &descriptor, config.sync, engine)
        .await
        .context("Failed to join session")?;
    info!(
        session_id = %joined.snapshot.session_id,
        movie_id = ?joined.snapshot.movie_id,
        "Joined; following the master's timeline"
    );

    tokio::signal::ctrl_c().await?;
    info!("Leaving session");
    joined.follower.close();
    for task in joined.tasks {
        task.abort();
    }
    Ok(())
}

async fn open_upload_store(config: &Config) -> Result<UploadSessionRepository> {
    let options = SqliteConnectOptions::new()
        .filename(&config.database.path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .context("Failed to open the upload-session database")?;
    UploadSessionRepository::migrate(&pool)
        .await
        .context("Failed to migrate the upload-session table")?;
    if config.upload.scratch_dir.is_none() {
        warn!("No UPLOAD_SCRATCH_DIR set; expiry skips the scratch sweep");
    }
    Ok(UploadSessionRepository::new(pool))
}
