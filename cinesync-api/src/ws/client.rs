//! Client side of the command transport.
//!
//! `join` resolves the PIN handshake and wires a [`SyncFollower`] to
//! the channel: inbound envelopes dispatch to the follower, outbound
//! status reports drain from a bounded queue. Lost connections
//! reconnect with exponential backoff capped at 30 s; a graceful
//! server close (code 1000) or a rejection on reconnect closes the
//! follower for good.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::frame::coding::CloseCode,
    tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use cinesync_core::config::SyncConfig;
use cinesync_core::engine::PlaybackEngine;
use cinesync_core::models::DeviceDescriptor;
use cinesync_core::sync::{StatusOutbound, SyncFollower};
use cinesync_proto::{decode_frame, CommandEnvelope, InboundFrame, JoinReply, SessionSnapshot, StatusReport};

use crate::error::JoinError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const OUTBOX_CAPACITY: usize = 64;

/// Status reports ride a bounded queue so the follower's report
/// cadence never blocks on the socket.
struct ChannelStatus {
    tx: mpsc::Sender<StatusReport>,
}

impl StatusOutbound for ChannelStatus {
    fn send(&self, report: &StatusReport) -> bool {
        self.tx.try_send(report.clone()).is_ok()
    }
}

/// A joined session: the snapshot received on handshake, the follower
/// driving the local engine, and the channel tasks.
pub struct JoinedSession {
    pub snapshot: SessionSnapshot,
    pub follower: Arc<SyncFollower>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Join a hosted session by PIN.
///
/// `server_url` is the ws base, e.g. `ws://10.0.0.2:8081`; the PIN and
/// descriptor travel in the upgrade query string. Resolves once the
/// master answers the handshake, within the configured join timeout.
pub async fn join(
    server_url: &str,
    pin: &str,
    descriptor: &DeviceDescriptor,
    config: SyncConfig,
    engine: Arc<dyn PlaybackEngine>,
) -> Result<JoinedSession, JoinError> {
    let url = build_url(server_url, pin, descriptor);
    let timeout = Duration::from_millis(config.join_timeout_ms);
    let (ws, snapshot) = connect_handshake(&url, timeout).await?;

    let (tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let follower = Arc::new(SyncFollower::new(
        descriptor.device_id.clone(),
        config,
        engine,
        Arc::new(ChannelStatus { tx }),
    ));

    // A late joiner learns the current video from the snapshot rather
    // than from a load broadcast it never saw.
    if let (Some(movie_id), Some(stream_url)) = (&snapshot.movie_id, &snapshot.stream_url) {
        follower.handle_command(CommandEnvelope::load(
            &snapshot.master.device_id,
            movie_id,
            stream_url,
        ));
    }

    info!(session_id = %snapshot.session_id, "Joined session");

    let mut tasks = follower.spawn_tasks();
    let channel_task = tokio::spawn(run_channel(
        ws,
        url,
        timeout,
        Arc::clone(&follower),
        outbox_rx,
    ));
    tasks.push(channel_task);

    Ok(JoinedSession {
        snapshot,
        follower,
        tasks,
    })
}

fn build_url(server_url: &str, pin: &str, descriptor: &DeviceDescriptor) -> String {
    format!(
        "{}/sync?pin={}&deviceId={}&displayName={}",
        server_url.trim_end_matches('/'),
        urlencoding::encode(pin),
        urlencoding::encode(descriptor.device_id.as_str()),
        urlencoding::encode(&descriptor.display_name),
    )
}

async fn connect_handshake(
    url: &str,
    timeout: Duration,
) -> Result<(WsStream, SessionSnapshot), JoinError> {
    let (mut ws, _response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| JoinError::Network("Join timed out".to_string()))?
        .map_err(|e| JoinError::Network(e.to_string()))?;

    let reply = tokio::time::timeout(timeout, ws.next())
        .await
        .map_err(|_| JoinError::Network("Join handshake timed out".to_string()))?;

    match reply {
        Some(Ok(Message::Text(text))) => {
            match serde_json::from_str::<JoinReply>(text.as_str()) {
                Ok(JoinReply::Accepted { session }) => Ok((ws, session)),
                Ok(JoinReply::Rejected) => Err(JoinError::UnknownPin),
                Err(e) => Err(JoinError::Network(format!("Malformed join reply: {e}"))),
            }
        }
        Some(Ok(Message::Close(_))) | None => Err(JoinError::SessionClosed),
        Some(Ok(_)) => Err(JoinError::Network("Unexpected handshake frame".to_string())),
        Some(Err(e)) => Err(JoinError::Network(e.to_string())),
    }
}

enum PumpExit {
    Graceful,
    Lost,
}

async fn run_channel(
    mut ws: WsStream,
    url: String,
    timeout: Duration,
    follower: Arc<SyncFollower>,
    mut outbox: mpsc::Receiver<StatusReport>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match pump(&mut ws, &follower, &mut outbox).await {
            PumpExit::Graceful => {
                info!("Sync channel closed by master");
                follower.close();
                return;
            }
            PumpExit::Lost => loop {
                warn!("Sync channel lost, reconnecting in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                match connect_handshake(&url, timeout).await {
                    Ok((new_ws, _snapshot)) => {
                        info!("Sync channel re-established");
                        ws = new_ws;
                        backoff = INITIAL_BACKOFF;
                        break;
                    }
                    Err(JoinError::UnknownPin | JoinError::SessionClosed) => {
                        info!("Session no longer accepts us, closing follower");
                        follower.close();
                        return;
                    }
                    Err(JoinError::Network(e)) => {
                        debug!("Reconnect attempt failed: {e}");
                    }
                }
            },
        }
    }
}

async fn pump(
    ws: &mut WsStream,
    follower: &Arc<SyncFollower>,
    outbox: &mut mpsc::Receiver<StatusReport>,
) -> PumpExit {
    loop {
        tokio::select! {
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                    Ok(InboundFrame::Command(envelope)) => follower.handle_command(envelope),
                    Ok(InboundFrame::Status(_)) => {
                        debug!("Ignoring status report echoed to a client");
                    }
                    Err(e) => warn!("Dropping unparseable frame: {e}"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let graceful = frame
                        .as_ref()
                        .is_some_and(|f| f.code == CloseCode::Normal);
                    return if graceful { PumpExit::Graceful } else { PumpExit::Lost };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Sync channel receive error: {e}");
                    return PumpExit::Lost;
                }
                None => return PumpExit::Lost,
            },
            report = outbox.recv() => match report {
                Some(report) => {
                    let text = match serde_json::to_string(&report) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Status report serialization failed: {e}");
                            continue;
                        }
                    };
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        return PumpExit::Lost;
                    }
                }
                // Follower dropped its sender; nothing left to do.
                None => return PumpExit::Graceful,
            },
        }
    }
}
