//! Server side of the command transport.
//!
//! One WebSocket endpoint at `/sync`. The join handshake happens on
//! upgrade: the client presents the session PIN and its descriptor in
//! the query string and receives a [`JoinReply`] as the first frame.
//! After that, text frames flow both ways: envelopes out through the
//! hub, status reports in to the coordinator.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use cinesync_core::models::{DeviceDescriptor, DeviceId};
use cinesync_proto::{decode_frame, InboundFrame, JoinReply};

use crate::hub::OutboundFrame;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync", get(sync_handler))
        .with_state(state)
}

/// Join parameters presented in the upgrade query string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncParams {
    pin: String,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

async fn sync_handler(
    Query(params): Query<SyncParams>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state, addr))
}

async fn handle_socket(
    mut socket: WebSocket,
    params: SyncParams,
    state: AppState,
    addr: SocketAddr,
) {
    // The rejection is deliberately reason-free; see the join reply
    // contract.
    if params.pin != state.session.pin {
        warn!(ip = %addr.ip(), "Join rejected");
        send_reply(&mut socket, &JoinReply::Rejected).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let device_id = params
        .device_id
        .filter(|id| !id.is_empty())
        .map_or_else(DeviceId::new, DeviceId::from_string);
    let display_name = params
        .display_name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("Guest-{}", &device_id.as_str()[..4.min(device_id.as_str().len())]));
    let descriptor = DeviceDescriptor::new(device_id.clone(), display_name, addr.ip().to_string());

    state.coordinator.register_client(descriptor);
    let connection_id = format!("ws_{}_{}", device_id.as_str(), nanoid::nanoid!(8));
    let mut outbound_rx = state.hub.subscribe(device_id.clone(), connection_id.clone());

    send_reply(&mut socket, &JoinReply::Accepted { session: state.snapshot() }).await;
    info!(
        device_id = %device_id,
        connection_id = %connection_id,
        ip = %addr.ip(),
        "Sync channel established"
    );

    let (mut sender, mut receiver) = socket.split();

    // Outbound: hub frames to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame {
                OutboundFrame::Envelope(envelope) => {
                    let text = match serde_json::to_string(&envelope) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Envelope serialization failed: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        warn!("Sync frame send failed, closing send loop");
                        break;
                    }
                }
                OutboundFrame::Shutdown => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: "Server shutting down".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Inbound: frames dispatched by shape; parse failures are logged
    // and dropped without tearing the channel down.
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                Ok(InboundFrame::Command(envelope)) => {
                    state.coordinator.handle_remote_command(&envelope);
                }
                Ok(InboundFrame::Status(report)) => {
                    state.coordinator.handle_status_report(&report);
                }
                Err(e) => {
                    warn!(device_id = %device_id, "Dropping unparseable frame: {e}");
                }
            },
            Ok(Message::Close(_)) => {
                debug!(device_id = %device_id, "Sync channel closed by client");
                break;
            }
            Ok(Message::Binary(_)) | Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(device_id = %device_id, "Sync channel error: {e}");
                break;
            }
        }
    }

    send_task.abort();
    state.hub.unsubscribe(&connection_id);
    state.coordinator.unregister_client(&device_id);
    info!(device_id = %device_id, "Sync channel closed");
}

async fn send_reply(socket: &mut WebSocket, reply: &JoinReply) {
    match serde_json::to_string(reply) {
        Ok(text) => {
            let _ = socket.send(Message::Text(text.into())).await;
        }
        Err(e) => warn!("Join reply serialization failed: {e}"),
    }
}
