//! In-process hub fanning command envelopes out to connected clients.
//!
//! Each WebSocket connection subscribes with a bounded channel; the
//! coordinator broadcasts through the [`CommandOutbound`] seam without
//! knowing anything about sockets. Subscribers that stay full for too
//! many consecutive broadcasts are disconnected rather than allowed to
//! exert unbounded backpressure.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use cinesync_core::models::DeviceId;
use cinesync_core::sync::CommandOutbound;
use cinesync_proto::CommandEnvelope;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handle for a client connection subscription
pub type ConnectionId = String;

/// Capacity for per-subscriber message channels.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Consecutive drops before a slow subscriber is disconnected.
const MAX_CONSECUTIVE_DROPS: u32 = 10;

/// Frame pushed to a connection's send loop.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Envelope(CommandEnvelope),
    /// Close the socket with code 1000 "Server shutting down".
    Shutdown,
}

#[derive(Debug)]
struct Subscriber {
    device_id: DeviceId,
    sender: mpsc::Sender<OutboundFrame>,
    consecutive_drops: AtomicU32,
}

/// Connection hub for one session.
#[derive(Clone, Debug, Default)]
pub struct SessionHub {
    connections: Arc<DashMap<ConnectionId, Subscriber>>,
}

impl SessionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection; returns the receiver its send loop
    /// drains.
    pub fn subscribe(
        &self,
        device_id: DeviceId,
        connection_id: ConnectionId,
    ) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.connections.insert(
            connection_id.clone(),
            Subscriber {
                device_id: device_id.clone(),
                sender: tx,
                consecutive_drops: AtomicU32::new(0),
            },
        );
        info!(
            device_id = %device_id,
            connection_id = %connection_id,
            "Client subscribed to sync channel"
        );
        rx
    }

    pub fn unsubscribe(&self, connection_id: &str) {
        if let Some((_, subscriber)) = self.connections.remove(connection_id) {
            info!(
                device_id = %subscriber.device_id,
                connection_id = %connection_id,
                "Client unsubscribed from sync channel"
            );
        }
    }

    /// Fan one envelope out to every connection present right now.
    /// Returns the number of frames successfully enqueued.
    pub fn broadcast_envelope(&self, envelope: &CommandEnvelope) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        for entry in self.connections.iter() {
            let subscriber = entry.value();
            match subscriber
                .sender
                .try_send(OutboundFrame::Envelope(envelope.clone()))
            {
                Ok(()) => {
                    subscriber.consecutive_drops.store(0, Ordering::Relaxed);
                    sent_count += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let drops = subscriber.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                    if drops >= MAX_CONSECUTIVE_DROPS {
                        warn!(
                            device_id = %subscriber.device_id,
                            connection_id = %entry.key(),
                            consecutive_drops = drops,
                            "Disconnecting persistently slow subscriber"
                        );
                        failed_connections.push(entry.key().clone());
                    } else {
                        warn!(
                            device_id = %subscriber.device_id,
                            connection_id = %entry.key(),
                            "Subscriber channel full, dropping frame"
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(
                        device_id = %subscriber.device_id,
                        connection_id = %entry.key(),
                        "Subscriber channel closed, marking for cleanup"
                    );
                    failed_connections.push(entry.key().clone());
                }
            }
        }

        // Drop the iteration guards before mutating the map.
        for connection_id in failed_connections {
            self.unsubscribe(&connection_id);
        }

        debug!(
            action = envelope.action.as_str(),
            sent_count, "Envelope broadcast complete"
        );
        sent_count
    }

    /// Disconnect every connection belonging to a device.
    pub fn drop_device(&self, device_id: &DeviceId) {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().device_id == *device_id)
            .map(|entry| entry.key().clone())
            .collect();
        for connection_id in stale {
            self.unsubscribe(&connection_id);
        }
    }

    /// Graceful end: every send loop receives a shutdown frame and
    /// closes its socket with code 1000.
    pub fn shutdown_all(&self) {
        for entry in self.connections.iter() {
            let _ = entry.value().sender.try_send(OutboundFrame::Shutdown);
        }
        self.connections.clear();
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl CommandOutbound for SessionHub {
    fn broadcast(&self, envelope: &CommandEnvelope) -> usize {
        self.broadcast_envelope(envelope)
    }

    fn drop_client(&self, device_id: &DeviceId) {
        self.drop_device(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DeviceId {
        DeviceId::from_string(id.to_string())
    }

    fn envelope() -> CommandEnvelope {
        CommandEnvelope::pause("master", 1_000)
    }

    #[tokio::test]
    async fn broadcast_reaches_all_current_subscribers_once() {
        let hub = SessionHub::new();
        let mut rx1 = hub.subscribe(device("a"), "conn1".to_string());
        let mut rx2 = hub.subscribe(device("b"), "conn2".to_string());

        assert_eq!(hub.broadcast_envelope(&envelope()), 2);

        assert!(matches!(rx1.recv().await, Some(OutboundFrame::Envelope(_))));
        assert!(matches!(rx2.recv().await, Some(OutboundFrame::Envelope(_))));
        // Exactly once: nothing further is queued.
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_joiners_miss_earlier_broadcasts() {
        let hub = SessionHub::new();
        let mut rx1 = hub.subscribe(device("a"), "conn1".to_string());

        assert_eq!(hub.broadcast_envelope(&envelope()), 1);
        let mut rx2 = hub.subscribe(device("b"), "conn2".to_string());

        assert!(matches!(rx1.recv().await, Some(OutboundFrame::Envelope(_))));
        assert!(rx2.try_recv().is_err(), "late joiner must not see the frame");
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned_on_broadcast() {
        let hub = SessionHub::new();
        let rx = hub.subscribe(device("a"), "conn1".to_string());
        drop(rx);

        assert_eq!(hub.broadcast_envelope(&envelope()), 0);
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn drop_device_removes_all_its_connections() {
        let hub = SessionHub::new();
        let _rx1 = hub.subscribe(device("a"), "conn1".to_string());
        let _rx2 = hub.subscribe(device("a"), "conn2".to_string());
        let _rx3 = hub.subscribe(device("b"), "conn3".to_string());

        hub.drop_device(&device("a"));
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_sends_close_frames_and_clears() {
        let hub = SessionHub::new();
        let mut rx = hub.subscribe(device("a"), "conn1".to_string());

        hub.shutdown_all();
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Shutdown)));
        assert_eq!(hub.connection_count(), 0);
    }
}
