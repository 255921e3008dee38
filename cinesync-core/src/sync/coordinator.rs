//! Master-side sync coordination.
//!
//! The coordinator owns the authoritative timeline and the device
//! roster. It emits command envelopes through a narrow
//! [`CommandOutbound`] seam implemented by the transport hub, and the
//! transport feeds inbound frames back in through
//! [`SyncCoordinator::handle_status_report`]; neither module imports
//! the other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cinesync_proto::{now_ms, CommandEnvelope, StatusReport};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::timeline::MasterTimeline;
use crate::config::SyncConfig;
use crate::engine::PlaybackEngine;
use crate::models::{DeviceDescriptor, DeviceId, MovieId};

/// Outbound half of the command transport, as seen by the coordinator.
pub trait CommandOutbound: Send + Sync {
    /// Fan the envelope out to every connected client; returns the
    /// number of frames successfully enqueued.
    fn broadcast(&self, envelope: &CommandEnvelope) -> usize;

    /// Tear down the channel of a client removed from the roster.
    fn drop_client(&self, device_id: &DeviceId);
}

#[derive(Debug, Clone)]
struct RosterEntry {
    descriptor: DeviceDescriptor,
    drift_ms: i64,
    buffer_percentage: u8,
    is_playing: bool,
    last_seen: DateTime<Utc>,
    load_sent_at: Option<DateTime<Utc>>,
}

/// Point-in-time roster view with per-device diagnostics.
#[derive(Debug, Clone)]
pub struct RosterStatus {
    pub descriptor: DeviceDescriptor,
    pub drift_ms: i64,
    pub buffer_percentage: u8,
    pub is_playing: bool,
    pub last_seen: DateTime<Utc>,
    /// Diagnostic string when the device is in a degraded state.
    pub degraded: Option<String>,
}

/// Master-side sync coordinator.
pub struct SyncCoordinator {
    master_id: DeviceId,
    config: SyncConfig,
    engine: Arc<dyn PlaybackEngine>,
    outbound: Arc<dyn CommandOutbound>,
    timeline: RwLock<MasterTimeline>,
    roster: RwLock<HashMap<DeviceId, RosterEntry>>,
    loaded: RwLock<Option<(MovieId, String)>>,
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(
        master_id: DeviceId,
        config: SyncConfig,
        engine: Arc<dyn PlaybackEngine>,
        outbound: Arc<dyn CommandOutbound>,
    ) -> Self {
        Self {
            master_id,
            config,
            engine,
            outbound,
            timeline: RwLock::new(MasterTimeline::idle()),
            roster: RwLock::new(HashMap::new()),
            loaded: RwLock::new(None),
        }
    }

    /// Add a freshly joined client to the roster.
    pub fn register_client(&self, descriptor: DeviceDescriptor) {
        let device_id = descriptor.device_id.clone();
        let load_sent_at = self.loaded.read().as_ref().map(|_| Utc::now());
        self.roster.write().insert(
            device_id.clone(),
            RosterEntry {
                descriptor,
                drift_ms: 0,
                buffer_percentage: 0,
                is_playing: false,
                last_seen: Utc::now(),
                load_sent_at,
            },
        );
        info!(device_id = %device_id, "Client joined roster");
    }

    pub fn unregister_client(&self, device_id: &DeviceId) {
        if self.roster.write().remove(device_id).is_some() {
            info!(device_id = %device_id, "Client left roster");
        }
    }

    /// Refresh the authoritative timeline from the engine.
    pub fn sample_timeline(&self) {
        let sampled = MasterTimeline {
            position_ms: self.engine.position_ms(),
            sampled_at_ms: now_ms(),
            is_playing: self.engine.is_playing(),
        };
        *self.timeline.write() = sampled;
    }

    #[must_use]
    pub fn timeline(&self) -> MasterTimeline {
        *self.timeline.read()
    }

    #[must_use]
    pub fn loaded_movie(&self) -> Option<(MovieId, String)> {
        self.loaded.read().clone()
    }

    /// Announce the selected video to every client.
    pub fn load(&self, movie_id: &MovieId, stream_url: &str) {
        *self.loaded.write() = Some((movie_id.clone(), stream_url.to_string()));
        let now = Utc::now();
        for entry in self.roster.write().values_mut() {
            entry.descriptor.is_ready = false;
            entry.load_sent_at = Some(now);
        }
        let envelope = CommandEnvelope::load(self.master_id.as_str(), movie_id.as_str(), stream_url);
        self.broadcast(&envelope);
    }

    /// First play after load. Returns the target start time so the UI
    /// can count down to it.
    pub fn start(self: &Arc<Self>) -> i64 {
        let target = now_ms() + self.config.lead_ms as i64;
        let position = self.engine.position_ms();
        let envelope = CommandEnvelope::start(self.master_id.as_str(), position, target);
        self.broadcast(&envelope);
        self.play_at_target(target);
        target
    }

    /// Resume from pause; same predictive-start scheme as `start`.
    pub fn play(self: &Arc<Self>) -> i64 {
        let target = now_ms() + self.config.lead_ms as i64;
        let position = self.engine.position_ms();
        let envelope = CommandEnvelope::play(self.master_id.as_str(), position, target);
        self.broadcast(&envelope);
        self.play_at_target(target);
        target
    }

    pub fn pause(&self) {
        self.engine.pause();
        self.sample_timeline();
        let envelope = CommandEnvelope::pause(self.master_id.as_str(), self.engine.position_ms());
        self.broadcast(&envelope);
    }

    pub fn seek(&self, position_ms: i64) {
        self.engine.seek(position_ms);
        self.sample_timeline();
        let envelope = CommandEnvelope::seek(self.master_id.as_str(), position_ms);
        self.broadcast(&envelope);
    }

    /// One sync_check emission; no-op unless playing.
    pub fn sync_check_tick(&self) {
        self.sample_timeline();
        let timeline = self.timeline();
        if !timeline.is_playing {
            return;
        }
        let envelope =
            CommandEnvelope::sync_check(self.master_id.as_str(), timeline.position_ms);
        self.broadcast(&envelope);
    }

    /// Inbound status report from a client.
    pub fn handle_status_report(&self, report: &StatusReport) {
        let device_id = DeviceId::from_string(report.client_id.clone());
        let mut roster = self.roster.write();
        let Some(entry) = roster.get_mut(&device_id) else {
            debug!(client_id = %report.client_id, "Status report from unknown client");
            return;
        };
        entry.descriptor.is_ready = report.is_ready;
        entry.drift_ms = report.drift;
        entry.buffer_percentage = report.buffer_percentage;
        entry.is_playing = report.is_playing;
        entry.last_seen = Utc::now();
        debug!(
            client_id = %report.client_id,
            drift_ms = report.drift,
            buffer = report.buffer_percentage,
            is_ready = report.is_ready,
            "Status report"
        );
    }

    /// Inbound command envelope from a client. Control is
    /// master-driven; the frame only refreshes liveness.
    pub fn handle_remote_command(&self, envelope: &CommandEnvelope) {
        let device_id = DeviceId::from_string(envelope.sender_id.clone());
        self.touch(&device_id);
        debug!(
            sender_id = %envelope.sender_id,
            action = envelope.action.as_str(),
            "Ignoring client-originated command"
        );
    }

    /// Refresh last-seen for a device, from any inbound frame.
    pub fn touch(&self, device_id: &DeviceId) {
        if let Some(entry) = self.roster.write().get_mut(device_id) {
            entry.last_seen = Utc::now();
        }
    }

    /// True when every rostered client reports ready. Gates the first
    /// start in the UI.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        self.roster
            .read()
            .values()
            .all(|entry| entry.descriptor.is_ready)
    }

    #[must_use]
    pub fn roster_snapshot(&self) -> Vec<RosterStatus> {
        let now = Utc::now();
        let ready_timeout = chrono::Duration::milliseconds(self.config.ready_timeout_ms as i64);
        let silence_timeout =
            chrono::Duration::milliseconds(self.config.silence_timeout_ms as i64);
        self.roster
            .read()
            .values()
            .map(|entry| {
                let degraded = if !entry.descriptor.is_ready
                    && entry
                        .load_sent_at
                        .is_some_and(|sent| now - sent > ready_timeout)
                {
                    Some(format!(
                        "not ready {} s after load",
                        self.config.ready_timeout_ms / 1_000
                    ))
                } else if now - entry.last_seen > silence_timeout {
                    Some(format!(
                        "no report for {} s",
                        (now - entry.last_seen).num_seconds()
                    ))
                } else {
                    None
                };
                RosterStatus {
                    descriptor: entry.descriptor.clone(),
                    drift_ms: entry.drift_ms,
                    buffer_percentage: entry.buffer_percentage,
                    is_playing: entry.is_playing,
                    last_seen: entry.last_seen,
                    degraded,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn roster_len(&self) -> usize {
        self.roster.read().len()
    }

    /// Drop clients silent past the timeout, then fan out.
    fn broadcast(&self, envelope: &CommandEnvelope) -> usize {
        self.prune_silent();
        let sent = self.outbound.broadcast(envelope);
        debug!(action = envelope.action.as_str(), sent, "Command broadcast");
        sent
    }

    fn prune_silent(&self) {
        let cutoff =
            Utc::now() - chrono::Duration::milliseconds(self.config.silence_timeout_ms as i64);
        let dead: Vec<DeviceId> = self
            .roster
            .read()
            .iter()
            .filter(|(_, entry)| entry.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if dead.is_empty() {
            return;
        }
        let mut roster = self.roster.write();
        for device_id in dead {
            warn!(device_id = %device_id, "Dropping silent client from roster");
            roster.remove(&device_id);
            self.outbound.drop_client(&device_id);
        }
    }

    /// Master honors its own target start time, like every follower.
    fn play_at_target(self: &Arc<Self>, target_ms: i64) {
        let delay = (target_ms - now_ms()).max(0) as u64;
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            coordinator.engine.play();
            coordinator.sample_timeline();
        });
    }

    /// Periodic tasks: timeline sampling and the sync_check cadence.
    pub fn spawn_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sampler = {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(
                    coordinator.config.sample_interval_ms,
                ));
                loop {
                    tick.tick().await;
                    coordinator.sample_timeline();
                }
            })
        };
        let sync_check = {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(
                    coordinator.config.sync_check_interval_ms,
                ));
                loop {
                    tick.tick().await;
                    coordinator.sync_check_tick();
                }
            })
        };
        vec![sampler, sync_check]
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("master_id", &self.master_id)
            .finish()
    }
}
