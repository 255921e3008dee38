//! Client-side sync following.
//!
//! The follower applies master commands to the local playback engine,
//! measures drift against the expected position, and corrects it with
//! the graded controller. Commands arrive in channel order; any
//! playback-altering command aborts an in-flight correction and any
//! pending scheduled play.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cinesync_proto::{now_ms, CommandAction, CommandEnvelope, StatusReport};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::drift::{CorrectionAction, DriftController, DriftQuality};
use super::timeline::MasterTimeline;
use crate::clock::ClockOffset;
use crate::config::SyncConfig;
use crate::engine::PlaybackEngine;
use crate::models::DeviceId;

/// Outbound half of the command transport, as seen by the follower.
pub trait StatusOutbound: Send + Sync {
    /// Enqueue one status report; returns false when the channel is
    /// down (the report is dropped, not retried).
    fn send(&self, report: &StatusReport) -> bool;
}

/// Follower state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    Idle,
    Loading,
    Ready,
    ScheduledPlay,
    Playing,
    Paused,
    Seeking,
    Closed,
}

impl FollowerState {
    /// Ready means buffered with no unapplied load/seek outstanding.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::ScheduledPlay | Self::Playing | Self::Paused
        )
    }
}

struct FollowerInner {
    state: FollowerState,
    /// State to restore when an explicit seek completes.
    resume_state: FollowerState,
    /// Master timeline with `sampled_at_ms` in the local wall clock.
    master: Option<MasterTimeline>,
    clock: ClockOffset,
    controller: DriftController,
    /// Bumped by every playback-altering command; cancels stale
    /// scheduled plays.
    generation: u64,
    played_once: bool,
    last_drift_ms: i64,
}

/// Client-side sync follower.
pub struct SyncFollower {
    client_id: DeviceId,
    config: SyncConfig,
    engine: Arc<dyn PlaybackEngine>,
    outbound: Arc<dyn StatusOutbound>,
    inner: Mutex<FollowerInner>,
}

impl SyncFollower {
    #[must_use]
    pub fn new(
        client_id: DeviceId,
        config: SyncConfig,
        engine: Arc<dyn PlaybackEngine>,
        outbound: Arc<dyn StatusOutbound>,
    ) -> Self {
        let controller = DriftController::new(&config);
        Self {
            client_id,
            config,
            engine,
            outbound,
            inner: Mutex::new(FollowerInner {
                state: FollowerState::Idle,
                resume_state: FollowerState::Paused,
                master: None,
                clock: ClockOffset::default(),
                controller,
                generation: 0,
                played_once: false,
                last_drift_ms: 0,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> FollowerState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn last_drift_ms(&self) -> i64 {
        self.inner.lock().last_drift_ms
    }

    /// Apply one command from the channel.
    pub fn handle_command(self: &Arc<Self>, envelope: CommandEnvelope) {
        let mut inner = self.inner.lock();
        if inner.state == FollowerState::Closed {
            return;
        }
        inner.clock.observe(envelope.timestamp);

        if envelope.action == CommandAction::SyncCheck {
            // Refreshes the expected-position baseline; never touches
            // playback or an in-flight correction.
            if let Some(position) = envelope.video_position {
                inner.master = Some(MasterTimeline {
                    position_ms: position,
                    sampled_at_ms: inner.clock.to_local(envelope.timestamp),
                    is_playing: true,
                });
            }
            drop(inner);
            self.send_report();
            return;
        }

        inner.generation += 1;
        let generation = inner.generation;
        if inner.controller.abort() {
            self.engine.set_rate(1.0);
        }

        match envelope.action {
            CommandAction::Load => {
                let Some(stream_url) = envelope.stream_url().map(str::to_string) else {
                    warn!("load command without stream URL, dropping");
                    return;
                };
                inner.state = FollowerState::Loading;
                inner.played_once = false;
                inner.controller.reset();
                inner.master = Some(MasterTimeline {
                    position_ms: 0,
                    sampled_at_ms: now_ms(),
                    is_playing: false,
                });
                drop(inner);
                debug!(url = %stream_url, "Loading stream");
                self.engine.prepare(&stream_url, 0);
                self.send_report();
            }
            CommandAction::Start | CommandAction::Play => {
                let position = envelope.video_position.unwrap_or(0);
                let target_local = envelope
                    .target_start_time
                    .map(|t| inner.clock.to_local(t));
                inner.master = Some(MasterTimeline {
                    position_ms: position,
                    sampled_at_ms: target_local.unwrap_or_else(now_ms),
                    is_playing: true,
                });
                inner.state = FollowerState::ScheduledPlay;
                drop(inner);
                if envelope.video_position.is_some() {
                    self.engine.seek(position);
                }
                self.schedule_play(generation, target_local);
            }
            CommandAction::Pause => {
                let position = envelope
                    .video_position
                    .unwrap_or_else(|| self.engine.position_ms());
                inner.master = Some(MasterTimeline {
                    position_ms: position,
                    sampled_at_ms: now_ms(),
                    is_playing: false,
                });
                inner.state = FollowerState::Paused;
                drop(inner);
                self.engine.pause();
                self.engine.set_rate(1.0);
                self.send_report();
            }
            CommandAction::Seek => {
                let Some(position) = envelope.seek_position else {
                    warn!("seek command without position, dropping");
                    return;
                };
                inner.resume_state = match inner.state {
                    FollowerState::Playing | FollowerState::ScheduledPlay => FollowerState::Playing,
                    FollowerState::Ready => FollowerState::Ready,
                    _ => FollowerState::Paused,
                };
                inner.state = FollowerState::Seeking;
                let sampled_at = inner.clock.to_local(envelope.timestamp);
                if let Some(master) = inner.master.as_mut() {
                    master.position_ms = position;
                    master.sampled_at_ms = sampled_at;
                }
                drop(inner);
                self.engine.seek(position);
                self.send_report();
            }
            CommandAction::SyncCheck => unreachable!("handled above"),
        }
    }

    /// Host engine reports buffered-and-paused at the prepared position.
    pub fn on_engine_ready(&self) {
        let mut inner = self.inner.lock();
        if inner.state == FollowerState::Loading {
            inner.state = FollowerState::Ready;
        }
        drop(inner);
        self.send_report();
    }

    /// Host engine reports an explicit seek finished.
    pub fn on_engine_seek_complete(&self) {
        let mut inner = self.inner.lock();
        if inner.state != FollowerState::Seeking {
            return;
        }
        let resume = inner.resume_state;
        inner.state = resume;
        drop(inner);
        if resume == FollowerState::Playing && !self.engine.is_playing() {
            self.engine.play();
        }
        self.send_report();
    }

    /// Session end or unrecoverable channel loss.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = FollowerState::Closed;
        drop(inner);
        self.engine.pause();
    }

    /// Current drift against the expected master position, in ms.
    /// Positive means this client is ahead.
    #[must_use]
    pub fn drift_sample(&self) -> Option<(i64, i64)> {
        let inner = self.inner.lock();
        let master = inner.master?;
        drop(inner);
        let expected = master.expected_position(now_ms());
        let drift = self.engine.position_ms() - expected;
        Some((drift, expected))
    }

    /// One drift-monitor tick: measure, classify, correct.
    pub fn correction_tick(self: &Arc<Self>) {
        if self.state() != FollowerState::Playing {
            return;
        }
        let Some((drift, expected)) = self.drift_sample() else {
            return;
        };

        let mut inner = self.inner.lock();
        inner.last_drift_ms = drift;
        let action = inner.controller.evaluate(drift, expected, Instant::now());
        drop(inner);

        let quality = DriftQuality::classify(drift);
        debug!(drift_ms = drift, quality = quality.as_str(), "Drift sample");

        match action {
            CorrectionAction::SetRate(rate) => {
                debug!(rate, drift_ms = drift, "Adjusting playback rate");
                self.engine.set_rate(rate);
            }
            CorrectionAction::ResetRate => {
                debug!("Drift back in deadband, restoring rate 1.0");
                self.engine.set_rate(1.0);
            }
            CorrectionAction::Seek(position) => {
                debug!(position, drift_ms = drift, "Seeking to expected position");
                self.engine.seek(position);
                self.inner.lock().last_drift_ms = 0;
            }
            CorrectionAction::None => {}
        }
    }

    /// Build and send one status report.
    pub fn send_report(&self) {
        let (state, drift) = {
            let inner = self.inner.lock();
            (inner.state, inner.last_drift_ms)
        };
        if state == FollowerState::Closed {
            return;
        }
        let buffer_percentage = match state {
            FollowerState::Idle | FollowerState::Loading => 0,
            _ => 100,
        };
        let report = StatusReport {
            client_id: self.client_id.to_string(),
            video_position: self.engine.position_ms(),
            is_playing: self.engine.is_playing(),
            drift,
            buffer_percentage,
            is_ready: state.is_ready(),
            timestamp: now_ms(),
        };
        if !self.outbound.send(&report) {
            debug!("Status channel down, report dropped");
        }
    }

    fn schedule_play(self: &Arc<Self>, generation: u64, target_local_ms: Option<i64>) {
        let delay = target_local_ms.map_or(0, |t| (t - now_ms()).max(0));
        if delay == 0 {
            self.begin_playback(generation);
            return;
        }
        let follower = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            follower.begin_playback(generation);
        });
    }

    fn begin_playback(self: &Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != FollowerState::ScheduledPlay {
            return;
        }
        inner.state = FollowerState::Playing;
        if !inner.played_once {
            inner.played_once = true;
            inner.controller.on_playback_started(Instant::now());
        }
        drop(inner);
        self.engine.play();
        self.send_report();
    }

    /// Periodic tasks: the drift monitor and the ≥1 Hz report cadence.
    /// Both exit once the follower closes.
    pub fn spawn_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let monitor = {
            let follower = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(
                    follower.config.drift_interval_ms,
                ));
                loop {
                    tick.tick().await;
                    if follower.state() == FollowerState::Closed {
                        break;
                    }
                    follower.correction_tick();
                }
            })
        };
        let reporter = {
            let follower = Arc::clone(self);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_millis(
                    follower.config.report_interval_ms,
                ));
                loop {
                    tick.tick().await;
                    match follower.state() {
                        FollowerState::Closed => break,
                        FollowerState::Playing => follower.send_report(),
                        _ => {}
                    }
                }
            })
        };
        vec![monitor, reporter]
    }
}

impl std::fmt::Debug for SyncFollower {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncFollower")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ClockEngine;

    #[derive(Default)]
    struct RecordingStatus {
        reports: parking_lot::Mutex<Vec<StatusReport>>,
    }

    impl StatusOutbound for RecordingStatus {
        fn send(&self, report: &StatusReport) -> bool {
            self.reports.lock().push(report.clone());
            true
        }
    }

    struct Fixture {
        follower: Arc<SyncFollower>,
        engine: Arc<ClockEngine>,
        status: Arc<RecordingStatus>,
    }

    fn fixture() -> Fixture {
        let engine = Arc::new(ClockEngine::new(7_200_000));
        let status = Arc::new(RecordingStatus::default());
        let follower = Arc::new(SyncFollower::new(
            DeviceId::from_string("client-a".to_string()),
            SyncConfig::default(),
            engine.clone(),
            status.clone(),
        ));
        Fixture {
            follower,
            engine,
            status,
        }
    }

    fn load_envelope() -> CommandEnvelope {
        CommandEnvelope::load("master", "m1", "http://10.0.0.2:8080/video/m1")
    }

    /// Drive the fixture into Playing with a master timeline anchored
    /// at "now", then push playback start far enough into the past for
    /// the startup seek suppression to be over.
    fn playing_fixture() -> Fixture {
        let f = fixture();
        f.follower.handle_command(load_envelope());
        f.follower.on_engine_ready();
        f.follower
            .handle_command(CommandEnvelope::start("master", 0, now_ms()));
        assert_eq!(f.follower.state(), FollowerState::Playing);
        {
            let mut inner = f.follower.inner.lock();
            inner
                .controller
                .on_playback_started(Instant::now() - Duration::from_secs(30));
        }
        f
    }

    #[tokio::test]
    async fn load_then_ready_transitions() {
        let f = fixture();
        assert_eq!(f.follower.state(), FollowerState::Idle);

        f.follower.handle_command(load_envelope());
        assert_eq!(f.follower.state(), FollowerState::Loading);
        assert_eq!(
            f.engine.prepared_uri().as_deref(),
            Some("http://10.0.0.2:8080/video/m1")
        );

        // The load-time report is not ready; the ready one is.
        let first = f.status.reports.lock().last().cloned().unwrap();
        assert!(!first.is_ready);
        assert_eq!(first.buffer_percentage, 0);

        f.follower.on_engine_ready();
        assert_eq!(f.follower.state(), FollowerState::Ready);
        let second = f.status.reports.lock().last().cloned().unwrap();
        assert!(second.is_ready);
    }

    #[tokio::test]
    async fn start_with_past_target_plays_immediately() {
        let f = fixture();
        f.follower.handle_command(load_envelope());
        f.follower.on_engine_ready();

        f.follower
            .handle_command(CommandEnvelope::start("master", 5_000, now_ms() - 50));
        assert_eq!(f.follower.state(), FollowerState::Playing);
        assert!(f.engine.is_playing());
        assert!(f.engine.position_ms() >= 5_000);
    }

    #[tokio::test]
    async fn start_honors_future_target() {
        let f = fixture();
        f.follower.handle_command(load_envelope());
        f.follower.on_engine_ready();

        let target = now_ms() + 150;
        f.follower
            .handle_command(CommandEnvelope::start("master", 0, target));
        assert_eq!(f.follower.state(), FollowerState::ScheduledPlay);
        assert!(!f.engine.is_playing());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.follower.state(), FollowerState::Playing);
        assert!(f.engine.is_playing());
    }

    #[tokio::test]
    async fn pause_command_freezes_and_resets_rate() {
        let f = playing_fixture();
        f.engine.set_rate(0.96);

        f.follower
            .handle_command(CommandEnvelope::pause("master", 12_000));
        assert_eq!(f.follower.state(), FollowerState::Paused);
        assert!(!f.engine.is_playing());
        assert!((f.engine.rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn command_seek_round_trips_through_seeking() {
        let f = playing_fixture();

        f.follower
            .handle_command(CommandEnvelope::seek("master", 600_000));
        assert_eq!(f.follower.state(), FollowerState::Seeking);
        let report_state = f.status.reports.lock().last().cloned().unwrap();
        assert!(!report_state.is_ready, "seeking must clear the ready flag");

        f.follower.on_engine_seek_complete();
        assert_eq!(f.follower.state(), FollowerState::Playing);
        assert!(f.engine.is_playing());
        assert!(f.engine.position_ms() >= 600_000);
    }

    #[tokio::test]
    async fn speed_correction_engages_and_releases() {
        let f = playing_fixture();
        // Put the client 200 ms ahead of expected.
        f.engine.nudge(200);

        f.follower.correction_tick();
        assert!((f.engine.rate() - 0.96).abs() < 1e-9);

        // Drift shrinks below the deadband; the next tick (after the
        // speed cooldown) restores rate 1.0 without any seek.
        f.engine.nudge(-180);
        {
            let mut inner = f.follower.inner.lock();
            inner.controller.on_playback_started(Instant::now() - Duration::from_secs(60));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        f.follower.correction_tick();
        // Position drifts a little during the tick; rate should be
        // back at exactly 1.0.
        assert!((f.engine.rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn critical_drift_seeks_to_expected() {
        let f = playing_fixture();
        f.engine.nudge(1_500);

        f.follower.correction_tick();
        let (drift, _) = f.follower.drift_sample().unwrap();
        assert!(
            drift.abs() < 300,
            "after the correction the drift should be near zero, was {drift}"
        );
    }

    #[tokio::test]
    async fn seeks_suppressed_right_after_playback_starts() {
        let f = fixture();
        f.follower.handle_command(load_envelope());
        f.follower.on_engine_ready();
        f.follower
            .handle_command(CommandEnvelope::start("master", 0, now_ms()));
        assert_eq!(f.follower.state(), FollowerState::Playing);

        // Fresh playback: inside the 15 s window a critical drift is
        // met with a saturated rate nudge, not a seek.
        f.engine.nudge(2_000);
        f.follower.correction_tick();
        let (drift, _) = f.follower.drift_sample().unwrap();
        assert!(drift > 1_500, "no seek should have run, drift was {drift}");
        assert!((f.engine.rate() - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn command_aborts_engaged_rate_correction() {
        let f = playing_fixture();
        f.engine.nudge(200);
        f.follower.correction_tick();
        assert!((f.engine.rate() - 0.96).abs() < 1e-9);

        // Any playback-altering command restores rate 1.0.
        f.follower
            .handle_command(CommandEnvelope::seek("master", 90_000));
        assert!((f.engine.rate() - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn sync_check_reports_without_touching_playback() {
        let f = playing_fixture();
        f.engine.nudge(200);
        f.follower.correction_tick();
        let engaged_rate = f.engine.rate();
        assert!((engaged_rate - 0.96).abs() < 1e-9);

        let position = f.engine.position_ms();
        let before = f.status.reports.lock().len();
        f.follower
            .handle_command(CommandEnvelope::sync_check("master", position));
        assert_eq!(f.status.reports.lock().len(), before + 1);
        // The correction stays engaged across a sync_check.
        assert!((f.engine.rate() - engaged_rate).abs() < f64::EPSILON);
        assert_eq!(f.follower.state(), FollowerState::Playing);
    }

    #[tokio::test]
    async fn closed_follower_ignores_commands() {
        let f = playing_fixture();
        f.follower.close();
        assert_eq!(f.follower.state(), FollowerState::Closed);
        assert!(!f.engine.is_playing());

        f.follower
            .handle_command(CommandEnvelope::play("master", 0, now_ms()));
        assert_eq!(f.follower.state(), FollowerState::Closed);
        assert!(!f.engine.is_playing());
    }
}
