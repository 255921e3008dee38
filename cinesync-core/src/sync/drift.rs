//! Graded drift correction.
//!
//! The speed branch is a proportional controller clamped to
//! [0.95, 1.05] with a 100 ms deadband; the seek branch is a reset
//! governed by cooldowns. The two never operate simultaneously: while
//! seeks are suppressed (startup window or seek cooldown) a critical
//! drift falls back to a saturated rate nudge.

use std::time::{Duration, Instant};

use crate::config::SyncConfig;

/// Drift below this resets the rate to 1.0.
pub const RATE_DEADBAND_MS: i64 = 100;
/// Drift at or above this stops rate adjustment (hysteresis band).
pub const RATE_CEILING_MS: i64 = 500;
/// Drift at or above this corrects by seeking.
pub const SEEK_THRESHOLD_MS: i64 = 1_000;

/// Sync quality tier, reported for observability only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftQuality {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl DriftQuality {
    #[must_use]
    pub const fn classify(drift_ms: i64) -> Self {
        let magnitude = drift_ms.abs();
        if magnitude < 100 {
            Self::Excellent
        } else if magnitude < 300 {
            Self::Good
        } else if magnitude < SEEK_THRESHOLD_MS {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

/// What the follower should do about the current drift.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CorrectionAction {
    None,
    SetRate(f64),
    ResetRate,
    /// Seek to the expected position.
    Seek(i64),
}

/// Cooldown-governed decision state for one follower.
#[derive(Debug)]
pub struct DriftController {
    speed_cooldown: Duration,
    seek_cooldown: Duration,
    initial_cooldown: Duration,
    last_rate_change: Option<Instant>,
    last_seek: Option<Instant>,
    playback_started_at: Option<Instant>,
    rate_engaged: bool,
}

impl DriftController {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            speed_cooldown: Duration::from_millis(config.speed_cooldown_ms),
            seek_cooldown: Duration::from_millis(config.seek_cooldown_ms),
            initial_cooldown: Duration::from_millis(config.initial_playback_cooldown_ms),
            last_rate_change: None,
            last_seek: None,
            playback_started_at: None,
            rate_engaged: false,
        }
    }

    /// Target rate for a given drift: 2% per 100 ms, saturating.
    #[must_use]
    pub fn target_rate(drift_ms: i64) -> f64 {
        (1.0 - (drift_ms as f64 / 100.0) * 0.02).clamp(0.95, 1.05)
    }

    /// Record the first transition into playing; starts the window in
    /// which seeks are suppressed and only rate nudges run.
    pub fn on_playback_started(&mut self, now: Instant) {
        self.playback_started_at = Some(now);
    }

    /// Forget everything; used when a new video is loaded.
    pub fn reset(&mut self) {
        self.last_rate_change = None;
        self.last_seek = None;
        self.playback_started_at = None;
        self.rate_engaged = false;
    }

    /// Abort an in-flight correction. Returns true when a rate
    /// adjustment was engaged and the caller must restore rate 1.0.
    pub fn abort(&mut self) -> bool {
        std::mem::take(&mut self.rate_engaged)
    }

    #[must_use]
    pub const fn rate_engaged(&self) -> bool {
        self.rate_engaged
    }

    /// Decide the correction for one monitor tick.
    pub fn evaluate(&mut self, drift_ms: i64, expected_ms: i64, now: Instant) -> CorrectionAction {
        let magnitude = drift_ms.abs();

        if magnitude >= SEEK_THRESHOLD_MS {
            let startup_over = self
                .playback_started_at
                .is_some_and(|t| now.duration_since(t) >= self.initial_cooldown);
            let seek_allowed = self
                .last_seek
                .is_none_or(|t| now.duration_since(t) >= self.seek_cooldown);
            if startup_over && seek_allowed {
                self.last_seek = Some(now);
                self.rate_engaged = false;
                return CorrectionAction::Seek(expected_ms);
            }
            // Seek suppressed; nudge the rate at saturation instead.
            return self.rate_action(drift_ms, now);
        }

        if magnitude >= RATE_CEILING_MS {
            // Hysteresis band between the two correction methods.
            return CorrectionAction::None;
        }

        if magnitude >= RATE_DEADBAND_MS {
            return self.rate_action(drift_ms, now);
        }

        if self.rate_engaged {
            self.rate_engaged = false;
            return CorrectionAction::ResetRate;
        }
        CorrectionAction::None
    }

    fn rate_action(&mut self, drift_ms: i64, now: Instant) -> CorrectionAction {
        let in_cooldown = self
            .last_rate_change
            .is_some_and(|t| now.duration_since(t) < self.speed_cooldown);
        if in_cooldown {
            return CorrectionAction::None;
        }
        self.last_rate_change = Some(now);
        self.rate_engaged = true;
        CorrectionAction::SetRate(Self::target_rate(drift_ms))
    }
}
