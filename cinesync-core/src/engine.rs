//! Host playback engine contract.
//!
//! Decoding, surface binding and audio routing live in the host; the
//! core drives this narrow control surface and learns about engine
//! state through the follower's `on_engine_ready` / `on_seek_complete`
//! notifications. All methods are non-blocking for the caller.

use std::time::Instant;

use parking_lot::Mutex;

/// Control surface of the host playback engine.
///
/// `set_rate` must be honored within [0.5, 2.0]; the drift controller
/// only ever asks for [0.95, 1.05].
pub trait PlaybackEngine: Send + Sync {
    fn prepare(&self, uri: &str, start_ms: i64);
    fn play(&self);
    fn pause(&self);
    fn seek(&self, position_ms: i64);
    fn set_rate(&self, rate: f64);
    fn position_ms(&self) -> i64;
    fn duration_ms(&self) -> i64;
    fn is_playing(&self) -> bool;
    fn rate(&self) -> f64;
    fn stop(&self);
}

#[derive(Debug)]
struct ClockEngineState {
    prepared_uri: Option<String>,
    base_position_ms: i64,
    anchored_at: Instant,
    rate: f64,
    playing: bool,
    duration_ms: i64,
}

/// A playback engine that advances position by wall time.
///
/// Stands in where no real decoder is bound: the headless binary and
/// every sync test. Honors rate and seek exactly, which makes drift
/// scenarios reproducible.
#[derive(Debug)]
pub struct ClockEngine {
    state: Mutex<ClockEngineState>,
}

impl ClockEngine {
    #[must_use]
    pub fn new(duration_ms: i64) -> Self {
        Self {
            state: Mutex::new(ClockEngineState {
                prepared_uri: None,
                base_position_ms: 0,
                anchored_at: Instant::now(),
                rate: 1.0,
                playing: false,
                duration_ms,
            }),
        }
    }

    #[must_use]
    pub fn prepared_uri(&self) -> Option<String> {
        self.state.lock().prepared_uri.clone()
    }

    /// Skew the position by `delta_ms`; test hook for drift scenarios.
    pub fn nudge(&self, delta_ms: i64) {
        let mut state = self.state.lock();
        state.base_position_ms += delta_ms;
    }
}

fn fold_elapsed(state: &mut ClockEngineState) {
    if state.playing {
        let elapsed = state.anchored_at.elapsed().as_millis() as i64;
        state.base_position_ms += (elapsed as f64 * state.rate) as i64;
    }
    state.anchored_at = Instant::now();
}

impl PlaybackEngine for ClockEngine {
    fn prepare(&self, uri: &str, start_ms: i64) {
        let mut state = self.state.lock();
        state.prepared_uri = Some(uri.to_string());
        state.base_position_ms = start_ms;
        state.anchored_at = Instant::now();
        state.rate = 1.0;
        state.playing = false;
    }

    fn play(&self) {
        let mut state = self.state.lock();
        fold_elapsed(&mut state);
        state.playing = true;
    }

    fn pause(&self) {
        let mut state = self.state.lock();
        fold_elapsed(&mut state);
        state.playing = false;
    }

    fn seek(&self, position_ms: i64) {
        let mut state = self.state.lock();
        state.base_position_ms = position_ms;
        state.anchored_at = Instant::now();
    }

    fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        fold_elapsed(&mut state);
        state.rate = rate.clamp(0.5, 2.0);
    }

    fn position_ms(&self) -> i64 {
        let state = self.state.lock();
        if state.playing {
            let elapsed = state.anchored_at.elapsed().as_millis() as i64;
            state.base_position_ms + (elapsed as f64 * state.rate) as i64
        } else {
            state.base_position_ms
        }
    }

    fn duration_ms(&self) -> i64 {
        self.state.lock().duration_ms
    }

    fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.playing = false;
        state.base_position_ms = 0;
        state.rate = 1.0;
        state.prepared_uri = None;
    }
}
