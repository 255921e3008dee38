use serde::{Deserialize, Serialize};

/// The authoritative playback timeline: position paired with the wall
/// clock at which it was sampled.
///
/// On the master the pair is refreshed from the engine every sampling
/// tick; on a follower it is rebuilt from each envelope, with the
/// sample instant mapped into the local wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterTimeline {
    pub position_ms: i64,
    pub sampled_at_ms: i64,
    pub is_playing: bool,
}

impl MasterTimeline {
    #[must_use]
    pub const fn idle() -> Self {
        Self {
            position_ms: 0,
            sampled_at_ms: 0,
            is_playing: false,
        }
    }

    /// Position the master should be at, extrapolated to `now_ms`.
    #[must_use]
    pub const fn expected_position(&self, now_ms: i64) -> i64 {
        if self.is_playing {
            self.position_ms + (now_ms - self.sampled_at_ms)
        } else {
            self.position_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playing_timeline_extrapolates() {
        let timeline = MasterTimeline {
            position_ms: 10_000,
            sampled_at_ms: 1_000,
            is_playing: true,
        };
        assert_eq!(timeline.expected_position(1_000), 10_000);
        assert_eq!(timeline.expected_position(3_500), 12_500);
    }

    #[test]
    fn paused_timeline_holds() {
        let timeline = MasterTimeline {
            position_ms: 10_000,
            sampled_at_ms: 1_000,
            is_playing: false,
        };
        assert_eq!(timeline.expected_position(99_000), 10_000);
    }
}
