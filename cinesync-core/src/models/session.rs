use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::device::DeviceDescriptor;
use super::id::{MovieId, SessionId};

/// A hosted watch-together session. Exactly one exists per master
/// process at a time; a new host action always mints a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// 6-digit PIN clients present on the sync channel handshake.
    pub pin: String,
    /// Shorter PIN protecting the upload endpoint, when enabled.
    pub upload_pin: Option<String>,
    pub master: DeviceDescriptor,
    pub movie_id: Option<MovieId>,
    pub stream_url: Option<String>,
    pub command_url: String,
    pub created_at: DateTime<Utc>,
}

/// Mint a PIN of `digits` decimal digits, uniform over the full range
/// (no leading zeros). Collision retry against previously-minted PINs
/// is the caller's job.
#[must_use]
pub fn mint_pin(digits: u32) -> String {
    let low = 10u32.pow(digits - 1);
    let high = 10u32.pow(digits);
    let pin = rand::thread_rng().gen_range(low..high);
    pin.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_pins_have_requested_width() {
        for _ in 0..200 {
            let pin = mint_pin(6);
            assert_eq!(pin.len(), 6);
            let value: u32 = pin.parse().unwrap();
            assert!((100_000..1_000_000).contains(&value));
        }
        for _ in 0..200 {
            assert_eq!(mint_pin(4).len(), 4);
        }
    }
}
