use chrono::{DateTime, Utc};
use cinesync_proto::DeviceInfo;
use serde::{Deserialize, Serialize};

use super::id::DeviceId;

/// Descriptor of a participating device.
///
/// `is_ready` means the device's playback engine reports it is
/// buffered and paused at the requested position; only the master's
/// coordinator mutates it, from inbound status reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub device_id: DeviceId,
    pub display_name: String,
    pub ip: String,
    pub connected_at: DateTime<Utc>,
    pub is_ready: bool,
}

impl DeviceDescriptor {
    #[must_use]
    pub fn new(device_id: DeviceId, display_name: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            device_id,
            display_name: display_name.into(),
            ip: ip.into(),
            connected_at: Utc::now(),
            is_ready: false,
        }
    }

    /// Wire representation for the session snapshot.
    #[must_use]
    pub fn to_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_id: self.device_id.to_string(),
            display_name: self.display_name.clone(),
            ip: self.ip.clone(),
            connected_at: self.connected_at.timestamp_millis(),
            is_ready: self.is_ready,
        }
    }
}
