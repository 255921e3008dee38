//! LAN probe via the default-route trick: connecting a UDP socket to
//! a public address picks the outbound interface without sending a
//! packet.

use std::net::{IpAddr, UdpSocket};

use cinesync_core::probe::NetworkProbe;

pub struct SystemProbe;

impl NetworkProbe for SystemProbe {
    fn local_ipv4(&self) -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let addr = socket.local_addr().ok()?;
        match addr.ip() {
            IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip.to_string()),
            _ => None,
        }
    }

    fn is_wifi_connected(&self) -> bool {
        self.local_ipv4().is_some()
    }
}
