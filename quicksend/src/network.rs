//! Host address discovery and port selection.

use quicksend_core::auth::LocalAddress;
use std::env;
use std::net::{IpAddr, TcpListener, UdpSocket};
use tracing::debug;

/// Best guess at this machine's LAN address.
///
/// `HOST_IP` or `LAN_IP` win when set; otherwise the address the OS would
/// route external traffic from is used. No packet is sent by the probe.
pub fn lan_ip() -> Option<IpAddr> {
    lan_ip_with(|key| env::var(key).ok())
}

pub fn lan_ip_with(lookup: impl Fn(&str) -> Option<String>) -> Option<IpAddr> {
    for key in ["HOST_IP", "LAN_IP"] {
        if let Some(ip) = lookup(key).and_then(|v| v.trim().parse::<IpAddr>().ok()) {
            return Some(ip);
        }
    }
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => Some(ip),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "route probe failed");
            None
        }
    }
}

/// [`LocalAddress`] backed by [`lan_ip`], re-resolved on each call.
#[derive(Clone, Copy, Debug, Default)]
pub struct LanAddress;

impl LocalAddress for LanAddress {
    fn current(&self) -> Option<IpAddr> {
        lan_ip()
    }
}

/// First port in `start..=start + 100` that can be bound on `host`.
pub fn find_free_port(host: IpAddr, start: u16) -> Option<u16> {
    (start..=start.saturating_add(100)).find(|port| TcpListener::bind((host, *port)).is_ok())
}
