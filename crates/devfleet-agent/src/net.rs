//! Host address discovery.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

/// Address probed to pick the outbound interface. No packet is sent.
const PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// The IPv4 address of the interface that carries outbound traffic.
#[must_use]
pub fn outbound_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(PROBE_ADDR).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Host name or address announced for device endpoints.
///
/// An explicit, non-blank `configured` value wins; otherwise the outbound
/// interface address, then loopback.
#[must_use]
pub fn public_host(configured: Option<&str>) -> String {
    if let Some(host) = configured.map(str::trim).filter(|h| !h.is_empty()) {
        return host.to_string();
    }
    outbound_ipv4().map_or_else(
        || {
            debug!("No outbound interface, announcing loopback");
            Ipv4Addr::LOCALHOST.to_string()
        },
        |ip| ip.to_string(),
    )
}
