//! Local address discovery.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Best-effort discovery of the address this host uses for outbound
/// traffic. No packets are sent; the socket is only "connected" so the
/// kernel picks the route. Falls back to loopback when the host has no
/// route at all.
#[must_use]
pub fn local_ip() -> IpAddr {
    discover().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn discover() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(("8.8.8.8", 53))?;
    Ok(socket.local_addr()?.ip())
}
