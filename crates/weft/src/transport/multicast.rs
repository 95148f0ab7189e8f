// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast socket construction and interface discovery.
//!
//! Discovery sockets are bound with address (and, on Unix, port) reuse so
//! several fabric processes can coexist on one host, and join the group
//! on every non-loopback interface. Join failures on individual
//! interfaces are non-fatal: a host with no multicast route still runs,
//! it just won't see remote peers.

use crate::config::SOCKET_READ_TIMEOUT_MS;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

/// Build a discovery socket bound to `0.0.0.0:port`, joined to `group`.
pub fn discovery_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;

    let socket: UdpSocket = socket.into();
    join_multicast_group(&socket, group);
    socket.set_read_timeout(Some(Duration::from_millis(SOCKET_READ_TIMEOUT_MS)))?;
    Ok(socket)
}

/// Join `group` on all suitable interfaces.
///
/// Mirrors what mature DDS stacks do: one membership per interface, with
/// per-interface failures logged and skipped.
fn join_multicast_group(socket: &UdpSocket, group: Ipv4Addr) {
    let interfaces = local_ipv4_addresses();

    if interfaces.is_empty() {
        if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            log::debug!("[multicast] join {} on UNSPECIFIED failed: {}", group, e);
        }
    } else {
        for iface in &interfaces {
            match socket.join_multicast_v4(&group, iface) {
                Ok(()) => {
                    log::debug!("[multicast] joined {} on {}", group, iface);
                }
                Err(e) if e.raw_os_error() == Some(98) => {
                    // EADDRINUSE: already joined on the same physical NIC
                }
                Err(e) => {
                    log::debug!("[multicast] join {} on {} failed (non-fatal): {}", group, iface, e);
                }
            }
        }
    }

    if let Err(e) = socket.set_multicast_loop_v4(true) {
        log::debug!("[multicast] enabling loopback failed: {}", e);
    }
    let _ = socket.set_multicast_ttl_v4(1);
}

/// All non-loopback IPv4 addresses of this host.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[multicast] listing interfaces failed: {}", e);
            return Vec::new();
        }
    };

    let mut addrs = Vec::new();
    for (_name, ip) in interfaces {
        if let IpAddr::V4(ipv4) = ip {
            if !ipv4.is_loopback() {
                addrs.push(ipv4);
            }
        }
    }
    addrs
}

/// Whether a source address belongs to this host (loopback included).
pub fn is_local_address(ip: IpAddr, local: &[Ipv4Addr]) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || local.contains(&v4),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// The IP advertised to peers: explicit override, else the primary
/// interface, else loopback.
pub fn advertised_ip(ip_override: Option<Ipv4Addr>) -> Ipv4Addr {
    if let Some(ip) = ip_override {
        return ip;
    }
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => ip,
        Ok(IpAddr::V6(_)) | Err(_) => {
            let addrs = local_ipv4_addresses();
            addrs.first().copied().unwrap_or(Ipv4Addr::LOCALHOST)
        }
    }
}
