// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes wire constants, timing defaults, and the
//! runtime [`Settings`] populated from environment variables. Constants
//! are never duplicated elsewhere.

use std::net::Ipv4Addr;

// =======================================================================
// Wire protocol constants
// =======================================================================

/// Discovery datagram version. Mismatched versions are dropped on receive.
pub const WIRE_VERSION: u16 = 1;

/// Default multicast group for discovery traffic.
pub const DEF_DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 7);

/// Default UDP port for topic discovery datagrams.
pub const DEF_MSG_DISCOVERY_PORT: u16 = 11319;

/// Default UDP port for service discovery datagrams.
pub const DEF_SRV_DISCOVERY_PORT: u16 = 11320;

/// Maximum accepted discovery datagram size.
///
/// Topic names, addresses, and type names all fit comfortably below the
/// ethernet MTU; anything larger is malformed.
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Maximum accepted data-plane frame size (anti-OOM bound).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =======================================================================
// Timing & lease
// =======================================================================

/// Period between announcement/heartbeat rounds (milliseconds).
pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Remote entry lease: a peer silent for 3 heartbeat periods is gone.
pub const PEER_TTL_MS: u64 = 3 * HEARTBEAT_INTERVAL_MS;

/// Read timeout on discovery sockets, bounds listener shutdown latency.
pub const SOCKET_READ_TIMEOUT_MS: u64 = 250;

// =======================================================================
// Runtime settings (environment)
// =======================================================================

/// Runtime settings, read once when the per-process runtime starts.
///
/// | Variable             | Meaning                              | Default               |
/// |----------------------|--------------------------------------|-----------------------|
/// | `PARTITION`          | namespace isolating deployments      | `hostname:username`   |
/// | `DISCOVERY_GROUP`    | multicast group                      | `224.0.0.7`           |
/// | `DISCOVERY_MSG_PORT` | topic discovery port                 | `11319`               |
/// | `DISCOVERY_SRV_PORT` | service discovery port               | `11320`               |
/// | `VERBOSE`            | `1` enables diagnostic logging       | off                   |
/// | `IP`                 | override the IP advertised to peers  | auto-detected         |
#[derive(Debug, Clone)]
pub struct Settings {
    /// Partition string namespacing all topics and services.
    pub partition: String,
    /// Multicast group for discovery.
    pub group: Ipv4Addr,
    /// UDP port for topic discovery.
    pub msg_port: u16,
    /// UDP port for service discovery.
    pub srv_port: u16,
    /// Diagnostic logging toggle.
    pub verbose: bool,
    /// Advertised IP override.
    pub ip_override: Option<Ipv4Addr>,
}

impl Settings {
    /// Build settings from the environment, falling back to defaults on
    /// missing or unparseable values.
    pub fn from_env() -> Self {
        let partition = std::env::var("PARTITION")
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(default_partition);

        let group = env_parse("DISCOVERY_GROUP").unwrap_or(DEF_DISCOVERY_GROUP);
        let msg_port = env_parse("DISCOVERY_MSG_PORT").unwrap_or(DEF_MSG_DISCOVERY_PORT);
        let srv_port = env_parse("DISCOVERY_SRV_PORT").unwrap_or(DEF_SRV_DISCOVERY_PORT);
        let verbose = std::env::var("VERBOSE").map(|v| v == "1").unwrap_or(false);
        let ip_override = env_parse("IP");

        Self {
            partition,
            group,
            msg_port,
            srv_port,
            verbose,
            ip_override,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            partition: default_partition(),
            group: DEF_DISCOVERY_GROUP,
            msg_port: DEF_MSG_DISCOVERY_PORT,
            srv_port: DEF_SRV_DISCOVERY_PORT,
            verbose: false,
            ip_override: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    match std::env::var(var) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::debug!("[config] ignoring unparseable {}='{}'", var, raw);
                None
            }
        },
        Err(_) => None,
    }
}

/// Default partition: `hostname:username`.
///
/// Deterministic per host/user so unrelated deployments on a shared
/// network do not see each other unless they opt in.
pub fn default_partition() -> String {
    format!("{}:{}", hostname(), username())
}

/// System hostname (Unix).
#[cfg(unix)]
fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY:
    // - buf is a valid mutable buffer of known size
    // - gethostname writes at most buf.len() bytes including the NUL
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "unknown".to_string();
    }

    // SAFETY: gethostname succeeded, so buf holds a NUL-terminated string.
    let name = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .into_owned();

    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

/// System hostname (Windows).
#[cfg(windows)]
fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
