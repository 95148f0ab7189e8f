// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # weft — a distributed messaging fabric
//!
//! Topic-based publish/subscribe and request/reply (service calls)
//! between processes on a host and across a local network, with
//! automatic peer discovery over UDP multicast. Applications create
//! [`Node`]s; the fabric resolves topic names to peers, routes messages
//! to interested subscribers, and dispatches service requests to a
//! deterministically chosen responder.
//!
//! ## Quick start
//!
//! ```no_run
//! use weft::{messages::StringMsg, Node, Scope};
//!
//! fn main() -> weft::Result<()> {
//!     let node = Node::new()?;
//!
//!     node.subscribe("/chatter", |topic: &str, msg: &StringMsg| {
//!         println!("[{}] {}", topic, msg.data);
//!     })?;
//!
//!     node.advertise("/chatter", Scope::All)?;
//!     node.publish("/chatter", &StringMsg::new("hello fabric"))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       Node API                               |
//! |  advertise / publish / subscribe / services / request        |
//! +--------------------------------------------------------------+
//! |  Handler registry          |  Discovery service              |
//! |  subscriptions, repliers,  |  multicast announce/subscribe,  |
//! |  pending requests          |  peer tables with leases        |
//! +--------------------------------------------------------------+
//! |                 Transport endpoints                          |
//! |  publish/reply TCP listeners, peer connections,              |
//! |  single receive thread (mio), control waker                  |
//! +--------------------------------------------------------------+
//! ```
//!
//! Topics and services are namespaced by **partition** (the `PARTITION`
//! environment variable, defaulting to `hostname:username`); unrelated
//! deployments on one network never see each other. Every advertisement
//! carries a [`Scope`] restricting who may connect.
//!
//! Messages within one process are delivered through an in-process
//! shortcut: the publisher's thread runs local subscription callbacks
//! directly, and a service request finding a local replier never
//! touches the network.

/// Runtime settings and the fabric's wire/timing constants.
pub mod config;
/// Multicast discovery: announcements, peer tables, leases.
pub mod discovery;
/// Error types surfaced by the fabric.
pub mod error;
/// The serialization seam between the fabric and user payloads.
pub mod message;
/// Built-in message types used by examples and tests.
pub mod messages;
/// The node runtime and its public API.
pub mod node;
/// Wire protocol: discovery datagrams and data-plane frames.
pub mod protocol;
/// Handler registry: subscriptions, repliers, pending requests.
pub mod registry;
/// Topic name validation and partition scoping.
pub mod topic;
/// TCP endpoints, stream framing, and the receive loop.
pub mod transport;

pub use config::Settings;
pub use discovery::{Publisher, Responder};
pub use error::{Error, Result};
pub use message::Message;
pub use node::Node;
pub use protocol::Scope;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
