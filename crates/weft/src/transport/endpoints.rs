// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-process TCP endpoints.
//!
//! Each process owns:
//!
//! - a **publish listener** — subscribers connect here; topic frames
//!   written by local publishers fan out to every connected subscriber;
//! - a **reply listener** — requesters connect here; requests are
//!   dispatched to the local replier and answered on the same
//!   connection;
//! - **outbound connections** to remote publish listeners (inbound topic
//!   data) and remote reply listeners (outgoing requests), keyed by
//!   address;
//! - a **control path** — a `mio::Waker` plus a command channel waking
//!   the receive loop for administrative events (new subscription,
//!   shutdown).
//!
//! All socket I/O happens on one background thread (`weft-io`); the
//! methods here only enqueue commands. Inbound frames are handed to a
//! [`FrameHandler`] sequentially on the I/O thread; handlers must not
//! block.

use super::codec::StreamCodec;
use super::io_thread::{IoThread, WAKER_TOKEN};
use crate::protocol::DataFrame;
use crossbeam::channel::{self, Sender};
use mio::net::TcpListener;
use mio::{Poll, Waker};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Sink for inbound data-plane frames, invoked on the I/O thread.
pub trait FrameHandler: Send + Sync {
    /// A topic message arrived from a remote publisher.
    fn on_message(&self, frame: DataFrame);

    /// A service request arrived; returns the response frame body to
    /// write back on the same connection.
    fn on_request(&self, frame: DataFrame) -> Vec<u8>;

    /// A service response arrived for one of our requests.
    fn on_response(&self, frame: DataFrame);
}

/// Commands accepted by the I/O thread.
pub(crate) enum Command {
    /// Write a framed message to every connected subscriber.
    Broadcast(Vec<u8>),
    /// Ensure a connection to a remote publish listener for a topic.
    ConnectPublisher { topic: String, addr: SocketAddr },
    /// Drop a topic's claim on its publisher connections; close the ones
    /// nobody needs anymore.
    DisconnectTopic { topic: String },
    /// Close the connection to a vanished peer.
    DisconnectAddr { addr: SocketAddr },
    /// Send a framed request to a remote reply listener.
    SendRequest { addr: SocketAddr, frame: Vec<u8> },
    /// Stop the I/O thread.
    Shutdown,
}

/// The per-process transport endpoints.
pub struct Endpoints {
    publish_address: String,
    reply_address: String,
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<()>>,
}

impl Endpoints {
    /// Bind both listeners and start the receive loop.
    ///
    /// Listeners bind `0.0.0.0` on ephemeral ports; `advertise_ip` is
    /// the address announced to peers.
    pub fn start(advertise_ip: Ipv4Addr, handler: Arc<dyn FrameHandler>) -> io::Result<Self> {
        let mut publish_listener =
            TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        let mut reply_listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;

        let publish_address =
            format!("{}:{}", advertise_ip, publish_listener.local_addr()?.port());
        let reply_address = format!("{}:{}", advertise_ip, reply_listener.local_addr()?.port());

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = channel::unbounded();

        let io = IoThread::new(
            poll,
            cmd_rx,
            handler,
            &mut publish_listener,
            &mut reply_listener,
        )?;

        let handle = thread::Builder::new()
            .name("weft-io".to_string())
            .spawn(move || io.run(publish_listener, reply_listener))?;

        log::debug!(
            "[endpoints] publish at {} reply at {}",
            publish_address,
            reply_address
        );

        Ok(Self {
            publish_address,
            reply_address,
            cmd_tx,
            waker,
            handle: Some(handle),
        })
    }

    /// Address subscribers connect to, as announced to peers.
    pub fn publish_address(&self) -> &str {
        &self.publish_address
    }

    /// Address requesters connect to, as announced to peers.
    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    /// Fan a frame body out to every connected subscriber.
    pub fn broadcast(&self, frame_body: &[u8]) {
        self.send_command(Command::Broadcast(StreamCodec::encode(frame_body)));
    }

    /// Connect (or add a topic claim) to a remote publish listener.
    pub fn connect_publisher(&self, topic: &str, addr: &str) {
        let Some(addr) = parse_addr(addr) else { return };
        self.send_command(Command::ConnectPublisher {
            topic: topic.to_string(),
            addr,
        });
    }

    /// Release a topic's claim on its publisher connections.
    pub fn disconnect_topic(&self, topic: &str) {
        self.send_command(Command::DisconnectTopic {
            topic: topic.to_string(),
        });
    }

    /// Drop the connection to a vanished peer endpoint.
    pub fn disconnect_addr(&self, addr: &str) {
        let Some(addr) = parse_addr(addr) else { return };
        self.send_command(Command::DisconnectAddr { addr });
    }

    /// Send a request frame body to a remote reply listener.
    pub fn send_request(&self, addr: &str, frame_body: &[u8]) {
        let Some(addr) = parse_addr(addr) else { return };
        self.send_command(Command::SendRequest {
            addr,
            frame: StreamCodec::encode(frame_body),
        });
    }

    fn send_command(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            log::debug!("[endpoints] command dropped: I/O thread gone");
            return;
        }
        if let Err(e) = self.waker.wake() {
            log::debug!("[endpoints] wake failed: {}", e);
        }
    }
}

impl Drop for Endpoints {
    fn drop(&mut self) {
        self.send_command(Command::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        log::debug!("[endpoints] stopped");
    }
}

fn parse_addr(addr: &str) -> Option<SocketAddr> {
    match addr.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            log::debug!("[endpoints] ignoring unparseable peer address '{}'", addr);
            None
        }
    }
}
