// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The single background receive loop.
//!
//! One `mio::Poll` drives both listeners, every peer connection, and the
//! control waker. The loop owns all sockets; other threads talk to it
//! exclusively through the command channel (woken via `mio::Waker`).
//!
//! mio is edge-triggered: reads drain until `WouldBlock`, writes flush
//! the outbox until `WouldBlock`, accepts loop until `WouldBlock`.
//! Inbound frames are parsed and handed to the [`FrameHandler`]
//! sequentially on this thread; no user-facing lock is held while
//! polling.

use super::codec::StreamCodec;
use super::endpoints::{Command, FrameHandler};
use crate::config::MAX_FRAME_SIZE;
use crate::protocol::DataFrame;
use crossbeam::channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const PUBLISH_LISTENER_TOKEN: Token = Token(0);
pub(crate) const REPLY_LISTENER_TOKEN: Token = Token(1);
pub(crate) const WAKER_TOKEN: Token = Token(2);
const FIRST_CONN_TOKEN: usize = 3;

/// What a connection is for; decides which frames are legal on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnKind {
    /// Accepted on the publish listener: a remote subscriber we write
    /// topic frames to.
    Subscriber,
    /// Accepted on the reply listener: a remote requester we read
    /// requests from and answer.
    Requester,
    /// Outbound to a remote publish listener: we read topic frames.
    Publisher,
    /// Outbound to a remote reply listener: we write requests and read
    /// responses.
    Responder,
}

struct Conn {
    stream: TcpStream,
    kind: ConnKind,
    codec: StreamCodec,
    outbox: VecDeque<Vec<u8>>,
    out_pos: usize,
    /// Topics that need this connection (outbound publisher conns).
    topics: HashSet<String>,
    /// Remote address we connected to (outbound conns).
    peer: Option<SocketAddr>,
    writable_registered: bool,
}

impl Conn {
    fn new(stream: TcpStream, kind: ConnKind, peer: Option<SocketAddr>) -> Self {
        Self {
            stream,
            kind,
            codec: StreamCodec::new(MAX_FRAME_SIZE),
            outbox: VecDeque::new(),
            out_pos: 0,
            topics: HashSet::new(),
            peer,
            writable_registered: false,
        }
    }
}

pub(crate) struct IoThread {
    poll: Poll,
    cmd_rx: Receiver<Command>,
    handler: Arc<dyn FrameHandler>,
    conns: HashMap<Token, Conn>,
    by_addr: HashMap<SocketAddr, Token>,
    next_token: usize,
}

impl IoThread {
    pub fn new(
        poll: Poll,
        cmd_rx: Receiver<Command>,
        handler: Arc<dyn FrameHandler>,
        publish_listener: &mut TcpListener,
        reply_listener: &mut TcpListener,
    ) -> io::Result<Self> {
        poll.registry()
            .register(publish_listener, PUBLISH_LISTENER_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(reply_listener, REPLY_LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            cmd_rx,
            handler,
            conns: HashMap::new(),
            by_addr: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
        })
    }

    /// Receive loop; returns on `Command::Shutdown`.
    pub fn run(mut self, mut publish_listener: TcpListener, mut reply_listener: TcpListener) {
        let mut events = Events::with_capacity(128);

        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(Duration::from_millis(500))) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::debug!("[io] poll failed: {}", e);
                return;
            }

            // Collect first: event handling needs &mut self.
            let batch: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in batch {
                match token {
                    PUBLISH_LISTENER_TOKEN => {
                        self.accept_loop(&mut publish_listener, ConnKind::Subscriber)
                    }
                    REPLY_LISTENER_TOKEN => {
                        self.accept_loop(&mut reply_listener, ConnKind::Requester)
                    }
                    WAKER_TOKEN => {}
                    token => self.conn_event(token, readable, writable),
                }
            }

            // Commands are drained every wakeup (waker events and poll
            // timeouts both land here).
            if self.drain_commands() {
                return;
            }
        }
    }

    fn accept_loop(&mut self, listener: &mut TcpListener, kind: ConnKind) {
        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::debug!("[io] register accepted conn failed: {}", e);
                        continue;
                    }
                    log::debug!("[io] accepted {:?} connection from {}", kind, peer);
                    self.conns.insert(token, Conn::new(stream, kind, None));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[io] accept failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Returns true on shutdown.
    fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Broadcast(frame) => {
                    let targets: Vec<Token> = self
                        .conns
                        .iter()
                        .filter(|(_, c)| c.kind == ConnKind::Subscriber)
                        .map(|(t, _)| *t)
                        .collect();
                    for token in targets {
                        self.queue_write(token, frame.clone());
                    }
                }

                Command::ConnectPublisher { topic, addr } => {
                    if let Some(&token) = self.by_addr.get(&addr) {
                        if let Some(conn) = self.conns.get_mut(&token) {
                            conn.topics.insert(topic);
                            continue;
                        }
                    }
                    match self.connect(addr, ConnKind::Publisher) {
                        Some(token) => {
                            if let Some(conn) = self.conns.get_mut(&token) {
                                conn.topics.insert(topic);
                            }
                        }
                        None => {
                            log::debug!("[io] connect to publisher {} failed", addr);
                        }
                    }
                }

                Command::DisconnectTopic { topic } => {
                    let mut to_close = Vec::new();
                    for (token, conn) in self.conns.iter_mut() {
                        if conn.kind == ConnKind::Publisher {
                            conn.topics.remove(&topic);
                            if conn.topics.is_empty() {
                                to_close.push(*token);
                            }
                        }
                    }
                    for token in to_close {
                        self.close(token, "no topics left");
                    }
                }

                Command::DisconnectAddr { addr } => {
                    if let Some(&token) = self.by_addr.get(&addr) {
                        self.close(token, "peer gone");
                    }
                }

                Command::SendRequest { addr, frame } => {
                    let token = match self.by_addr.get(&addr) {
                        Some(&token) => Some(token),
                        None => self.connect(addr, ConnKind::Responder),
                    };
                    match token {
                        Some(token) => self.queue_write(token, frame),
                        None => {
                            // Dropped; the requester's timeout handles it.
                            log::debug!("[io] connect to responder {} failed", addr);
                        }
                    }
                }

                Command::Shutdown => return true,
            }
        }
        false
    }

    fn connect(&mut self, addr: SocketAddr, kind: ConnKind) -> Option<Token> {
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                log::debug!("[io] connect {} failed: {}", addr, e);
                return None;
            }
        };

        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            log::debug!("[io] register outbound conn failed: {}", e);
            return None;
        }

        log::debug!("[io] connecting {:?} to {}", kind, addr);
        self.conns.insert(token, Conn::new(stream, kind, Some(addr)));
        self.by_addr.insert(addr, token);
        Some(token)
    }

    fn conn_event(&mut self, token: Token, readable: bool, writable: bool) {
        if writable {
            self.flush_outbox(token);
        }
        if readable {
            self.read_frames(token);
        }
    }

    fn queue_write(&mut self, token: Token, frame: Vec<u8>) {
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.outbox.push_back(frame);
        }
        self.flush_outbox(token);
    }

    fn flush_outbox(&mut self, token: Token) {
        let mut failure: Option<io::Error> = None;

        if let Some(conn) = self.conns.get_mut(&token) {
            loop {
                let (front_len, written) = {
                    let Some(front) = conn.outbox.front() else { break };
                    match conn.stream.write(&front[conn.out_pos..]) {
                        Ok(n) => (front.len(), n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                };
                conn.out_pos += written;
                if conn.out_pos >= front_len {
                    conn.outbox.pop_front();
                    conn.out_pos = 0;
                }
            }

            // Track writable interest only while the outbox is non-empty.
            if failure.is_none() {
                let wants_write = !conn.outbox.is_empty();
                if wants_write != conn.writable_registered {
                    let interest = if wants_write {
                        Interest::READABLE | Interest::WRITABLE
                    } else {
                        Interest::READABLE
                    };
                    match self
                        .poll
                        .registry()
                        .reregister(&mut conn.stream, token, interest)
                    {
                        Ok(()) => conn.writable_registered = wants_write,
                        Err(e) => log::debug!("[io] reregister failed: {}", e),
                    }
                }
            }
        }

        if let Some(e) = failure {
            log::debug!("[io] write failed: {}", e);
            self.close(token, "write error");
        }
    }

    fn read_frames(&mut self, token: Token) {
        let mut bodies = Vec::new();
        let mut close_reason: Option<String> = None;

        if let Some(conn) = self.conns.get_mut(&token) {
            loop {
                match conn.codec.decode(&mut conn.stream) {
                    Ok(Some(body)) => bodies.push(body),
                    Ok(None) => break,
                    Err(e) => {
                        close_reason = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        for body in bodies {
            self.handle_frame(token, &body);
        }

        if let Some(reason) = close_reason {
            self.close(token, &reason);
        }
    }

    fn handle_frame(&mut self, token: Token, body: &[u8]) {
        let Some(kind) = self.conns.get(&token).map(|c| c.kind) else {
            return;
        };

        let frame = match DataFrame::parse(body) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("[io] dropping malformed frame: {}", e);
                return;
            }
        };

        match (kind, frame) {
            (ConnKind::Publisher, frame @ DataFrame::Message { .. }) => {
                self.handler.on_message(frame);
            }
            (ConnKind::Requester, frame @ DataFrame::Request { .. }) => {
                let response = self.handler.on_request(frame);
                self.queue_write(token, StreamCodec::encode(&response));
            }
            (ConnKind::Responder, frame @ DataFrame::Response { .. }) => {
                self.handler.on_response(frame);
            }
            (kind, frame) => {
                log::debug!(
                    "[io] unexpected frame on {:?} connection: {:?}",
                    kind,
                    frame.topic()
                );
            }
        }
    }

    fn close(&mut self, token: Token, reason: &str) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            if let Some(addr) = conn.peer {
                self.by_addr.remove(&addr);
            }
            log::debug!("[io] closed {:?} connection ({})", conn.kind, reason);
        }
    }
}
