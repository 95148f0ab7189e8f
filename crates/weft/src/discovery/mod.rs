// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast discovery service.
//!
//! One instance per process. Resolves topics to the publishers willing
//! to publish them and services to the responders willing to answer,
//! with no configured peer addresses.
//!
//! # Architecture
//!
//! ```text
//! announcer thread (1 Hz)          listener threads (one per socket)
//!   heartbeat + re-advertise         recv -> parse -> filter -> tables
//!   purge expired leases                 -> connection callbacks
//!            \                          /
//!             +---- shared Core state -+
//! ```
//!
//! Two UDP multicast sockets are used: topics on `DISCOVERY_MSG_PORT`,
//! services on `DISCOVERY_SRV_PORT`. Callbacks are invoked with no lock
//! held (tables are snapshotted first), so a callback may call back into
//! the discovery service.
//!
//! Receive-side filtering: wire version, own process, partition, scope
//! (`Process`-scoped records never cross process boundaries, `Host`-
//! scoped records are dropped unless the source IP is local).

pub mod peers;

pub use peers::{pick_responder, Publisher, Responder};

use crate::config::{
    Settings, HEARTBEAT_INTERVAL_MS, MAX_DATAGRAM_SIZE, PEER_TTL_MS, WIRE_VERSION,
};
use crate::protocol::{
    AdvertiseData, AdvertiseSrvData, Datagram, DatagramBody, MsgType, Scope,
};
use crate::topic;
use crate::transport::multicast::{discovery_socket, is_local_address, local_ipv4_addresses};
use parking_lot::Mutex;
use peers::PeerTable;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Connection/disconnection callback for topic publishers.
pub type PublisherCallback = Arc<dyn Fn(&str, &Publisher) + Send + Sync>;
/// Connection/disconnection callback for service responders.
pub type ResponderCallback = Arc<dyn Fn(&str, &Responder) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    pub_connect: Option<PublisherCallback>,
    pub_disconnect: Option<PublisherCallback>,
    srv_connect: Option<ResponderCallback>,
    srv_disconnect: Option<ResponderCallback>,
}

#[derive(Default)]
struct State {
    /// topic -> node_uuid -> record this process announces.
    local_publishers: HashMap<String, HashMap<String, Publisher>>,
    local_responders: HashMap<String, HashMap<String, Responder>>,
    /// Leased remote records.
    remote_publishers: PeerTable<Publisher>,
    remote_responders: PeerTable<Responder>,
    /// Topics/services this process asked to discover.
    topic_interest: HashSet<String>,
    srv_interest: HashSet<String>,
    /// Processes that reported a connection to one of our publishers.
    remote_subscribers: HashMap<String, HashSet<Uuid>>,
}

struct Core {
    settings: Settings,
    process_uuid: Uuid,
    msg_sock: UdpSocket,
    srv_sock: UdpSocket,
    local_ips: Vec<Ipv4Addr>,
    state: Mutex<State>,
    callbacks: Mutex<Callbacks>,
    malformed: AtomicU64,
    shutdown: AtomicBool,
}

/// The per-process discovery service.
pub struct Discovery {
    core: Arc<Core>,
    threads: Vec<JoinHandle<()>>,
}

impl Discovery {
    /// Bind the discovery sockets and start the listener and announcer
    /// threads.
    pub fn start(settings: Settings, process_uuid: Uuid) -> io::Result<Self> {
        let msg_sock = discovery_socket(settings.group, settings.msg_port)?;
        let srv_sock = discovery_socket(settings.group, settings.srv_port)?;

        log::debug!(
            "[discovery] started (partition='{}' group={} msg={} srv={})",
            settings.partition,
            settings.group,
            settings.msg_port,
            settings.srv_port
        );

        let core = Arc::new(Core {
            local_ips: local_ipv4_addresses(),
            settings,
            process_uuid,
            msg_sock,
            srv_sock,
            state: Mutex::new(State::default()),
            callbacks: Mutex::new(Callbacks::default()),
            malformed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut threads = Vec::new();
        for (label, sock) in [
            ("weft-disc-msg", core.msg_sock.try_clone()?),
            ("weft-disc-srv", core.srv_sock.try_clone()?),
        ] {
            let core_clone = Arc::clone(&core);
            threads.push(
                thread::Builder::new()
                    .name(label.to_string())
                    .spawn(move || listener_loop(core_clone, sock))?,
            );
        }
        let core_clone = Arc::clone(&core);
        threads.push(
            thread::Builder::new()
                .name("weft-disc-beat".to_string())
                .spawn(move || announcer_loop(core_clone))?,
        );

        Ok(Self { core, threads })
    }

    /// Install topic connection/disconnection callbacks.
    pub fn set_publisher_callbacks(&self, connect: PublisherCallback, disconnect: PublisherCallback) {
        let mut cbs = self.core.callbacks.lock();
        cbs.pub_connect = Some(connect);
        cbs.pub_disconnect = Some(disconnect);
    }

    /// Install service connection/disconnection callbacks.
    pub fn set_responder_callbacks(&self, connect: ResponderCallback, disconnect: ResponderCallback) {
        let mut cbs = self.core.callbacks.lock();
        cbs.srv_connect = Some(connect);
        cbs.srv_disconnect = Some(disconnect);
    }

    /// Announce a topic publisher. `Process`-scoped records are stored
    /// but never emitted.
    pub fn advertise(&self, publisher: Publisher) {
        {
            let mut state = self.core.state.lock();
            state
                .local_publishers
                .entry(publisher.topic.clone())
                .or_default()
                .insert(publisher.node_uuid.clone(), publisher.clone());
        }
        if publisher.scope != Scope::Process {
            self.core.send_advertise(&publisher);
        }
    }

    /// Withdraw a topic advertisement. No-op when nothing was announced.
    pub fn unadvertise(&self, topic: &str, node_uuid: &str) {
        let removed = {
            let mut state = self.core.state.lock();
            let removed = state
                .local_publishers
                .get_mut(topic)
                .and_then(|bucket| bucket.remove(node_uuid));
            if state
                .local_publishers
                .get(topic)
                .is_some_and(|bucket| bucket.is_empty())
            {
                state.local_publishers.remove(topic);
            }
            removed
        };

        if removed.is_some_and(|p| p.scope != Scope::Process) {
            let dgram = self.core.datagram(MsgType::Unadvertise, self.core.scoped(topic)).with_body(
                DatagramBody::NodeRef {
                    node_uuid: node_uuid.to_string(),
                },
            );
            self.core.send(&self.core.msg_sock, self.core.settings.msg_port, &dgram);
        }
    }

    /// Announce a service responder.
    pub fn advertise_service(&self, responder: Responder) {
        {
            let mut state = self.core.state.lock();
            state
                .local_responders
                .entry(responder.topic.clone())
                .or_default()
                .insert(responder.node_uuid.clone(), responder.clone());
        }
        if responder.scope != Scope::Process {
            self.core.send_advertise_srv(&responder);
        }
    }

    /// Withdraw a service advertisement.
    pub fn unadvertise_service(&self, topic: &str, node_uuid: &str) {
        let removed = {
            let mut state = self.core.state.lock();
            let removed = state
                .local_responders
                .get_mut(topic)
                .and_then(|bucket| bucket.remove(node_uuid));
            if state
                .local_responders
                .get(topic)
                .is_some_and(|bucket| bucket.is_empty())
            {
                state.local_responders.remove(topic);
            }
            removed
        };

        if removed.is_some_and(|r| r.scope != Scope::Process) {
            let dgram = self.core.datagram(MsgType::UnadvertiseSrv, self.core.scoped(topic)).with_body(
                DatagramBody::NodeRef {
                    node_uuid: node_uuid.to_string(),
                },
            );
            self.core.send(&self.core.srv_sock, self.core.settings.srv_port, &dgram);
        }
    }

    /// Ask the network who publishes `topic`: emit `SUBSCRIBE`, then
    /// synchronously fire the connection callback for every peer already
    /// known.
    pub fn discover(&self, topic: &str) {
        {
            self.core.state.lock().topic_interest.insert(topic.to_string());
        }
        let dgram = self.core.datagram(MsgType::Subscribe, self.core.scoped(topic));
        self.core.send(&self.core.msg_sock, self.core.settings.msg_port, &dgram);

        for publisher in self.publishers(topic) {
            self.core.fire_pub_connect(&publisher);
        }
    }

    /// Ask the network who responds on `topic` (service flavor of
    /// [`Discovery::discover`]).
    pub fn discover_service(&self, topic: &str) {
        {
            self.core.state.lock().srv_interest.insert(topic.to_string());
        }
        let dgram = self.core.datagram(MsgType::SubscribeSrv, self.core.scoped(topic));
        self.core.send(&self.core.srv_sock, self.core.settings.srv_port, &dgram);

        for responder in self.responders(topic) {
            self.core.fire_srv_connect(&responder);
        }
    }

    /// Known remote publishers for a topic.
    pub fn publishers(&self, topic: &str) -> Vec<Publisher> {
        self.core.state.lock().remote_publishers.get(topic)
    }

    /// Known remote responders for a service.
    pub fn responders(&self, topic: &str) -> Vec<Responder> {
        self.core.state.lock().remote_responders.get(topic)
    }

    /// Every known publisher for a topic, local records included.
    pub fn topic_info(&self, topic: &str) -> Vec<Publisher> {
        let state = self.core.state.lock();
        let mut publishers: Vec<Publisher> = state
            .local_publishers
            .get(topic)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default();
        publishers.extend(state.remote_publishers.get(topic));
        publishers
    }

    /// Every known responder for a service, local records included.
    pub fn service_info(&self, topic: &str) -> Vec<Responder> {
        let state = self.core.state.lock();
        let mut responders: Vec<Responder> = state
            .local_responders
            .get(topic)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default();
        responders.extend(state.remote_responders.get(topic));
        responders
    }

    /// All topics known to this process (local and remote), sorted.
    pub fn topic_list(&self) -> Vec<String> {
        let state = self.core.state.lock();
        let mut topics: Vec<String> = state
            .local_publishers
            .keys()
            .cloned()
            .chain(state.remote_publishers.topics())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// All services known to this process (local and remote), sorted.
    pub fn service_list(&self) -> Vec<String> {
        let state = self.core.state.lock();
        let mut services: Vec<String> = state
            .local_responders
            .keys()
            .cloned()
            .chain(state.remote_responders.topics())
            .collect();
        services.sort();
        services.dedup();
        services
    }

    /// Remote processes that reported a connection to our publisher on
    /// `topic` (coarse, per-process introspection).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.core
            .state
            .lock()
            .remote_subscribers
            .get(topic)
            .map_or(0, HashSet::len)
    }

    /// Tell publishers we connected to their endpoint.
    pub fn announce_connection(&self, topic: &str, address: &str, node_uuid: &str) {
        self.core.send_connection(MsgType::NewConnection, topic, address, node_uuid);
    }

    /// Tell publishers we dropped our connections for a topic.
    pub fn announce_disconnection(&self, topic: &str, address: &str, node_uuid: &str) {
        self.core.send_connection(MsgType::EndConnection, topic, address, node_uuid);
    }

    /// Datagrams dropped as malformed since startup.
    pub fn malformed_count(&self) -> u64 {
        self.core.malformed.load(Ordering::Relaxed)
    }

    /// Feed a raw datagram through the receive path (test hook).
    #[cfg(test)]
    pub(crate) fn inject(&self, data: &[u8], src: SocketAddr) {
        self.core.handle_datagram(data, src);
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::Relaxed);

        // Last words: let peers drop our records ahead of lease expiry.
        let bye = self.core.datagram(MsgType::Bye, self.core.settings.partition.clone());
        self.core.send(&self.core.msg_sock, self.core.settings.msg_port, &bye);
        self.core.send(&self.core.srv_sock, self.core.settings.srv_port, &bye);

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        log::debug!("[discovery] stopped");
    }
}

impl Core {
    fn scoped(&self, topic: &str) -> String {
        topic::scope_with_partition(&self.settings.partition, topic)
    }

    fn datagram(&self, msg_type: MsgType, wire_topic: String) -> Datagram {
        Datagram::new(WIRE_VERSION, self.process_uuid, msg_type, wire_topic)
    }

    fn send(&self, sock: &UdpSocket, port: u16, dgram: &Datagram) {
        let dest = SocketAddr::from((self.settings.group, port));
        if let Err(e) = sock.send_to(&dgram.encode(), dest) {
            // Non-fatal: the next heartbeat round reconciles.
            log::debug!("[discovery] send {:?} to {} failed: {}", dgram.msg_type, dest, e);
        }
    }

    fn send_advertise(&self, publisher: &Publisher) {
        let dgram = self
            .datagram(MsgType::Advertise, self.scoped(&publisher.topic))
            .with_body(DatagramBody::Advertise(AdvertiseData {
                address: publisher.address.clone(),
                ctrl_address: publisher.ctrl_address.clone(),
                node_uuid: publisher.node_uuid.clone(),
                scope: publisher.scope,
            }));
        self.send(&self.msg_sock, self.settings.msg_port, &dgram);
    }

    fn send_advertise_srv(&self, responder: &Responder) {
        let dgram = self
            .datagram(MsgType::AdvertiseSrv, self.scoped(&responder.topic))
            .with_body(DatagramBody::AdvertiseSrv(AdvertiseSrvData {
                address: responder.reply_address.clone(),
                ctrl_address: String::new(),
                node_uuid: responder.node_uuid.clone(),
                scope: responder.scope,
                req_type: responder.req_type.clone(),
                rep_type: responder.rep_type.clone(),
            }));
        self.send(&self.srv_sock, self.settings.srv_port, &dgram);
    }

    fn send_connection(&self, msg_type: MsgType, topic: &str, address: &str, node_uuid: &str) {
        let dgram = self
            .datagram(msg_type, self.scoped(topic))
            .with_body(DatagramBody::Connection {
                address: address.to_string(),
                node_uuid: node_uuid.to_string(),
            });
        self.send(&self.msg_sock, self.settings.msg_port, &dgram);
    }

    fn fire_pub_connect(&self, publisher: &Publisher) {
        let cb = self.callbacks.lock().pub_connect.clone();
        if let Some(cb) = cb {
            cb(&publisher.topic, publisher);
        }
    }

    fn fire_pub_disconnect(&self, publisher: &Publisher) {
        let cb = self.callbacks.lock().pub_disconnect.clone();
        if let Some(cb) = cb {
            cb(&publisher.topic, publisher);
        }
    }

    fn fire_srv_connect(&self, responder: &Responder) {
        let cb = self.callbacks.lock().srv_connect.clone();
        if let Some(cb) = cb {
            cb(&responder.topic, responder);
        }
    }

    fn fire_srv_disconnect(&self, responder: &Responder) {
        let cb = self.callbacks.lock().srv_disconnect.clone();
        if let Some(cb) = cb {
            cb(&responder.topic, responder);
        }
    }

    fn drop_malformed(&self, reason: &str) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
        if self.settings.verbose {
            log::warn!("[discovery] dropped datagram: {}", reason);
        } else {
            log::debug!("[discovery] dropped datagram: {}", reason);
        }
    }

    /// Receive path: parse, filter, update tables, fire callbacks.
    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let dgram = match Datagram::parse(data) {
            Ok(dgram) => dgram,
            Err(e) => {
                self.drop_malformed(&format!("{} (from {})", e, src));
                return;
            }
        };

        if dgram.version != WIRE_VERSION {
            self.drop_malformed(&format!("version {} (from {})", dgram.version, src));
            return;
        }
        if dgram.process_uuid == self.process_uuid {
            return;
        }

        // Process-level datagrams carry the bare partition; everything
        // else carries a partition-qualified topic.
        let topic = match dgram.msg_type {
            MsgType::Heartbeat | MsgType::Bye => {
                if dgram.topic != self.settings.partition {
                    return;
                }
                String::new()
            }
            _ => {
                let Some((partition, topic)) = topic::split_partition(&dgram.topic) else {
                    self.drop_malformed(&format!("unqualified topic '{}'", dgram.topic));
                    return;
                };
                if partition != self.settings.partition {
                    return;
                }
                topic.to_string()
            }
        };

        match (dgram.msg_type, dgram.body) {
            (MsgType::Advertise, DatagramBody::Advertise(adv)) => {
                if self.scope_rejects(adv.scope, &src) {
                    return;
                }
                let publisher = Publisher {
                    topic: topic.clone(),
                    scope: adv.scope,
                    address: adv.address,
                    ctrl_address: adv.ctrl_address,
                    process_uuid: dgram.process_uuid,
                    node_uuid: adv.node_uuid,
                };
                let (is_new, interested) = {
                    let mut state = self.state.lock();
                    let is_new = state
                        .remote_publishers
                        .insert_or_refresh(publisher.clone(), ttl());
                    (is_new, state.topic_interest.contains(&topic))
                };
                if is_new {
                    log::debug!(
                        "[discovery] publisher on '{}' at {} ({})",
                        topic,
                        publisher.address,
                        dgram.process_uuid
                    );
                    if interested {
                        self.fire_pub_connect(&publisher);
                    }
                }
            }

            (MsgType::Subscribe, _) => {
                let records: Vec<Publisher> = {
                    let state = self.state.lock();
                    state
                        .local_publishers
                        .get(&topic)
                        .map(|bucket| {
                            bucket
                                .values()
                                .filter(|p| p.scope != Scope::Process)
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default()
                };
                for record in records {
                    self.send_advertise(&record);
                }
            }

            (MsgType::Unadvertise, DatagramBody::NodeRef { node_uuid }) => {
                let (removed, interested) = {
                    let mut state = self.state.lock();
                    let removed =
                        state
                            .remote_publishers
                            .remove(&topic, dgram.process_uuid, &node_uuid);
                    (removed, state.topic_interest.contains(&topic))
                };
                if let Some(publisher) = removed {
                    if interested {
                        self.fire_pub_disconnect(&publisher);
                    }
                }
            }

            (MsgType::Heartbeat, _) => {
                let mut state = self.state.lock();
                state.remote_publishers.refresh_process(dgram.process_uuid, ttl());
                state.remote_responders.refresh_process(dgram.process_uuid, ttl());
            }

            (MsgType::Bye, _) => {
                self.remove_process(dgram.process_uuid);
            }

            (MsgType::AdvertiseSrv, DatagramBody::AdvertiseSrv(adv)) => {
                if self.scope_rejects(adv.scope, &src) {
                    return;
                }
                let responder = Responder {
                    topic: topic.clone(),
                    scope: adv.scope,
                    reply_address: adv.address,
                    req_type: adv.req_type,
                    rep_type: adv.rep_type,
                    process_uuid: dgram.process_uuid,
                    node_uuid: adv.node_uuid,
                };
                let (is_new, interested) = {
                    let mut state = self.state.lock();
                    let is_new = state
                        .remote_responders
                        .insert_or_refresh(responder.clone(), ttl());
                    (is_new, state.srv_interest.contains(&topic))
                };
                if is_new {
                    log::debug!(
                        "[discovery] responder on '{}' at {} ({})",
                        topic,
                        responder.reply_address,
                        dgram.process_uuid
                    );
                    if interested {
                        self.fire_srv_connect(&responder);
                    }
                }
            }

            (MsgType::SubscribeSrv, _) => {
                let records: Vec<Responder> = {
                    let state = self.state.lock();
                    state
                        .local_responders
                        .get(&topic)
                        .map(|bucket| {
                            bucket
                                .values()
                                .filter(|r| r.scope != Scope::Process)
                                .cloned()
                                .collect()
                        })
                        .unwrap_or_default()
                };
                for record in records {
                    self.send_advertise_srv(&record);
                }
            }

            (MsgType::UnadvertiseSrv, DatagramBody::NodeRef { node_uuid }) => {
                let (removed, interested) = {
                    let mut state = self.state.lock();
                    let removed =
                        state
                            .remote_responders
                            .remove(&topic, dgram.process_uuid, &node_uuid);
                    (removed, state.srv_interest.contains(&topic))
                };
                if let Some(responder) = removed {
                    if interested {
                        self.fire_srv_disconnect(&responder);
                    }
                }
            }

            (MsgType::NewConnection, DatagramBody::Connection { .. }) => {
                let mut state = self.state.lock();
                state
                    .remote_subscribers
                    .entry(topic)
                    .or_default()
                    .insert(dgram.process_uuid);
            }

            (MsgType::EndConnection, DatagramBody::Connection { node_uuid, .. }) => {
                let (removed, interested) = {
                    let mut state = self.state.lock();
                    if let Some(subs) = state.remote_subscribers.get_mut(&topic) {
                        subs.remove(&dgram.process_uuid);
                        if subs.is_empty() {
                            state.remote_subscribers.remove(&topic);
                        }
                    }
                    // The sender may itself be a publisher closing down
                    // its connections for the topic.
                    let removed =
                        state
                            .remote_publishers
                            .remove(&topic, dgram.process_uuid, &node_uuid);
                    (removed, state.topic_interest.contains(&topic))
                };
                if let Some(publisher) = removed {
                    if interested {
                        self.fire_pub_disconnect(&publisher);
                    }
                }
            }

            (msg_type, _) => {
                self.drop_malformed(&format!("{:?} with mismatched body", msg_type));
            }
        }
    }

    /// Remote-record scope filter.
    fn scope_rejects(&self, scope: Scope, src: &SocketAddr) -> bool {
        match scope {
            // Process-scoped records never leave their process; seeing
            // one from a remote peer means it must be ignored.
            Scope::Process => true,
            Scope::Host => !is_local_address(src.ip(), &self.local_ips),
            Scope::All => false,
        }
    }

    fn remove_process(&self, process_uuid: Uuid) {
        let (pubs, srvs, topic_interest, srv_interest) = {
            let mut state = self.state.lock();
            for subs in state.remote_subscribers.values_mut() {
                subs.remove(&process_uuid);
            }
            state.remote_subscribers.retain(|_, subs| !subs.is_empty());
            let pubs = state.remote_publishers.remove_process(process_uuid);
            let srvs = state.remote_responders.remove_process(process_uuid);
            (
                pubs,
                srvs,
                state.topic_interest.clone(),
                state.srv_interest.clone(),
            )
        };

        for publisher in &pubs {
            if topic_interest.contains(&publisher.topic) {
                self.fire_pub_disconnect(publisher);
            }
        }
        for responder in &srvs {
            if srv_interest.contains(&responder.topic) {
                self.fire_srv_disconnect(responder);
            }
        }
    }
}

fn ttl() -> Duration {
    Duration::from_millis(PEER_TTL_MS)
}

/// Listener loop: one per discovery socket.
fn listener_loop(core: Arc<Core>, sock: UdpSocket) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while !core.shutdown.load(Ordering::Relaxed) {
        match sock.recv_from(&mut buf) {
            Ok((len, src)) => core.handle_datagram(&buf[..len], src),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[discovery] recv failed: {}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// Announcer loop: heartbeat, re-advertise, purge expired leases.
fn announcer_loop(core: Arc<Core>) {
    let period = Duration::from_millis(HEARTBEAT_INTERVAL_MS);

    while !core.shutdown.load(Ordering::Relaxed) {
        let beat = core.datagram(MsgType::Heartbeat, core.settings.partition.clone());
        core.send(&core.msg_sock, core.settings.msg_port, &beat);
        core.send(&core.srv_sock, core.settings.srv_port, &beat);

        // Re-emit full records so late joiners converge within a period.
        let (pubs, srvs) = {
            let state = core.state.lock();
            let pubs: Vec<Publisher> = state
                .local_publishers
                .values()
                .flat_map(|bucket| bucket.values())
                .filter(|p| p.scope != Scope::Process)
                .cloned()
                .collect();
            let srvs: Vec<Responder> = state
                .local_responders
                .values()
                .flat_map(|bucket| bucket.values())
                .filter(|r| r.scope != Scope::Process)
                .cloned()
                .collect();
            (pubs, srvs)
        };
        for publisher in &pubs {
            core.send_advertise(publisher);
        }
        for responder in &srvs {
            core.send_advertise_srv(responder);
        }

        let (expired_pubs, expired_srvs, topic_interest, srv_interest) = {
            let mut state = core.state.lock();
            (
                state.remote_publishers.purge_expired(),
                state.remote_responders.purge_expired(),
                state.topic_interest.clone(),
                state.srv_interest.clone(),
            )
        };
        for publisher in &expired_pubs {
            log::debug!(
                "[discovery] publisher on '{}' timed out ({})",
                publisher.topic,
                publisher.process_uuid
            );
            if topic_interest.contains(&publisher.topic) {
                core.fire_pub_disconnect(publisher);
            }
        }
        for responder in &expired_srvs {
            if srv_interest.contains(&responder.topic) {
                core.fire_srv_disconnect(responder);
            }
        }

        // Chunked sleep keeps shutdown latency well below the period.
        let sleep_end = std::time::Instant::now() + period;
        while std::time::Instant::now() < sleep_end {
            if core.shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_settings(partition: &str) -> Settings {
        Settings {
            partition: partition.to_string(),
            // Port 0: sockets bind ephemeral ports, so unit tests never
            // talk to each other or to a live fabric. Datagrams are
            // injected directly.
            msg_port: 0,
            srv_port: 0,
            ..Settings::default()
        }
    }

    fn start(partition: &str) -> Discovery {
        Discovery::start(test_settings(partition), Uuid::new_v4()).expect("discovery start")
    }

    fn remote_advertise(partition: &str, topic: &str, scope: Scope, puuid: Uuid) -> Vec<u8> {
        Datagram::new(
            WIRE_VERSION,
            puuid,
            MsgType::Advertise,
            format!("{}@{}", partition, topic),
        )
        .with_body(DatagramBody::Advertise(AdvertiseData {
            address: "192.0.2.10:5000".to_string(),
            ctrl_address: "192.0.2.10:5001".to_string(),
            node_uuid: "remote-node".to_string(),
            scope,
        }))
        .encode()
    }

    fn remote_src() -> SocketAddr {
        "192.0.2.10:40000".parse().expect("addr")
    }

    #[test]
    fn advertise_records_and_lists_topic() {
        let discovery = start("p1");
        discovery.advertise(Publisher {
            topic: "/foo".to_string(),
            scope: Scope::All,
            address: "127.0.0.1:5000".to_string(),
            ctrl_address: "127.0.0.1:5001".to_string(),
            process_uuid: Uuid::new_v4(),
            node_uuid: "n1".to_string(),
        });
        assert_eq!(discovery.topic_list(), vec!["/foo".to_string()]);
    }

    #[test]
    fn remote_advertise_fires_callback_once() {
        let discovery = start("p1");
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        discovery.set_publisher_callbacks(
            Arc::new(move |topic: &str, publisher: &Publisher| {
                assert_eq!(topic, "/foo");
                assert_eq!(publisher.address, "192.0.2.10:5000");
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_: &str, _: &Publisher| {}),
        );

        discovery.discover("/foo");
        let puuid = Uuid::new_v4();
        let dgram = remote_advertise("p1", "/foo", Scope::All, puuid);
        discovery.inject(&dgram, remote_src());
        // Duplicate announcement is idempotent.
        discovery.inject(&dgram, remote_src());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(discovery.publishers("/foo").len(), 1);
    }

    #[test]
    fn discover_fires_for_already_known_peers() {
        let discovery = start("p1");
        let puuid = Uuid::new_v4();
        discovery.inject(&remote_advertise("p1", "/foo", Scope::All, puuid), remote_src());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        discovery.set_publisher_callbacks(
            Arc::new(move |_: &str, _: &Publisher| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_: &str, _: &Publisher| {}),
        );

        discovery.discover("/foo");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreign_partition_is_filtered() {
        let discovery = start("p1");
        discovery.discover("/foo");
        discovery.inject(
            &remote_advertise("p2", "/foo", Scope::All, Uuid::new_v4()),
            remote_src(),
        );
        assert!(discovery.publishers("/foo").is_empty());
    }

    #[test]
    fn process_scope_is_filtered() {
        let discovery = start("p1");
        discovery.discover("/foo");
        discovery.inject(
            &remote_advertise("p1", "/foo", Scope::Process, Uuid::new_v4()),
            remote_src(),
        );
        assert!(discovery.publishers("/foo").is_empty());
    }

    #[test]
    fn host_scope_requires_local_source() {
        let discovery = start("p1");
        discovery.discover("/foo");

        // Non-local source: rejected.
        discovery.inject(
            &remote_advertise("p1", "/foo", Scope::Host, Uuid::new_v4()),
            remote_src(),
        );
        assert!(discovery.publishers("/foo").is_empty());

        // Loopback source: accepted.
        discovery.inject(
            &remote_advertise("p1", "/foo", Scope::Host, Uuid::new_v4()),
            "127.0.0.1:40000".parse().expect("addr"),
        );
        assert_eq!(discovery.publishers("/foo").len(), 1);
    }

    #[test]
    fn version_mismatch_counted_as_malformed() {
        let discovery = start("p1");
        let mut dgram = remote_advertise("p1", "/foo", Scope::All, Uuid::new_v4());
        dgram[0] = 0xFF; // clobber the version field
        discovery.inject(&dgram, remote_src());

        assert_eq!(discovery.malformed_count(), 1);
        assert!(discovery.publishers("/foo").is_empty());
    }

    #[test]
    fn bye_drops_process_and_fires_disconnect() {
        let discovery = start("p1");
        let disconnects = Arc::new(AtomicUsize::new(0));
        let disconnects_clone = Arc::clone(&disconnects);
        discovery.set_publisher_callbacks(
            Arc::new(|_: &str, _: &Publisher| {}),
            Arc::new(move |topic: &str, _: &Publisher| {
                assert_eq!(topic, "/foo");
                disconnects_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        discovery.discover("/foo");
        let puuid = Uuid::new_v4();
        discovery.inject(&remote_advertise("p1", "/foo", Scope::All, puuid), remote_src());
        assert_eq!(discovery.publishers("/foo").len(), 1);

        let bye = Datagram::new(WIRE_VERSION, puuid, MsgType::Bye, "p1".to_string()).encode();
        discovery.inject(&bye, remote_src());

        assert!(discovery.publishers("/foo").is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unadvertise_removes_remote_entry() {
        let discovery = start("p1");
        discovery.discover("/foo");
        let puuid = Uuid::new_v4();
        discovery.inject(&remote_advertise("p1", "/foo", Scope::All, puuid), remote_src());

        let unadv = Datagram::new(
            WIRE_VERSION,
            puuid,
            MsgType::Unadvertise,
            "p1@/foo".to_string(),
        )
        .with_body(DatagramBody::NodeRef {
            node_uuid: "remote-node".to_string(),
        })
        .encode();
        discovery.inject(&unadv, remote_src());

        assert!(discovery.publishers("/foo").is_empty());
    }

    #[test]
    fn srv_advertise_and_responder_listing() {
        let discovery = start("p1");
        let puuid = Uuid::new_v4();
        let dgram = Datagram::new(
            WIRE_VERSION,
            puuid,
            MsgType::AdvertiseSrv,
            "p1@/echo".to_string(),
        )
        .with_body(DatagramBody::AdvertiseSrv(AdvertiseSrvData {
            address: "192.0.2.10:6000".to_string(),
            ctrl_address: String::new(),
            node_uuid: "remote-node".to_string(),
            scope: Scope::All,
            req_type: "Req".to_string(),
            rep_type: "Rep".to_string(),
        }))
        .encode();
        discovery.inject(&dgram, remote_src());

        let responders = discovery.responders("/echo");
        assert_eq!(responders.len(), 1);
        assert_eq!(responders[0].reply_address, "192.0.2.10:6000");
        assert_eq!(discovery.service_list(), vec!["/echo".to_string()]);
    }

    #[test]
    fn own_datagrams_are_ignored() {
        let settings = test_settings("p1");
        let puuid = Uuid::new_v4();
        let discovery = Discovery::start(settings, puuid).expect("discovery start");
        discovery.discover("/foo");
        discovery.inject(&remote_advertise("p1", "/foo", Scope::All, puuid), remote_src());
        assert!(discovery.publishers("/foo").is_empty());
    }

    #[test]
    fn new_connection_tracks_subscribers() {
        let discovery = start("p1");
        let puuid = Uuid::new_v4();
        let conn = |msg_type| {
            Datagram::new(WIRE_VERSION, puuid, msg_type, "p1@/foo".to_string())
                .with_body(DatagramBody::Connection {
                    address: "192.0.2.1:5000".to_string(),
                    node_uuid: "sub-node".to_string(),
                })
                .encode()
        };

        discovery.inject(&conn(MsgType::NewConnection), remote_src());
        assert_eq!(discovery.subscriber_count("/foo"), 1);

        discovery.inject(&conn(MsgType::EndConnection), remote_src());
        assert_eq!(discovery.subscriber_count("/foo"), 0);
    }
}
