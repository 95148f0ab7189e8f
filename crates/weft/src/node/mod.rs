// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The public node API.
//!
//! A [`Node`] is a named communication endpoint within a process. Nodes
//! advertise and publish topics, subscribe with typed callbacks, expose
//! services, and invoke services on peers — without ever knowing peer
//! addresses. All methods are thread-safe.
//!
//! # Example
//!
//! ```no_run
//! use weft::{messages::StringMsg, Node, Scope};
//!
//! fn main() -> weft::Result<()> {
//!     let node = Node::new()?;
//!     node.advertise("/chatter", Scope::All)?;
//!     node.subscribe("/chatter", |topic: &str, msg: &StringMsg| {
//!         println!("[{}] {}", topic, msg.data);
//!     })?;
//!     node.publish("/chatter", &StringMsg::new("hello"))?;
//!     Ok(())
//! }
//! ```

mod dispatch;
mod shared;

use shared::NodeShared;

use crate::discovery::{Publisher, Responder};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::protocol::{DataFrame, Scope};
use crate::registry::{PendingRequest, ResponseCallback, TypedReplier, TypedSubscription};
use crate::registry::handlers::decode_response;
use crate::topic;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct NodeState {
    advertised: HashMap<String, Scope>,
    subscribed: HashSet<String>,
    services: HashSet<String>,
}

/// A communication endpoint in the fabric.
///
/// Creating the first node in a process starts the shared runtime
/// (discovery, transport endpoints, receive thread); dropping the last
/// one tears it down. Dropping a node unadvertises its topics and
/// services, removes its subscriptions, and cancels its pending
/// requests.
pub struct Node {
    shared: Arc<NodeShared>,
    uuid_str: String,
    verbose: bool,
    state: Mutex<NodeState>,
}

impl Node {
    /// Create a node, joining the per-process runtime.
    pub fn new() -> Result<Self> {
        Self::with_verbose(false)
    }

    /// Create a node with diagnostic logging promoted to info level
    /// (also enabled process-wide via `VERBOSE=1`).
    pub fn with_verbose(verbose: bool) -> Result<Self> {
        let shared = NodeShared::instance()?;
        let uuid = Uuid::new_v4();
        let verbose = verbose || shared.settings.verbose;
        log::debug!("[node] created node {}", uuid);
        Ok(Self {
            shared,
            uuid_str: uuid.to_string(),
            verbose,
            state: Mutex::new(NodeState::default()),
        })
    }

    /// This node's UUID (string form).
    pub fn uuid(&self) -> &str {
        &self.uuid_str
    }

    /// The partition this process participates in.
    pub fn partition(&self) -> &str {
        &self.shared.settings.partition
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    /// Advertise a topic. Idempotent on an identical `(topic, scope)`;
    /// re-advertising with a different scope updates the announcement.
    pub fn advertise(&self, topic: &str, scope: Scope) -> Result<()> {
        topic::validate(topic)?;

        {
            let mut state = self.state.lock();
            if state.advertised.get(topic) == Some(&scope) {
                return Ok(());
            }
            state.advertised.insert(topic.to_string(), scope);
        }

        self.shared.discovery.advertise(Publisher {
            topic: topic.to_string(),
            scope,
            address: self.shared.endpoints.publish_address().to_string(),
            ctrl_address: self.shared.endpoints.reply_address().to_string(),
            process_uuid: self.shared.process_uuid,
            node_uuid: self.uuid_str.clone(),
        });

        if self.verbose {
            log::info!("[node] advertised '{}' (scope {})", topic, scope);
        }
        Ok(())
    }

    /// Withdraw a topic advertisement. No-op when the topic was never
    /// advertised by this node.
    pub fn unadvertise(&self, topic: &str) -> Result<()> {
        topic::validate(topic)?;

        let was_advertised = self.state.lock().advertised.remove(topic).is_some();
        if was_advertised {
            self.shared.discovery.unadvertise(topic, &self.uuid_str);
            if self.verbose {
                log::info!("[node] unadvertised '{}'", topic);
            }
        }
        Ok(())
    }

    /// Publish a message on a previously advertised topic.
    ///
    /// Local subscriptions are served synchronously in the caller's
    /// thread (the in-process shortcut) before the frame is handed to
    /// the network, so a local subscriber may observe the message before
    /// any remote one does.
    pub fn publish<M: Message>(&self, topic: &str, msg: &M) -> Result<()> {
        topic::validate(topic)?;
        if !self.state.lock().advertised.contains_key(topic) {
            return Err(Error::NotAdvertised(topic.to_string()));
        }

        let payload = msg.encode()?;

        // In-process shortcut.
        self.shared
            .dispatcher
            .deliver_message(topic, M::type_name(), &payload);

        // Network path: one multi-part frame to every connected
        // subscriber.
        let frame = DataFrame::Message {
            topic: topic.to_string(),
            process_uuid: self.shared.process_uuid,
            type_name: M::type_name().to_string(),
            payload,
        };
        self.shared.endpoints.broadcast(&frame.encode());
        Ok(())
    }

    /// Subscribe to a topic with a typed callback.
    ///
    /// The callback runs on the receive thread (or the publisher's
    /// thread for in-process messages) and must not block. Messages
    /// whose wire type differs from `M` are skipped without error.
    pub fn subscribe<M, F>(&self, topic: &str, callback: F) -> Result<()>
    where
        M: Message,
        F: Fn(&str, &M) + Send + Sync + 'static,
    {
        topic::validate(topic)?;

        self.shared.registry.add_subscription(
            topic,
            Arc::new(TypedSubscription::<M, _>::new(self.uuid_str.clone(), callback)),
        );
        self.state.lock().subscribed.insert(topic.to_string());

        // Ask the fabric who publishes this topic; already-known peers
        // are connected synchronously.
        self.shared.discovery.discover(topic);

        if self.verbose {
            log::info!("[node] subscribed to '{}' ({})", topic, M::type_name());
        }
        Ok(())
    }

    /// Remove every subscription this node holds on a topic. The
    /// subscriber side of discovery is pull-based, so no datagram needs
    /// to be sent beyond the connection teardown notice.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        topic::validate(topic)?;

        self.state.lock().subscribed.remove(topic);
        let removed = self
            .shared
            .registry
            .remove_node_subscriptions(topic, &self.uuid_str);

        if removed && !self.shared.registry.has_subscriptions(topic) {
            self.shared.endpoints.disconnect_topic(topic);
            self.shared
                .discovery
                .announce_disconnection(topic, "", &self.uuid_str);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Advertise a service. The callback maps a request to
    /// `Some(response)` on success or `None` for a failed call.
    ///
    /// Fails with [`Error::AlreadyAdvertised`] when this process already
    /// has a replier for the service.
    pub fn advertise_service<Req, Rep, F>(&self, topic: &str, callback: F, scope: Scope) -> Result<()>
    where
        Req: Message,
        Rep: Message,
        F: Fn(&str, &Req) -> Option<Rep> + Send + Sync + 'static,
    {
        topic::validate(topic)?;

        self.shared.registry.add_replier(
            topic,
            Arc::new(TypedReplier::<Req, Rep, _>::new(self.uuid_str.clone(), callback)),
        )?;
        self.state.lock().services.insert(topic.to_string());

        self.shared.discovery.advertise_service(Responder {
            topic: topic.to_string(),
            scope,
            reply_address: self.shared.endpoints.reply_address().to_string(),
            req_type: Req::type_name().to_string(),
            rep_type: Rep::type_name().to_string(),
            process_uuid: self.shared.process_uuid,
            node_uuid: self.uuid_str.clone(),
        });

        if self.verbose {
            log::info!(
                "[node] serving '{}' ({} -> {})",
                topic,
                Req::type_name(),
                Rep::type_name()
            );
        }
        Ok(())
    }

    /// Withdraw a service advertisement owned by this node.
    pub fn unadvertise_service(&self, topic: &str) -> Result<()> {
        topic::validate(topic)?;

        self.state.lock().services.remove(topic);
        if self.shared.registry.remove_replier(topic, &self.uuid_str) {
            self.shared
                .discovery
                .unadvertise_service(topic, &self.uuid_str);
        }
        Ok(())
    }

    /// Invoke a service without blocking. The callback receives
    /// `(topic, response, result_flag)` when the response arrives; a
    /// replier in this process is served synchronously before returning.
    pub fn request<Req, Rep, F>(&self, topic: &str, req: &Req, callback: F) -> Result<()>
    where
        Req: Message,
        Rep: Message,
        F: Fn(&str, Option<&Rep>, bool) + Send + Sync + 'static,
    {
        topic::validate(topic)?;
        let payload = req.encode()?;

        // In-process shortcut: a local replier answers synchronously.
        if let Some(replier) = self.shared.registry.replier(topic) {
            let (result, response) = replier.invoke(topic, &payload);
            let (rep, result) = decode_response::<Rep>(&response, result);
            callback(topic, rep.as_ref(), result);
            return Ok(());
        }

        let erased: ResponseCallback = Box::new(move |topic, response, result| {
            let (rep, result) = decode_response::<Rep>(response, result);
            callback(topic, rep.as_ref(), result);
        });

        let pending = Arc::new(PendingRequest::new(
            Uuid::new_v4().to_string(),
            topic.to_string(),
            self.uuid_str.clone(),
            Req::type_name().to_string(),
            Rep::type_name().to_string(),
            payload,
            Some(erased),
        ));
        self.shared.registry.add_request(pending);

        // Resolve a responder; known ones are flushed synchronously via
        // the discovery connection callback.
        self.shared.discovery.discover_service(topic);
        Ok(())
    }

    /// Invoke a service and wait for the response.
    ///
    /// Returns `Ok(Some(response))` on a successful call,
    /// `Ok(None)` when the responder flagged failure, and
    /// [`Error::Timeout`] when the deadline expires. A timeout does not
    /// cancel the in-flight remote request; its late response is
    /// dropped.
    pub fn request_blocking<Req, Rep>(
        &self,
        topic: &str,
        req: &Req,
        timeout: Duration,
    ) -> Result<Option<Rep>>
    where
        Req: Message,
        Rep: Message,
    {
        topic::validate(topic)?;
        let payload = req.encode()?;

        // In-process shortcut: answered without touching the network.
        if let Some(replier) = self.shared.registry.replier(topic) {
            let (result, response) = replier.invoke(topic, &payload);
            if !result {
                return Ok(None);
            }
            return Ok(Some(Rep::decode(&response)?));
        }

        let pending = Arc::new(PendingRequest::new(
            Uuid::new_v4().to_string(),
            topic.to_string(),
            self.uuid_str.clone(),
            Req::type_name().to_string(),
            Rep::type_name().to_string(),
            payload,
            None,
        ));
        let request_id = pending.id.clone();
        self.shared.registry.add_request(Arc::clone(&pending));
        self.shared.discovery.discover_service(topic);

        match pending.wait(timeout) {
            Some((result, response)) => {
                if !result {
                    return Ok(None);
                }
                Ok(Some(Rep::decode(&response)?))
            }
            None => {
                // Remove the entry so a late response is dropped.
                self.shared.registry.take_request(topic, &request_id);
                Err(Error::Timeout)
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection (consumed by the CLI)
    // ------------------------------------------------------------------

    /// All topics known to this process, local and discovered.
    pub fn topic_list(&self) -> Vec<String> {
        self.shared.discovery.topic_list()
    }

    /// Every known publisher for a topic.
    pub fn topic_info(&self, topic: &str) -> Vec<Publisher> {
        self.shared.discovery.topic_info(topic)
    }

    /// All services known to this process, local and discovered.
    pub fn service_list(&self) -> Vec<String> {
        self.shared.discovery.service_list()
    }

    /// Every known responder for a service.
    pub fn service_info(&self, topic: &str) -> Vec<Responder> {
        self.shared.discovery.service_info(topic)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let state = std::mem::take(&mut *self.state.lock());

        for topic in state.advertised.keys() {
            self.shared.discovery.unadvertise(topic, &self.uuid_str);
        }
        for topic in &state.services {
            if self.shared.registry.remove_replier(topic, &self.uuid_str) {
                self.shared.discovery.unadvertise_service(topic, &self.uuid_str);
            }
        }
        for topic in &state.subscribed {
            let removed = self
                .shared
                .registry
                .remove_node_subscriptions(topic, &self.uuid_str);
            if removed && !self.shared.registry.has_subscriptions(topic) {
                self.shared.endpoints.disconnect_topic(topic);
                self.shared
                    .discovery
                    .announce_disconnection(topic, "", &self.uuid_str);
            }
        }

        // Blocking waiters on this node's requests wake with failure.
        self.shared.registry.cancel_node_requests(&self.uuid_str);
        log::debug!("[node] destroyed node {}", self.uuid_str);
    }
}
