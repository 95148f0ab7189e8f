// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The per-process runtime shared by all nodes.
//!
//! Discovery, the transport endpoints, and the handler registry are
//! process-wide singletons, initialised lazily when the first node is
//! created and torn down when the last node is dropped. Nodes hold an
//! `Arc<NodeShared>`; a global `Weak` hands the same instance to every
//! node without keeping the runtime alive on its own.

use super::dispatch::Dispatcher;
use crate::config::Settings;
use crate::discovery::{pick_responder, Discovery, Publisher, Responder};
use crate::error::Result;
use crate::protocol::DataFrame;
use crate::registry::Registry;
use crate::transport::multicast::advertised_ip;
use crate::transport::Endpoints;
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use uuid::Uuid;

pub(crate) struct NodeShared {
    pub settings: Settings,
    pub process_uuid: Uuid,
    pub registry: Arc<Registry>,
    pub dispatcher: Arc<Dispatcher>,
    pub endpoints: Endpoints,
    pub discovery: Discovery,
}

impl NodeShared {
    /// Join (or lazily create) the per-process runtime.
    pub fn instance() -> Result<Arc<Self>> {
        static SHARED: OnceLock<Mutex<Weak<NodeShared>>> = OnceLock::new();
        let slot = SHARED.get_or_init(|| Mutex::new(Weak::new()));

        let mut guard = slot.lock();
        if let Some(shared) = guard.upgrade() {
            return Ok(shared);
        }

        let shared = Arc::new(Self::create()?);
        shared.wire_discovery(&shared);
        *guard = Arc::downgrade(&shared);
        Ok(shared)
    }

    fn create() -> Result<Self> {
        let settings = Settings::from_env();
        let process_uuid = Uuid::new_v4();

        let registry = Arc::new(Registry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            process_uuid,
            settings.verbose,
        ));

        let ip = advertised_ip(settings.ip_override);
        let endpoints = Endpoints::start(ip, Arc::clone(&dispatcher) as _)?;
        let discovery = Discovery::start(settings.clone(), process_uuid)?;

        log::info!(
            "[node] fabric runtime started (process {} partition '{}')",
            process_uuid,
            settings.partition
        );

        Ok(Self {
            settings,
            process_uuid,
            registry,
            dispatcher,
            endpoints,
            discovery,
        })
    }

    /// Hook discovery events into the transport and the request path.
    /// Callbacks hold a `Weak` so the runtime can still tear down.
    fn wire_discovery(&self, shared: &Arc<Self>) {
        let weak = Arc::downgrade(shared);
        let on_pub_connect = {
            let weak = weak.clone();
            move |topic: &str, publisher: &Publisher| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_publisher_found(topic, publisher);
                }
            }
        };
        let on_pub_disconnect = {
            let weak = weak.clone();
            move |_topic: &str, publisher: &Publisher| {
                if let Some(shared) = weak.upgrade() {
                    shared.endpoints.disconnect_addr(&publisher.address);
                }
            }
        };
        self.discovery
            .set_publisher_callbacks(Arc::new(on_pub_connect), Arc::new(on_pub_disconnect));

        let on_srv_connect = {
            let weak = weak.clone();
            move |topic: &str, _responder: &Responder| {
                if let Some(shared) = weak.upgrade() {
                    shared.flush_pending(topic);
                }
            }
        };
        let on_srv_disconnect = {
            move |_topic: &str, responder: &Responder| {
                if let Some(shared) = weak.upgrade() {
                    shared.endpoints.disconnect_addr(&responder.reply_address);
                }
            }
        };
        self.discovery
            .set_responder_callbacks(Arc::new(on_srv_connect), Arc::new(on_srv_disconnect));
    }

    /// A publisher appeared for a topic someone here subscribes to:
    /// connect the inbound socket and tell the publisher.
    fn on_publisher_found(&self, topic: &str, publisher: &Publisher) {
        if !self.registry.has_subscriptions(topic) {
            return;
        }
        log::debug!(
            "[node] connecting to publisher of '{}' at {}",
            topic,
            publisher.address
        );
        self.endpoints.connect_publisher(topic, &publisher.address);
        self.discovery.announce_connection(topic, &publisher.address, "");
    }

    /// Send every not-yet-dispatched pending request for a service to
    /// the deterministically chosen responder. All requesters pick the
    /// same one; the others are not contacted.
    pub fn flush_pending(&self, topic: &str) {
        let Some(responder) = pick_responder(self.discovery.responders(topic)) else {
            return;
        };

        for pending in self.registry.requests(topic) {
            if pending.is_complete() || !pending.claim_send() {
                continue;
            }
            let frame = DataFrame::Request {
                topic: topic.to_string(),
                request_id: pending.id.clone(),
                reply_address: self.endpoints.reply_address().to_string(),
                process_uuid: self.process_uuid,
                req_type: pending.req_type.clone(),
                rep_type: pending.rep_type.clone(),
                payload: pending.request_bytes.clone(),
            };
            log::debug!(
                "[node] request '{}' ({}) -> {}",
                topic,
                pending.id,
                responder.reply_address
            );
            self.endpoints
                .send_request(&responder.reply_address, &frame.encode());
        }
    }
}

impl Drop for NodeShared {
    fn drop(&mut self) {
        // Wake every blocked requester with failure before the sockets
        // go away; endpoints and discovery tear down field by field
        // afterwards (discovery sends BYE).
        self.registry.cancel_all_requests();
        log::info!("[node] fabric runtime stopping");
    }
}
