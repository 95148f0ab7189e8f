// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handler registry: subscriptions, repliers, and pending requests.
//!
//! Three maps, each keyed by topic and then by owner identifier, behind
//! one mutex. Dispatch never runs user code under the lock: callers take
//! a snapshot of the relevant bucket, release the lock, then invoke
//! callbacks. A callback may therefore freely re-enter the registry
//! (e.g. unsubscribe from inside a subscription callback).

pub mod handlers;

pub use handlers::{
    next_handler_id, PendingRequest, ReplierHandler, ResponseCallback, SubscriptionHandler,
    TypedReplier, TypedSubscription,
};

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    /// topic -> handler_id -> subscription
    subscriptions: HashMap<String, HashMap<u64, Arc<dyn SubscriptionHandler>>>,
    /// topic -> node_uuid -> replier (at most one entry per topic)
    repliers: HashMap<String, HashMap<String, Arc<dyn ReplierHandler>>>,
    /// topic -> request_id -> pending request
    requests: HashMap<String, HashMap<String, Arc<PendingRequest>>>,
}

/// Per-process handler registry.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a subscription handler, returning its id.
    pub fn add_subscription(&self, topic: &str, handler: Arc<dyn SubscriptionHandler>) -> u64 {
        let id = next_handler_id();
        let mut inner = self.inner.lock();
        inner
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(id, handler);
        id
    }

    /// Remove every subscription a node owns on a topic. Returns true
    /// when at least one handler was removed.
    pub fn remove_node_subscriptions(&self, topic: &str, node_uuid: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(bucket) = inner.subscriptions.get_mut(topic) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|_, h| h.node_uuid() != node_uuid);
        let removed = bucket.len() < before;
        if bucket.is_empty() {
            inner.subscriptions.remove(topic);
        }
        removed
    }

    /// Snapshot all subscription handlers for a topic.
    pub fn subscriptions(&self, topic: &str) -> Vec<Arc<dyn SubscriptionHandler>> {
        let inner = self.inner.lock();
        inner
            .subscriptions
            .get(topic)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any node in this process subscribes to the topic.
    pub fn has_subscriptions(&self, topic: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .subscriptions
            .get(topic)
            .is_some_and(|bucket| !bucket.is_empty())
    }

    // ------------------------------------------------------------------
    // Repliers
    // ------------------------------------------------------------------

    /// Register a service replier. At most one replier may exist per
    /// topic within a process.
    pub fn add_replier(&self, topic: &str, handler: Arc<dyn ReplierHandler>) -> Result<()> {
        let mut inner = self.inner.lock();
        let bucket = inner.repliers.entry(topic.to_string()).or_default();
        if !bucket.is_empty() {
            return Err(Error::AlreadyAdvertised(topic.to_string()));
        }
        bucket.insert(handler.node_uuid().to_string(), handler);
        Ok(())
    }

    /// Snapshot the replier for a topic, if any.
    pub fn replier(&self, topic: &str) -> Option<Arc<dyn ReplierHandler>> {
        let inner = self.inner.lock();
        inner
            .repliers
            .get(topic)
            .and_then(|bucket| bucket.values().next().cloned())
    }

    /// Remove the replier a node owns on a topic.
    pub fn remove_replier(&self, topic: &str, node_uuid: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(bucket) = inner.repliers.get_mut(topic) else {
            return false;
        };
        let removed = bucket.remove(node_uuid).is_some();
        if bucket.is_empty() {
            inner.repliers.remove(topic);
        }
        removed
    }

    // ------------------------------------------------------------------
    // Pending requests
    // ------------------------------------------------------------------

    /// Store a pending request.
    pub fn add_request(&self, pending: Arc<PendingRequest>) {
        let mut inner = self.inner.lock();
        inner
            .requests
            .entry(pending.topic.clone())
            .or_default()
            .insert(pending.id.clone(), pending);
    }

    /// Remove and return a pending request by correlation id. A `None`
    /// here means the request already timed out or was cancelled; the
    /// caller drops the (late) response.
    pub fn take_request(&self, topic: &str, request_id: &str) -> Option<Arc<PendingRequest>> {
        let mut inner = self.inner.lock();
        let bucket = inner.requests.get_mut(topic)?;
        let pending = bucket.remove(request_id);
        if bucket.is_empty() {
            inner.requests.remove(topic);
        }
        pending
    }

    /// Snapshot the pending requests for a topic (sent and unsent).
    pub fn requests(&self, topic: &str) -> Vec<Arc<PendingRequest>> {
        let inner = self.inner.lock();
        inner
            .requests
            .get(topic)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and cancel every pending request a node owns. Waiters wake
    /// with a failed, empty response.
    pub fn cancel_node_requests(&self, node_uuid: &str) {
        let cancelled = {
            let mut inner = self.inner.lock();
            let mut cancelled = Vec::new();
            inner.requests.retain(|_, bucket| {
                bucket.retain(|_, pending| {
                    if pending.node_uuid == node_uuid {
                        cancelled.push(Arc::clone(pending));
                        false
                    } else {
                        true
                    }
                });
                !bucket.is_empty()
            });
            cancelled
        };

        for pending in cancelled {
            pending.cancel();
        }
    }

    /// Cancel everything (runtime shutdown).
    pub fn cancel_all_requests(&self) {
        let cancelled: Vec<Arc<PendingRequest>> = {
            let mut inner = self.inner.lock();
            let all = inner
                .requests
                .values()
                .flat_map(|bucket| bucket.values().cloned())
                .collect();
            inner.requests.clear();
            all
        };

        for pending in cancelled {
            pending.cancel();
        }
    }
}
