// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame dispatch: the bridge between the receive loop and the handler
//! registry.
//!
//! Every dispatch path snapshots the relevant registry bucket before
//! invoking user callbacks, so callbacks may re-enter the node freely.
//! Callback panics are isolated per handler and counted; one broken
//! subscriber never takes down its neighbours or the receive loop.

use crate::protocol::DataFrame;
use crate::registry::Registry;
use crate::transport::FrameHandler;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    process_uuid: Uuid,
    verbose: bool,
    callback_panics: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, process_uuid: Uuid, verbose: bool) -> Self {
        Self {
            registry,
            process_uuid,
            verbose,
            callback_panics: AtomicU64::new(0),
        }
    }

    /// Deliver a topic payload to every local handler expecting its
    /// type. Handlers registered with a different type are skipped
    /// without error; multiple typed handlers may coexist on one topic.
    ///
    /// Used by both the network receive path and the in-process
    /// publish shortcut.
    pub fn deliver_message(&self, topic: &str, type_name: &str, payload: &[u8]) {
        for handler in self.registry.subscriptions(topic) {
            if handler.type_name() != type_name {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler.invoke(topic, payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::debug!("[dispatch] handler on '{}' rejected payload: {}", topic, e);
                }
                Err(_) => {
                    self.callback_panics.fetch_add(1, Ordering::Relaxed);
                    if self.verbose {
                        log::warn!("[dispatch] subscription callback on '{}' panicked", topic);
                    } else {
                        log::debug!("[dispatch] subscription callback on '{}' panicked", topic);
                    }
                }
            }
        }
    }

    /// Run the local replier for a request and build the response frame
    /// body. A missing replier (lost a race with unadvertise) or a
    /// panicking callback answers with a failed result.
    pub fn answer_request(&self, topic: &str, request_id: &str, payload: &[u8]) -> Vec<u8> {
        let (result, response) = match self.registry.replier(topic) {
            Some(replier) => {
                match catch_unwind(AssertUnwindSafe(|| replier.invoke(topic, payload))) {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        self.callback_panics.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[dispatch] replier on '{}' panicked", topic);
                        (false, Vec::new())
                    }
                }
            }
            None => {
                log::debug!("[dispatch] request for '{}' but no replier here", topic);
                (false, Vec::new())
            }
        };

        DataFrame::Response {
            topic: topic.to_string(),
            request_id: request_id.to_string(),
            process_uuid: self.process_uuid,
            payload: response,
            result,
        }
        .encode()
    }

    /// Callback panics observed since startup.
    #[cfg(test)]
    pub fn callback_panics(&self) -> u64 {
        self.callback_panics.load(Ordering::Relaxed)
    }
}

impl FrameHandler for Dispatcher {
    fn on_message(&self, frame: DataFrame) {
        if let DataFrame::Message {
            topic,
            type_name,
            payload,
            ..
        } = frame
        {
            self.deliver_message(&topic, &type_name, &payload);
        }
    }

    fn on_request(&self, frame: DataFrame) -> Vec<u8> {
        match frame {
            DataFrame::Request {
                topic,
                request_id,
                payload,
                ..
            } => self.answer_request(&topic, &request_id, &payload),
            other => {
                // Unreachable via the receive loop; answer with failure
                // rather than leave the requester hanging.
                DataFrame::Response {
                    topic: other.topic().to_string(),
                    request_id: String::new(),
                    process_uuid: self.process_uuid,
                    payload: Vec::new(),
                    result: false,
                }
                .encode()
            }
        }
    }

    fn on_response(&self, frame: DataFrame) {
        if let DataFrame::Response {
            topic,
            request_id,
            payload,
            result,
            ..
        } = frame
        {
            match self.registry.take_request(&topic, &request_id) {
                Some(pending) => pending.complete(payload, result),
                None => {
                    // Either the blocking caller timed out or the node
                    // was destroyed; late responses are dropped.
                    log::debug!(
                        "[dispatch] late response for '{}' ({}) dropped",
                        topic,
                        request_id
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::messages::{Int32, StringMsg};
    use crate::registry::{PendingRequest, TypedReplier, TypedSubscription};
    use std::sync::atomic::AtomicUsize;

    fn dispatcher() -> (Arc<Registry>, Dispatcher) {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Uuid::new_v4(), false);
        (registry, dispatcher)
    }

    #[test]
    fn mismatched_type_is_skipped_without_error() {
        let (registry, dispatcher) = dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));

        let string_hits = Arc::clone(&hits);
        registry.add_subscription(
            "/foo",
            Arc::new(TypedSubscription::<StringMsg, _>::new(
                "n1".to_string(),
                move |_, _: &StringMsg| {
                    string_hits.fetch_add(1, Ordering::SeqCst);
                },
            )),
        );
        let int_hits = Arc::clone(&hits);
        registry.add_subscription(
            "/foo",
            Arc::new(TypedSubscription::<Int32, _>::new(
                "n1".to_string(),
                move |_, _: &Int32| {
                    int_hits.fetch_add(100, Ordering::SeqCst);
                },
            )),
        );

        let payload = StringMsg::new("x").encode().expect("encode");
        dispatcher.deliver_message("/foo", StringMsg::type_name(), &payload);

        // Only the StringMsg handler fired.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let (registry, dispatcher) = dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.add_subscription(
            "/foo",
            Arc::new(TypedSubscription::<Int32, _>::new(
                "n1".to_string(),
                |_, _: &Int32| std::panic::panic_any("subscriber panic"),
            )),
        );
        let survivor_hits = Arc::clone(&hits);
        registry.add_subscription(
            "/foo",
            Arc::new(TypedSubscription::<Int32, _>::new(
                "n2".to_string(),
                move |_, _: &Int32| {
                    survivor_hits.fetch_add(1, Ordering::SeqCst);
                },
            )),
        );

        let payload = Int32::new(5).encode().expect("encode");
        dispatcher.deliver_message("/foo", Int32::type_name(), &payload);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.callback_panics(), 1);
    }

    #[test]
    fn request_without_replier_answers_failure() {
        let (_registry, dispatcher) = dispatcher();
        let body = dispatcher.answer_request("/echo", "r1", &[]);
        match DataFrame::parse(&body).expect("parse") {
            DataFrame::Response {
                result, payload, ..
            } => {
                assert!(!result);
                assert!(payload.is_empty());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn request_roundtrips_through_replier() {
        let (registry, dispatcher) = dispatcher();
        registry
            .add_replier(
                "/echo",
                Arc::new(TypedReplier::<Int32, Int32, _>::new(
                    "n1".to_string(),
                    |_, req: &Int32| Some(*req),
                )),
            )
            .expect("add replier");

        let request = Int32::new(10).encode().expect("encode");
        let body = dispatcher.answer_request("/echo", "r1", &request);
        match DataFrame::parse(&body).expect("parse") {
            DataFrame::Response {
                request_id,
                result,
                payload,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert!(result);
                assert_eq!(Int32::decode(&payload).expect("decode").data, 10);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn response_completes_pending_request() {
        let (registry, dispatcher) = dispatcher();
        let pending = Arc::new(PendingRequest::new(
            "r1".to_string(),
            "/echo".to_string(),
            "n1".to_string(),
            String::new(),
            String::new(),
            Vec::new(),
            None,
        ));
        registry.add_request(Arc::clone(&pending));

        dispatcher.on_response(DataFrame::Response {
            topic: "/echo".to_string(),
            request_id: "r1".to_string(),
            process_uuid: Uuid::new_v4(),
            payload: vec![7],
            result: true,
        });

        assert!(pending.is_complete());
        // The entry was removed; a duplicate response is a no-op.
        dispatcher.on_response(DataFrame::Response {
            topic: "/echo".to_string(),
            request_id: "r1".to_string(),
            process_uuid: Uuid::new_v4(),
            payload: vec![8],
            result: true,
        });
    }
}
