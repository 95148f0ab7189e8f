// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Type-erased handler objects.
//!
//! User callbacks are typed; the registry and the receive loop are not.
//! Each concrete handler knows how to parse its expected payload type
//! and call the user's typed callback, exposing only an opaque
//! `invoke(...)` to the rest of the fabric.

use crate::error::Result;
use crate::message::Message;
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide handler id source.
static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh handler id.
pub fn next_handler_id() -> u64 {
    NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A registered topic subscription.
pub trait SubscriptionHandler: Send + Sync {
    /// UUID of the owning node (string form).
    fn node_uuid(&self) -> &str;

    /// Payload type this handler expects.
    fn type_name(&self) -> &'static str;

    /// Decode the payload and run the user callback.
    ///
    /// Callers must have verified the type name already; a decode failure
    /// here means the sender lied about the type and is reported back.
    fn invoke(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Typed subscription adapter.
pub struct TypedSubscription<M, F>
where
    M: Message,
    F: Fn(&str, &M) + Send + Sync,
{
    node_uuid: String,
    callback: F,
    _marker: PhantomData<fn(M)>,
}

impl<M, F> TypedSubscription<M, F>
where
    M: Message,
    F: Fn(&str, &M) + Send + Sync,
{
    pub fn new(node_uuid: String, callback: F) -> Self {
        Self {
            node_uuid,
            callback,
            _marker: PhantomData,
        }
    }
}

impl<M, F> SubscriptionHandler for TypedSubscription<M, F>
where
    M: Message,
    F: Fn(&str, &M) + Send + Sync,
{
    fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    fn type_name(&self) -> &'static str {
        M::type_name()
    }

    fn invoke(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let msg = M::decode(payload)?;
        (self.callback)(topic, &msg);
        Ok(())
    }
}

/// A registered service replier.
pub trait ReplierHandler: Send + Sync {
    /// UUID of the owning node (string form).
    fn node_uuid(&self) -> &str;

    /// Request payload type.
    fn req_type(&self) -> &'static str;

    /// Response payload type.
    fn rep_type(&self) -> &'static str;

    /// Decode the request, run the service callback, and encode the
    /// response. Returns `(result_flag, response_bytes)`; decode or
    /// encode failures yield `(false, empty)`.
    fn invoke(&self, topic: &str, request: &[u8]) -> (bool, Vec<u8>);
}

/// Typed replier adapter. A callback returning `None` signals a failed
/// service call (result flag false).
pub struct TypedReplier<Req, Rep, F>
where
    Req: Message,
    Rep: Message,
    F: Fn(&str, &Req) -> Option<Rep> + Send + Sync,
{
    node_uuid: String,
    callback: F,
    _marker: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep, F> TypedReplier<Req, Rep, F>
where
    Req: Message,
    Rep: Message,
    F: Fn(&str, &Req) -> Option<Rep> + Send + Sync,
{
    pub fn new(node_uuid: String, callback: F) -> Self {
        Self {
            node_uuid,
            callback,
            _marker: PhantomData,
        }
    }
}

impl<Req, Rep, F> ReplierHandler for TypedReplier<Req, Rep, F>
where
    Req: Message,
    Rep: Message,
    F: Fn(&str, &Req) -> Option<Rep> + Send + Sync,
{
    fn node_uuid(&self) -> &str {
        &self.node_uuid
    }

    fn req_type(&self) -> &'static str {
        Req::type_name()
    }

    fn rep_type(&self) -> &'static str {
        Rep::type_name()
    }

    fn invoke(&self, topic: &str, request: &[u8]) -> (bool, Vec<u8>) {
        let req = match Req::decode(request) {
            Ok(req) => req,
            Err(e) => {
                log::debug!("[registry] replier on '{}' got undecodable request: {}", topic, e);
                return (false, Vec::new());
            }
        };

        match (self.callback)(topic, &req) {
            Some(rep) => match rep.encode() {
                Ok(bytes) => (true, bytes),
                Err(e) => {
                    log::debug!("[registry] replier on '{}' produced unencodable response: {}", topic, e);
                    (false, Vec::new())
                }
            },
            None => (false, Vec::new()),
        }
    }
}

/// Completion slot of a pending request.
#[derive(Debug, Default)]
struct ResponseSlot {
    available: bool,
    result: bool,
    response: Vec<u8>,
}

/// Callback signature for non-blocking requests: `(topic, response
/// payload, result_flag)`. The payload is only meaningful when the
/// result flag is true.
pub type ResponseCallback = Box<dyn Fn(&str, &[u8], bool) + Send + Sync>;

/// An outstanding service request awaiting a response.
///
/// Blocking callers park on the condition variable; the non-blocking
/// path stores a callback invoked on completion. Either way the slot is
/// populated exactly once (`complete` and `cancel` are first-wins).
pub struct PendingRequest {
    /// Correlation id carried in the request frame.
    pub id: String,
    /// Service topic.
    pub topic: String,
    /// UUID of the requesting node (string form).
    pub node_uuid: String,
    /// Expected response type name.
    pub rep_type: String,
    /// Request payload type name.
    pub req_type: String,
    /// Serialized request payload.
    pub request_bytes: Vec<u8>,

    slot: Mutex<ResponseSlot>,
    cond: Condvar,
    callback: Option<ResponseCallback>,
    sent: AtomicBool,
}

impl PendingRequest {
    pub fn new(
        id: String,
        topic: String,
        node_uuid: String,
        req_type: String,
        rep_type: String,
        request_bytes: Vec<u8>,
        callback: Option<ResponseCallback>,
    ) -> Self {
        Self {
            id,
            topic,
            node_uuid,
            rep_type,
            req_type,
            request_bytes,
            slot: Mutex::new(ResponseSlot::default()),
            cond: Condvar::new(),
            callback,
            sent: AtomicBool::new(false),
        }
    }

    /// Claim the right to send this request. Returns false when another
    /// path already dispatched it.
    pub fn claim_send(&self) -> bool {
        !self.sent.swap(true, Ordering::AcqRel)
    }

    /// Deliver the response: populate the slot, wake waiters, run the
    /// owner callback. Later calls are ignored.
    pub fn complete(&self, response: Vec<u8>, result: bool) {
        {
            let mut slot = self.slot.lock();
            if slot.available {
                return;
            }
            slot.available = true;
            slot.result = result;
            slot.response = response.clone();
            self.cond.notify_all();
        }

        if let Some(cb) = &self.callback {
            cb(&self.topic, &response, result);
        }
    }

    /// Cancel the request (node death / runtime shutdown): waiters wake
    /// with a failed, empty response.
    pub fn cancel(&self) {
        self.complete(Vec::new(), false);
    }

    /// Block until the response arrives or the timeout elapses.
    ///
    /// Returns `Some((result_flag, response_bytes))` on completion,
    /// `None` on timeout. A timeout does not cancel the in-flight remote
    /// request; the caller removes the pending entry so a late response
    /// is dropped.
    pub fn wait(&self, timeout: Duration) -> Option<(bool, Vec<u8>)> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot.lock();
        while !slot.available {
            if self.cond.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        if slot.available {
            Some((slot.result, slot.response.clone()))
        } else {
            None
        }
    }

    /// Whether the response already arrived.
    pub fn is_complete(&self) -> bool {
        self.slot.lock().available
    }
}

/// Decode a response payload for a typed non-blocking callback, mapping
/// failed results and undecodable payloads to `None`.
pub fn decode_response<Rep: Message>(payload: &[u8], result: bool) -> (Option<Rep>, bool) {
    if !result {
        return (None, false);
    }
    match Rep::decode(payload) {
        Ok(rep) => (Some(rep), true),
        Err(e) => {
            log::debug!("[registry] dropping undecodable response payload: {}", e);
            (None, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Int32, StringMsg};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn typed_subscription_invokes_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        let handler = TypedSubscription::<StringMsg, _>::new(
            "node-1".to_string(),
            move |topic, msg: &StringMsg| {
                assert_eq!(topic, "/foo");
                assert_eq!(msg.data, "hi");
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        let payload = StringMsg::new("hi").encode().expect("encode");
        handler.invoke("/foo", &payload).expect("invoke");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(handler.type_name(), StringMsg::type_name());
    }

    #[test]
    fn typed_subscription_rejects_garbage() {
        let handler =
            TypedSubscription::<Int32, _>::new("node-1".to_string(), |_topic, _msg: &Int32| {
                panic!("must not be called");
            });
        assert!(handler.invoke("/foo", &[1, 2, 3]).is_err());
    }

    #[test]
    fn typed_replier_echoes() {
        let replier = TypedReplier::<Int32, Int32, _>::new(
            "node-1".to_string(),
            |_topic, req: &Int32| Some(*req),
        );

        let request = Int32::new(10).encode().expect("encode");
        let (result, response) = replier.invoke("/echo", &request);
        assert!(result);
        assert_eq!(Int32::decode(&response).expect("decode").data, 10);
    }

    #[test]
    fn typed_replier_failure_path() {
        let replier = TypedReplier::<Int32, Int32, _>::new(
            "node-1".to_string(),
            |_topic, _req: &Int32| None,
        );

        let request = Int32::new(1).encode().expect("encode");
        let (result, response) = replier.invoke("/echo", &request);
        assert!(!result);
        assert!(response.is_empty());

        // Undecodable request also fails without panicking.
        let (result, _) = replier.invoke("/echo", &[1]);
        assert!(!result);
    }

    #[test]
    fn pending_request_complete_wakes_waiter() {
        let pending = Arc::new(PendingRequest::new(
            "r1".to_string(),
            "/echo".to_string(),
            "node-1".to_string(),
            Int32::type_name().to_string(),
            Int32::type_name().to_string(),
            vec![1, 0, 0, 0],
            None,
        ));

        let pending_clone = Arc::clone(&pending);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            pending_clone.complete(vec![9], true);
        });

        let (result, response) = pending
            .wait(Duration::from_millis(500))
            .expect("response before timeout");
        assert!(result);
        assert_eq!(response, vec![9]);
        handle.join().expect("join");
    }

    #[test]
    fn pending_request_times_out() {
        let pending = PendingRequest::new(
            "r1".to_string(),
            "/echo".to_string(),
            "node-1".to_string(),
            String::new(),
            String::new(),
            Vec::new(),
            None,
        );

        let start = Instant::now();
        assert!(pending.wait(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn pending_request_completes_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let pending = PendingRequest::new(
            "r1".to_string(),
            "/echo".to_string(),
            "node-1".to_string(),
            String::new(),
            String::new(),
            Vec::new(),
            Some(Box::new(move |_topic, _payload, _result| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        pending.complete(vec![1], true);
        pending.complete(vec![2], true);
        pending.cancel();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let (result, response) = pending.wait(Duration::from_millis(10)).expect("complete");
        assert!(result);
        assert_eq!(response, vec![1]);
    }

    #[test]
    fn claim_send_is_exclusive() {
        let pending = PendingRequest::new(
            "r1".to_string(),
            "/echo".to_string(),
            "node-1".to_string(),
            String::new(),
            String::new(),
            Vec::new(),
            None,
        );
        assert!(pending.claim_send());
        assert!(!pending.claim_send());
    }
}
