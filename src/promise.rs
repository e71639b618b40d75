//! [`ResponsePromise`] — a handle to an in-flight request whose response
//! headers have not yet been read.
//!
//! Grounded on `urllib3.future`'s `backend._base.ResponsePromise`: a 16
//! random byte uid (rather than `id()` of a Python object, which a systems
//! language should replace with a generation-checked handle), combined here
//! with a `ConnectionHandle` back-reference.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::HeaderMap;
use rand::RngCore;

use crate::response::LowLevelResponse;

/// Any small, clonable value a caller can stash on a promise with
/// [`ResponsePromise::set_parameter`] and retrieve later with
/// [`ResponsePromise::get_parameter`]. A loose string-to-any parameter map,
/// so callers aren't forced through a single concrete type.
pub trait Parameter: std::any::Any + fmt::Debug + Send + Sync {}
impl<T: std::any::Any + fmt::Debug + Send + Sync> Parameter for T {}

/// A non-owning reference to the connection a promise or pending response
/// belongs to: a monotonic counter plus a generation, validated on every use
/// rather than dereferenced as a raw pointer.
///
/// A handle outlives any one connection; [`crate::pool::TrafficPolice`]
/// bumps the generation whenever a registry slot is reused so a stale handle
/// is detectably wrong instead of silently pointing at an unrelated item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub(crate) index: u64,
    pub(crate) generation: u64,
}

impl ConnectionHandle {
    pub(crate) fn new(index: u64, generation: u64) -> Self {
        ConnectionHandle { index, generation }
    }
}

/// A handle returned when a request has been dispatched but no response
/// headers have been read yet.
///
/// Two promises compare equal iff their [`uid`](ResponsePromise::uid)s
/// match; a promise's [`stream_id`](ResponsePromise::stream_id) must equal
/// that of the response eventually bound to it.
pub struct ResponsePromise {
    uid: String,
    connection: ConnectionHandle,
    stream_id: u64,
    request_headers: HeaderMap,
    parameters: HashMap<String, Box<dyn Parameter>>,
    response: Option<LowLevelResponse>,
}

impl ResponsePromise {
    /// Create a new promise for a request dispatched on `connection`'s
    /// `stream_id`, echoing the headers that were sent.
    pub fn new(connection: ConnectionHandle, stream_id: u64, request_headers: HeaderMap) -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        let uid = URL_SAFE_NO_PAD.encode(raw);

        ResponsePromise {
            uid,
            connection,
            stream_id,
            request_headers,
            parameters: HashMap::new(),
            response: None,
        }
    }

    /// The globally unique id assigned at creation time.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The connection that owns this promise, as a non-owning handle.
    pub fn connection(&self) -> ConnectionHandle {
        self.connection
    }

    /// The protocol-specific stream id this promise was dispatched on.
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// The request headers as they were sent, for diagnostics/retries one
    /// layer up.
    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    /// True iff a response has been bound to this promise.
    pub fn is_ready(&self) -> bool {
        self.response.is_some()
    }

    /// The bound response, if any.
    pub fn response(&self) -> Option<&LowLevelResponse> {
        self.response.as_ref()
    }

    /// Bind the response that resolves this promise. Panics if the
    /// response's stream id disagrees with this promise's — that would mean
    /// a backend wired frames to the wrong promise.
    pub fn set_response(&mut self, response: LowLevelResponse) {
        assert_eq!(
            response.stream_id(),
            self.stream_id,
            "response bound to a promise for a different stream"
        );
        self.response = Some(response);
    }

    /// Stash an arbitrary, caller-defined value under `key`.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Parameter) {
        self.parameters.insert(key.into(), Box::new(value));
    }

    /// Retrieve a previously stashed value, if present and of type `T`.
    pub fn get_parameter<T: Parameter>(&self, key: &str) -> Option<&T> {
        self.parameters
            .get(key)
            .and_then(|v| (&**v as &dyn std::any::Any).downcast_ref::<T>())
    }
}

impl fmt::Debug for ResponsePromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponsePromise")
            .field("uid", &self.uid)
            .field("stream_id", &self.stream_id)
            .field("is_ready", &self.is_ready())
            .finish()
    }
}

impl PartialEq for ResponsePromise {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

impl Eq for ResponsePromise {}

impl std::hash::Hash for ResponsePromise {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::new(0, 0)
    }

    #[test]
    fn two_promises_never_collide() {
        let a = ResponsePromise::new(handle(), 1, HeaderMap::new());
        let b = ResponsePromise::new(handle(), 1, HeaderMap::new());
        assert_ne!(a, b);
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn equality_is_by_uid_only() {
        let mut a = ResponsePromise::new(handle(), 3, HeaderMap::new());
        let b = ResponsePromise::new(handle(), 3, HeaderMap::new());
        assert_ne!(a, b);

        a.set_parameter("retries", 2u32);
        assert_eq!(a.get_parameter::<u32>("retries"), Some(&2));
        assert_eq!(a.get_parameter::<u32>("missing"), None);
    }

    #[test]
    fn not_ready_until_response_bound() {
        let mut promise = ResponsePromise::new(handle(), 7, HeaderMap::new());
        assert!(!promise.is_ready());

        let response = LowLevelResponse::new(
            http::Method::GET,
            11,
            http::StatusCode::OK,
            "OK".to_owned(),
            HeaderMap::new(),
            7,
            None,
        );
        promise.set_response(response);
        assert!(promise.is_ready());
    }
}
