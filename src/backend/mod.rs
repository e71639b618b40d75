//! The per-connection state machine every protocol backend implements.
//!
//! `traffic-arbiter` treats a connection as an opaque state machine: the
//! arbiter ([`crate::pool`]) only ever needs to know whether an item is idle,
//! saturated, or multiplexed, while the rich request/response lifecycle
//! (`put_request`, `end_headers`, `get_response`, ...) is something each
//! protocol version implements in its own idiom. [`Manageable`] is the
//! narrow, object-safe contract the pool needs; [`BaseBackend`] is the full
//! operation set, implemented concretely by [`h1::Connection`],
//! [`h2::Connection`], and [`h3::Connection`].

use std::time::{Duration, Instant};

use http::HeaderMap;

use crate::ext::ConnectionInfo;
use crate::promise::ResponsePromise;
use crate::response::LowLevelResponse;
use crate::Result;

#[cfg(feature = "http1")]
pub mod h1;
#[cfg(feature = "http2")]
pub mod h2;
#[cfg(feature = "http3")]
pub mod h3;

mod quic_cache;

pub use quic_cache::PreemptiveQuicCache;

/// The three protocol revisions this crate negotiates.
///
/// Kept as a three-value enum rather than the bare `{11, 20, 30}` integers
/// `LowLevelResponse::version()` exposes at the wire-compat boundary, the
/// way the original implementation's `HttpVersion` enum does.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    /// HTTP/1.1 over a plain or TLS-wrapped TCP stream.
    Http11,
    /// HTTP/2, negotiated via ALPN over TLS (or prior knowledge over plaintext).
    H2,
    /// HTTP/3 over QUIC.
    H3,
}

impl HttpVersion {
    /// The legacy two/three-digit version number (`11`, `20`, `30`) some
    /// call sites (`LowLevelResponse::version`) still need for
    /// `http.client`-style compatibility.
    pub fn as_u16(self) -> u16 {
        match self {
            HttpVersion::Http11 => 11,
            HttpVersion::H2 => 20,
            HttpVersion::H3 => 30,
        }
    }

    /// The ALPN protocol id this version negotiates as, where applicable.
    pub fn alpn_id(self) -> &'static [u8] {
        match self {
            HttpVersion::Http11 => b"http/1.1",
            HttpVersion::H2 => b"h2",
            HttpVersion::H3 => b"h3",
        }
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::H2 => "HTTP/2.0",
            HttpVersion::H3 => "HTTP/3.0",
        };
        f.write_str(s)
    }
}

/// The ten states a backend connection moves through over its lifetime.
///
/// Transitions are driven exclusively by [`BaseBackend`]'s operations;
/// calling an operation from a state that doesn't allow it fails with
/// `ProtocolStateError` rather than silently doing the wrong thing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No transport exists yet.
    Disconnected,
    /// Transport established, no protocol handshake performed.
    Connected,
    /// A tunnel (`CONNECT`) has been requested but not yet confirmed.
    TunnelRequested,
    /// TLS (or QUIC's equivalent) handshake completed.
    TlsWrapped,
    /// `put_request`/`put_header` have started a request; headers not yet sent.
    RequestHeadersOpen,
    /// Headers were sent and a request body is being streamed.
    RequestBodyOpen,
    /// The full request was sent; waiting on response headers.
    AwaitingResponse,
    /// Response headers arrived; the body is being streamed.
    StreamingResponse,
    /// The connection is shutting down.
    Closing,
    /// The connection is fully torn down.
    Closed,
}

/// The subset of backend behavior [`crate::pool::TrafficPolice`] needs to
/// manage an item generically, independent of which protocol it speaks.
///
/// Every method here is synchronous bookkeeping — no I/O — so the trait
/// stays object-safe and the pool can hold connections of different
/// concrete backend types behind one indicator map.
pub trait Manageable {
    /// `is_idle ≡ (no pending promises) ∧ (no pending responses)`.
    fn is_idle(&self) -> bool;

    /// Protocol-defined: always true for H1 mid-request; for H2/H3, true
    /// once live streams equal the peer's advertised concurrency limit.
    fn is_saturated(&self) -> bool;

    /// True iff the negotiated version is H2 or H3.
    fn is_multiplexed(&self) -> bool;

    /// If this item is itself a nested pool (`PoolManager -> ConnectionPool`),
    /// a handle usable for one-level `locate`/`beacon` descent; `None` for a
    /// leaf connection.
    fn nested_pool(&self) -> Option<&dyn crate::pool::Beacon> {
        None
    }

    /// Tear down the transport and clear any bookkeeping. Must swallow
    /// secondary errors — the item is going away regardless.
    fn close(&mut self);
}

/// The full per-connection operation set.
///
/// Implemented by [`h1::Connection`], [`h2::Connection`], and
/// [`h3::Connection`]. Each concrete type also implements [`Manageable`] so
/// it can live inside a [`crate::pool::TrafficPolice`].
#[allow(async_fn_in_trait)]
pub trait BaseBackend: Manageable {
    /// The scheme this backend dials (`"http"` or `"https"`), part of the
    /// pool-selection-key composition (`scheme/host/port/tls-params`).
    fn scheme(&self) -> &'static str;

    /// The protocol versions this backend type is able to negotiate, most
    /// preferred first.
    fn supported_svn() -> &'static [HttpVersion]
    where
        Self: Sized;

    /// Telemetry gathered while dialing and negotiating this connection.
    fn conn_info(&self) -> &ConnectionInfo;

    /// True iff the identity of the direct peer's certificate has been
    /// verified against a trust store.
    fn is_verified(&self) -> bool;

    /// True iff, when tunneling through a proxy, the proxy's own
    /// certificate has been verified.
    fn proxy_is_verified(&self) -> bool;

    /// Open the transport (TCP connect, or QUIC handshake start). Sets
    /// `Connected`.
    async fn new_conn(&mut self) -> Result<()>;

    /// Perform the protocol handshake (TLS for `https`, QUIC transport
    /// parameters for H3); populate [`ConnectionInfo`].
    async fn post_conn(&mut self) -> Result<()>;

    /// Record a tunnel target without performing any I/O.
    fn set_tunnel(&mut self, host: &str, port: u16, headers: HeaderMap, scheme: &str);

    /// Emit `CONNECT` to the intermediary and await its 2xx response.
    async fn tunnel(&mut self) -> Result<()>;

    /// Begin a new request; for H2/H3 this allocates a new stream id.
    fn put_request(
        &mut self,
        method: &http::Method,
        path: &str,
        skip_host: bool,
        skip_accept_encoding: bool,
    ) -> Result<()>;

    /// Append a header; repeated names are preserved as ordered value lists.
    fn put_header(&mut self, name: &http::header::HeaderName, values: &[http::HeaderValue]) -> Result<()>;

    /// Finalize request headers. Returns a promise iff the connection is
    /// multiplexed and the caller did not request an immediate blocking
    /// read.
    async fn end_headers(
        &mut self,
        body: Option<&[u8]>,
        encode_chunked: bool,
        expect_body_afterward: bool,
    ) -> Result<Option<ResponsePromise>>;

    /// Enqueue body bytes; `eot` closes the request side. Returns a promise
    /// when the final byte is sent on a multiplexed connection.
    async fn send(&mut self, data: &[u8], eot: bool) -> Result<Option<ResponsePromise>>;

    /// Wait for response headers: on the given promise's stream if one is
    /// supplied, else on the oldest in-flight request (first-ready for
    /// multiplexed backends).
    async fn get_response(&mut self, promise: Option<&ResponsePromise>) -> Result<LowLevelResponse>;

    /// Set (or clear, with `None`) the deadline blocking socket operations
    /// are bounded by. Spec §3's per-`Connection` `timeout`. Backends that
    /// don't drive a [`crate::socket::Socket`] directly (H3's QUIC transport
    /// carries its own idle timeout from construction) may leave this a
    /// no-op.
    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Time the last request was dispatched, used by keepalive/idle-timeout
    /// policy one layer up.
    fn last_request_at(&self) -> Option<Instant>;

    /// How long ago the last request was dispatched, if any.
    fn idle_for(&self) -> Option<Duration> {
        self.last_request_at().map(|t| t.elapsed())
    }
}
