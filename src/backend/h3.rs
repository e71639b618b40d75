//! HTTP/3 backend: a multiplexed `BaseBackend` over `h3`/`h3-quinn`/`quinn`.
//!
//! QUIC folds transport and TLS into one handshake, so unlike
//! [`super::h1::Connection`] and [`super::h2::Connection`] this backend
//! does not wrap a pre-dialed [`crate::socket::Socket`]: `new_conn` and
//! `post_conn` both drive `quinn::Endpoint::connect`, and the caller
//! supplies an already-configured client `Endpoint` (TLS roots, ALPN, and
//! transport parameters are its job, same as a `TlsConnector` is for H1/H2).
//!
//! `h3` has no wire-visible stream id the way `h2::client::ResponseFuture`
//! exposes one, so this backend mints its own per-connection counter and
//! uses it as the [`ResponsePromise`] key; it never appears on the wire and
//! only has to be unique within one `Shared`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use h3::client::{RequestStream, SendRequest};
use h3_quinn::{Connection as H3QuinnConnection, OpenStreams, RecvStream as H3RecvStream, SendStream as H3SendStream};
use http::{HeaderMap, Method, Uri};
use quinn::Endpoint;
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{BaseBackend, ConnState, HttpVersion, Manageable};
use crate::ext::ConnectionInfo;
use crate::headers::{method_has_defined_payload_semantics, set_content_length_if_missing};
use crate::promise::{ConnectionHandle, ResponsePromise};
use crate::response::{BodySource, LowLevelResponse, ReadFuture};
use crate::{Error, Result};

/// A conservative default for the peer's concurrent-stream allowance before
/// quinn has reported the real transport parameter back to us.
const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 100;

type H3Send = RequestStream<H3SendStream<Bytes>, Bytes>;
type H3Recv = RequestStream<H3RecvStream, Bytes>;

struct InFlight {
    method: Method,
    recv: H3Recv,
}

/// State shared by every clone of one physical [`Connection`].
struct Shared {
    send_request: AsyncMutex<SendRequest<OpenStreams, Bytes>>,
    in_flight: StdMutex<HashMap<u64, InFlight>>,
    next_stream_id: AtomicU64,
    open_streams: AtomicUsize,
    max_concurrent_streams: usize,
    driver: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Shared {
    fn close(&self) {
        if let Some(handle) = self.driver.lock().unwrap().take() {
            handle.abort();
        }
    }
}

struct PendingRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
}

/// One handle onto a multiplexed HTTP/3 connection.
///
/// Clones share the handshake (`Arc<Shared>`) the same way
/// [`super::h2::Connection`]'s clones do; `pending`/`send_stream` stay
/// per-clone scratch so concurrent borrows under `TrafficPolice`'s
/// `concurrency = true` mode can't corrupt each other's in-progress request.
pub struct Connection {
    endpoint: Endpoint,
    remote_addr: SocketAddr,
    server_name: String,
    port: u16,
    quic_conn: Option<quinn::Connection>,
    shared: Option<Arc<Shared>>,
    state: ConnState,
    conn_info: ConnectionInfo,
    verified: bool,
    proxy_verified: bool,
    pending: Option<PendingRequest>,
    send_stream: Option<H3Send>,
    last_request_at: Option<Instant>,
    handle: ConnectionHandle,
    timeout: Option<Duration>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Connection {
            endpoint: self.endpoint.clone(),
            remote_addr: self.remote_addr,
            server_name: self.server_name.clone(),
            port: self.port,
            // Only the clone that performed `post_conn` ever touches this;
            // every other clone reaches the QUIC connection through `shared`.
            quic_conn: None,
            shared: self.shared.clone(),
            state: self.state,
            conn_info: self.conn_info.clone(),
            verified: self.verified,
            proxy_verified: self.proxy_verified,
            pending: None,
            send_stream: None,
            last_request_at: self.last_request_at,
            handle: self.handle,
            timeout: self.timeout,
        }
    }
}

impl Connection {
    /// Wrap a client `Endpoint` already configured with TLS roots and ALPN,
    /// targeting `remote_addr` under the given TLS server name.
    pub fn new(endpoint: Endpoint, remote_addr: SocketAddr, server_name: impl Into<String>, port: u16) -> Self {
        Connection {
            endpoint,
            remote_addr,
            server_name: server_name.into(),
            port,
            quic_conn: None,
            shared: None,
            state: ConnState::Disconnected,
            conn_info: ConnectionInfo::default(),
            verified: false,
            proxy_verified: false,
            pending: None,
            send_stream: None,
            last_request_at: None,
            handle: ConnectionHandle::new(0, 0),
            timeout: None,
        }
    }

    /// See [`super::h2::Connection::set_handle`].
    pub fn set_handle(&mut self, handle: ConnectionHandle) {
        self.handle = handle;
    }

    fn require_state(&self, allowed: &[ConnState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::new_protocol_state("h3 operation called from an illegal state"))
        }
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        self.shared
            .as_ref()
            .ok_or_else(|| Error::new_protocol_state("h3 handshake not yet completed"))
    }

    fn build_uri(&self, path: &str) -> Result<Uri> {
        Uri::builder()
            .scheme("https")
            .authority(format!("{}:{}", self.server_name, self.port))
            .path_and_query(path)
            .build()
            .map_err(Error::new_protocol)
    }

    fn build_response(&self, stream_id: u64, method: Method, resp: http::Response<()>, recv: H3Recv) -> LowLevelResponse {
        let (parts, ()) = resp.into_parts();
        let reason = parts.status.canonical_reason().unwrap_or("").to_owned();
        let reader: Box<dyn BodySource> = Box::new(H3Body {
            recv: Some(recv),
            shared: self.shared.clone(),
            decremented: false,
        });
        LowLevelResponse::new(
            method,
            HttpVersion::H3.as_u16(),
            parts.status,
            reason,
            parts.headers,
            stream_id,
            Some(reader),
        )
    }
}

/// A not-yet-fully-read response body.
///
/// Built with the `recv` half moved in directly by `get_response` rather
/// than looked up again through `Shared`, since once response headers
/// arrive the recv stream belongs exclusively to whichever caller is
/// reading the body.
struct H3Body {
    recv: Option<H3Recv>,
    shared: Option<Arc<Shared>>,
    decremented: bool,
}

impl Drop for H3Body {
    fn drop(&mut self) {
        if !self.decremented {
            if let Some(shared) = &self.shared {
                shared.open_streams.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl BodySource for H3Body {
    fn read_chunk(&mut self, _max_size: Option<usize>, _stream_id: u64) -> ReadFuture {
        let mut recv = match self.recv.take() {
            Some(recv) => recv,
            None => {
                return Box::pin(async { Ok((Vec::new(), true)) });
            }
        };
        Box::pin(async move {
            let chunk = futures_util::future::poll_fn(|cx| recv.poll_recv_data(cx))
                .await
                .map_err(Error::new_h3)?;
            match chunk {
                Some(mut buf) => {
                    let bytes = buf.copy_to_bytes(buf.remaining());
                    // `h3`'s `poll_recv_data` only returns `None` once the
                    // stream's FIN has actually been observed, so the next
                    // poll tells us whether this was the last chunk.
                    self.recv = Some(recv);
                    Ok((bytes.to_vec(), false))
                }
                None => Ok((Vec::new(), true)),
            }
        })
    }
}

impl BaseBackend for Connection {
    fn scheme(&self) -> &'static str {
        "https"
    }

    fn supported_svn() -> &'static [HttpVersion] {
        &[HttpVersion::H3]
    }

    fn conn_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    fn is_verified(&self) -> bool {
        self.verified
    }

    fn proxy_is_verified(&self) -> bool {
        self.proxy_verified
    }

    async fn new_conn(&mut self) -> Result<()> {
        self.require_state(&[ConnState::Disconnected])?;
        let connecting = self
            .endpoint
            .connect(self.remote_addr, &self.server_name)
            .map_err(Error::new_connect)?;
        let quic_conn = match self.timeout {
            Some(dur) => match tokio::time::timeout(dur, connecting).await {
                Ok(res) => res.map_err(Error::new_connect)?,
                Err(_) => return Err(Error::new_timeout()),
            },
            None => connecting.await.map_err(Error::new_connect)?,
        };
        self.quic_conn = Some(quic_conn);
        self.state = ConnState::Connected;
        Ok(())
    }

    async fn post_conn(&mut self) -> Result<()> {
        self.require_state(&[ConnState::Connected])?;
        let quic_conn = self
            .quic_conn
            .take()
            .ok_or_else(|| Error::new_protocol_state("h3 handshake already performed"))?;

        let h3_conn = H3QuinnConnection::new(quic_conn);
        let build = h3::client::builder().build::<_, _, Bytes>(h3_conn);
        let (mut driver, send_request) = match self.timeout {
            Some(dur) => match tokio::time::timeout(dur, build).await {
                Ok(res) => res.map_err(Error::new_h3)?,
                Err(_) => return Err(Error::new_timeout()),
            },
            None => build.await.map_err(Error::new_h3)?,
        };

        let driver_handle = tokio::spawn(async move {
            let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        self.verified = true; // QUIC mandates TLS 1.3; there is no cleartext h3.
        self.conn_info.set_http_version(HttpVersion::H3);
        self.shared = Some(Arc::new(Shared {
            send_request: AsyncMutex::new(send_request),
            in_flight: StdMutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
            open_streams: AtomicUsize::new(0),
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            driver: StdMutex::new(Some(driver_handle)),
        }));
        self.state = ConnState::TlsWrapped;
        Ok(())
    }

    fn set_tunnel(&mut self, host: &str, port: u16, _headers: HeaderMap, _scheme: &str) {
        self.server_name = host.to_owned();
        self.port = port;
        self.state = ConnState::TunnelRequested;
    }

    async fn tunnel(&mut self) -> Result<()> {
        // CONNECT proxying for QUIC (RFC 9298's CONNECT-UDP) is a distinct
        // protocol extension this backend does not implement; tunneling to
        // an H3 origin happens, if at all, one layer below over H1/H2.
        Err(Error::new_protocol_state("h3 backend does not originate CONNECT tunnels"))
    }

    fn put_request(
        &mut self,
        method: &Method,
        path: &str,
        _skip_host: bool,
        _skip_accept_encoding: bool,
    ) -> Result<()> {
        self.require_state(&[ConnState::TlsWrapped, ConnState::Connected])?;
        self.pending = Some(PendingRequest {
            method: method.clone(),
            path: path.to_owned(),
            headers: HeaderMap::new(),
        });
        self.state = ConnState::RequestHeadersOpen;
        Ok(())
    }

    fn put_header(&mut self, name: &http::header::HeaderName, values: &[http::HeaderValue]) -> Result<()> {
        self.require_state(&[ConnState::RequestHeadersOpen])?;
        let pending = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::new_protocol_state("put_header called without put_request"))?;
        for value in values {
            pending.headers.append(name.clone(), value.clone());
        }
        Ok(())
    }

    async fn end_headers(
        &mut self,
        body: Option<&[u8]>,
        _encode_chunked: bool,
        expect_body_afterward: bool,
    ) -> Result<Option<ResponsePromise>> {
        self.require_state(&[ConnState::RequestHeadersOpen])?;
        let mut pending = self
            .pending
            .take()
            .ok_or_else(|| Error::new_protocol_state("end_headers called without put_request"))?;

        if let Some(b) = body {
            if method_has_defined_payload_semantics(&pending.method) {
                set_content_length_if_missing(&mut pending.headers, b.len() as u64);
            }
        }

        let uri = self.build_uri(&pending.path)?;
        let mut request = http::Request::new(());
        *request.method_mut() = pending.method.clone();
        *request.uri_mut() = uri;
        *request.version_mut() = http::Version::HTTP_3;
        *request.headers_mut() = pending.headers.clone();

        let shared = self.shared()?.clone();
        let stream_id = shared.next_stream_id.fetch_add(1, Ordering::SeqCst);

        let stream = {
            let mut send_request = shared.send_request.lock().await;
            send_request.send_request(request).await.map_err(Error::new_h3)?
        };
        let (mut send_half, recv_half) = stream.split();

        if let Some(b) = body {
            send_half
                .send_data(Bytes::copy_from_slice(b))
                .await
                .map_err(Error::new_h3)?;
        }
        if !expect_body_afterward {
            send_half.finish().await.map_err(Error::new_h3)?;
        }

        shared.open_streams.fetch_add(1, Ordering::SeqCst);
        shared.in_flight.lock().unwrap().insert(
            stream_id,
            InFlight {
                method: pending.method.clone(),
                recv: recv_half,
            },
        );

        self.last_request_at = Some(Instant::now());
        self.state = if expect_body_afterward {
            self.send_stream = Some(send_half);
            ConnState::RequestBodyOpen
        } else {
            ConnState::TlsWrapped
        };

        Ok(Some(ResponsePromise::new(self.handle, stream_id, pending.headers)))
    }

    async fn send(&mut self, data: &[u8], eot: bool) -> Result<Option<ResponsePromise>> {
        self.require_state(&[ConnState::RequestBodyOpen])?;
        let send_half = self
            .send_stream
            .as_mut()
            .ok_or_else(|| Error::new_protocol_state("send called without a streaming request body"))?;
        send_half
            .send_data(Bytes::copy_from_slice(data))
            .await
            .map_err(Error::new_h3)?;

        if eot {
            send_half.finish().await.map_err(Error::new_h3)?;
            self.send_stream = None;
            self.state = ConnState::TlsWrapped;
        }
        Ok(None)
    }

    async fn get_response(&mut self, promise: Option<&ResponsePromise>) -> Result<LowLevelResponse> {
        let shared = self.shared()?.clone();

        let (stream_id, in_flight) = match promise {
            Some(p) => {
                let stream_id = p.stream_id();
                let in_flight = shared
                    .in_flight
                    .lock()
                    .unwrap()
                    .remove(&stream_id)
                    .ok_or_else(|| Error::new_protocol_state("no pending response for that promise"))?;
                (stream_id, in_flight)
            }
            None => {
                // `h3` exposes no select-across-streams primitive the way
                // `h2`'s `ResponseFuture`s do; first-ready here means
                // oldest-inserted, the same fallback `pool.rs` uses when an
                // arbiter-level `HashMap` iteration order is the only signal
                // available. Found and removed under one lock so a sibling
                // clone's concurrent `get_response(None)` can't steal the
                // same entry between the lookup and the removal.
                let mut guard = shared.in_flight.lock().unwrap();
                let stream_id = *guard
                    .keys()
                    .min()
                    .ok_or_else(|| Error::new_unavailable("no requests in flight on this connection"))?;
                let in_flight = guard.remove(&stream_id).expect("id just read");
                drop(guard);
                (stream_id, in_flight)
            }
        };

        let InFlight { method, mut recv } = in_flight;
        let wait = recv.recv_response();
        let resp = match self.timeout {
            Some(dur) => match tokio::time::timeout(dur, wait).await {
                Ok(res) => res.map_err(Error::new_h3)?,
                Err(_) => return Err(Error::new_timeout()),
            },
            None => wait.await.map_err(Error::new_h3)?,
        };
        Ok(self.build_response(stream_id, method, resp, recv))
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }
}

impl Manageable for Connection {
    fn is_idle(&self) -> bool {
        match &self.shared {
            Some(shared) => {
                shared.open_streams.load(Ordering::SeqCst) == 0 && shared.in_flight.lock().unwrap().is_empty()
            }
            None => matches!(self.state, ConnState::Connected),
        }
    }

    fn is_saturated(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.open_streams.load(Ordering::SeqCst) >= shared.max_concurrent_streams,
            None => false,
        }
    }

    fn is_multiplexed(&self) -> bool {
        true
    }

    fn close(&mut self) {
        if let Some(shared) = &self.shared {
            shared.close();
        }
        self.state = ConnState::Closed;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("h3::Connection")
            .field("server_name", &self.server_name)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn unconnected() -> Connection {
        let endpoint =
            Endpoint::client((Ipv4Addr::LOCALHOST, 0).into()).expect("bind an ephemeral UDP port");
        Connection::new(endpoint, (Ipv4Addr::LOCALHOST, 4433).into(), "example.com", 443)
    }

    #[test]
    fn fresh_connection_is_not_idle_before_handshake() {
        let conn = unconnected();
        assert!(!conn.is_idle());
        assert!(conn.is_multiplexed());
        assert!(!conn.is_saturated());
    }

    #[test]
    fn put_request_requires_a_completed_handshake() {
        let mut conn = unconnected();
        let err = conn.put_request(&Method::GET, "/", false, false).unwrap_err();
        assert!(err.is_protocol_state());
    }

    #[test]
    fn clone_does_not_duplicate_the_quic_connection_slot() {
        let a = unconnected();
        let b = a.clone();
        assert!(b.quic_conn.is_none());
        assert_eq!(a.server_name, b.server_name);
    }
}
