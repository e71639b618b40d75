//! HTTP/2 backend: a multiplexed `BaseBackend` over the `h2` crate.
//!
//! Unlike [`super::h1::Connection`], one `h2::Connection` can carry many
//! concurrent requests, so the `TrafficPolice<Connection<T>>` that owns one
//! of these is expected to run with `concurrency = true`: several tasks can
//! each hold their own clone of the same entry at once. The shared
//! handshake state (the `h2::client::SendRequest` handle, the in-flight
//! response futures, the live-stream count) lives behind one `Arc<Shared>`
//! so every clone sees the same connection; the request currently being
//! assembled through `put_request`/`put_header`/`end_headers` is kept in a
//! per-clone field so sibling borrows building requests at the same time
//! don't stomp on each other's headers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::Poll;
use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::client::{self, ResponseFuture, SendRequest, SendStream};
use http::{HeaderMap, Method, Uri};
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::{BaseBackend, ConnState, HttpVersion, Manageable};
use crate::ext::ConnectionInfo;
use crate::headers::{method_has_defined_payload_semantics, set_content_length_if_missing};
use crate::promise::{ConnectionHandle, ResponsePromise};
use crate::proto::h2::SendBuf;
use crate::response::{BodySource, LowLevelResponse, ReadFuture};
use crate::rt::{Read, TokioIo, Write};
use crate::socket::Socket;
use crate::{Error, Result};

/// A conservative default for the peer's `SETTINGS_MAX_CONCURRENT_STREAMS`
/// before the real value is known. `h2` enforces the actual negotiated
/// limit internally via `SendRequest::poll_ready`; this is only used to
/// answer [`Manageable::is_saturated`] without needing an async round trip.
const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 100;

/// A response future paired with the method that produced it, since `h2`'s
/// own `Response<RecvStream>` carries no method and `LowLevelResponse`
/// wants one.
struct InFlight {
    method: Method,
    response: ResponseFuture,
}

/// State shared by every clone of one physical [`Connection`].
struct Shared {
    send_request: AsyncMutex<SendRequest<SendBuf<Bytes>>>,
    in_flight: StdMutex<HashMap<u64, InFlight>>,
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

/// A request under construction through `put_request`/`put_header`, not yet
/// handed to `h2` by `end_headers`.
struct PendingRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
}

/// One handle onto a multiplexed HTTP/2 connection.
///
/// `Clone` is cheap: clones share the underlying handshake via `Arc<Shared>`
/// but each get independent `PendingRequest`/`SendStream` scratch space,
/// which is what lets [`crate::pool::TrafficPolice`] hand the same entry to
/// several tasks at once under `concurrency = true`.
pub struct Connection<T> {
    socket: Option<Socket<T>>,
    shared: Option<Arc<Shared>>,
    state: ConnState,
    conn_info: ConnectionInfo,
    host: String,
    port: u16,
    scheme: &'static str,
    verified: bool,
    proxy_verified: bool,
    pending: Option<PendingRequest>,
    send_stream: Option<SendStream<SendBuf<Bytes>>>,
    last_request_at: Option<Instant>,
    handle: ConnectionHandle,
    timeout: Option<Duration>,
}

impl<T> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Connection {
            // The socket is only ever touched pre-handshake, while no clone
            // could exist yet (see `post_conn`), so a clone never needs it.
            socket: None,
            shared: self.shared.clone(),
            state: self.state,
            conn_info: self.conn_info.clone(),
            host: self.host.clone(),
            port: self.port,
            scheme: self.scheme,
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

impl<T> Connection<T>
where
    T: Read + Write + Unpin + Send + 'static,
{
    /// Wrap an already-connected socket talking to `host:port`; the actual
    /// `h2` handshake happens in [`BaseBackend::post_conn`].
    pub fn new(socket: Socket<T>, host: impl Into<String>, port: u16, scheme: &'static str) -> Self {
        Connection {
            socket: Some(socket),
            shared: None,
            state: ConnState::Connected,
            conn_info: ConnectionInfo::default(),
            host: host.into(),
            port,
            scheme,
            verified: false,
            proxy_verified: false,
            pending: None,
            send_stream: None,
            last_request_at: None,
            handle: ConnectionHandle::new(0, 0),
            timeout: None,
        }
    }

    /// Told by the pool composition layer once this connection has been
    /// inserted into a [`crate::pool::TrafficPolice`], so promises minted
    /// from [`BaseBackend::end_headers`] carry a handle a caller can later
    /// hand to `locate`/`get`.
    pub fn set_handle(&mut self, handle: ConnectionHandle) {
        self.handle = handle;
    }

    fn require_state(&self, allowed: &[ConnState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::new_protocol_state("h2 operation called from an illegal state"))
        }
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        self.shared
            .as_ref()
            .ok_or_else(|| Error::new_protocol_state("h2 handshake not yet completed"))
    }

    fn build_uri(&self, path: &str) -> Result<Uri> {
        Uri::builder()
            .scheme(self.scheme)
            .authority(format!("{}:{}", self.host, self.port))
            .path_and_query(path)
            .build()
            .map_err(Error::new_protocol)
    }

    fn build_response(&self, stream_id: u64, method: Method, resp: http::Response<h2::RecvStream>) -> LowLevelResponse {
        let (parts, recv) = resp.into_parts();
        let eot = recv.is_end_stream();

        let reader: Option<Box<dyn BodySource>> = if eot {
            if let Some(shared) = &self.shared {
                shared.open_streams.fetch_sub(1, Ordering::SeqCst);
            }
            None
        } else {
            Some(Box::new(H2Body {
                recv: Arc::new(AsyncMutex::new(recv)),
                shared: self.shared.clone(),
                decremented: false,
            }))
        };

        let reason = parts.status.canonical_reason().unwrap_or("").to_owned();
        LowLevelResponse::new(
            method,
            HttpVersion::H2.as_u16(),
            parts.status,
            reason,
            parts.headers,
            stream_id,
            reader,
        )
    }
}

/// A not-yet-fully-read response body, read through an `Arc<Mutex<..>>`
/// rather than a raw `&mut` the way [`super::h1::Http1Body`] shares its
/// socket, since `BodySource::read_chunk` must return a `'static` future.
struct H2Body {
    recv: Arc<AsyncMutex<h2::RecvStream>>,
    shared: Option<Arc<Shared>>,
    decremented: bool,
}

impl Drop for H2Body {
    fn drop(&mut self) {
        // Decrements once whether end-of-stream was observed in
        // `read_chunk` or the caller abandoned the response mid-body; the
        // live-stream count only needs to be eventually consistent for
        // `Manageable::is_idle`/`is_saturated`, not exact mid-read.
        if !self.decremented {
            if let Some(shared) = &self.shared {
                shared.open_streams.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl BodySource for H2Body {
    fn read_chunk(&mut self, _max_size: Option<usize>, _stream_id: u64) -> ReadFuture {
        let recv = self.recv.clone();
        Box::pin(async move {
            let mut recv = recv.lock().await;
            match recv.data().await {
                Some(Ok(bytes)) => {
                    let _ = recv.flow_control().release_capacity(bytes.len());
                    let eot = recv.is_end_stream();
                    Ok((bytes.to_vec(), eot))
                }
                Some(Err(e)) => Err(Error::new_h2(e)),
                None => Ok((Vec::new(), true)),
            }
        })
    }
}

impl<T> BaseBackend for Connection<T>
where
    T: Read + Write + Unpin + Send + 'static,
{
    fn scheme(&self) -> &'static str {
        self.scheme
    }

    fn supported_svn() -> &'static [HttpVersion] {
        &[HttpVersion::H2]
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
        self.require_state(&[ConnState::Disconnected, ConnState::Connected])?;
        self.state = ConnState::Connected;
        Ok(())
    }

    async fn post_conn(&mut self) -> Result<()> {
        self.require_state(&[ConnState::Connected])?;
        let socket = self
            .socket
            .take()
            .ok_or_else(|| Error::new_protocol_state("h2 handshake already performed"))?;
        let encrypted = socket.is_encrypted();

        let io = TokioIo::new(socket);
        let handshake = client::handshake(io);
        let (send_request, connection) = match self.timeout {
            Some(dur) => match tokio::time::timeout(dur, handshake).await {
                Ok(res) => res.map_err(Error::new_h2)?,
                Err(_) => return Err(Error::new_timeout()),
            },
            None => handshake.await.map_err(Error::new_h2)?,
        };

        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("h2 connection driver exited: {}", e);
            }
        });

        self.verified = encrypted;
        self.conn_info.set_http_version(HttpVersion::H2);
        self.shared = Some(Arc::new(Shared {
            send_request: AsyncMutex::new(send_request),
            in_flight: StdMutex::new(HashMap::new()),
            open_streams: AtomicUsize::new(0),
            max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
            driver: StdMutex::new(Some(driver)),
        }));
        self.state = ConnState::TlsWrapped;
        Ok(())
    }

    fn set_tunnel(&mut self, host: &str, port: u16, _headers: HeaderMap, _scheme: &str) {
        self.host = host.to_owned();
        self.port = port;
        self.state = ConnState::TunnelRequested;
    }

    async fn tunnel(&mut self) -> Result<()> {
        // The CONNECT handshake itself is always spoken in plain HTTP/1.1
        // one layer below (see `h1::Connection::tunnel`); by the time an
        // `h2::Connection` exists over a tunneled socket, the tunnel is
        // already established, so this backend never originates one.
        Err(Error::new_protocol_state("h2 backend does not originate CONNECT tunnels"))
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
        *request.version_mut() = http::Version::HTTP_2;
        *request.headers_mut() = pending.headers.clone();

        let shared = self.shared()?.clone();
        let eos = body.is_none() && !expect_body_afterward;

        let (resp_fut, mut send_stream, stream_id) = {
            let mut send_request = shared.send_request.lock().await;
            let ready = futures_util::future::poll_fn(|cx| send_request.poll_ready(cx));
            match self.timeout {
                Some(dur) => match tokio::time::timeout(dur, ready).await {
                    Ok(res) => res.map_err(Error::new_h2)?,
                    Err(_) => return Err(Error::new_timeout()),
                },
                None => ready.await.map_err(Error::new_h2)?,
            }
            let (resp_fut, send_stream) = send_request.send_request(request, eos).map_err(Error::new_h2)?;
            let stream_id = u64::from(resp_fut.stream_id());
            (resp_fut, send_stream, stream_id)
        };

        if let Some(b) = body {
            send_stream
                .send_data(Bytes::copy_from_slice(b), !expect_body_afterward)
                .map_err(Error::new_h2)?;
        }

        shared.open_streams.fetch_add(1, Ordering::SeqCst);
        shared.in_flight.lock().unwrap().insert(
            stream_id,
            InFlight {
                method: pending.method.clone(),
                response: resp_fut,
            },
        );

        self.last_request_at = Some(Instant::now());
        self.state = if expect_body_afterward {
            self.send_stream = Some(send_stream);
            ConnState::RequestBodyOpen
        } else {
            ConnState::TlsWrapped
        };

        Ok(Some(ResponsePromise::new(self.handle, stream_id, pending.headers)))
    }

    async fn send(&mut self, data: &[u8], eot: bool) -> Result<Option<ResponsePromise>> {
        self.require_state(&[ConnState::RequestBodyOpen])?;
        let send_stream = self
            .send_stream
            .as_mut()
            .ok_or_else(|| Error::new_protocol_state("send called without a streaming request body"))?;
        send_stream
            .send_data(Bytes::copy_from_slice(data), eot)
            .map_err(Error::new_h2)?;

        if eot {
            self.send_stream = None;
            self.state = ConnState::TlsWrapped;
        }
        Ok(None)
    }

    async fn get_response(&mut self, promise: Option<&ResponsePromise>) -> Result<LowLevelResponse> {
        let shared = self.shared()?.clone();

        match promise {
            Some(p) => {
                let stream_id = p.stream_id();
                let in_flight = shared
                    .in_flight
                    .lock()
                    .unwrap()
                    .remove(&stream_id)
                    .ok_or_else(|| Error::new_protocol_state("no pending response for that promise"))?;
                let wait = in_flight.response;
                let result = match self.timeout {
                    Some(dur) => match tokio::time::timeout(dur, wait).await {
                        Ok(res) => res,
                        Err(_) => return Err(Error::new_timeout()),
                    },
                    None => wait.await,
                };
                let resp = result.map_err(Error::new_h2)?;
                Ok(self.build_response(stream_id, in_flight.method, resp))
            }
            None => {
                let ids: Vec<u64> = {
                    let in_flight = shared.in_flight.lock().unwrap();
                    in_flight.keys().copied().collect()
                };
                if ids.is_empty() {
                    return Err(Error::new_unavailable("no requests in flight on this connection"));
                }

                // Poll every candidate in place, under a lock held only for
                // the span of one poll, so a sibling clone's concurrent
                // `get_response` never observes the map missing entries
                // that are merely being raced here — the same guarantee
                // `h3.rs`'s single-lock selection gives its one-entry case,
                // extended to h2's genuine multi-future race.
                let select = futures_util::future::poll_fn(|cx| {
                    let mut in_flight = shared.in_flight.lock().unwrap();
                    for id in &ids {
                        if let Some(entry) = in_flight.get_mut(id) {
                            if let Poll::Ready(result) = Pin::new(&mut entry.response).poll(cx) {
                                let entry = in_flight.remove(id).expect("id just polled");
                                return Poll::Ready((*id, entry.method, result));
                            }
                        }
                    }
                    Poll::Pending
                });

                let (done_id, done_method, result) = match self.timeout {
                    Some(dur) => match tokio::time::timeout(dur, select).await {
                        Ok(res) => res,
                        Err(_) => return Err(Error::new_timeout()),
                    },
                    None => select.await,
                };

                let resp = result.map_err(Error::new_h2)?;
                Ok(self.build_response(done_id, done_method, resp))
            }
        }
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn last_request_at(&self) -> Option<Instant> {
        self.last_request_at
    }
}

impl<T> Manageable for Connection<T>
where
    T: Read + Write + Unpin + Send + 'static,
{
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

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("h2::Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn socket_pair() -> (Socket<TokioIo<DuplexStream>>, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Socket::plain(TokioIo::new(a)), b)
    }

    #[tokio::test]
    async fn fresh_connection_is_idle_before_handshake() {
        let (socket, _peer) = socket_pair();
        let conn = Connection::new(socket, "example.com", 443, "https");
        // Before `post_conn` there's no `Shared` yet; `is_idle` falls back
        // to the state machine, which reports idle once merely connected.
        assert!(conn.is_idle());
        assert!(conn.is_multiplexed());
    }

    #[tokio::test]
    async fn post_conn_performs_the_h2_preface() {
        let (socket, peer) = socket_pair();
        let mut conn = Connection::new(socket, "example.com", 443, "https");
        conn.new_conn().await.unwrap();

        let server = tokio::spawn(async move {
            let _ = h2::server::handshake(peer).await;
        });

        conn.post_conn().await.unwrap();
        assert!(conn.is_idle());
        assert!(!conn.is_saturated());
        server.abort();
    }

    #[tokio::test]
    async fn put_request_builds_independent_scratch_per_clone() {
        let (socket, _peer) = socket_pair();
        let mut a = Connection::new(socket, "example.com", 443, "https");
        a.new_conn().await.unwrap();
        let mut b = a.clone();

        a.put_request(&Method::GET, "/a", false, false).unwrap();
        b.put_request(&Method::POST, "/b", false, false).unwrap();

        assert_eq!(a.pending.as_ref().unwrap().path, "/a");
        assert_eq!(b.pending.as_ref().unwrap().path, "/b");
    }

    #[tokio::test]
    async fn round_trip_over_a_real_h2_handshake() {
        let (socket, peer) = socket_pair();
        let mut conn = Connection::new(socket, "example.com", 443, "https");
        conn.new_conn().await.unwrap();

        let server = tokio::spawn(async move {
            let mut server_conn = h2::server::handshake(peer).await.unwrap();
            if let Some(Ok((request, mut respond))) = server_conn.accept().await {
                assert_eq!(request.method(), Method::GET);
                let response = http::Response::new(());
                let mut send = respond.send_response(response, false).unwrap();
                send.send_data(Bytes::from_static(b"hello"), true).unwrap();
            }
        });

        conn.post_conn().await.unwrap();
        conn.put_request(&Method::GET, "/", false, false).unwrap();
        let promise = conn.end_headers(None, false, false).await.unwrap();
        assert!(promise.is_some());

        let mut response = conn.get_response(promise.as_ref()).await.unwrap();
        let body = response.read(None).await.unwrap();
        assert_eq!(body, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_unnamed_get_response_never_sees_a_transiently_empty_map() {
        let (socket, peer) = socket_pair();
        let mut conn = Connection::new(socket, "example.com", 443, "https");
        conn.new_conn().await.unwrap();

        let server = tokio::spawn(async move {
            let mut server_conn = h2::server::handshake(peer).await.unwrap();
            for _ in 0..2 {
                let (_, mut respond) = server_conn.accept().await.unwrap().unwrap();
                // Stagger replies so the two racing callers below actually
                // have to wait on a still-populated `in_flight` map rather
                // than both resolving on the first poll.
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let mut send = respond.send_response(http::Response::new(()), false).unwrap();
                send.send_data(Bytes::from_static(b"ok"), true).unwrap();
            }
        });

        conn.post_conn().await.unwrap();
        conn.put_request(&Method::GET, "/a", false, false).unwrap();
        conn.end_headers(None, false, false).await.unwrap();
        conn.put_request(&Method::GET, "/b", false, false).unwrap();
        conn.end_headers(None, false, false).await.unwrap();

        let mut a = conn.clone();
        let mut b = conn.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.get_response(None).await }),
            tokio::spawn(async move { b.get_response(None).await }),
        );
        assert!(ra.unwrap().is_ok());
        assert!(rb.unwrap().is_ok());

        server.await.unwrap();
    }
}
