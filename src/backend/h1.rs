//! HTTP/1.1 backend: one request in flight at a time over one socket.
//!
//! Grounded on the shape of hyper's historic `proto::h1` role/parse split —
//! write a request head plus a framed body, then parse a status line and
//! headers off the wire with `httparse` — collapsed here into a single
//! state machine sized for the [`BaseBackend`] contract instead of hyper's
//! buffered `Conn`/`Dispatcher` pair, since H1 never multiplexes and needs
//! none of that machinery's concurrency.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::Mutex as AsyncMutex;

use crate::backend::quic_cache::record_alt_svc;
use crate::backend::{BaseBackend, ConnState, HttpVersion, Manageable, PreemptiveQuicCache};
use crate::ext::ConnectionInfo;
use crate::headers;
use crate::promise::ResponsePromise;
use crate::response::{BodySource, LowLevelResponse, ReadFuture};
use crate::rt::{Read, Write};
use crate::socket::Socket;
use crate::{Error, Result};

const MAX_HEADERS: usize = 100;

/// How the response body's end is determined, decided once from the
/// response headers per RFC 7230 §3.3.3.
#[derive(Clone, Copy, Debug)]
enum BodyLen {
    Fixed(u64),
    Chunked,
    UntilClose,
    None,
}

/// An HTTP/1.1 connection: one socket, one request/response at a time.
///
/// Never multiplexed ([`Manageable::is_multiplexed`] is always false) and
/// never returns a [`ResponsePromise`] from [`BaseBackend::end_headers`] or
/// [`BaseBackend::send`] — callers always get their response synchronously
/// from [`BaseBackend::get_response`].
pub struct Connection<T> {
    socket: Arc<AsyncMutex<Socket<T>>>,
    state: ConnState,
    conn_info: ConnectionInfo,
    host: String,
    port: u16,
    scheme: &'static str,
    verified: bool,
    proxy_verified: bool,
    pending_head: Vec<u8>,
    pending_method: Method,
    keep_alive: bool,
    last_request_at: Option<Instant>,
    stream_id: u64,
    quic_cache: Option<PreemptiveQuicCache>,
    timeout: Option<Duration>,
}

impl<T> Connection<T>
where
    T: Read + Write + Unpin + Send + 'static,
{
    /// Wrap an already-connected socket talking to `host:port`.
    pub fn new(socket: Socket<T>, host: impl Into<String>, port: u16, scheme: &'static str) -> Self {
        let encrypted = socket.is_encrypted();
        let mut conn_info = ConnectionInfo::default();
        if encrypted {
            conn_info.set_http_version(HttpVersion::Http11);
        }
        Connection {
            socket: Arc::new(AsyncMutex::new(socket)),
            state: ConnState::Connected,
            conn_info,
            host: host.into(),
            port,
            scheme,
            verified: false,
            proxy_verified: false,
            pending_head: Vec::new(),
            pending_method: Method::GET,
            keep_alive: true,
            last_request_at: None,
            stream_id: 0,
            quic_cache: None,
            timeout: None,
        }
    }

    /// Record advertised `Alt-Svc: h3=...` origins into `cache` so a later
    /// connection attempt to the same origin can try QUIC first.
    pub fn with_quic_cache(mut self, cache: PreemptiveQuicCache) -> Self {
        self.quic_cache = Some(cache);
        self
    }

    fn require_state(&self, allowed: &[ConnState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::new_protocol_state("h1 operation called from an illegal state"))
        }
    }

    async fn parse_response_head(&mut self) -> Result<(StatusCode, String, HeaderMap, BytesMut)> {
        let mut buf = BytesMut::new();
        loop {
            {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut resp = httparse::Response::new(&mut headers);
                let parsed = resp
                    .parse(&buf)
                    .map_err(|e| Error::new_protocol(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())))?;

                if let httparse::Status::Complete(consumed) = parsed {
                    let status = StatusCode::from_u16(resp.code.unwrap_or(500))
                        .map_err(|e| Error::new_protocol(e))?;
                    let reason = resp.reason.unwrap_or("").to_owned();

                    let mut map = HeaderMap::new();
                    for h in resp.headers.iter() {
                        let name = http::header::HeaderName::from_bytes(h.name.as_bytes())
                            .map_err(|e| Error::new_protocol(e))?;
                        let value = http::HeaderValue::from_bytes(h.value)
                            .map_err(|e| Error::new_protocol(e))?;
                        map.append(name, value);
                    }

                    let rest = buf.split_off(consumed);
                    return Ok((status, reason, map, rest));
                }
            }

            let mut sock = self.socket.lock().await;
            sock.set_timeout(self.timeout);
            let chunk = sock.recv(8 * 1024).await?;
            drop(sock);
            if chunk.is_empty() {
                return Err(Error::new_closed());
            }
            buf.extend_from_slice(&chunk);
        }
    }

    fn body_len(headers: &HeaderMap, status: StatusCode, method: &Method) -> BodyLen {
        if method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || (100..200).contains(&status.as_u16())
        {
            return BodyLen::None;
        }
        if headers::transfer_encoding_is_chunked(headers) {
            return BodyLen::Chunked;
        }
        if let Some(len) = headers::content_length_parse_all(headers) {
            return BodyLen::Fixed(len);
        }
        BodyLen::UntilClose
    }

    fn connection_should_close(headers: &HeaderMap) -> Option<bool> {
        headers.get(http::header::CONNECTION).map(|v| {
            if headers::connection_close(v) {
                true
            } else {
                !headers::connection_keep_alive(v)
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
        &[HttpVersion::Http11]
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
        // The socket is already connected by the time a `Connection` is
        // constructed; this just confirms we're in the expected state.
        self.require_state(&[ConnState::Disconnected, ConnState::Connected])?;
        self.state = ConnState::Connected;
        Ok(())
    }

    async fn post_conn(&mut self) -> Result<()> {
        self.require_state(&[ConnState::Connected])?;
        let encrypted = self.socket.lock().await.is_encrypted();
        if encrypted {
            self.verified = true;
            self.state = ConnState::TlsWrapped;
        }
        Ok(())
    }

    fn set_tunnel(&mut self, host: &str, port: u16, _headers: HeaderMap, _scheme: &str) {
        self.host = host.to_owned();
        self.port = port;
        self.state = ConnState::TunnelRequested;
    }

    async fn tunnel(&mut self) -> Result<()> {
        self.require_state(&[ConnState::TunnelRequested])?;
        let request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
            host = self.host,
            port = self.port
        );
        {
            let mut sock = self.socket.lock().await;
            sock.set_timeout(self.timeout);
            sock.send_all(request.as_bytes()).await?;
        }
        let (status, _, _, _) = self.parse_response_head().await?;
        if !status.is_success() {
            return Err(Error::new_protocol_state("proxy refused CONNECT tunnel"));
        }
        self.proxy_verified = self.socket.lock().await.is_encrypted();
        self.state = ConnState::Connected;
        Ok(())
    }

    fn put_request(
        &mut self,
        method: &Method,
        path: &str,
        skip_host: bool,
        skip_accept_encoding: bool,
    ) -> Result<()> {
        self.require_state(&[ConnState::Connected, ConnState::TlsWrapped])?;
        self.pending_head.clear();
        self.pending_method = method.clone();
        self.pending_head
            .extend_from_slice(format!("{} {} HTTP/1.1\r\n", method, path).as_bytes());

        if !skip_host {
            self.pending_head
                .extend_from_slice(format!("host: {}:{}\r\n", self.host, self.port).as_bytes());
        }
        if !skip_accept_encoding {
            self.pending_head.extend_from_slice(b"accept-encoding: identity\r\n");
        }

        self.state = ConnState::RequestHeadersOpen;
        Ok(())
    }

    fn put_header(&mut self, name: &http::header::HeaderName, values: &[http::HeaderValue]) -> Result<()> {
        self.require_state(&[ConnState::RequestHeadersOpen])?;
        if name == HOST {
            // a caller-supplied Host always wins over the one synthesized in
            // `put_request`; drop ours rather than sending two.
            let prefix = format!("host: {}:{}\r\n", self.host, self.port);
            if let Some(pos) = find_subsequence(&self.pending_head, prefix.as_bytes()) {
                self.pending_head.drain(pos..pos + prefix.len());
            }
        }
        for value in values {
            self.pending_head.extend_from_slice(name.as_str().as_bytes());
            self.pending_head.extend_from_slice(b": ");
            self.pending_head.extend_from_slice(value.as_bytes());
            self.pending_head.extend_from_slice(b"\r\n");
        }
        Ok(())
    }

    async fn end_headers(
        &mut self,
        body: Option<&[u8]>,
        encode_chunked: bool,
        expect_body_afterward: bool,
    ) -> Result<Option<ResponsePromise>> {
        self.require_state(&[ConnState::RequestHeadersOpen])?;

        if encode_chunked {
            self.pending_head.extend_from_slice(b"transfer-encoding: chunked\r\n");
        } else if let Some(b) = body {
            self.pending_head
                .extend_from_slice(format!("content-length: {}\r\n", b.len()).as_bytes());
        } else if expect_body_afterward {
            self.pending_head.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }
        self.pending_head.extend_from_slice(b"\r\n");

        let mut sock = self.socket.lock().await;
        sock.set_timeout(self.timeout);
        sock.send_all(&self.pending_head).await?;
        if let Some(b) = body {
            if encode_chunked {
                write_chunk(&mut sock, b).await?;
                if !expect_body_afterward {
                    write_last_chunk(&mut sock).await?;
                }
            } else {
                sock.send_all(b).await?;
            }
        }
        drop(sock);

        self.pending_head.clear();
        self.last_request_at = Some(Instant::now());

        self.state = if expect_body_afterward {
            ConnState::RequestBodyOpen
        } else {
            ConnState::AwaitingResponse
        };

        Ok(None)
    }

    async fn send(&mut self, data: &[u8], eot: bool) -> Result<Option<ResponsePromise>> {
        self.require_state(&[ConnState::RequestBodyOpen])?;
        let mut sock = self.socket.lock().await;
        sock.set_timeout(self.timeout);
        write_chunk(&mut sock, data).await?;
        if eot {
            write_last_chunk(&mut sock).await?;
        }
        drop(sock);

        if eot {
            self.state = ConnState::AwaitingResponse;
        }
        Ok(None)
    }

    async fn get_response(&mut self, promise: Option<&ResponsePromise>) -> Result<LowLevelResponse> {
        if promise.is_some() {
            return Err(Error::new_protocol_state("h1 connections never issue promises"));
        }
        self.require_state(&[ConnState::AwaitingResponse])?;

        let (status, reason, resp_headers, leftover) = self.parse_response_head().await?;
        self.keep_alive = Self::connection_should_close(&resp_headers).map(|close| !close).unwrap_or(true);

        if let Some(cache) = &self.quic_cache {
            record_alt_svc(cache, &self.host, self.port, &resp_headers);
        }

        let method = self.pending_method.clone();
        let len = Self::body_len(&resp_headers, status, &method);

        self.stream_id += 1;
        let stream_id = self.stream_id;
        self.state = ConnState::StreamingResponse;

        let reader: Option<Box<dyn BodySource>> = match len {
            BodyLen::None => None,
            other => Some(Box::new(Http1Body {
                socket: self.socket.clone(),
                remaining: other,
                overflow: leftover,
                timeout: self.timeout,
            })),
        };

        Ok(LowLevelResponse::new(method, 11, status, reason, resp_headers, stream_id, reader))
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
        matches!(self.state, ConnState::Connected | ConnState::TlsWrapped)
    }

    fn is_saturated(&self) -> bool {
        !matches!(
            self.state,
            ConnState::Connected | ConnState::TlsWrapped | ConnState::Disconnected
        )
    }

    fn is_multiplexed(&self) -> bool {
        false
    }

    fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("h1::Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

struct Http1Body<T> {
    socket: Arc<AsyncMutex<Socket<T>>>,
    remaining: BodyLen,
    overflow: BytesMut,
    timeout: Option<Duration>,
}

impl<T> BodySource for Http1Body<T>
where
    T: Read + Write + Unpin + Send + 'static,
{
    fn read_chunk(&mut self, max_size: Option<usize>, _stream_id: u64) -> ReadFuture {
        let socket = self.socket.clone();
        let want = max_size.unwrap_or(64 * 1024).max(1);
        let remaining = self.remaining;
        let mut overflow = std::mem::take(&mut self.overflow);
        let timeout = self.timeout;

        Box::pin(async move {
            match remaining {
                BodyLen::None => Ok((Vec::new(), true)),
                BodyLen::Fixed(total) => {
                    while overflow.len() < want as usize && (overflow.len() as u64) < total {
                        let mut sock = socket.lock().await;
                        sock.set_timeout(timeout);
                        let chunk = sock.recv(8 * 1024).await?;
                        drop(sock);
                        if chunk.is_empty() {
                            break;
                        }
                        overflow.extend_from_slice(&chunk);
                    }
                    let take = (overflow.len() as u64).min(total).min(want as u64) as usize;
                    let out = overflow.split_to(take);
                    Ok((out.to_vec(), (total - take as u64) == 0))
                }
                BodyLen::Chunked => {
                    // a conservative single-chunk reader: pull one
                    // size-prefixed chunk at a time, reconciling against
                    // `want` the way `LowLevelResponse::read`'s overflow
                    // buffer reconciles against the caller.
                    loop {
                        if let Some((data, rest, last)) = try_decode_chunk(&overflow) {
                            overflow = BytesMut::from(&rest[..]);
                            return Ok((data, last));
                        }
                        let mut sock = socket.lock().await;
                        sock.set_timeout(timeout);
                        let chunk = sock.recv(8 * 1024).await?;
                        drop(sock);
                        if chunk.is_empty() {
                            return Err(Error::new_closed());
                        }
                        overflow.extend_from_slice(&chunk);
                    }
                }
                BodyLen::UntilClose => {
                    if !overflow.is_empty() {
                        let take = overflow.len().min(want as usize);
                        let out = overflow.split_to(take);
                        return Ok((out.to_vec(), false));
                    }
                    let mut sock = socket.lock().await;
                    sock.set_timeout(timeout);
                    let chunk = sock.recv(want as usize).await?;
                    let eot = chunk.is_empty();
                    Ok((chunk, eot))
                }
            }
        })
    }
}

fn try_decode_chunk(buf: &[u8]) -> Option<(Vec<u8>, Vec<u8>, bool)> {
    let line_end = find_subsequence(buf, b"\r\n")?;
    let size_str = std::str::from_utf8(&buf[..line_end]).ok()?;
    let size_str = size_str.split(';').next().unwrap_or(size_str).trim();
    let size = usize::from_str_radix(size_str, 16).ok()?;

    let body_start = line_end + 2;
    if size == 0 {
        // final chunk; ignore trailers, require the terminating CRLF
        let term = body_start + 2;
        if buf.len() < term {
            return None;
        }
        return Some((Vec::new(), buf[term..].to_vec(), true));
    }

    let body_end = body_start + size;
    let full_end = body_end + 2;
    if buf.len() < full_end {
        return None;
    }
    Some((buf[body_start..body_end].to_vec(), buf[full_end..].to_vec(), false))
}

async fn write_chunk<T>(sock: &mut Socket<T>, data: &[u8]) -> Result<()>
where
    T: Read + Write + Unpin + Send,
{
    if data.is_empty() {
        return Ok(());
    }
    let header = format!("{:x}\r\n", data.len());
    sock.send_all(header.as_bytes()).await?;
    sock.send_all(data).await?;
    sock.send_all(b"\r\n").await
}

async fn write_last_chunk<T>(sock: &mut Socket<T>) -> Result<()>
where
    T: Read + Write + Unpin + Send,
{
    sock.send_all(b"0\r\n\r\n").await
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len().max(1))
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::TokioIo;
    use tokio::io::DuplexStream;

    fn pair() -> (Connection<TokioIo<DuplexStream>>, DuplexStream) {
        let (a, b) = tokio::io::duplex(4096);
        let socket = Socket::plain(TokioIo::new(a));
        (Connection::new(socket, "example.com", 80, "http"), b)
    }

    #[tokio::test]
    async fn fresh_connection_is_idle_and_not_saturated() {
        let (conn, _peer) = pair();
        assert!(conn.is_idle());
        assert!(!conn.is_saturated());
        assert!(!conn.is_multiplexed());
    }

    #[tokio::test]
    async fn put_request_moves_out_of_idle() {
        let (mut conn, _peer) = pair();
        conn.put_request(&Method::GET, "/", false, false).unwrap();
        assert!(!conn.is_idle());
        assert!(conn.is_saturated());
    }

    #[tokio::test]
    async fn fixed_length_body_reads_exact_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut conn, mut peer) = pair();
        conn.put_request(&Method::GET, "/", false, false).unwrap();
        conn.end_headers(None, false, false).await.unwrap();

        let mut sent = vec![0u8; 256];
        let n = peer.read(&mut sent).await.unwrap();
        sent.truncate(n);
        assert!(sent.starts_with(b"GET / HTTP/1.1\r\n"));

        peer.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
            .await
            .unwrap();

        let mut response = conn.get_response(None).await.unwrap();
        let body = response.read(None).await.unwrap();
        assert_eq!(body, b"hello");
        assert!(response.is_closed());
    }

    #[tokio::test]
    async fn chunked_body_reassembles_across_frames() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut conn, mut peer) = pair();
        conn.put_request(&Method::GET, "/", false, false).unwrap();
        conn.end_headers(None, false, false).await.unwrap();

        let mut sent = vec![0u8; 256];
        let n = peer.read(&mut sent).await.unwrap();
        sent.truncate(n);

        peer.write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .await
            .unwrap();

        let mut response = conn.get_response(None).await.unwrap();
        let mut collected = Vec::new();
        loop {
            let chunk = response.read(Some(4)).await.unwrap();
            if chunk.is_empty() && response.is_closed() {
                break;
            }
            collected.extend(chunk);
            if response.is_closed() {
                break;
            }
        }
        assert_eq!(collected, b"hello world");
    }
}
