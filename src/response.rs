//! [`LowLevelResponse`] — the lazy, byte-exact body reader handed back from
//! `get_response`.
//!
//! Grounded on `urllib3.future`'s `backend._base.LowLevelResponse`. The
//! wire delivers frames sized however the protocol likes; callers ask for
//! exact byte counts. `read`'s overflow buffer reconciles the two.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use http::{HeaderMap, Method, StatusCode};

use crate::{Error, Result};

/// A future yielding the next chunk of a response body.
pub type ReadFuture = Pin<Box<dyn Future<Output = Result<(Vec<u8>, bool)>> + Send>>;

/// The backend-supplied callable that actually pulls bytes off the wire.
///
/// Given `(max_size, stream_id)`, returns `(chunk, end_of_transmission)`.
/// `max_size` of `None` means "give me whatever you have, no upper bound."
pub trait BodySource: Send {
    /// Pull the next chunk, honoring `max_size` as an upper bound when given.
    fn read_chunk(&mut self, max_size: Option<usize>, stream_id: u64) -> ReadFuture;
}

/// A lazily-read HTTP response: headers are already available, the body is
/// pulled on demand through [`LowLevelResponse::read`].
///
/// `closed` becomes true once end-of-transmission has been observed and the
/// overflow buffer has been fully drained — never before, so a caller can
/// always drain exactly what was received.
pub struct LowLevelResponse {
    method: Method,
    version: u16,
    status: StatusCode,
    reason: String,
    headers: HeaderMap,
    stream_id: u64,
    reader: Option<Box<dyn BodySource>>,
    overflow: Vec<u8>,
    eot: bool,
    closed: bool,
    upgrade_authority: Option<(String, u16)>,
    promise_uid: Option<String>,
}

impl LowLevelResponse {
    /// Build a response around its headers; `reader` is `None` for
    /// bodiless responses (e.g. `204`, `HEAD`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: Method,
        version: u16,
        status: StatusCode,
        reason: String,
        headers: HeaderMap,
        stream_id: u64,
        reader: Option<Box<dyn BodySource>>,
    ) -> Self {
        let eot = reader.is_none();
        LowLevelResponse {
            method,
            version,
            status,
            reason,
            headers,
            stream_id,
            reader,
            overflow: Vec::new(),
            eot,
            closed: eot,
            upgrade_authority: None,
            promise_uid: None,
        }
    }

    /// Record an `(authority, port)` hint to probe for a protocol upgrade
    /// after this response completes (e.g. from `Alt-Svc`).
    pub fn set_upgrade_hint(&mut self, authority: impl Into<String>, port: u16) {
        self.upgrade_authority = Some((authority.into(), port));
    }

    /// The upgrade-probing hint set by [`Self::set_upgrade_hint`], if any.
    pub fn upgrade_hint(&self) -> Option<(&str, u16)> {
        self.upgrade_authority
            .as_ref()
            .map(|(host, port)| (host.as_str(), *port))
    }

    /// Attach the uid of the [`crate::promise::ResponsePromise`] this
    /// response resolves, for diagnostics.
    pub fn set_from_promise(&mut self, uid: impl Into<String>) {
        self.promise_uid = Some(uid.into());
    }

    /// The uid of the promise this response resolves, if dispatched through
    /// one.
    pub fn from_promise(&self) -> Option<&str> {
        self.promise_uid.as_deref()
    }

    /// The request method that produced this response.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The numeric HTTP version (`11`, `20`, or `30`).
    pub fn version(&self) -> u16 {
        self.version
    }

    /// The response status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The status line's reason phrase, as sent by the peer (H1) or
    /// synthesized from the status code (H2/H3, which carry none).
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The stream this response was received on.
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// True once end-of-transmission has been observed and the overflow
    /// buffer has been fully drained.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read up to `n` bytes of the body; `None` drains whatever is
    /// currently available.
    ///
    /// - Fails with `IOClosed` if already closed.
    /// - `n == Some(0)` is always a no-op, even on a closed response read
    ///   before any other call — callers may probe with it freely.
    /// - Otherwise pulls one chunk from the wire (unless end-of-transmission
    ///   was already reached), prepends any buffered overflow, hands back
    ///   exactly `n` bytes and stashes the rest, or hands back everything
    ///   buffered when `n` is `None`.
    pub async fn read(&mut self, n: Option<usize>) -> Result<Vec<u8>> {
        if n == Some(0) {
            return Ok(Vec::new());
        }
        if self.closed {
            return Err(Error::new_closed());
        }

        if !self.eot {
            let reader = self
                .reader
                .as_mut()
                .expect("reader present whenever eot is false");
            let (chunk, eot) = reader.read_chunk(n, self.stream_id).await?;
            self.eot = eot;
            if self.overflow.is_empty() {
                self.overflow = chunk;
            } else {
                self.overflow.extend_from_slice(&chunk);
            }
        }

        let out = match n {
            Some(n) if self.overflow.len() > n => self.overflow.drain(..n).collect(),
            _ => std::mem::take(&mut self.overflow),
        };

        if self.eot && self.overflow.is_empty() {
            self.closed = true;
        }

        Ok(out)
    }

    /// Drop the reader and mark this response closed, discarding any
    /// buffered-but-unread overflow. Idempotent.
    pub fn close(&mut self) {
        self.reader = None;
        self.overflow.clear();
        self.closed = true;
    }
}

impl fmt::Debug for LowLevelResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowLevelResponse")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("stream_id", &self.stream_id)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedSource {
        chunks: VecDeque<(Vec<u8>, bool)>,
    }

    impl BodySource for ScriptedSource {
        fn read_chunk(&mut self, _max_size: Option<usize>, _stream_id: u64) -> ReadFuture {
            let next = self.chunks.pop_front().unwrap_or((Vec::new(), true));
            Box::pin(async move { Ok(next) })
        }
    }

    fn response(chunks: Vec<(&'static [u8], bool)>) -> LowLevelResponse {
        let source = ScriptedSource {
            chunks: chunks.into_iter().map(|(b, eot)| (b.to_vec(), eot)).collect(),
        };
        LowLevelResponse::new(
            Method::GET,
            20,
            StatusCode::OK,
            "OK".to_owned(),
            HeaderMap::new(),
            1,
            Some(Box::new(source)),
        )
    }

    #[tokio::test]
    async fn read_zero_is_always_a_noop() {
        let mut resp = response(vec![(b"hello", true)]);
        assert_eq!(resp.read(Some(0)).await.unwrap(), Vec::<u8>::new());
        assert!(!resp.is_closed());
    }

    #[tokio::test]
    async fn byte_exact_reads_reassemble_the_body() {
        let mut resp = response(vec![(b"hello world", true)]);
        let mut collected = Vec::new();
        for _ in 0..5 {
            collected.extend(resp.read(Some(1)).await.unwrap());
        }
        assert_eq!(&collected, b"hello");
        assert!(!resp.is_closed());

        let rest = resp.read(None).await.unwrap();
        collected.extend(rest);
        assert_eq!(&collected, b"hello world");
        assert!(resp.is_closed());
    }

    #[tokio::test]
    async fn overflow_buffer_reconciles_chunk_vs_requested_size() {
        let mut resp = response(vec![(b"abcdef", false), (b"ghi", true)]);
        assert_eq!(resp.read(Some(2)).await.unwrap(), b"ab");
        assert_eq!(resp.read(Some(2)).await.unwrap(), b"cd");
        // drains overflow, then pulls the final (eot) chunk and returns it whole
        let rest = resp.read(None).await.unwrap();
        assert_eq!(rest, b"efghi");
        assert!(resp.is_closed());
    }

    #[tokio::test]
    async fn reading_after_close_fails() {
        let mut resp = response(vec![(b"x", true)]);
        resp.close();
        let err = resp.read(Some(1)).await.unwrap_err();
        assert!(err.is_closed());
    }
}
