//! The async socket abstraction every backend dials through.
//!
//! A [`Socket`] starts out plain and can be wrapped into TLS exactly once
//! via [`Socket::wrap_tls`]; the plain transport is consumed by the wrap,
//! so a backend can't accidentally keep writing cleartext to a socket it
//! believes is encrypted. Modeled on hyper's `rt::{Read, Write}` split
//! rather than `tokio::io::{AsyncRead, AsyncWrite}` directly, so the same
//! backend code works over any executor that can produce something
//! implementing those two traits. Every blocking operation is bounded by
//! the socket's own `timeout`, set with [`Socket::set_timeout`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::rt::{Read, ReadBufCursor, Write};
use crate::{Error, Result};

#[cfg(feature = "tls")]
use std::sync::Arc;

/// A plain or TLS-wrapped transport, generic over the underlying IO type.
///
/// `T` is almost always [`crate::rt::TokioIo`] wrapping a `TcpStream`, but
/// any `Read + Write + Unpin + Send` type — a Unix socket, an in-memory
/// duplex for tests — works the same way.
enum Transport<T> {
    /// Cleartext transport.
    Plain(T),
    /// TLS-wrapped transport, reached only through [`Socket::wrap_tls`].
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<T>>),
    /// Transitional state entered only while a wrap is in progress; never
    /// observed by callers since `wrap_tls` takes `self` by value.
    Poisoned,
}

/// A plain or TLS-wrapped socket, carrying the spec's per-connection
/// `timeout` (spec §3's `Connection.timeout`) alongside the transport so
/// every blocking operation shares one deadline.
pub struct Socket<T> {
    transport: Transport<T>,
    timeout: Option<Duration>,
}

impl<T> fmt::Debug for Socket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match self.transport {
            Transport::Plain(_) => "Plain",
            #[cfg(feature = "tls")]
            Transport::Tls(_) => "Tls",
            Transport::Poisoned => "Poisoned",
        };
        f.debug_struct("Socket")
            .field("transport", &format_args!("{}", variant))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T> Socket<T>
where
    T: Read + Write + Unpin + Send,
{
    /// Wrap an already-connected transport as a plain (unencrypted) socket,
    /// with no timeout set.
    ///
    /// Establishing the transport itself (`new_conn` in spec terms) is the
    /// caller's job — a `Socket` only knows how to read, write, and upgrade
    /// to TLS, not how to resolve or dial.
    pub fn plain(io: T) -> Self {
        Socket {
            transport: Transport::Plain(io),
            timeout: None,
        }
    }

    /// True iff this socket has completed a TLS handshake.
    pub fn is_encrypted(&self) -> bool {
        match self.transport {
            #[cfg(feature = "tls")]
            Transport::Tls(_) => true,
            _ => false,
        }
    }

    /// Set (or clear, with `None`) the deadline every subsequent
    /// `send_all`/`recv`/`read_exact` call is bounded by. Spec §4.1's
    /// `set_timeout(seconds|none)`.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The currently configured timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Write the entirety of `data`, looping over partial writes. Fails with
    /// `Timeout` if the configured timeout elapses before every byte is
    /// written.
    pub async fn send_all(&mut self, mut data: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        while !data.is_empty() {
            let write = futures_util::future::poll_fn(|cx| Pin::new(&mut *self).poll_write(cx, data));
            let n = match timeout {
                Some(dur) => match tokio::time::timeout(dur, write).await {
                    Ok(res) => res.map_err(Error::new_io)?,
                    Err(_) => return Err(Error::new_timeout()),
                },
                None => write.await.map_err(Error::new_io)?,
            };
            if n == 0 {
                return Err(Error::new_io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write zero bytes into socket",
                )));
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Read at most `max` bytes, returning as soon as any data (or EOF) is
    /// observed. Returns an empty `Vec` on EOF. Fails with `Timeout` if the
    /// configured timeout elapses first.
    pub async fn recv(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut storage = vec![0u8; max];
        let mut buf = crate::rt::ReadBuf::new(&mut storage);
        let timeout = self.timeout;
        let read = futures_util::future::poll_fn(|cx| {
            let cursor = buf.unfilled();
            Pin::new(&mut *self).poll_read(cx, cursor)
        });
        match timeout {
            Some(dur) => match tokio::time::timeout(dur, read).await {
                Ok(res) => res.map_err(Error::new_io)?,
                Err(_) => return Err(Error::new_timeout()),
            },
            None => read.await.map_err(Error::new_io)?,
        }
        let filled = buf.filled().len();
        storage.truncate(filled);
        Ok(storage)
    }

    /// Read exactly `n` bytes, failing with `IOClosed` on premature EOF, or
    /// `Timeout` if the configured timeout elapses first.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let chunk = self.recv(n - out.len()).await?;
            if chunk.is_empty() {
                return Err(Error::new_closed());
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Flush and shut down the transport, swallowing secondary errors — the
    /// socket is going away regardless of whether the peer acknowledges it.
    pub async fn close(&mut self) {
        let _ = futures_util::future::poll_fn(|cx| match &mut self.transport {
            Transport::Plain(io) => Pin::new(io).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(io) => Pin::new(&mut **io).poll_shutdown(cx),
            Transport::Poisoned => Poll::Ready(Ok(())),
        })
        .await;
    }
}

/// Lets a [`Socket`] be handed directly to protocol crates (`h2`, `quinn`)
/// that drive their own framing over a raw stream, by wrapping it in
/// [`crate::rt::TokioIo`] to get back to `tokio::io::{AsyncRead, AsyncWrite}`.
impl<T> Read for Socket<T>
where
    T: Read + Write + Unpin + Send,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(io) => Pin::new(&mut **io).poll_read(cx, buf),
            Transport::Poisoned => {
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "socket poisoned")))
            }
        }
    }
}

impl<T> Write for Socket<T>
where
    T: Read + Write + Unpin + Send,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Transport::Tls(io) => Pin::new(&mut **io).poll_write(cx, buf),
            Transport::Poisoned => {
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "socket poisoned")))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_flush(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(io) => Pin::new(&mut **io).poll_flush(cx),
            Transport::Poisoned => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.get_mut().transport {
            Transport::Plain(io) => Pin::new(io).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Transport::Tls(io) => Pin::new(&mut **io).poll_shutdown(cx),
            Transport::Poisoned => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(feature = "tls")]
impl<T> Socket<T>
where
    T: Read + Write + Unpin + Send,
{
    /// Perform a TLS handshake over the current (plain) transport, replacing
    /// it with the encrypted variant in place. Fails with `TLSError` on
    /// handshake failure or `Timeout` if `handshake_timeout` elapses first;
    /// calling this on an already-wrapped socket fails with
    /// `ProtocolStateError`.
    pub async fn wrap_tls(
        self,
        connector: &TlsConnector,
        server_hostname: &str,
        handshake_timeout: Option<Duration>,
    ) -> Result<Self> {
        let plain = match self.transport {
            Transport::Plain(io) => io,
            Transport::Tls(_) => return Err(Error::new_protocol_state("socket already TLS-wrapped")),
            Transport::Poisoned => return Err(Error::new_protocol_state("socket poisoned")),
        };
        let timeout = self.timeout;

        let name = tokio_rustls::rustls::pki_types::ServerName::try_from(server_hostname.to_owned())
            .map_err(Error::new_tls)?;

        let handshake = connector.inner.connect(name, plain);
        let stream = match handshake_timeout {
            Some(dur) => match tokio::time::timeout(dur, handshake).await {
                Ok(res) => res.map_err(Error::new_tls)?,
                Err(_) => return Err(Error::new_timeout()),
            },
            None => handshake.await.map_err(Error::new_tls)?,
        };

        Ok(Socket {
            transport: Transport::Tls(Box::new(stream)),
            timeout,
        })
    }
}

/// A small wrapper around a `rustls::ClientConfig`, acting as an SSL
/// context factory. Callers build one from CA roots and an optional client
/// certificate; backends pass it to [`Socket::wrap_tls`].
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

#[cfg(feature = "tls")]
impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

#[cfg(feature = "tls")]
impl TlsConnector {
    /// Build a connector from a ready-made `rustls::ClientConfig`, e.g. one
    /// produced with webpki-roots or a custom CA bundle.
    pub fn new(config: Arc<rustls::ClientConfig>) -> Self {
        TlsConnector {
            inner: tokio_rustls::TlsConnector::from(config),
        }
    }
}

#[cfg(feature = "runtime")]
fn _assert_bounds() {
    fn assert_send<T: Send>() {}
    assert_send::<Socket<crate::rt::TokioIo<tokio::net::TcpStream>>>();
}

#[cfg(all(test, feature = "runtime"))]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn duplex_socket() -> (Socket<crate::rt::TokioIo<DuplexStream>>, DuplexStream) {
        let (a, b) = tokio::io::duplex(64);
        (Socket::plain(crate::rt::TokioIo::new(a)), b)
    }

    #[tokio::test]
    async fn send_then_recv_round_trips() {
        let (mut sock, mut peer) = duplex_socket();
        sock.send_all(b"hello").await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn read_exact_fails_on_early_eof() {
        let (mut sock, peer) = duplex_socket();
        drop(peer);
        let err = sock.read_exact(4).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn fresh_socket_is_not_encrypted() {
        let (sock, _peer) = duplex_socket();
        assert!(!sock.is_encrypted());
    }

    #[tokio::test]
    async fn recv_times_out_when_the_peer_stays_quiet() {
        let (mut sock, _peer) = duplex_socket();
        sock.set_timeout(Some(Duration::from_millis(10)));
        let err = sock.recv(4).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn send_all_succeeds_within_a_generous_timeout() {
        let (mut sock, mut peer) = duplex_socket();
        sock.set_timeout(Some(Duration::from_secs(5)));
        sock.send_all(b"hi").await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
