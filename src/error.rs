//! Crate-wide error type.
//!
//! Connection setup, protocol framing, arbiter bookkeeping, and I/O all
//! surface through one opaque `Error`, the way hyper's `error.rs` keeps a
//! single type over a private `Kind` enum rather than exposing a public
//! error hierarchy.

use std::error::Error as StdError;
use std::fmt;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// An error produced by the socket, backend, or arbiter layers.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Transport (TCP or QUIC) could not be established.
    Connect,
    /// A blocking operation exceeded its deadline.
    Timeout,
    /// A backend operation was called while the state machine was in the
    /// wrong state (e.g. `put_header` before `put_request`).
    ProtocolState,
    /// Framing or header violation from the peer.
    Protocol,
    /// Read or write on a response/connection that is already closed.
    IoClosed,
    /// A task attempted to hold two borrows from the same arbiter.
    AtomicTraffic,
    /// `get`/`locate` could not find a matching item.
    UnavailableTraffic,
    /// `put` could not evict anything to make room.
    OverwhelmedTraffic,
    /// DNS resolution failed.
    Resolution,
    /// TLS handshake or certificate validation failed.
    Tls,
    /// Underlying transport I/O error.
    Io,
    /// A general error surfaced by the `h2` crate.
    #[cfg(feature = "http2")]
    Http2,
    /// A general error surfaced by the `h3` crate.
    #[cfg(feature = "http3")]
    Http3,
}

impl Error {
    /// Returns true if this was an error trying to establish a connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if an operation was called in a state that forbids it.
    pub fn is_protocol_state(&self) -> bool {
        matches!(self.inner.kind, Kind::ProtocolState)
    }

    /// Returns true if the peer violated framing or header rules.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if this was a read/write against an already-closed item.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::IoClosed)
    }

    /// Returns true if a task tried to hold two borrows at once.
    pub fn is_atomic_traffic(&self) -> bool {
        matches!(self.inner.kind, Kind::AtomicTraffic)
    }

    /// Returns true if `get`/`locate` found nothing to hand back.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.inner.kind, Kind::UnavailableTraffic)
    }

    /// Returns true if `put` could not evict anything to make room.
    pub fn is_overwhelmed(&self) -> bool {
        matches!(self.inner.kind, Kind::OverwhelmedTraffic)
    }

    /// Returns true if this was a DNS resolution failure.
    pub fn is_resolution(&self) -> bool {
        matches!(self.inner.kind, Kind::Resolution)
    }

    /// Returns true if this was a TLS handshake/certificate failure.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Consumes the error, returning its cause, if any.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_connect<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Connect).with(cause)
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_protocol_state(msg: &'static str) -> Error {
        Error::new(Kind::ProtocolState).with(ProtocolStateMsg(msg))
    }

    pub(crate) fn new_protocol<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::IoClosed)
    }

    pub(crate) fn new_atomic_traffic(msg: &'static str) -> Error {
        Error::new(Kind::AtomicTraffic).with(ProtocolStateMsg(msg))
    }

    pub(crate) fn new_unavailable(msg: impl Into<String>) -> Error {
        Error::new(Kind::UnavailableTraffic).with(Message(msg.into()))
    }

    pub(crate) fn new_overwhelmed(msg: &'static str) -> Error {
        Error::new(Kind::OverwhelmedTraffic).with(ProtocolStateMsg(msg))
    }

    pub(crate) fn new_resolution<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Resolution).with(cause)
    }

    pub(crate) fn new_tls<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Tls).with(cause)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    #[cfg(feature = "http2")]
    pub(crate) fn new_h2(cause: ::h2::Error) -> Error {
        if cause.is_io() {
            Error::new_io(cause.into_io().expect("h2::Error::is_io"))
        } else {
            Error::new(Kind::Http2).with(cause)
        }
    }

    #[cfg(feature = "http3")]
    pub(crate) fn new_h3<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Http3).with(cause)
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Connect => "error trying to connect",
            Kind::Timeout => "operation timed out",
            Kind::ProtocolState => "backend operation called in an illegal state",
            Kind::Protocol => "framing or header violation from peer",
            Kind::IoClosed => "I/O operation on a closed response or connection",
            Kind::AtomicTraffic => "task tried to hold more than one borrow",
            Kind::UnavailableTraffic => "no connection available",
            Kind::OverwhelmedTraffic => "cannot evict a connection to make room",
            Kind::Resolution => "DNS resolution failed",
            Kind::Tls => "TLS handshake or certificate validation failed",
            Kind::Io => "connection I/O error",
            #[cfg(feature = "http2")]
            Kind::Http2 => "http2 error",
            #[cfg(feature = "http3")]
            Kind::Http3 => "http3 error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("traffic_arbiter::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

#[derive(Debug)]
struct ProtocolStateMsg(&'static str);

impl fmt::Display for ProtocolStateMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
impl StdError for ProtocolStateMsg {}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
impl StdError for Message {}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(std::mem::size_of::<Error>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn predicates_match_their_kind() {
        assert!(Error::new_timeout().is_timeout());
        assert!(Error::new_closed().is_closed());
        assert!(Error::new_atomic_traffic("double borrow").is_atomic_traffic());
        assert!(Error::new_overwhelmed("full").is_overwhelmed());
        assert!(Error::new_unavailable("empty").is_unavailable());
    }

    #[test]
    fn display_includes_cause() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::new_io(io_err);
        assert!(err.to_string().contains("boom"));
    }
}
