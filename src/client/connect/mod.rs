//! The DNS collaborator backends are expected to dial through.
//!
//! This module intentionally does not define a generic `tower_service::Service<Uri>`
//! connector abstraction the way hyper proper does — every backend here is
//! handed an already-dialed [`Socket`](crate::socket::Socket), so there is no
//! connector indirection to plug custom transports into. What's left is the
//! DNS piece: resolving a hostname to candidate addresses is still a real
//! collaborator interface (spec'd separately from TLS and from the socket
//! itself), so [`dns`] is kept as the reference resolver implementation.

pub mod dns;

#[cfg(feature = "runtime")]
mod sockopt {
    use socket2::SockRef;

    /// Apply this crate's default dial-time socket options to a freshly
    /// connected TCP stream, before handing it to [`crate::socket::Socket::plain`].
    ///
    /// Disables Nagle's algorithm (`TCP_NODELAY`). Small request/response
    /// frames (status lines, promise headers) should hit the wire
    /// immediately rather than wait on Nagle coalescing or the peer's
    /// delayed ACK.
    pub fn apply_defaults(stream: &tokio::net::TcpStream) -> std::io::Result<()> {
        SockRef::from(stream).set_nodelay(true)
    }
}

#[cfg(feature = "runtime")]
pub use sockopt::apply_defaults;
