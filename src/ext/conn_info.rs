//! `ConnectionInfo` — opportunistic telemetry captured while dialing and
//! negotiating a connection.
//!
//! Every field is populated best-effort; a field that was never observed is
//! `None`, never a wrong guess. Grounded on urllib3.future's
//! `backend._base.ConnectionInfo`, reshaped into an idiomatic struct with
//! private setters instead of a mutable bag of public attributes.

use std::net::SocketAddr;
use std::time::Duration;

use crate::backend::HttpVersion;

/// Opportunistic telemetry gathered while establishing and using a
/// connection: resolution/handshake latencies, negotiated protocol, and the
/// peer's certificate chain when TLS was used.
#[derive(Clone, Debug, Default)]
pub struct ConnectionInfo {
    resolution_latency: Option<Duration>,
    established_latency: Option<Duration>,
    tls_handshake_latency: Option<Duration>,
    request_sent_latency: Option<Duration>,
    http_version: Option<HttpVersion>,
    cipher: Option<String>,
    tls_version: Option<String>,
    certificate_der: Option<Vec<u8>>,
    issuer_certificate_der: Option<Vec<u8>>,
    destination_address: Option<SocketAddr>,
}

impl ConnectionInfo {
    /// Time taken to resolve a domain name into a reachable address.
    pub fn resolution_latency(&self) -> Option<Duration> {
        self.resolution_latency
    }

    /// Time taken to establish the raw transport (TCP handshake, or the
    /// QUIC setup).
    pub fn established_latency(&self) -> Option<Duration> {
        self.established_latency
    }

    /// Time taken to complete the TLS handshake with the remote peer, if
    /// any. `None` for a plaintext connection.
    pub fn tls_handshake_latency(&self) -> Option<Duration> {
        self.tls_handshake_latency
    }

    /// Time taken to encode and send the whole request through the socket.
    pub fn request_sent_latency(&self) -> Option<Duration> {
        self.request_sent_latency
    }

    /// The HTTP version negotiated with the remote peer (via ALPN for H2,
    /// via the QUIC transport parameters for H3).
    pub fn http_version(&self) -> Option<HttpVersion> {
        self.http_version
    }

    /// The TLS cipher suite negotiated with the remote peer.
    pub fn cipher(&self) -> Option<&str> {
        self.cipher.as_deref()
    }

    /// The TLS protocol version negotiated with the remote peer.
    pub fn tls_version(&self) -> Option<&str> {
        self.tls_version.as_deref()
    }

    /// DER-encoded certificate presented by the remote peer.
    pub fn certificate_der(&self) -> Option<&[u8]> {
        self.certificate_der.as_deref()
    }

    /// DER-encoded issuer certificate for the remote peer's certificate.
    pub fn issuer_certificate_der(&self) -> Option<&[u8]> {
        self.issuer_certificate_der.as_deref()
    }

    /// The address actually dialed, as yielded by the resolver.
    pub fn destination_address(&self) -> Option<SocketAddr> {
        self.destination_address
    }

    /// True iff a peer certificate was captured, i.e. the connection is
    /// encrypted. Dropped from the distilled spec's field list but present
    /// in the original and useful for upgrade-probing decisions.
    pub fn is_encrypted(&self) -> bool {
        self.certificate_der.is_some()
    }

    pub(crate) fn set_resolution_latency(&mut self, d: Duration) {
        self.resolution_latency = Some(d);
    }

    pub(crate) fn set_established_latency(&mut self, d: Duration) {
        self.established_latency = Some(d);
    }

    pub(crate) fn set_tls_handshake_latency(&mut self, d: Duration) {
        self.tls_handshake_latency = Some(d);
    }

    pub(crate) fn set_request_sent_latency(&mut self, d: Duration) {
        self.request_sent_latency = Some(d);
    }

    pub(crate) fn set_http_version(&mut self, v: HttpVersion) {
        self.http_version = Some(v);
    }

    pub(crate) fn set_cipher(&mut self, cipher: String) {
        self.cipher = Some(cipher);
    }

    pub(crate) fn set_tls_version(&mut self, version: String) {
        self.tls_version = Some(version);
    }

    pub(crate) fn set_certificate_der(&mut self, der: Vec<u8>) {
        self.certificate_der = Some(der);
    }

    pub(crate) fn set_issuer_certificate_der(&mut self, der: Vec<u8>) {
        self.issuer_certificate_der = Some(der);
    }

    pub(crate) fn set_destination_address(&mut self, addr: SocketAddr) {
        self.destination_address = Some(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_info_reports_not_encrypted() {
        let info = ConnectionInfo::default();
        assert!(!info.is_encrypted());
        assert!(info.http_version().is_none());
    }

    #[test]
    fn setting_certificate_marks_encrypted() {
        let mut info = ConnectionInfo::default();
        info.set_certificate_der(vec![1, 2, 3]);
        assert!(info.is_encrypted());
    }
}
