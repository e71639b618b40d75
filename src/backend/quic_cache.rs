//! Process-local cache recording which origins have advertised QUIC support,
//! so a later connection to the same origin can dial QUIC directly instead
//! of paying for a TCP handshake first. Grounded on
//! `BaseBackend._preemptive_quic_cache`'s `Alt-Svc` handling; kept as a
//! plain `std::sync::Mutex`-guarded map rather than reaching for `dashmap`,
//! matching the teacher's own preference for `std::sync::Mutex` around
//! shared pool state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use http::HeaderMap;

type Origin = (String, u16);

/// Parse an `Alt-Svc` header value for an advertised `h3`/`h3-*` entry and,
/// if found, record `host:port` as QUIC-reachable at the advertised
/// authority (falling back to `host:port` itself when the entry omits a
/// host, which is the common case — `Alt-Svc: h3=":443"`).
///
/// Grounded on the same header `BaseBackend._preemptive_quic_cache` reads in
/// the original; this crate doesn't parse the full `ma=`/`persist=`
/// parameter grammar since nothing here acts on advertisement lifetime.
pub(crate) fn record_alt_svc(cache: &PreemptiveQuicCache, host: &str, port: u16, headers: &HeaderMap) {
    for value in headers.get_all(http::header::ALT_SVC) {
        let Ok(value) = value.to_str() else { continue };
        if let Some((alt_host, alt_port)) = parse_h3_entry(value) {
            let quic_host = if alt_host.is_empty() { host } else { alt_host };
            cache.insert(host, port, quic_host, alt_port);
            return;
        }
    }
}

/// Pull the first `h3`/`h3-*` entry's `"host:port"` authority out of an
/// `Alt-Svc` header value, e.g. `h3=":443"; ma=2592000, h3-29="alt.example:443"`.
fn parse_h3_entry(value: &str) -> Option<(&str, u16)> {
    for entry in value.split(',') {
        let entry = entry.trim();
        let (protocol, rest) = entry.split_once('=')?;
        if !(protocol == "h3" || protocol.starts_with("h3-")) {
            continue;
        }
        let authority = rest.split(';').next().unwrap_or(rest).trim().trim_matches('"');
        let (host, port) = authority.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        return Some((host, port));
    }
    None
}

/// A shared, process-local table of `(host, port) -> (host, port) | absent`.
///
/// A present mapping means the origin advertised `Alt-Svc: h3=...` and
/// subsequent connections to it should attempt QUIC first. Absence means
/// "never observed"; it is not a negative cache entry, so failed QUIC
/// attempts don't poison it — `post_conn`'s fallback to TCP handles that per
/// connection instead.
#[derive(Clone, Debug, Default)]
pub struct PreemptiveQuicCache {
    inner: Arc<Mutex<HashMap<Origin, Origin>>>,
}

impl PreemptiveQuicCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up whether `(host, port)` has ever advertised QUIC support.
    pub fn get(&self, host: &str, port: u16) -> Option<(String, u16)> {
        let key = (host.to_owned(), port);
        self.inner.lock().unwrap().get(&key).cloned()
    }

    /// Record that `(host, port)` advertised QUIC reachable at
    /// `(quic_host, quic_port)`.
    pub fn insert(&self, host: &str, port: u16, quic_host: &str, quic_port: u16) {
        self.inner.lock().unwrap().insert(
            (host.to_owned(), port),
            (quic_host.to_owned(), quic_port),
        );
    }

    /// Forget any QUIC mapping for `(host, port)`, e.g. after a QUIC dial
    /// attempt fails outright.
    pub fn forget(&self, host: &str, port: u16) {
        self.inner.lock().unwrap().remove(&(host.to_owned(), port));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_forgets_a_mapping() {
        let cache = PreemptiveQuicCache::new();
        assert!(cache.get("example.com", 443).is_none());

        cache.insert("example.com", 443, "example.com", 443);
        assert_eq!(
            cache.get("example.com", 443),
            Some(("example.com".to_owned(), 443))
        );

        cache.forget("example.com", 443);
        assert!(cache.get("example.com", 443).is_none());
    }

    #[test]
    fn clones_share_the_same_table() {
        let cache = PreemptiveQuicCache::new();
        let other = cache.clone();
        cache.insert("h.example", 443, "h.example", 443);
        assert!(other.get("h.example", 443).is_some());
    }

    #[test]
    fn record_alt_svc_uses_origin_host_when_entry_omits_one() {
        let cache = PreemptiveQuicCache::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::ALT_SVC,
            "h3=\":443\"; ma=2592000".parse().unwrap(),
        );
        record_alt_svc(&cache, "example.com", 443, &headers);
        assert_eq!(
            cache.get("example.com", 443),
            Some(("example.com".to_owned(), 443))
        );
    }

    #[test]
    fn record_alt_svc_honors_an_explicit_alternate_authority() {
        let cache = PreemptiveQuicCache::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::ALT_SVC,
            "h3-29=\"alt.example:8443\"".parse().unwrap(),
        );
        record_alt_svc(&cache, "example.com", 443, &headers);
        assert_eq!(
            cache.get("example.com", 443),
            Some(("alt.example".to_owned(), 8443))
        );
    }

    #[test]
    fn record_alt_svc_ignores_entries_without_h3() {
        let cache = PreemptiveQuicCache::new();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ALT_SVC, "clear".parse().unwrap());
        record_alt_svc(&cache, "example.com", 443, &headers);
        assert!(cache.get("example.com", 443).is_none());
    }
}
