#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]
#![cfg_attr(all(test, feature = "full"), deny(unreachable_pub))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # traffic-arbiter
//!
//! `traffic-arbiter` is the connection-multiplexing core of an HTTP client:
//! a bounded, concurrency-aware pool that negotiates HTTP/1.1, HTTP/2, and
//! HTTP/3 transparently and lets callers fire many concurrent requests over
//! a handful of physical connections while reading responses back in
//! whichever order they arrive.
//!
//! ## What's in here
//!
//! - [`pool`] — [`TrafficPolice`](pool::TrafficPolice), the arbiter that
//!   tracks connections, enforces one active borrow per task, and maps
//!   promises/responses back to the connection that owns them.
//! - [`backend`] — the [`BaseBackend`](backend::BaseBackend) state machine
//!   each protocol version implements, plus the `h1`/`h2`/`h3` backends.
//! - [`promise`] and [`response`] — the `ResponsePromise` / `LowLevelResponse`
//!   handoff: dispatch a request, get a promise back, resolve it into a
//!   response whose body streams lazily and slices to the exact byte count
//!   asked for.
//! - [`socket`] — the plain/TLS socket abstraction every backend dials
//!   through.
//!
//! This crate is deliberately low-level: URL parsing, redirects, cookies,
//! retries, and header canonicalization live one layer up. What lives here
//! is the part that's hard to get right — borrowing connections safely
//! across concurrent tasks, and keeping a promise's identity attached to
//! the right connection for the life of a multiplexed request.
//!
//! # Optional Features
//!
//! - `http1`: Enables the HTTP/1.1 backend.
//! - `http2`: Enables the HTTP/2 backend (via the `h2` crate).
//! - `http3`: Enables the HTTP/3 backend (via `h3`/`h3-quinn`/`quinn`).
//! - `tls`: Wires a `rustls`-backed default TLS connector.
//! - `runtime`: Enables the tokio-backed default socket and timer.
//! - `layers`: Enables `tracing`/`log` interop for the arbiter and backends.
//! - `full`: All of the above.
#[doc(hidden)]
pub use http;

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri, Version};

pub use crate::error::{Error, Result};

#[macro_use]
mod cfg;

#[macro_use]
mod trace;

pub mod backend;

#[macro_use]
mod common;
mod error;
pub mod ext;
pub mod pool;
pub mod promise;
pub mod response;
pub mod rt;
pub mod socket;

cfg_proto! {
    mod headers;
    mod proto;
}

cfg_feature! {
    #![feature = "client"]

    pub mod client;
}
