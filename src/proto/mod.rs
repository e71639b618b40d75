//! Pieces pertaining to the HTTP message protocol.
//!
//! The H1/H2/H3 backends each speak their own wire format
//! (`backend::h1`/`h2`/`h3`); this module holds the bits of machinery that
//! are awkward to inline there. HTTP/2 flow control and keepalive (`h2`) are
//! shared with the `h2` crate's primitives rather than reimplemented.

#[cfg(feature = "http2")]
pub(crate) mod h2;
