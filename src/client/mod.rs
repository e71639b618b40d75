//! Collaborator interfaces consumed by backends when dialing a destination.
//!
//! This crate does not own the dial itself — constructing a [`Socket`](crate::socket::Socket)
//! and handing it to a backend's constructor is a caller concern — but it
//! keeps the DNS collaborator interface backends are expected to be built
//! against, so callers don't each invent their own resolver.

pub mod connect;
