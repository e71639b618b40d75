//! HTTP/2 support shared between this crate's `backend::h2` and the
//! `h2` crate's connection/stream types.

use std::io::Cursor;

use bytes::{Buf, Bytes};

/// The buffer type handed to `h2::SendStream::send_data`.
///
/// `h2`'s `SendStream` is generic over the buffer it sends; request bodies
/// come in as the caller's body type `B`, but a few internal call sites
/// (notably flushing a final empty frame) need to send a plain `Bytes`
/// cursor or nothing at all, so this wraps both cases alongside the real
/// body buffer.
pub(crate) enum SendBuf<B> {
    Buf(B),
    Cursor(Cursor<Bytes>),
    None,
}

impl<B: Buf> Buf for SendBuf<B> {
    fn remaining(&self) -> usize {
        match self {
            SendBuf::Buf(b) => b.remaining(),
            SendBuf::Cursor(c) => c.remaining(),
            SendBuf::None => 0,
        }
    }

    fn chunk(&self) -> &[u8] {
        match self {
            SendBuf::Buf(b) => b.chunk(),
            SendBuf::Cursor(c) => c.chunk(),
            SendBuf::None => &[],
        }
    }

    fn advance(&mut self, cnt: usize) {
        match self {
            SendBuf::Buf(b) => b.advance(cnt),
            SendBuf::Cursor(c) => c.advance(cnt),
            SendBuf::None => {}
        }
    }
}
