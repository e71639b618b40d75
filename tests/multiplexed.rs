//! Multiplexing behavior over a real `h2` handshake: several requests share
//! one connection, the fastest response resolves first regardless of
//! dispatch order, and the body reads back byte-exact across whatever chunk
//! sizes the wire happened to deliver.

#![cfg(feature = "full")]
#![warn(rust_2018_idioms)]

use bytes::Bytes;
use http::Method;

use traffic_arbiter::backend::h2::Connection;
use traffic_arbiter::backend::BaseBackend;
use traffic_arbiter::rt::TokioIo;
use traffic_arbiter::socket::Socket;

fn socket_pair() -> (Socket<TokioIo<tokio::io::DuplexStream>>, tokio::io::DuplexStream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Socket::plain(TokioIo::new(a)), b)
}

#[tokio::test]
async fn fastest_response_resolves_first_regardless_of_dispatch_order() {
    let (socket, peer) = socket_pair();
    let mut conn = Connection::new(socket, "example.com", 443, "https");
    conn.new_conn().await.unwrap();

    let server = tokio::spawn(async move {
        let mut server_conn = h2::server::handshake(peer).await.unwrap();

        // Two requests arrive; answer the second one first so a first-ready
        // `get_response(None)` has to actually race rather than happen to
        // match dispatch order.
        let (req_a, mut respond_a) = server_conn.accept().await.unwrap().unwrap();
        let (req_b, mut respond_b) = server_conn.accept().await.unwrap().unwrap();
        assert_eq!(req_a.method(), Method::GET);
        assert_eq!(req_b.method(), Method::GET);

        let mut send_b = respond_b
            .send_response(http::Response::new(()), false)
            .unwrap();
        send_b.send_data(Bytes::from_static(b"second-dispatched-first-ready"), true).unwrap();

        let mut send_a = respond_a
            .send_response(http::Response::new(()), false)
            .unwrap();
        send_a.send_data(Bytes::from_static(b"first-dispatched"), true).unwrap();

        // Keep the connection driver alive until both replies are flushed.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    });

    conn.post_conn().await.unwrap();

    conn.put_request(&Method::GET, "/a", false, false).unwrap();
    let promise_a = conn.end_headers(None, false, false).await.unwrap().unwrap();

    conn.put_request(&Method::GET, "/b", false, false).unwrap();
    let _promise_b = conn.end_headers(None, false, false).await.unwrap().unwrap();

    // Ask for whichever resolves first, naming no promise.
    let mut first = conn.get_response(None).await.unwrap();
    let first_body = first.read(None).await.unwrap();
    assert_eq!(first_body, b"second-dispatched-first-ready");

    // The other promise is still resolvable by name afterward.
    let mut second = conn.get_response(Some(&promise_a)).await.unwrap();
    let second_body = second.read(None).await.unwrap();
    assert_eq!(second_body, b"first-dispatched");

    server.await.unwrap();
}

#[tokio::test]
async fn response_body_reads_back_byte_exact_across_small_requested_chunks() {
    let (socket, peer) = socket_pair();
    let mut conn = Connection::new(socket, "example.com", 443, "https");
    conn.new_conn().await.unwrap();

    let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
    let expected = payload.clone();

    let server = tokio::spawn(async move {
        let mut server_conn = h2::server::handshake(peer).await.unwrap();
        if let Some(Ok((_, mut respond))) = server_conn.accept().await {
            let mut send = respond.send_response(http::Response::new(()), false).unwrap();
            // Split into uneven frames; the caller asks for a different,
            // unrelated chunk size below.
            send.send_data(Bytes::copy_from_slice(&payload[..7]), false).unwrap();
            send.send_data(Bytes::copy_from_slice(&payload[7..20]), false).unwrap();
            send.send_data(Bytes::copy_from_slice(&payload[20..]), true).unwrap();
        }
    });

    conn.post_conn().await.unwrap();
    conn.put_request(&Method::GET, "/", false, false).unwrap();
    conn.end_headers(None, false, false).await.unwrap();

    let mut response = conn.get_response(None).await.unwrap();
    let mut collected = Vec::new();
    loop {
        let chunk = response.read(Some(6)).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        collected.extend_from_slice(&chunk);
        if response.is_closed() && collected.len() >= expected.len() {
            break;
        }
    }
    assert_eq!(collected, expected);

    server.await.unwrap();
}
