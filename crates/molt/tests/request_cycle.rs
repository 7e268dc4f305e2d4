//! End-to-end request staging over real sockets, without forking:
//! the reader, body input, and response writer driven the way a worker
//! drives them.

use molt::{AppResponse, Connection, RequestReader};
use molt_http::ResponseWriter;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

fn pair() -> (Connection, UnixStream) {
    let (a, b) = UnixStream::pair().unwrap();
    (Connection::Unix(a), b)
}

#[test]
fn large_put_is_staged_byte_exact() {
    const BODY_LEN: usize = 256 * 4096; // 1 MiB

    let (mut conn, client) = pair();
    let body: Vec<u8> = (0..BODY_LEN).map(|i| (i * 31 % 251) as u8).collect();
    let expected = body.clone();

    let writer = std::thread::spawn(move || {
        let mut client = client;
        client
            .write_all(format!("PUT /upload HTTP/1.1\r\nContent-Length: {BODY_LEN}\r\n\r\n").as_bytes())
            .unwrap();
        client.write_all(&body).unwrap();
    });

    let mut env = RequestReader::new().read_request(&mut conn).unwrap();
    let input = env.input().unwrap();
    assert_eq!(input.size().unwrap(), Some(BODY_LEN as u64));

    let mut staged = Vec::with_capacity(BODY_LEN);
    input.read_to_end(&mut staged).unwrap();
    assert_eq!(staged.len(), BODY_LEN);
    assert_eq!(staged, expected);

    // The body crossed the in-memory cap, so it rewound from disk.
    input.rewind().unwrap();
    let mut replay = Vec::with_capacity(BODY_LEN);
    input.read_to_end(&mut replay).unwrap();
    assert_eq!(replay, expected);

    writer.join().unwrap();
}

#[test]
fn chunked_put_with_trailers() {
    let (mut conn, mut client) = pair();
    client
        .write_all(
            b"PUT /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\nTrailer: X-Checksum\r\n\r\n\
              6\r\nchunky\r\n1\r\n \r\n4\r\nbody\r\n0\r\nX-Checksum: abc123\r\n\r\n",
        )
        .unwrap();

    let mut env = RequestReader::new().read_request(&mut conn).unwrap();
    let input = env.input().unwrap();
    let mut body = Vec::new();
    input.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"chunky body");

    let trailers = input.trailers().to_vec();
    assert_eq!(trailers.len(), 1);
    env.merge_trailers(&trailers);
    assert_eq!(env.get("HTTP_X_CHECKSUM"), Some("abc123"));
}

#[test]
fn response_reaches_the_client() {
    let (conn, mut client) = pair();

    let response = AppResponse::text("it works");
    let mut writer = ResponseWriter::new(conn);
    writer.write_head(response.status, &response.headers).unwrap();
    if let molt::AppBody::Bytes(bytes) = response.body {
        writer.write_body(&bytes).unwrap();
    }
    writer.finish().unwrap();
    drop(writer);

    let mut wire = Vec::new();
    client.read_to_end(&mut wire).unwrap();
    let text = String::from_utf8(wire).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.ends_with("\r\n\r\nit works"));
}

#[test]
fn continue_handshake_wire_order() {
    let (mut conn, client) = pair();

    let exchange = std::thread::spawn(move || {
        let mut client = client;
        client
            .write_all(
                b"PUT /u HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
            )
            .unwrap();

        // Wait for the interim response before sending the body.
        let mut interim = [0u8; 25];
        client.read_exact(&mut interim).unwrap();
        assert_eq!(&interim[..], b"HTTP/1.1 100 Continue\r\n\r\n");

        client.write_all(b"hello").unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        let text = String::from_utf8(rest).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    });

    let mut env = RequestReader::new().read_request(&mut conn).unwrap();
    assert!(env.expects_continue());

    let mut writer = ResponseWriter::new(conn.try_clone().unwrap());
    writer.write_continue().unwrap();

    let input = env.input().unwrap();
    let mut body = Vec::new();
    input.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"hello");

    let response = AppResponse::text("ok");
    writer.write_head(response.status, &response.headers).unwrap();
    if let molt::AppBody::Bytes(bytes) = response.body {
        writer.write_body(&bytes).unwrap();
    }
    writer.finish().unwrap();
    conn.shutdown_write().unwrap();
    drop(conn);
    drop(writer);

    exchange.join().unwrap();
}

#[test]
fn second_request_succeeds_after_an_oversized_one() {
    // A worker answers 413 and stays healthy; emulate the two connections
    // it would serve back to back.
    let reader = RequestReader {
        max_header: 2048,
        ..RequestReader::default()
    };

    let (mut conn, client) = pair();
    let flood = std::thread::spawn(move || {
        let mut client = client;
        let _ = client.write_all(b"GET / HTTP/1.1\r\n");
        let line = b"X-Big: stuff\r\n".repeat(300);
        let _ = client.write_all(&line);
    });
    let err = reader.read_request(&mut conn).unwrap_err();
    assert_eq!(err.response_status(), Some(413));
    flood.join().unwrap();
    drop(conn);

    let (mut conn, mut client) = pair();
    client.write_all(b"GET /ok HTTP/1.1\r\n\r\n").unwrap();
    let env = reader.read_request(&mut conn).unwrap();
    assert_eq!(env.get("PATH_INFO"), Some("/ok"));
}
