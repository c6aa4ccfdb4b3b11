use std::path::Path;
use std::time::{Duration, Instant};

use cgi_gateway::gateway::{Error, Framing, Peer, Phase};
use cgi_gateway::{chunked, ChunkedBody, Config};
use futures_util::io::{BufReader, Cursor};
use http::{StatusCode, Version};
use tokio::io::AsyncWriteExt;
use tokio_util::compat::TokioAsyncReadCompatExt;

mod common;
use common::*;

const SLOW_CHUNKS: [&str; 5] = ["Hello ", "this is ", "a slow ", "chunked ", "request!"];
const SLOW_BODY: &str = "Hello this is a slow chunked request!";

fn empty() -> Cursor<Vec<u8>> {
    Cursor::new(Vec::new())
}


#[tokio::test]
async fn slow_chunked_request() {
    init_tracing();
    let gateway = gateway(config());
    let req = TestRequest::new("POST", "/cgi/echo.sh", None, &[("transfer-encoding", "chunked")]);

    let (mut remote, local) = tokio::io::duplex(64);
    let sender = async move {
        for part in SLOW_CHUNKS {
            let mut frame = Vec::new();
            chunked::encode_chunk(part.as_bytes(), &mut frame);
            remote.write_all(&frame).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        remote.write_all(chunked::TERMINATOR).await.unwrap();
        // Keep the connection open, as a keep-alive client would
        remote
    };
    let ((res, raw), _remote) = tokio::join!(req.serve(&gateway, BufReader::new(local.compat())), sender);

    let completion = res.unwrap();
    assert_eq!(completion.status, StatusCode::OK);
    assert_eq!(completion.framing, Framing::Chunked);
    assert_eq!(completion.request_bytes, SLOW_BODY.len() as u64);
    assert!(completion.reusable);

    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Content-Type: text/plain\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    let body = dechunk(body);
    assert_eq!(body, format!("CONTENT_LENGTH=unset\n{SLOW_BODY}").as_bytes());
}

#[tokio::test]
async fn empty_chunked_body_on_open_connection() {
    let mut config = config();
    config.body_idle_timeout = Duration::from_secs(5);
    let gateway = gateway(config);
    let req = TestRequest::new("POST", "/cgi/echo.sh", None, &[("transfer-encoding", "chunked")]);

    let (mut remote, local) = tokio::io::duplex(64);
    remote.write_all(chunked::TERMINATOR).await.unwrap();
    let start = Instant::now();
    let (res, raw) = req.serve(&gateway, BufReader::new(local.compat())).await;
    assert!(start.elapsed() < Duration::from_secs(3), "waited for more request body");

    let completion = res.unwrap();
    assert_eq!(completion.request_bytes, 0);
    assert!(completion.reusable);
    assert_eq!(dechunk(split_response(&raw).1), b"CONTENT_LENGTH=unset\n");
    drop(remote);
}

#[tokio::test]
async fn buffered_chunked_request() {
    let mut config = config();
    config.chunked_body = ChunkedBody::Buffer;
    config.max_body_size = Some(1024);
    let gateway = gateway(config);
    let req = TestRequest::new("POST", "/cgi/echo.sh", None, &[("transfer-encoding", "chunked")]);

    let parts: Vec<&[u8]> = SLOW_CHUNKS.iter().map(|c| c.as_bytes()).collect();
    let (res, raw) = req.serve(&gateway, Cursor::new(chunked_body(&parts))).await;
    assert_eq!(res.unwrap().request_bytes, 37);
    let body = dechunk(split_response(&raw).1);
    assert_eq!(body, format!("CONTENT_LENGTH=37\n{SLOW_BODY}").as_bytes());
}

#[tokio::test]
async fn next_request_stays_in_reader() {
    let gateway = gateway(config());
    let req = TestRequest::new("POST", "/cgi/echo.sh", None, &[("transfer-encoding", "chunked")]);

    let mut input = chunked_body(&[b"ping".as_slice()]);
    let body_len = input.len() as u64;
    input.extend_from_slice(b"GET /next HTTP/1.1\r\n\r\n");
    let mut reader = Cursor::new(input);

    let (res, raw) = req.serve(&gateway, &mut reader).await;
    assert!(res.unwrap().reusable);
    assert_eq!(reader.position(), body_len);
    assert_eq!(dechunk(split_response(&raw).1), b"CONTENT_LENGTH=unset\nping");
}

#[tokio::test]
async fn large_body_echo_does_not_deadlock() {
    let gateway = gateway(config());
    let mut data = vec![0; 2 * 1024 * 1024];
    fastrand::fill(&mut data);
    let len = data.len().to_string();
    let req = TestRequest::new("PUT", "/cgi/echo.sh", None, &[("content-length", len.as_str())]);

    let serve = req.serve(&gateway, Cursor::new(data.clone()));
    let (res, raw) = tokio::time::timeout(Duration::from_secs(20), serve).await
        .expect("request and response pumps stalled each other");

    let completion = res.unwrap();
    assert_eq!(completion.request_bytes, data.len() as u64);
    let body = dechunk(split_response(&raw).1);
    let (prefix, echoed) = body.split_at(body.len() - data.len());
    assert_eq!(prefix, format!("CONTENT_LENGTH={len}\n").as_bytes());
    assert!(echoed == data.as_slice());
}

#[tokio::test]
async fn environment() {
    let gateway = gateway(config());
    let req = TestRequest::new("POST", "/cgi/env.sh", Some("a=1&b=2"), &[
        ("content-type", "text/plain"),
        ("content-length", "5"),
        ("x-custom-header", "yes"),
        ("accept", "text/html"),
        ("accept", "text/plain"),
    ]);
    let (res, raw) = req.serve(&gateway, Cursor::new(b"hello".to_vec())).await;
    res.unwrap();

    let body = String::from_utf8(dechunk(split_response(&raw).1)).unwrap();
    let vars: Vec<&str> = body.lines().collect();
    for expected in [
        "GATEWAY_INTERFACE=CGI/1.1",
        "SERVER_NAME=test.local",
        "SERVER_PORT=8080",
        "SERVER_PROTOCOL=HTTP/1.1",
        "REQUEST_METHOD=POST",
        "SCRIPT_NAME=/cgi/env.sh",
        "PATH_INFO=",
        "QUERY_STRING=a=1&b=2",
        "CONTENT_LENGTH=5",
        "CONTENT_TYPE=text/plain",
        "REMOTE_ADDR=192.0.2.7",
        "HTTP_X_CUSTOM_HEADER=yes",
        "HTTP_ACCEPT=text/html, text/plain",
    ] {
        assert!(vars.contains(&expected), "{expected} missing from:\n{body}");
    }
    assert!(vars.iter().any(|v| v.starts_with("PATH=")));
    assert!(!body.contains("HTTP_CONTENT_LENGTH"));
    assert!(!body.contains("HTTP_CONTENT_TYPE"));
    // Nothing of the gateway's own environment leaks
    assert!(!body.contains("CARGO_MANIFEST_DIR"));
}

#[tokio::test]
async fn response_head_from_script() {
    let gateway = gateway(config());
    let req = TestRequest::get("/cgi/status.sh", None);
    let (res, raw) = req.serve(&gateway, empty()).await;
    assert_eq!(res.unwrap().status, StatusCode::NOT_FOUND);

    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.1 404 Not Here\r\n"), "{head}");
    assert!(head.contains("Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n"));
    assert!(!head.contains("Status:"));
    assert!(!head.contains("keep-alive"));
    assert_eq!(dechunk(body), b"missing");
}

#[tokio::test]
async fn http10_response_is_closed() {
    let gateway = gateway(config());
    let mut req = TestRequest::get("/cgi/stream_unsized.sh", Some("100000"));
    *req.head.version_mut() = Version::HTTP_10;

    let (res, raw) = req.serve(&gateway, empty()).await;
    let completion = res.unwrap();
    assert_eq!(completion.framing, Framing::Close);
    assert!(!completion.reusable);

    let (head, body) = split_response(&raw);
    assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(head.contains("Connection: close\r\n"));
    assert_eq!(body.len(), 100_000);
}

#[tokio::test]
async fn head_request_has_no_body() {
    let gateway = gateway(config());
    let req = TestRequest::new("HEAD", "/cgi/stream.sh", Some("1000"), &[]);
    let (res, raw) = req.serve(&gateway, empty()).await;
    let completion = res.unwrap();
    assert_eq!(completion.framing, Framing::Empty);
    assert_eq!(completion.body_bytes, 0);

    let (head, body) = split_response(&raw);
    assert!(head.contains("Content-Length: 1000\r\n"));
    assert!(body.is_empty());
}

#[tokio::test]
async fn content_length_caps_output() {
    let mut config = config();
    config.kill_grace = Duration::from_millis(200);
    let gateway = gateway(config);
    let req = TestRequest::get("/cgi/overlong.sh", None);

    let start = Instant::now();
    let (res, raw) = req.serve(&gateway, empty()).await;
    let completion = res.unwrap();
    assert!(start.elapsed() < Duration::from_secs(5), "waited for the script to finish");

    assert_eq!(completion.framing, Framing::Length(10));
    assert_eq!(completion.body_bytes, 10);
    assert!(completion.exit.is_some_and(|s| !s.success()));
    assert_eq!(split_response(&raw).1, b"0123456789");
}

#[tokio::test]
async fn nonzero_exit_still_completes() {
    let gateway = gateway(config());
    let req = TestRequest::get("/cgi/exit_code.sh", None);
    let (res, raw) = req.serve(&gateway, empty()).await;
    let completion = res.unwrap();
    assert_eq!(completion.exit.and_then(|s| s.code()), Some(3));
    assert_eq!(dechunk(split_response(&raw).1), b"bye");
}

#[tokio::test]
async fn timeout_kills_and_reaps() {
    let mut config = config();
    config.timeout = Duration::from_millis(300);
    config.kill_grace = Duration::from_millis(200);
    let gateway = gateway(config);
    let pid_file = temp_path("pid");
    let req = TestRequest::get("/cgi/sleep.sh", pid_file.to_str());

    let (res, raw) = req.serve(&gateway, empty()).await;
    let failure = res.unwrap_err();
    assert!(matches!(failure.error, Error::TimedOut(_)), "{failure}");
    assert!(!failure.headers_sent);
    assert_eq!(failure.phase, Phase::TimedOut);
    assert!(raw.is_empty());
    let resp = failure.error_response(Version::HTTP_11).unwrap();
    assert!(resp.starts_with(b"HTTP/1.1 504 "));

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    std::fs::remove_file(&pid_file).unwrap();
    // A zombie would keep its /proc entry until reaped
    assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists(), "script {pid} was not reaped");
}

#[tokio::test]
async fn client_disconnect_kills_script() {
    let mut config = config();
    config.timeout = Duration::from_secs(20);
    let gateway = gateway(config);
    let req = TestRequest::get("/cgi/stream.sh", Some("67108864"));

    let mut client = CountingClient { hang_up_after: Some(1024 * 1024), ..CountingClient::default() };
    let failure = gateway.serve(req.request(empty()), &mut client).await.unwrap_err();
    assert!(matches!(failure.error, Error::BrokenPipe { peer: Peer::Client, .. }), "{failure}");
    assert!(failure.headers_sent);
    assert_eq!(failure.phase, Phase::Killed);
    assert!(failure.error_response(Version::HTTP_11).is_none());
    assert!(client.received < 2 * 1024 * 1024);
}

#[tokio::test]
async fn spawn_failure() {
    let gateway = gateway(Config::default());
    let req = TestRequest::get("/cgi/does-not-exist", None);
    let (res, raw) = req.serve(&gateway, empty()).await;
    let failure = res.unwrap_err();
    assert!(matches!(failure.error, Error::SpawnFailure(_)), "{failure}");
    assert_eq!(failure.phase, Phase::Spawning);
    assert_eq!(failure.error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(raw.is_empty());
}

#[tokio::test]
async fn malformed_headers_from_script() {
    let gateway = gateway(config());
    let req = TestRequest::get("/cgi/bad_headers.sh", None);
    let (res, raw) = req.serve(&gateway, empty()).await;
    let failure = res.unwrap_err();
    assert!(matches!(failure.error, Error::MalformedCgiHeaders(_)), "{failure}");
    assert_eq!(failure.error.status(), StatusCode::BAD_GATEWAY);
    assert!(!failure.headers_sent);
    assert!(raw.is_empty());
}

#[tokio::test]
async fn malformed_chunk_is_rejected_before_spawn() {
    let gateway = gateway(config());
    let marker = temp_path("marker");
    let req = TestRequest::new("POST", "/cgi/touch.sh", marker.to_str(), &[("transfer-encoding", "chunked")]);

    let input = Cursor::new(b"zz\r\nhello\r\n0\r\n\r\n".to_vec());
    let (res, raw) = req.serve(&gateway, input).await;
    let failure = res.unwrap_err();
    assert!(matches!(failure.error, Error::Body(chunked::Error::MalformedChunkSize)), "{failure}");
    assert_eq!(failure.error.status(), StatusCode::BAD_REQUEST);
    assert!(raw.is_empty());
    assert!(!marker.exists(), "script was spawned");
}

#[tokio::test]
async fn oversized_body_is_rejected_before_spawn() {
    let mut config = config();
    config.max_body_size = Some(16);
    let gateway = gateway(config);
    let marker = temp_path("marker");
    let req = TestRequest::new("POST", "/cgi/touch.sh", marker.to_str(), &[("content-length", "20")]);

    let (res, _) = req.serve(&gateway, Cursor::new(vec![b'x'; 20])).await;
    let failure = res.unwrap_err();
    assert!(matches!(failure.error, Error::PayloadTooLarge { limit: 16 }), "{failure}");
    assert_eq!(failure.phase, Phase::Spawning);
    assert_eq!(failure.error.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!marker.exists(), "script was spawned");
}

async fn stream_through(size: u64) {
    let mut config = config();
    config.timeout = Duration::from_secs(300);
    let buffer_size = config.buffer_size;
    let gateway = gateway(config);
    let size_str = size.to_string();
    let req = TestRequest::get("/cgi/stream.sh", Some(size_str.as_str()));

    let mut client = CountingClient::default();
    let completion = gateway.serve(req.request(empty()), &mut client).await.unwrap();
    assert_eq!(completion.framing, Framing::Length(size));
    assert_eq!(completion.body_bytes, size);

    let (head, _) = split_response(&client.head);
    assert!(head.contains(&format!("Content-Length: {size}\r\n")));
    assert_eq!(client.received, (head.len() + 2) as u64 + size);
    // Output is relayed through one fixed buffer
    assert!(client.largest_write <= buffer_size);
}

#[tokio::test]
async fn bounded_streaming() {
    stream_through(64 * 1024 * 1024).await;
}

#[tokio::test]
#[ignore = "streams 1 GiB through a pipe"]
async fn bounded_streaming_1gib() {
    stream_through(1 << 30).await;
}

#[tokio::test]
async fn unsized_output_is_chunked() {
    let gateway = gateway(config());
    let req = TestRequest::get("/cgi/stream_unsized.sh", Some("3000000"));
    let (res, raw) = req.serve(&gateway, empty()).await;
    let completion = res.unwrap();
    assert_eq!(completion.framing, Framing::Chunked);
    assert_eq!(completion.body_bytes, 3_000_000);

    let body = dechunk(split_response(&raw).1);
    assert_eq!(body.len(), 3_000_000);
    assert!(body.iter().all(|&b| b == 0));
}
