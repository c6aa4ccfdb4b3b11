#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use cgi_gateway::cgi::env::ServerInfo;
use cgi_gateway::chunked::Decoder;
use cgi_gateway::{Body, Completion, Config, Failure, Gateway, Parts, Request};
use futures_util::io::{AsyncBufRead, AsyncWrite};


pub fn script(name: &str) -> PathBuf {
    [env!("CARGO_MANIFEST_DIR"), "tests", "scripts", name].iter().collect()
}

/// A configuration that runs the shell scripts under `tests/scripts`.
pub fn config() -> Config {
    let mut config = Config::with_interpreter("/bin/sh");
    config.env_passthrough = vec!["PATH".into()];
    config
}

pub fn gateway(config: Config) -> Gateway {
    let server = ServerInfo { name: "test.local".into(), port: 8080, ..ServerInfo::default() };
    Gateway::new(config, server)
}

pub fn temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cgi-gateway-{tag}-{}-{}", std::process::id(), fastrand::u64(..)))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();
}


/// An HTTP request head routed to one of the test scripts.
pub struct TestRequest {
    pub head: http::Request<()>,
    pub script: PathBuf,
    pub script_name: String,
}

impl TestRequest {
    pub fn new(method: &str, script_name: &str, query: Option<&str>, headers: &[(&str, &str)]) -> Self {
        let uri = match query {
            Some(q) => format!("{script_name}?{q}"),
            None => script_name.to_owned(),
        };
        let mut builder = http::Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let file = script_name.rsplit('/').next().unwrap_or(script_name);
        Self { head: builder.body(()).unwrap(), script: script(file), script_name: script_name.to_owned() }
    }

    pub fn get(script_name: &str, query: Option<&str>) -> Self {
        Self::new("GET", script_name, query, &[])
    }

    pub fn parts(&self) -> Parts<'_> {
        let remote: SocketAddr = "192.0.2.7:50000".parse().unwrap();
        Parts::from_http(&self.head, &self.script, &self.script_name, "", remote)
    }

    pub fn request<R>(&self, reader: R) -> Request<'_, R> {
        let body = Body::from_headers(self.head.headers(), reader).unwrap();
        Request::new(self.parts(), body)
    }

    /// Serves the request with a body from `reader` and collects the response.
    pub async fn serve<R>(&self, gateway: &Gateway, reader: R) -> (Result<Completion, Failure>, Vec<u8>)
    where
        R: AsyncBufRead + Unpin,
    {
        let mut client = Vec::new();
        let res = gateway.serve(self.request(reader), &mut client).await;
        (res, client)
    }
}


/// Splits a raw response into its head and body.
pub fn split_response(raw: &[u8]) -> (String, &[u8]) {
    let end = raw.windows(4).position(|w| w == b"\r\n\r\n").expect("incomplete response head");
    (String::from_utf8(raw[..end + 2].to_vec()).unwrap(), &raw[end + 4..])
}

pub fn dechunk(body: &[u8]) -> Vec<u8> {
    let mut decoder = Decoder::new();
    let mut out = Vec::new();
    let n = decoder.decode_into(body, &mut out).unwrap();
    assert!(decoder.is_done(), "chunked body is not terminated");
    assert_eq!(n, body.len(), "bytes after the chunked body");
    out
}

pub fn chunked_body(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        cgi_gateway::chunked::encode_chunk(part, &mut out);
    }
    out.extend_from_slice(cgi_gateway::chunked::TERMINATOR);
    out
}


/// A client that only counts what it receives, and can hang up.
#[derive(Debug, Default)]
pub struct CountingClient {
    pub received: u64,
    pub largest_write: usize,
    pub head: Vec<u8>,
    /// Fail with `BrokenPipe` once this many bytes were received.
    pub hang_up_after: Option<u64>,
}

impl AsyncWrite for CountingClient {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.hang_up_after.is_some_and(|limit| self.received >= limit) {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if self.head.len() < 1024 {
            let keep = buf.len().min(1024 - self.head.len());
            self.head.extend_from_slice(&buf[..keep]);
        }
        self.received += buf.len() as u64;
        self.largest_write = self.largest_write.max(buf.len());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
