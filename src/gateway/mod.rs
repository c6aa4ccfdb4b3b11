//! The CGI gateway: runs one script per request and relays its response.
//!
//! [`Gateway::serve`] drives a whole invocation. The request body is checked
//! and, where needed, decoded before anything is spawned. Once the script
//! runs, the body is forwarded into its stdin while its stdout is relayed to
//! the client, and both pumps progress concurrently so that neither side can
//! stall the other. Stderr is drained into the log alongside. The exchange
//! is bounded by [`Config::timeout`].

use std::io;
use std::pin::pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::{select, Either};
use futures_util::io::{AsyncBufRead, AsyncWrite};
use http::{StatusCode, Version};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

use crate::cgi::env::{resolve_passthrough, BodySize, Environment, ServerInfo};
use crate::cgi::{response, OwnedVarName, SmallBytes};
use crate::chunked::{self, Decoder};
use crate::config::{ChunkedBody, Config};
use crate::request::{Body, Request};

mod body;
mod framing;
mod process;

pub use framing::{error_response, write_head, Framing};
pub use process::Phase;

use body::Input;
use process::ProcessHandle;


/// The side of the exchange that went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Peer {
    #[strum(serialize = "client")]
    Client,
    #[strum(serialize = "CGI script")]
    Script,
}


/// Terminal outcomes of a failed CGI invocation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The chunked request body is malformed. No script is spawned if this
    /// is detected before the first chunk.
    #[error("malformed request body: {0}")]
    Body(#[from] chunked::Error),

    /// The request body exceeds [`Config::max_body_size`].
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// The client stopped sending its body between two chunks.
    #[error("request body stalled for more than {0:?}")]
    RequestTimeout(Duration),

    /// The script (or its interpreter) could not be executed.
    #[error("failed to spawn CGI script: {0}")]
    SpawnFailure(#[source] io::Error),

    /// The script did not finish within [`Config::timeout`] and was killed.
    #[error("CGI script did not finish within {0:?}")]
    TimedOut(Duration),

    /// One side vanished in the middle of the exchange.
    #[error("{peer} went away mid-stream: {source}")]
    BrokenPipe { peer: Peer, #[source] source: io::Error },

    /// The script's output does not start with a valid header block.
    #[error("malformed CGI response headers: {0}")]
    MalformedCgiHeaders(#[from] response::Error),

    /// Any other I/O error on the script's pipes.
    #[error("I/O error on CGI pipes: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the status code of the response that should be sent for this
    /// error, if nothing was sent yet.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Body(_) => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::SpawnFailure(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::TimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::BrokenPipe { peer: Peer::Client, .. } => StatusCode::BAD_REQUEST,
            Error::BrokenPipe { peer: Peer::Script, .. } | Error::MalformedCgiHeaders(_) => {
                StatusCode::BAD_GATEWAY
            },
        }
    }
}


/// A failed invocation, as returned by [`Gateway::serve`].
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Failure {
    #[source]
    pub error: Error,
    /// Whether any part of the response was sent to the client. If so, the
    /// connection must be closed without a further response.
    pub headers_sent: bool,
    /// The terminal phase of the script, or [`Phase::Spawning`] if it never
    /// ran.
    pub phase: Phase,
}

impl Failure {
    /// Returns the error response to send to the client, unless the
    /// response head was already sent.
    #[must_use]
    pub fn error_response(&self, version: Version) -> Option<Vec<u8>> {
        (!self.headers_sent).then(|| error_response(self.error.status(), version))
    }
}


/// A successful invocation.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub status: StatusCode,
    pub framing: Framing,
    /// Response body bytes sent to the client, excluding framing.
    pub body_bytes: u64,
    /// Request body bytes delivered to the script.
    pub request_bytes: u64,
    /// The script's exit status, if it could be collected.
    pub exit: Option<ExitStatus>,
    /// Whether the client connection can carry another request.
    pub reusable: bool,
}


/// Runs CGI scripts for requests.
///
/// A [`Gateway`] holds only read-only state, so one instance can serve any
/// number of concurrent requests.
#[derive(Debug, Clone)]
pub struct Gateway {
    config: Config,
    server: ServerInfo,
    passthrough: Vec<(OwnedVarName, SmallBytes)>,
}

impl Gateway {
    /// Creates a [`Gateway`]. The variables named in
    /// [`Config::env_passthrough`] are read from the current environment
    /// once, here.
    #[must_use]
    pub fn new(config: Config, server: ServerInfo) -> Self {
        let passthrough = resolve_passthrough(&config.env_passthrough);
        Self { config, server, passthrough }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Runs the script of `request` and writes its response to `client`.
    ///
    /// The request body is read from the body's reader exactly up to its
    /// end, so the reader can be used for the next request on the
    /// connection if [`Completion::reusable`] is set. `client` is flushed but
    /// never closed.
    ///
    /// # Errors
    /// Returns a [`Failure`] for every outcome other than a completely relayed
    /// response. See [`Failure::error_response`] for what to send then.
    pub async fn serve<R, W>(&self, request: Request<'_, R>, client: &mut W) -> Result<Completion, Failure>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let span = tracing::debug_span!(
            "cgi",
            method = %request.parts.method,
            script = %request.parts.script.display(),
            remote = %request.parts.remote_addr,
        );
        let committed = AtomicBool::new(false);
        let res = self.run(request, client, &committed).instrument(span.clone()).await;
        res.map_err(|(error, phase)| {
            let headers_sent = committed.load(Ordering::Acquire);
            let phase_name = <&str>::from(phase);
            span.in_scope(|| warn!(%error, headers_sent, phase = phase_name, "CGI invocation failed"));
            Failure { error, headers_sent, phase }
        })
    }

    async fn run<R, W>(
        &self,
        request: Request<'_, R>,
        client: &mut W,
        committed: &AtomicBool,
    ) -> Result<Completion, (Error, Phase)>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let config = &self.config;
        let (parts, body) = request.into_parts();
        let unspawned = |e: Error| (e, Phase::Spawning);

        let (input, size) = match body {
            Body::Empty => (Input::None, BodySize::None),
            Body::Fixed { reader, length } => {
                if let Some(limit) = config.max_body_size.filter(|&l| length > l) {
                    return Err(unspawned(Error::PayloadTooLarge { limit }));
                }
                (Input::Fixed { reader, length }, BodySize::Known(length))
            },
            Body::Chunked(mut reader) => match config.chunked_body {
                ChunkedBody::Buffer => {
                    let data = body::collect_chunked(&mut reader, config).await.map_err(unspawned)?;
                    let len = data.len() as u64;
                    (Input::Buffered(data), BodySize::Known(len))
                },
                ChunkedBody::Stream => {
                    let mut decoder = Decoder::new();
                    body::prime(&mut reader, &mut decoder, config).await.map_err(unspawned)?;
                    (Input::Chunked { reader, decoder }, BodySize::Unknown)
                },
            },
        };

        let env = Environment::build(&parts, &self.server, size, &self.passthrough);
        let (mut process, pipes) = ProcessHandle::spawn(parts.script, config.interpreter.as_deref(), &env)
            .map_err(|e| unspawned(Error::SpawnFailure(e)))?;
        let pid = process.pid();
        let deadline = Instant::now() + config.timeout;

        let forwarded = AtomicU64::new(0);
        let mut stdout = pipes.stdout;
        let mut stderr_drain = pin!(body::drain_stderr(pipes.stderr, pid));

        let mut stderr_done = false;
        let outcome = {
            let input = body::forward(input, pipes.stdin, config, &process.phase, &forwarded);
            let output = framing::relay(&mut stdout, client, &parts, config, &process.phase, committed);
            let exchange = async {
                match select(pin!(input), pin!(output)).await {
                    Either::Left((Ok(complete), output)) => output.await.map(|relayed| (complete, relayed)),
                    Either::Right((Ok(relayed), _)) => Ok((false, relayed)),
                    Either::Left((Err(e), _)) | Either::Right((Err(e), _)) => Err(e),
                }
            };
            let exchange = pin!(timeout_at(deadline, exchange));
            match select(exchange, stderr_drain.as_mut()).await {
                Either::Left((res, _)) => res,
                Either::Right(((), exchange)) => {
                    stderr_done = true;
                    exchange.await
                },
            }
        };
        drop(stdout);

        let grace = config.kill_grace;
        let result = match outcome {
            Err(_) => {
                process.phase.advance(Phase::TimedOut);
                warn!(pid, timeout = ?config.timeout, "CGI script timed out");
                log_exit(process.terminate(grace).await, pid);
                Err((Error::TimedOut(config.timeout), process.phase.get()))
            },
            Ok(Err(e)) => {
                let phase = if matches!(e, Error::Io(_)) { Phase::IoError } else { Phase::Killed };
                process.phase.advance(phase);
                let phase = process.phase.get();
                debug!(pid, phase = <&str>::from(phase), error = %e, "aborting CGI script");
                log_exit(process.kill().await, pid);
                Err((e, phase))
            },
            Ok(Ok((body_complete, relayed))) => {
                process.phase.advance(Phase::Completed);
                let exit = log_exit(process.reap(grace).await, pid);
                let request_bytes = forwarded.load(Ordering::Relaxed);
                let reusable = body_complete
                    && relayed.framing.keeps_alive()
                    && parts.version == Version::HTTP_11;
                info!(
                    status = relayed.status.as_u16(),
                    body_bytes = relayed.body_bytes,
                    request_bytes,
                    reusable,
                    "CGI invocation completed",
                );
                Ok(Completion {
                    status: relayed.status,
                    framing: relayed.framing,
                    body_bytes: relayed.body_bytes,
                    request_bytes,
                    exit,
                    reusable,
                })
            },
        };

        // The script is gone, so stderr ends unless a descendant still holds it
        if !stderr_done && timeout(grace, stderr_drain).await.is_err() {
            debug!(pid, "abandoned CGI stderr held open by a descendant");
        }
        result
    }
}

/// Logs unusual exit statuses of a reaped script.
fn log_exit(res: io::Result<ExitStatus>, pid: Option<u32>) -> Option<ExitStatus> {
    match res {
        Ok(status) if status.success() => {
            debug!(pid, "CGI script exited");
            Some(status)
        },
        Ok(status) => {
            warn!(pid, code = status.code(), %status, "CGI script exited with error");
            Some(status)
        },
        Err(e) => {
            warn!(pid, error = %e, "failed to reap CGI script");
            None
        },
    }
}
