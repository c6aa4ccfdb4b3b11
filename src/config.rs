use std::path::PathBuf;
use std::time::Duration;

use compact_str::CompactString;


/// How a chunked request body is handed to the script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChunkedBody {
    /// Decode the body while forwarding it, one chunk at a time.
    /// `CONTENT_LENGTH` is not set, so the script has to read its input until
    /// end-of-file.
    #[default]
    Stream,
    /// Decode the whole body into memory before spawning the script and set
    /// `CONTENT_LENGTH` to its decoded size. Only sensible together with
    /// [`Config::max_body_size`].
    Buffer,
}


/// Configuration values for a [`Gateway`](crate::Gateway).
///
/// The [`Default`] values are suitable for interactive scripts. Scripts that
/// stream large responses to slow clients need a longer `timeout`, since the
/// deadline covers the whole exchange.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deadline from spawning the script until its output is fully relayed.
    pub timeout: Duration,
    /// Time between `SIGTERM` and `SIGKILL`. Also bounds the wait for a
    /// script to exit after its output has ended.
    pub kill_grace: Duration,
    /// Longest pause allowed between two reads of a request body.
    pub body_idle_timeout: Duration,
    /// Largest CGI header block accepted from a script.
    pub max_header_size: usize,
    /// Largest request body forwarded to a script, if limited.
    pub max_body_size: Option<u64>,
    pub chunked_body: ChunkedBody,
    /// Size of the buffer used to relay script output.
    pub buffer_size: usize,
    /// Smallest chunk emitted for chunked responses, unless the script pauses.
    pub coalesce_size: usize,
    /// Program to run scripts with. The script path becomes its first argument.
    pub interpreter: Option<PathBuf>,
    /// Variables copied from the gateway's own environment into every CGI
    /// environment. Nothing else is inherited.
    pub env_passthrough: Vec<CompactString>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            body_idle_timeout: Duration::from_secs(60),
            max_header_size: 8192,
            max_body_size: None,
            chunked_body: ChunkedBody::Stream,
            buffer_size: 64 * 1024,
            coalesce_size: 8 * 1024,
            interpreter: None,
            env_passthrough: Vec::new(),
        }
    }
}

impl Config {
    /// Creates a configuration that runs every script through `interpreter`.
    #[inline]
    #[must_use]
    pub fn with_interpreter(interpreter: impl Into<PathBuf>) -> Self {
        Self { interpreter: Some(interpreter.into()), ..Self::default() }
    }
}
