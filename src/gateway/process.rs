use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::cgi::env::Environment;


/// Lifecycle of a CGI script process.
///
/// The first four phases are passed in order, although a fast script may
/// skip ahead (e.g. answer before its input is complete). The last four are
/// terminal and exactly one of them is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::FromRepr, strum::IntoStaticStr)]
#[repr(u8)]
pub enum Phase {
    Spawning,
    ForwardingBody,
    AwaitingHeaders,
    StreamingBody,
    Completed,
    TimedOut,
    Killed,
    IoError,
}

impl Phase {
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self >= Phase::Completed
    }
}


/// A [`Phase`] shared between the concurrent pumps of one invocation.
#[derive(Debug)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Phase::Spawning as u8))
    }

    pub(crate) fn get(&self) -> Phase {
        Phase::from_repr(self.0.load(Ordering::Acquire)).unwrap_or(Phase::IoError)
    }

    /// Moves to `to` unless that would go backwards or leave a terminal phase.
    /// Returns whether the phase changed.
    pub(crate) fn advance(&self, to: Phase) -> bool {
        let res = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
            let cur = Phase::from_repr(cur)?;
            (!cur.is_terminal() && to > cur).then_some(to as u8)
        });
        if res.is_ok() {
            debug!(phase = <&str>::from(to), "CGI phase changed");
        }
        res.is_ok()
    }
}


pub(crate) type Stdin = Compat<ChildStdin>;
pub(crate) type Stdout = Compat<ChildStdout>;
pub(crate) type Stderr = Compat<ChildStderr>;

/// The standard streams of a spawned script, adapted to `futures-io`.
#[derive(Debug)]
pub(crate) struct Pipes {
    pub(crate) stdin: Stdin,
    pub(crate) stdout: Stdout,
    pub(crate) stderr: Stderr,
}


/// Owns a spawned script process.
///
/// The child is killed when the handle is dropped, so every exit path of an
/// invocation releases the process. Use `ProcessHandle::reap` or
/// `ProcessHandle::terminate` to also collect its exit status.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    pub(crate) phase: PhaseCell,
}

impl ProcessHandle {
    /// Spawns `script`, or `interpreter script` if an interpreter is given,
    /// with exactly the variables of `env`.
    pub(crate) fn spawn(
        script: &Path,
        interpreter: Option<&Path>,
        env: &Environment,
    ) -> io::Result<(Self, Pipes)> {
        let mut cmd = match interpreter {
            Some(interp) => {
                let mut cmd = Command::new(interp);
                cmd.arg(script);
                cmd
            },
            None => Command::new(script),
        };
        if let Some(dir) = script.parent().filter(|d| script.is_absolute() && !d.as_os_str().is_empty()) {
            cmd.current_dir(dir);
        }
        cmd.env_clear()
            .envs(env.os_iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let phase = PhaseCell::new();
        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(pid, script = %script.display(), "CGI script spawned");

        let missing = || io::Error::other("child pipe unavailable");
        let pipes = Pipes {
            stdin: child.stdin.take().ok_or_else(missing)?.compat_write(),
            stdout: child.stdout.take().ok_or_else(missing)?.compat(),
            stderr: child.stderr.take().ok_or_else(missing)?.compat(),
        };
        phase.advance(Phase::ForwardingBody);
        Ok((Self { child, pid, phase }, pipes))
    }

    #[inline]
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits up to `grace` for the script to exit on its own, then
    /// terminates it.
    pub(crate) async fn reap(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(res) => res,
            Err(_) => {
                warn!(pid = self.pid, "CGI script did not exit after its output ended");
                self.terminate(grace).await
            },
        }
    }

    /// Sends `SIGTERM`, then `SIGKILL` if the script is still running after
    /// `grace`. Always reaps the process.
    pub(crate) async fn terminate(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }
        if let Err(e) = self.signal(libc::SIGTERM) {
            debug!(pid = self.pid, error = %e, "SIGTERM failed");
        } else if let Ok(res) = tokio::time::timeout(grace, self.child.wait()).await {
            return res;
        }
        self.kill().await
    }

    /// Kills the script immediately and reaps it.
    pub(crate) async fn kill(&mut self) -> io::Result<ExitStatus> {
        warn!(pid = self.pid, "killing CGI script");
        // Fails only if the child was already reaped, which wait() handles
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, error = %e, "SIGKILL failed");
        }
        self.child.wait().await
    }

    fn signal(&self, sig: libc::c_int) -> io::Result<()> {
        let pid = self.pid
            .and_then(|p| libc::pid_t::try_from(p).ok())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        // kill(2) has no memory safety requirements. The pid is still ours
        // since the child has not been reaped yet.
        #[allow(unsafe_code)]
        let res = unsafe { libc::kill(pid, sig) };
        if res == 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
    }
}
