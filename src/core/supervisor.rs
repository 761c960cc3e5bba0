//! Lifecycle of the external compressor process.
//!
//! The child runs in its own process group with stdout and stderr sharing
//! one pipe, so its output arrives in the order it was written. The
//! compressor fans out into parallel workers; signalling the whole group is
//! what makes cancellation reach them, and what keeps them from outliving
//! the handle.

use std::ffi::OsStr;
use std::io::{self, ErrorKind};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, pipe2};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::error::SpawnError;

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code; a signal death is reported shell-style as `128 + signo`.
    pub code: i32,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self { code, signal: None },
            (None, Some(sig)) => Self {
                code: 128 + sig,
                signal: Some(sig),
            },
            (None, None) => Self {
                code: -1,
                signal: None,
            },
        }
    }
}

/// Launch `program` with `args` and extra `env` entries.
///
/// Fails with `SpawnError` if the executable is missing or cannot be run.
/// Must be called inside a tokio runtime.
pub fn start<I, S>(
    program: &Path,
    args: I,
    env: &[(String, String)],
) -> Result<ProcessHandle, SpawnError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    check_executable(program)?;

    let io_err = |source: io::Error| SpawnError::Io {
        path: program.to_path_buf(),
        source,
    };

    // The read end stays in this process; CLOEXEC keeps it out of the child.
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(|e| io_err(e.into()))?;
    fcntl(read_fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| io_err(e.into()))?;
    let stderr_fd = write_fd.try_clone().map_err(io_err)?;

    let child = {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_fd))
            .stderr(Stdio::from(stderr_fd))
            .process_group(0)
            .kill_on_drop(true);

        // `cmd` owns both write ends; dropping it at the end of this block
        // closes them so the reader sees EOF once the child group exits.
        cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => SpawnError::NotFound(program.to_path_buf()),
            ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.to_path_buf()),
            _ => io_err(e),
        })?
    };

    let pid = child
        .id()
        .ok_or_else(|| io_err(io::Error::other("child exited before its pid was read")))?;
    let output = output_reader(read_fd).map_err(io_err)?;

    debug!(pid, program = %program.display(), "Compressor spawned");

    Ok(ProcessHandle {
        child,
        pgid: Pid::from_raw(pid as i32),
        output: Some(output),
        terminate_sent: false,
        reaped: false,
    })
}

fn check_executable(program: &Path) -> Result<(), SpawnError> {
    let meta = match std::fs::metadata(program) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(SpawnError::NotFound(program.to_path_buf()));
        }
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err(SpawnError::PermissionDenied(program.to_path_buf()));
        }
        Err(source) => {
            return Err(SpawnError::Io {
                path: program.to_path_buf(),
                source,
            });
        }
    };

    if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
        return Err(SpawnError::NotExecutable(program.to_path_buf()));
    }
    Ok(())
}

fn output_reader(fd: OwnedFd) -> io::Result<OutputLines> {
    let receiver = pipe::Receiver::from_owned_fd(fd)?;
    Ok(OutputLines {
        reader: BufReader::new(receiver),
        buf: Vec::new(),
    })
}

/// A finite stream of output lines from a running compressor.
pub(crate) trait LineSource {
    fn next_line(&mut self) -> impl Future<Output = io::Result<Option<String>>> + Send;
}

/// Merged stdout/stderr of the child, one line at a time.
///
/// Finite and not restartable: once `next_line` returns `Ok(None)` the
/// child has closed its output for good.
pub struct OutputLines {
    reader: BufReader<pipe::Receiver>,
    buf: Vec<u8>,
}

impl OutputLines {
    /// Next non-blank line, decoded lossily and with trailing whitespace removed.
    ///
    /// Cancel safe: bytes read by a dropped call stay in the buffer and are
    /// returned by the next one.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 && self.buf.is_empty() {
                return Ok(None);
            }

            let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
            self.buf.clear();
            if !line.is_empty() {
                return Ok(Some(line));
            }
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

impl LineSource for OutputLines {
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        OutputLines::next_line(self).await
    }
}

/// One live compressor process.
pub struct ProcessHandle {
    child: Child,
    pgid: Pid,
    output: Option<OutputLines>,
    terminate_sent: bool,
    reaped: bool,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pgid.as_raw() as u32
    }

    /// Take the output stream. Returns `None` on every call after the first.
    pub fn take_output(&mut self) -> Option<OutputLines> {
        self.output.take()
    }

    /// Ask the child group to terminate with SIGTERM.
    ///
    /// Does not wait. Returns `false` without signalling when a request was
    /// already sent or the child has been reaped.
    pub fn cancel(&mut self) -> bool {
        if self.reaped || self.terminate_sent {
            return false;
        }
        self.terminate_sent = true;

        match killpg(self.pgid, Signal::SIGTERM) {
            Ok(()) => {
                debug!(pgid = %self.pgid, "Sent SIGTERM to compressor");
                true
            }
            // Group already gone; wait() will still reap the leader.
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pgid = %self.pgid, error = %e, "Failed to signal compressor");
                false
            }
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.terminate_sent
    }

    /// Wait for the child to exit. Safe to call after `cancel`, and again
    /// after it has returned.
    pub async fn wait(&mut self) -> io::Result<ExitOutcome> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(ExitOutcome::from_status(status))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // `kill_on_drop` only reaches the leader; take the workers down too.
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) => warn!(pgid = %self.pgid, "Killed compressor left running at drop"),
            Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = %self.pgid, error = %e, "Failed to kill compressor at drop"),
        }
    }
}
