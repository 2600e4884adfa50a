//! Helpers for running child processes with timeouts and bounded output.
//!
//! The child is started in its own process group so a timeout takes down
//! everything the shell forked, not just the shell itself.

use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How long to wait for pipe EOF once the shell itself has exited.
///
/// Background jobs inherit the pipes and may hold them open indefinitely.
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(2_000);
/// Grace period between the polite and the forced group kill.
const KILL_GRACE: Duration = Duration::from_millis(800);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self) -> String {
        truncated_notice("stdout", self.stdout_truncated)
    }

    pub fn stderr_truncated_notice(&self) -> String {
        truncated_notice("stderr", self.stderr_truncated)
    }
}

fn truncated_notice(stream: &str, bytes: usize) -> String {
    if bytes > 0 {
        format!("\n[{stream} truncated {bytes} bytes]\n")
    } else {
        String::new()
    }
}

/// Spawn `cmd`, wait at most `timeout`, and capture both streams.
///
/// Pipes are drained on reader threads while the child runs, so a chatty
/// child can never block on a full pipe. At most `output_limit_bytes` per
/// stream are kept; the rest is counted and discarded. On timeout the whole
/// process group is killed. Once the shell has exited, readers get
/// [`READER_JOIN_TIMEOUT`] to reach EOF before whatever was captured so far is
/// returned. Spawn failures keep the underlying `std::io::Error` reachable via
/// `downcast_ref`.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut cmd);

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn command");
        anyhow::Error::new(err).context("spawn command")
    })?;
    debug!(pid = child.id(), "child spawned");

    let stdout = spawn_reader(child.stdout.take(), "stdout", output_limit_bytes)?;
    let stderr = spawn_reader(child.stderr.take(), "stderr", output_limit_bytes)?;

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing process group");
            (terminate_process_tree(&mut child)?, true)
        }
    };

    let join_deadline = Instant::now() + READER_JOIN_TIMEOUT;
    let (stdout, stdout_truncated) = stdout.finish(join_deadline)?;
    let (stderr, stderr_truncated) = stderr.finish(join_deadline)?;
    let elapsed = started.elapsed();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }
    debug!(
        exit_code = ?status.code(),
        timed_out,
        elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "command finished"
    );

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

fn own_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

/// Kill the child and everything in its process group, then reap it.
fn terminate_process_tree(child: &mut Child) -> Result<ExitStatus> {
    let pid = child.id();

    #[cfg(unix)]
    {
        let group = format!("-{pid}");
        if !signal(&["-TERM", &group]) {
            signal(&["-TERM", &pid.to_string()]);
        }
        if let Some(status) = child.wait_timeout(KILL_GRACE).context("wait after SIGTERM")? {
            // The shell is gone; stragglers in its group still hold the pipes.
            signal(&["-KILL", &group]);
            return Ok(status);
        }
        signal(&["-KILL", &group]);
    }

    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
        if let Some(status) = child.wait_timeout(KILL_GRACE).context("wait after taskkill")? {
            return Ok(status);
        }
    }

    if let Err(err) = child.kill() {
        // Already exited between the wait and the kill.
        if err.kind() != io::ErrorKind::InvalidInput {
            return Err(err).context("kill command");
        }
    }
    child.wait().context("reap killed command")
}

#[cfg(unix)]
fn signal(args: &[&str]) -> bool {
    Command::new("kill")
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Bytes kept from one stream plus the count of bytes discarded past the cap.
#[derive(Debug, Default)]
struct Captured {
    kept: Vec<u8>,
    dropped: usize,
}

/// Background drain of one child pipe.
struct StreamReader {
    name: &'static str,
    captured: Arc<Mutex<Captured>>,
    done: mpsc::Receiver<io::Result<()>>,
}

impl StreamReader {
    /// Wait until `deadline` for EOF, then hand back what was captured.
    fn finish(self, deadline: Instant) -> Result<(Vec<u8>, usize)> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.done.recv_timeout(remaining) {
            Ok(result) => result.with_context(|| format!("read {}", self.name))?,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    stream = self.name,
                    "pipe still open after the shell exited, returning partial output"
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("{} reader thread panicked", self.name));
            }
        }
        let mut guard = self
            .captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let captured = std::mem::take(&mut *guard);
        Ok((captured.kept, captured.dropped))
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
    name: &'static str,
    limit: usize,
) -> Result<StreamReader> {
    let pipe = pipe.ok_or_else(|| anyhow!("{name} was not piped"))?;
    let captured = Arc::new(Mutex::new(Captured::default()));
    let (tx, done) = mpsc::channel();
    let sink = Arc::clone(&captured);
    thread::spawn(move || {
        // The receiver is gone when the caller stopped waiting.
        let _ = tx.send(read_bounded(pipe, limit, &sink));
    });
    Ok(StreamReader {
        name,
        captured,
        done,
    })
}

/// Keep the first `limit` bytes and count everything after them.
fn read_bounded<R: Read>(mut reader: R, limit: usize, sink: &Mutex<Captured>) -> io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(captured.kept.len()));
        captured.kept.extend_from_slice(&chunk[..keep]);
        captured.dropped += n - keep;
    }
}
