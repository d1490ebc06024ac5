//! Helpers for running child processes with bounded output.
//!
//! Every child is spawned as the leader of its own process group so the whole
//! tree it starts can be killed at once on timeout or cancellation.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use super::breaker::{ProcessSlot, kill_process_group, terminate_process_group};

const POLL_SLICE: Duration = Duration::from_millis(100);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because the caller asked to stop.
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// Render stdout/stderr as one log document.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str(&self.stdout_truncated_notice(label));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        buf.push_str(&self.stderr_truncated_notice(label));
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        if self.cancelled {
            buf.push_str(&format!("\n[{label} cancelled]\n"));
        }
        buf
    }
}

/// Put the child in a fresh process group (its pid becomes the group id).
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// On timeout the child's whole process group is killed.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin.is_some())?;
    write_stdin(&mut child, stdin)?;

    let stdout = take_stdout(&mut child)?;
    let stderr = take_stderr(&mut child)?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            kill_process_group(child.id());
            // The group kill covers the leader; kill() is a fallback for platforms without groups.
            let _ = child.kill();
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled: false,
    })
}

/// Run a command to completion, handing each stdout line to `on_line` as it arrives.
///
/// The child's process group is published through `slot` so an enclosing
/// circuit breaker can kill it. No timeout is applied here; the breaker owns
/// the deadline. `timed_out` is set when the slot was terminated.
#[instrument(skip_all, fields(output_limit_bytes))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    output_limit_bytes: usize,
    slot: &ProcessSlot,
    on_line: &mut dyn FnMut(&str),
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin.is_some())?;
    slot.register(child.id());

    // Feed stdin from a helper thread so a child that floods stdout before
    // reading its input cannot deadlock us.
    let stdin_handle = match (stdin, child.stdin.take()) {
        (Some(input), Some(mut pipe)) => {
            let input = input.to_vec();
            Some(thread::spawn(move || pipe.write_all(&input)))
        }
        (Some(_), None) => return Err(anyhow!("stdin was not piped")),
        _ => None,
    };

    let stdout = take_stdout(&mut child)?;
    let stderr = take_stderr(&mut child)?;
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let (stdout, stdout_truncated) = read_lines_limited(stdout, output_limit_bytes, on_line)?;
    let status = child.wait().context("wait for command")?;
    slot.clear();

    if let Some(handle) = stdin_handle {
        match handle.join() {
            Ok(Err(err)) => debug!(err = %err, "stdin write ended early"),
            Err(_) => warn!("stdin writer thread panicked"),
            Ok(Ok(())) => {}
        }
    }
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    let timed_out = slot.is_terminated();

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }
    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled: false,
    })
}

/// Run a command until it exits, its optional deadline passes, or `should_stop`
/// returns true.
///
/// The latter two send SIGTERM to the child's process group so it can shut
/// down its own children, then SIGKILL the group if it is still running after
/// `grace`.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_command_until(
    mut cmd: Command,
    timeout: Option<Duration>,
    grace: Duration,
    output_limit_bytes: usize,
    should_stop: &dyn Fn() -> bool,
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, false)?;
    let stdout = take_stdout(&mut child)?;
    let stderr = take_stderr(&mut child)?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_SLICE).context("wait for command")? {
            break status;
        }
        if should_stop() {
            cancelled = true;
        } else if timeout.is_some_and(|limit| started.elapsed() >= limit) {
            timed_out = true;
        } else {
            continue;
        }
        break stop_child(&mut child, grace, timed_out, cancelled)?;
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn stop_child(
    child: &mut Child,
    grace: Duration,
    timed_out: bool,
    cancelled: bool,
) -> Result<ExitStatus> {
    warn!(
        timed_out,
        cancelled,
        grace_secs = grace.as_secs(),
        "stopping command, terminating process group"
    );
    terminate_process_group(child.id());
    if let Some(status) = child
        .wait_timeout(grace)
        .context("wait command after terminate")?
    {
        return Ok(status);
    }
    warn!("command outlived its grace period, killing process group");
    kill_process_group(child.id());
    let _ = child.kill();
    child.wait().context("wait command after kill")
}

fn spawn_piped(cmd: &mut Command, pipe_stdin: bool) -> Result<Child> {
    if pipe_stdin {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(cmd);

    debug!("spawning child process");
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            Err(e).context("spawn command")
        }
    }
}

fn write_stdin(child: &mut Child, stdin: Option<&[u8]>) -> Result<()> {
    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }
    Ok(())
}

fn take_stdout(child: &mut Child) -> Result<std::process::ChildStdout> {
    child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))
}

fn take_stderr(child: &mut Child) -> Result<std::process::ChildStderr> {
    child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, forwarding each line.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    on_line: &mut dyn FnMut(&str),
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        on_line(String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']));

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
