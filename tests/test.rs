/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
 */

//! End-to-end tests driving the real `daemon-managerd` binary over its
//! UNIX-domain control socket, covering the scenarios from spec.md §8.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

enum Completion<T> {
    Incomplete,
    Complete(T),
}
use Completion::*;

/// Repeatedly evaluates `condition`, sleeping a bit between calls, until it
/// yields `Complete(value)`, then returns `Ok(value)`. Gives up after a
/// while and returns an error instead.
fn wait_until<T, F>(mut condition: F) -> Result<T>
where
    F: FnMut() -> Completion<T>,
{
    for i in 0..40 {
        if let Complete(result) = condition() {
            return Ok(result);
        }
        let ms = match i {
            0..=4 => 20,
            5..=19 => 100,
            _ => 250,
        };
        std::thread::sleep(Duration::from_millis(ms));
    }
    Err(anyhow!("wait_until timed out"))
}

fn daemon_managerd() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_daemon-managerd"))
}

/// Send a single line to the control socket at `path` and return the reply.
fn send(path: &Path, line: &str) -> Result<String> {
    let mut stream = UnixStream::connect(path).context("connecting to control socket")?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    stream.write_all(format!("{line}\n").as_bytes())?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    Ok(reply)
}

fn try_send(path: &Path, line: &str) -> Option<String> {
    send(path, line).ok()
}

fn status_field<'a>(status: &'a str, key: &str) -> Option<&'a str> {
    status.lines().find_map(|l| l.strip_prefix(&format!("{key}=")))
}

struct Scratch {
    dir: tempfile::TempDir,
}

impl Scratch {
    fn new() -> Result<Self> {
        Ok(Scratch {
            dir: tempfile::tempdir()?,
        })
    }

    fn socket_path(&self) -> PathBuf {
        self.dir.path().join("ctl.sock")
    }

    fn transcript_path(&self) -> PathBuf {
        self.dir.path().join("transcript.log")
    }

    /// Spawn `daemon-managerd --no-detach` with the given extra flags and
    /// managed-program argv, wired to this scratch directory's socket and
    /// transcript.
    fn spawn(&self, extra_flags: &[&str], program: &[&str]) -> Result<Child> {
        let mut cmd = Command::new(daemon_managerd());
        cmd.arg("--no-detach")
            .arg("--socket-path")
            .arg(self.socket_path())
            .arg("--transcript-path")
            .arg(self.transcript_path())
            .args(extra_flags)
            .args(program);
        Ok(cmd.spawn()?)
    }

    fn wait_for_socket(&self) -> Result<()> {
        wait_until(|| if self.socket_path().exists() { Complete(()) } else { Incomplete })
    }

    fn status(&self) -> Result<String> {
        send(&self.socket_path(), "status")
    }
}

/// Non-daemon mode doesn't hang when the managed program exits on its own:
/// spec.md §8 scenario 1. `sleep 1` exits 0, which is in the default
/// exit-codes set, so the supervisor itself should exit promptly.
#[test]
fn supervisor_exits_when_child_exits_with_a_code_in_exit_codes() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut daemon = scratch.spawn(&[], &["--", "sleep", "1"])?;
    let status = wait_until(|| match daemon.try_wait() {
        Ok(Some(s)) => Complete(s),
        Ok(None) => Incomplete,
        Err(_) => Incomplete,
    })?;
    assert!(status.success());
    assert!(!scratch.socket_path().exists(), "control socket should be unlinked on orderly exit");
    Ok(())
}

/// `stop` against a child that dies from the SIGTERM itself (rather than
/// exiting on its own) resolves through the `killing` path, skips the
/// governor, and then the loop's own termination condition
/// (`!desired_up && pid==0`) ends the run cleanly: spec.md §3 invariant 4.
#[test]
fn stop_causes_the_supervisor_to_exit() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut daemon = scratch.spawn(&["--stop-timeout", "5"], &["--", "sleep", "30"])?;
    scratch.wait_for_socket()?;

    let reply = send(&scratch.socket_path(), "stop")?;
    assert_eq!(reply.trim(), "Sent SIGTERM");

    let status = wait_until(|| match daemon.try_wait() {
        Ok(Some(s)) => Complete(s),
        _ => Incomplete,
    })?;
    assert!(status.success());
    Ok(())
}

/// stop-timeout escalation: spec.md §8 scenario 3. The child ignores
/// SIGTERM, so the supervisor must escalate to SIGKILL once `stop-timeout`
/// elapses, and a `status` sent immediately afterward must find the socket
/// gone.
#[test]
fn stop_timeout_escalates_to_sigkill() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut daemon = scratch.spawn(&["--stop-timeout", "1"], &["--", "sh", "-c", "trap '' TERM; sleep 30"])?;
    scratch.wait_for_socket()?;

    let reply = send(&scratch.socket_path(), "stop")?;
    assert_eq!(reply.trim(), "Sent SIGTERM");

    let start = std::time::Instant::now();
    let status = wait_until(|| match daemon.try_wait() {
        Ok(Some(s)) => Complete(s),
        _ => Incomplete,
    })?;
    assert!(start.elapsed() < Duration::from_secs(4), "escalation should happen within stop-timeout + a small margin");
    // The supervisor process itself exits normally (its loop's termination
    // condition is met); only the managed child was SIGKILLed.
    assert!(status.success());
    assert!(try_send(&scratch.socket_path(), "status").is_none(), "daemon manager not running");
    Ok(())
}

/// `kill` with a symbolic signal name: spec.md §8 scenario 4.
#[test]
fn kill_accepts_symbolic_signal_names() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut daemon = scratch.spawn(&[], &["--", "sleep", "30"])?;
    scratch.wait_for_socket()?;

    let reply = send(&scratch.socket_path(), "kill CONT")?;
    assert!(reply.contains(&libc::SIGCONT.to_string()), "reply should name the numeric signal sent: {reply:?}");

    let reply = send(&scratch.socket_path(), "kill ded")?;
    assert!(reply.to_lowercase().contains("unrecognized") || reply.to_lowercase().contains("invalid"), "{reply:?}");

    // The bogus signal must not have changed anything: the child is still up.
    let status = scratch.status()?;
    assert_eq!(status_field(&status, "status"), Some("running"));

    send(&scratch.socket_path(), "stop")?;
    let _ = daemon.wait();
    Ok(())
}

/// logrotate-then-reopen: spec.md §8 scenario 5. Rename the transcript out
/// from under the supervisor, send `reopen_transcript`, and confirm a fresh
/// file appears at the original path and receives subsequent output.
#[test]
fn reopen_transcript_creates_a_fresh_file_after_rotation() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut daemon = scratch.spawn(&[], &["--", "sh", "-c", "echo before; sleep 1; echo after; sleep 30"])?;
    scratch.wait_for_socket()?;

    wait_until(|| {
        if std::fs::read_to_string(scratch.transcript_path()).map(|s| s.contains("before")).unwrap_or(false) {
            Complete(())
        } else {
            Incomplete
        }
    })?;

    let rotated = scratch.dir.path().join("transcript.log.1");
    std::fs::rename(scratch.transcript_path(), &rotated)?;
    let reply = send(&scratch.socket_path(), "reopen_transcript")?;
    assert_eq!(reply.trim(), "Transcript reopened");

    wait_until(|| {
        if scratch.transcript_path().exists() {
            Complete(())
        } else {
            Incomplete
        }
    })?;
    wait_until(|| {
        if std::fs::read_to_string(scratch.transcript_path()).map(|s| s.contains("after")).unwrap_or(false) {
            Complete(())
        } else {
            Incomplete
        }
    })?;

    let old_contents = std::fs::read_to_string(&rotated)?;
    assert!(old_contents.contains("before"));
    assert!(!old_contents.contains("after"), "post-rotation output must land in the new file, not the old one");

    send(&scratch.socket_path(), "stop")?;
    let _ = daemon.wait();
    Ok(())
}

/// start-test-program ready gate: spec.md §8 scenario 6. `status` reports
/// `testing=1` until the probe succeeds, and `application` is nonzero the
/// whole time once spawned.
#[test]
fn start_test_program_gates_readiness() -> Result<()> {
    let scratch = Scratch::new()?;
    let marker = scratch.dir.path().join("ready");
    let marker_str = marker.display().to_string();
    let program = format!("sleep 1; touch {marker_str}; sleep 30");
    let mut daemon = scratch.spawn(
        &["--start-test-program", &format!("test -f {marker_str}")],
        &["--", "sh", "-c", &program],
    )?;
    scratch.wait_for_socket()?;

    // Immediately after spawn, the child is running but not yet ready.
    wait_until(|| match scratch.status() {
        Ok(s) if status_field(&s, "application") != Some("0") => Complete(s),
        _ => Incomplete,
    })?;

    let final_status = wait_until(|| match scratch.status() {
        Ok(s) if status_field(&s, "testing") == Some("0") => Complete(s),
        _ => Incomplete,
    })?;
    assert_ne!(status_field(&final_status, "application"), Some("0"));
    assert!(marker.exists());

    send(&scratch.socket_path(), "stop")?;
    let _ = daemon.wait();
    Ok(())
}

/// DAEMON_MANAGER_MODE must never leak into the managed child: spec.md §6
/// and §8 scenario 7.
#[test]
fn daemon_manager_mode_env_does_not_leak_to_the_child() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut cmd = Command::new(daemon_managerd());
    cmd.env("DAEMON_MANAGER_MODE", "1")
        .arg("--no-detach")
        .arg("--socket-path")
        .arg(scratch.socket_path())
        .arg("--transcript-path")
        .arg(scratch.transcript_path())
        .arg("--")
        .arg("env");
    let mut daemon = cmd.spawn()?;

    let status = wait_until(|| match daemon.try_wait() {
        Ok(Some(s)) => Complete(s),
        _ => Incomplete,
    })?;
    assert!(status.success());

    let transcript = std::fs::read_to_string(scratch.transcript_path())?;
    assert!(
        !transcript.lines().any(|l| l.starts_with("DAEMON_MANAGER_MODE=")),
        "managed child must not inherit DAEMON_MANAGER_MODE: {transcript:?}"
    );
    Ok(())
}

/// A superseded control connection gets the documented reply before the
/// new one is serviced.
#[test]
fn a_second_connection_supersedes_the_first() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut daemon = scratch.spawn(&[], &["--", "sleep", "30"])?;
    scratch.wait_for_socket()?;

    let mut first = UnixStream::connect(scratch.socket_path())?;
    // Don't send a full line yet: this connection is accepted but idle
    // when the second one arrives.
    std::thread::sleep(Duration::from_millis(100));

    let mut second = UnixStream::connect(scratch.socket_path())?;
    second.write_all(b"status\n")?;

    let mut first_reply = String::new();
    first.read_to_string(&mut first_reply)?;
    assert_eq!(first_reply, "Command superseded by new command\n");

    let mut second_reply = String::new();
    second.set_read_timeout(Some(Duration::from_secs(5))).ok();
    second.read_to_string(&mut second_reply)?;
    assert!(second_reply.starts_with("status="));

    send(&scratch.socket_path(), "stop")?;
    let _ = daemon.wait();
    Ok(())
}

/// Sending more than 10 KB before a newline gets the documented rejection.
#[test]
fn oversized_command_is_rejected() -> Result<()> {
    let scratch = Scratch::new()?;
    let mut daemon = scratch.spawn(&[], &["--", "sleep", "30"])?;
    scratch.wait_for_socket()?;

    let mut stream = UnixStream::connect(scratch.socket_path())?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    let oversized = vec![b'a'; 11 * 1024];
    stream.write_all(&oversized)?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    assert_eq!(reply.trim(), "Command exceeds 10 KB");

    send(&scratch.socket_path(), "stop")?;
    let _ = daemon.wait();
    Ok(())
}
