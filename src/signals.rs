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

//! Delivers asynchronous signals into the supervisor loop through one
//! self-pipe per registered signal.
//!
//! Only a single `write()` of one byte happens in signal context (inside
//! `signal-hook`'s own handler); everything else — deciding whether a signal
//! is fatal, whether it means "go reap children", or whether it's the
//! transcript-reopen trigger — runs synchronously in [`crate::supervisor`]
//! after the loop wakes up and drains the pipes. The byte each handler
//! writes carries no information; which *pipe* became readable is what
//! identifies the signal.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use signal_hook::consts::signal::{SIGCHLD, SIGHUP, SIGINT, SIGTERM, SIGUSR2};
use signal_hook::low_level::pipe;
use std::collections::HashMap;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

lazy_static! {
    static ref SIGNAL_NAMES: HashMap<libc::c_int, &'static str> = {
        let mut m = HashMap::new();
        m.insert(libc::SIGHUP, "SIGHUP");
        m.insert(libc::SIGINT, "SIGINT");
        m.insert(libc::SIGQUIT, "SIGQUIT");
        m.insert(libc::SIGILL, "SIGILL");
        m.insert(libc::SIGABRT, "SIGABRT");
        m.insert(libc::SIGFPE, "SIGFPE");
        m.insert(libc::SIGKILL, "SIGKILL");
        m.insert(libc::SIGUSR1, "SIGUSR1");
        m.insert(libc::SIGSEGV, "SIGSEGV");
        m.insert(libc::SIGUSR2, "SIGUSR2");
        m.insert(libc::SIGPIPE, "SIGPIPE");
        m.insert(libc::SIGALRM, "SIGALRM");
        m.insert(libc::SIGTERM, "SIGTERM");
        m.insert(libc::SIGCHLD, "SIGCHLD");
        m.insert(libc::SIGCONT, "SIGCONT");
        m.insert(libc::SIGSTOP, "SIGSTOP");
        m.insert(libc::SIGTSTP, "SIGTSTP");
        m.insert(libc::SIGTTIN, "SIGTTIN");
        m.insert(libc::SIGTTOU, "SIGTTOU");
        m
    };
}

/// Return a symbolic name for a signal, or `"signal NNN"` if unknown.
pub fn signame(sig: libc::c_int) -> String {
    match SIGNAL_NAMES.get(&sig) {
        Some(name) => name.to_string(),
        None => format!("signal {sig}"),
    }
}

/// Parse a signal given either as a bare number ("9") or a symbolic name
/// ("KILL", "SIGKILL", case-insensitive, "SIG" prefix optional).
pub fn parse_signal(s: &str) -> Option<libc::c_int> {
    if let Ok(n) = s.parse::<libc::c_int>() {
        return Some(n);
    }
    let upper = s.to_uppercase();
    let upper = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNAL_NAMES
        .iter()
        .find(|(_, name)| name.trim_start_matches("SIG") == upper)
        .map(|(sig, _)| *sig)
}

/// What a woken-up supervisor loop should do about signals it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGCHLD: a child (there is only ever one) may have exited.
    Reap,
    /// SIGUSR2: reopen the transcript and any rotated log files.
    Reopen,
    /// SIGTERM/SIGHUP/SIGINT: the supervisor itself must log and exit(1).
    Fatal(libc::c_int),
}

/// One self-pipe per registered signal. `signal_hook::low_level::pipe`
/// writes an unspecified wakeup byte on each delivery — it is documented
/// only as "a signal happened, go check", not as a byte encoding *which*
/// signal. A single pipe shared across SIGTERM/SIGHUP/SIGINT/SIGCHLD/SIGUSR2
/// therefore cannot tell them apart on the read side; giving each signal its
/// own pipe makes "which fd became readable" the discriminator instead.
struct Pipe {
    read_end: UnixStream,
    sig: libc::c_int,
    event: SignalEvent,
}

/// Owns the read end of each self-pipe and the registrations that feed them.
pub struct SignalRelay {
    pipes: Vec<Pipe>,
    _ids: Vec<signal_hook::SigId>,
}

impl SignalRelay {
    /// Install handlers for SIGTERM, SIGHUP, SIGINT, SIGCHLD, and SIGUSR2,
    /// each on its own pipe. Every handler still does nothing but write one
    /// byte in signal context; all policy stays in [`Self::drain`].
    pub fn install() -> Result<Self> {
        let mut pipes = Vec::new();
        let mut ids = Vec::new();

        for (sig, event) in [
            (SIGCHLD, SignalEvent::Reap),
            (SIGUSR2, SignalEvent::Reopen),
            (SIGTERM, SignalEvent::Fatal(SIGTERM)),
            (SIGHUP, SignalEvent::Fatal(SIGHUP)),
            (SIGINT, SignalEvent::Fatal(SIGINT)),
        ] {
            let (read_end, write_end) = UnixStream::pair().with_context(|| format!("creating self-pipe for {}", signame(sig)))?;
            read_end
                .set_nonblocking(true)
                .with_context(|| format!("making self-pipe read end non-blocking for {}", signame(sig)))?;
            let id = pipe::register(sig, write_end).with_context(|| format!("registering {}", signame(sig)))?;
            ids.push(id);
            pipes.push(Pipe { read_end, sig, event });
        }

        Ok(SignalRelay { pipes, _ids: ids })
    }

    /// The read end of every self-pipe, for the event loop to poll
    /// alongside the listener and command connection.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.pipes.iter().map(|p| p.read_end.as_raw_fd()).collect()
    }

    /// Drain every byte currently sitting in each pipe and translate it into
    /// the set of distinct events seen. Never blocks.
    pub fn drain(&mut self) -> Vec<SignalEvent> {
        let mut events = Vec::new();
        let mut buf = [0u8; 64];
        for pipe in &mut self.pipes {
            let mut saw_byte = false;
            loop {
                match pipe.read_end.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => saw_byte = true,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            if saw_byte {
                tracing::trace!(signal = %signame(pipe.sig), "signal pending");
                events.push(pipe.event);
            }
        }
        events
    }
}
