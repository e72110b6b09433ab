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

//! The start-test prober: the one piece of concurrency in this crate
//! besides the event loop and the transcript copier. It never touches
//! supervisor state directly — it only publishes to a mutex-guarded
//! `probing` set, which [`crate::supervisor`] reads back.

use std::collections::HashSet;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared "pids currently being probed" set. A pid's absence means either
/// "never probed" or "probe succeeded"; the supervisor tells the two apart
/// by also checking whether the child is running at all.
#[derive(Clone, Default)]
pub struct Probing {
    inner: Arc<Mutex<HashSet<libc::pid_t>>>,
}

impl Probing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pid: libc::pid_t) -> bool {
        self.inner.lock().unwrap().contains(&pid)
    }

    fn insert(&self, pid: libc::pid_t) {
        self.inner.lock().unwrap().insert(pid);
    }

    fn remove(&self, pid: libc::pid_t) {
        self.inner.lock().unwrap().remove(&pid);
    }
}

/// Start probing `pid` with `start_test_argv`, polling once a second until
/// either the probe command exits zero (success — the pid is cleared from
/// `probing`) or `still_same_child` says the pid is stale (the probe gives
/// up silently; a new probe will be started for whatever replaces it).
///
/// `probing` gains `pid` before the thread is spawned, so callers observe
/// "probing in progress" immediately rather than racing the new thread.
pub fn spawn(probing: Probing, pid: libc::pid_t, start_test_argv: Vec<String>, still_same_child: impl Fn(libc::pid_t) -> bool + Send + 'static) {
    probing.insert(pid);
    std::thread::spawn(move || {
        loop {
            if !still_same_child(pid) {
                probing.remove(pid);
                return;
            }
            match run_probe(&start_test_argv) {
                Ok(true) => {
                    probing.remove(pid);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "start-test probe failed to launch");
                }
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    });
}

fn run_probe(argv: &[String]) -> std::io::Result<bool> {
    let (program, args) = argv.split_first().expect("start-test argv is non-empty");
    let status = Command::new(program).args(args).status()?;
    Ok(status.success())
}
