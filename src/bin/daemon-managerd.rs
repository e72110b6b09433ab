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

//! The supervisor binary: parse configuration, drop privileges, detach,
//! prepare directories, bind the control socket, install signal handling,
//! and hand off to the event loop.

use anyhow::{Context, Result};
use clap::Parser;
use daemon_manager::child::ChildHandle;
use daemon_manager::config::{Cli, Configuration};
use daemon_manager::control::ControlListener;
use daemon_manager::signals::SignalRelay;
use daemon_manager::supervisor::Supervisor;
use daemon_manager::transcript::Transcript;
use daemon_manager::{privilege, rundir};

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = Configuration::realize(cli)?;

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "daemon-managerd exiting");
        eprintln!("daemon-managerd: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn run(config: Configuration) -> Result<()> {
    // Directories are created (and, starting as root, chowned to the
    // target user) before dropping privileges: zdctl.py's `create_rundir`/
    // `create_socket_dir` both run before `set_uid`, for the same reason —
    // once privileges are dropped the process may no longer be able to
    // `chown` or even `mkdir` in a root-owned parent.
    let target = match &config.user {
        Some(user) => Some(privilege::resolve_user(user).context("resolving --user")?),
        None => None,
    };
    let (target_uid, target_gid) = target.map_or((None, None), |(u, g)| (Some(u), Some(g)));

    if let Some(dir) = &config.directory {
        rundir::ensure_directory(dir, target_uid, target_gid).context("preparing run directory")?;
    }
    if let Some(parent) = config.socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        rundir::ensure_directory(parent, target_uid, target_gid).context("preparing socket directory")?;
    }

    if let Some(ref user) = config.user {
        privilege::drop_privileges(user).context("dropping privileges")?;
    }

    if !config.no_detach {
        daemon_manager::detach::daemonize(config.directory.as_deref(), config.umask)
            .context("detaching from the controlling terminal")?;
    }

    let transcript = Transcript::install(&config.transcript_path).context("installing transcript")?;
    let signals = SignalRelay::install().context("installing signal relay")?;
    let control = ControlListener::bind(&config.socket_path).context("binding control socket")?;
    let child = ChildHandle::new(config.argv.clone()).context("resolving managed program")?;

    tracing::info!(argv = ?config.argv, socket = ?control.path(), "daemon-managerd starting");

    let supervisor = Supervisor::new(config, child, control, signals, transcript);
    supervisor.run()
}
