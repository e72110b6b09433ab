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

//! The operator-facing control CLI. Out of scope for the core's
//! correctness properties, but the only real client of the control
//! protocol besides the test suite, so it's a genuine (if deliberately
//! thin) implementation of spec.md §6's CLI surface.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

const DAEMON_MANAGER_MODE_ENV: &str = "DAEMON_MANAGER_MODE";

#[derive(Parser)]
#[clap(name = "daemon-managerctl", about = "Control a daemon-managerd instance")]
struct Args {
    /// Path to the control socket (must match the supervisor's).
    #[clap(long, default_value = "zdsock")]
    socket_path: PathBuf,

    /// Program to launch (and its arguments) if `start` needs to spawn a
    /// fresh supervisor. Passed through verbatim to `daemon-managerd`.
    #[clap(long, value_delimiter = ' ')]
    program: Vec<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Start,
    Stop,
    Restart,
    Status {
        #[clap(short = 'l', long)]
        long: bool,
    },
    Kill {
        signal: Option<String>,
    },
    Logreopen,
    ReopenTranscript,
    Wait,
    Help,
}

fn main() {
    let args = Args::parse();
    match run(args) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<()> {
    let socket_path = if args.socket_path.is_absolute() {
        args.socket_path.clone()
    } else {
        std::env::current_dir()?.join(&args.socket_path)
    };

    match args.command {
        Command::Start => cmd_start(&socket_path, &args.program),
        Command::Stop => print_reply(send(&socket_path, "stop")?),
        Command::Restart => print_reply(send(&socket_path, "restart")?),
        Command::Status { long } => cmd_status(&socket_path, long),
        Command::Kill { signal } => cmd_kill(&socket_path, signal),
        Command::Logreopen | Command::ReopenTranscript => print_reply(send(&socket_path, "reopen_transcript")?),
        Command::Wait => cmd_wait(&socket_path),
        Command::Help => print_reply(send(&socket_path, "help")?),
    }
}

/// Connect, send one line, read the reply, then the peer closes.
fn send(socket_path: &std::path::Path, line: &str) -> Result<String> {
    let mut stream = UnixStream::connect(socket_path).map_err(|_| anyhow::anyhow!("daemon manager not running"))?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok();
    stream
        .write_all(format!("{line}\n").as_bytes())
        .context("writing to control socket")?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).context("reading from control socket")?;
    if reply.is_empty() {
        bail!("daemon manager not running");
    }
    Ok(reply)
}

fn print_reply(reply: String) -> Result<()> {
    print!("{reply}");
    Ok(())
}

/// `kill`: validate the signal locally (so an invalid one never reaches the
/// socket) and, on success, report in spec.md §8 scenario 4's words —
/// `signal SIGCONT sent to process <pid>` — rather than the core's terser
/// `Signal N sent` reply.
fn cmd_kill(socket_path: &std::path::Path, signal: Option<String>) -> Result<()> {
    let sig = match &signal {
        None => libc::SIGTERM,
        Some(s) => daemon_manager::signals::parse_signal(s).ok_or_else(|| anyhow::anyhow!("invalid signal '{s}'"))?,
    };

    let status = send(socket_path, "status")?;
    let pid = status_field(&status, "application").unwrap_or("0").to_string();

    let reply = send(socket_path, &format!("kill {sig}"))?;
    if reply.to_lowercase().contains("sent") {
        println!("signal {} sent to process {}", daemon_manager::signals::signame(sig), pid);
        Ok(())
    } else {
        print_reply(reply)
    }
}

fn status_field<'a>(status: &'a str, key: &str) -> Option<&'a str> {
    status.lines().find_map(|l| l.strip_prefix(&format!("{key}=")))
}

fn cmd_start(socket_path: &std::path::Path, program: &[String]) -> Result<()> {
    match send(socket_path, "start") {
        Ok(reply) => return print_reply(reply),
        Err(_) if !program.is_empty() => {}
        Err(e) => return Err(e),
    }

    // No supervisor answered: spawn one, per zdctl.py's do_start re-exec
    // pattern, with DAEMON_MANAGER_MODE set so the spawned process (and
    // anything it execs on our behalf) can tell it's running under us.
    // The managed child itself must never see this variable; that's
    // enforced in ChildHandle::spawn, not here.
    let exe = std::env::current_exe().context("locating daemon-managerd")?;
    let daemonize_exe = exe.with_file_name("daemon-managerd");
    std::process::Command::new(&daemonize_exe)
        .arg("--socket-path")
        .arg(socket_path)
        .args(program)
        .env(DAEMON_MANAGER_MODE_ENV, "1")
        .spawn()
        .with_context(|| format!("launching {daemonize_exe:?}"))?;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(reply) = send(socket_path, "status") {
            if reply.contains("application=") && !reply.contains("application=0") {
                println!("Application started");
                return Ok(());
            }
        }
        if Instant::now() >= deadline {
            bail!("daemon manager not running");
        }
        std::thread::sleep(Duration::from_millis(200));
    }
}

fn cmd_status(socket_path: &std::path::Path, long: bool) -> Result<()> {
    let reply = send(socket_path, "status")?;
    print!("{reply}");
    if long {
        for line in reply.lines() {
            if let Some(argv) = line.strip_prefix("args=") {
                println!("argv={argv}");
            }
        }
        println!("transcript={}", "(see daemon-managerd --transcript-path)");
    }
    Ok(())
}

fn cmd_wait(socket_path: &std::path::Path) -> Result<()> {
    loop {
        let reply = match send(socket_path, "status") {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };
        if reply.lines().any(|l| l == "application=0") {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}
