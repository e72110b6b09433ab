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

//! The immutable-after-realize configuration value object. Realized from
//! CLI flags only; config-file loading and schema validation are out of
//! scope (they're the operator CLI's problem, not the core's).

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "daemon-managerd", about = "Run a command as a supervised background service")]
pub struct Cli {
    /// The program to run, followed by its arguments.
    #[clap(required = true, last = false)]
    pub argv: Vec<String>,

    /// Seconds to wait before retrying a rapidly-dying child; also the
    /// upper bound on the event loop's select timeout.
    #[clap(long, default_value_t = 10)]
    pub backoff_limit: u64,

    /// Don't give up after backoff-limit consecutive rapid restarts.
    #[clap(long)]
    pub forever: bool,

    /// Exit codes that, when returned by the child, also terminate the
    /// supervisor. Comma-separated.
    #[clap(long, default_value = "0,2", value_delimiter = ',')]
    pub exit_codes: Vec<i32>,

    /// Seconds to wait after SIGTERM before escalating to SIGKILL. 0
    /// means wait forever.
    #[clap(long, default_value_t = 0)]
    pub stop_timeout: u64,

    /// Seconds the operator CLI's `start` may block waiting for
    /// readiness before giving up.
    #[clap(long, default_value_t = 0)]
    pub start_timeout: u64,

    /// Command whose zero exit status marks the child as ready.
    #[clap(long)]
    pub start_test_program: Option<String>,

    /// Path to the control socket.
    #[clap(long, default_value = "zdsock")]
    pub socket_path: PathBuf,

    /// Working directory for the daemonized supervisor.
    #[clap(long)]
    pub directory: Option<PathBuf>,

    /// umask to apply after detaching, in octal (e.g. 022).
    #[clap(long)]
    pub umask: Option<String>,

    /// Drop privileges to this user after binding the socket.
    #[clap(long)]
    pub user: Option<String>,

    /// Path to the append-only transcript file.
    #[clap(long, default_value = "/dev/null")]
    pub transcript_path: PathBuf,

    /// Run in the foreground instead of detaching (used by tests and the
    /// operator CLI's `foreground`/`fg` commands).
    #[clap(long)]
    pub no_detach: bool,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub argv: Vec<String>,
    pub backoff_limit: u64,
    pub forever: bool,
    pub exit_codes: HashSet<i32>,
    pub stop_timeout: u64,
    pub start_timeout: u64,
    pub start_test_argv: Option<Vec<String>>,
    pub socket_path: PathBuf,
    pub directory: Option<PathBuf>,
    pub umask: Option<u32>,
    pub user: Option<String>,
    pub transcript_path: PathBuf,
    pub no_detach: bool,
}

impl Configuration {
    pub fn realize(cli: Cli) -> anyhow::Result<Self> {
        let umask = match cli.umask {
            Some(s) => Some(u32::from_str_radix(&s, 8).map_err(|_| anyhow::anyhow!("invalid umask {s:?}, expected octal"))?),
            None => None,
        };
        let socket_path = if cli.socket_path.is_absolute() {
            cli.socket_path
        } else {
            std::env::current_dir()?.join(cli.socket_path)
        };
        Ok(Configuration {
            argv: cli.argv,
            backoff_limit: cli.backoff_limit,
            forever: cli.forever,
            exit_codes: cli.exit_codes.into_iter().collect(),
            stop_timeout: cli.stop_timeout,
            start_timeout: cli.start_timeout,
            start_test_argv: cli.start_test_program.map(|p| shell_words_split(&p)),
            socket_path,
            directory: cli.directory,
            umask,
            user: cli.user,
            transcript_path: cli.transcript_path,
            no_detach: cli.no_detach,
        })
    }

    #[cfg(test)]
    pub fn for_test(argv: Vec<String>) -> Self {
        Configuration {
            argv,
            backoff_limit: 10,
            forever: false,
            exit_codes: [0, 2].into_iter().collect(),
            stop_timeout: 0,
            start_timeout: 0,
            start_test_argv: None,
            socket_path: PathBuf::from("zdsock"),
            directory: None,
            umask: None,
            user: None,
            transcript_path: PathBuf::from("/dev/null"),
            no_detach: true,
        }
    }
}

/// Minimal whitespace tokenizer for `start-test-program`: spec.md treats
/// it as an argv, and the CLI surface never needs quoting beyond spaces.
fn shell_words_split(s: &str) -> Vec<String> {
    s.split_whitespace().map(|w| w.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realize_defaults_exit_codes_to_zero_and_two() {
        let cli = Cli::parse_from(["daemon-managerd", "--", "sleep", "1"]);
        let config = Configuration::realize(cli).unwrap();
        assert!(config.exit_codes.contains(&0));
        assert!(config.exit_codes.contains(&2));
    }

    #[test]
    fn realize_parses_octal_umask() {
        let cli = Cli::parse_from(["daemon-managerd", "--umask", "022", "--", "sleep", "1"]);
        let config = Configuration::realize(cli).unwrap();
        assert_eq!(config.umask, Some(0o022));
    }

    #[test]
    fn realize_rejects_bad_umask() {
        let cli = Cli::parse_from(["daemon-managerd", "--umask", "xyz", "--", "sleep", "1"]);
        assert!(Configuration::realize(cli).is_err());
    }

    #[test]
    fn start_test_program_is_tokenized() {
        let cli = Cli::parse_from(["daemon-managerd", "--start-test-program", "cat x", "--", "sleep", "1"]);
        let config = Configuration::realize(cli).unwrap();
        assert_eq!(config.start_test_argv, Some(vec!["cat".to_string(), "x".to_string()]));
    }
}
