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

//! The UNIX-domain control listener: stale-socket recovery at bind time,
//! one line-terminated command per connection, at most one connection
//! live at a time.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 10 KB, per spec.md's buffer-limit invariant.
pub const MAX_COMMAND_BYTES: usize = 10 * 1024;

/// A parsed request line: command name plus whitespace-separated args.
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    pub command: String,
    pub args: Vec<String>,
}

/// The bound listener plus the one command connection that may be live.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
    conn: Option<CommandConn>,
}

/// An accepted connection, with its line-accumulation buffer.
struct CommandConn {
    stream: UnixStream,
    buf: Vec<u8>,
}

impl ControlListener {
    /// Bind at `path` following the scratch-name/hardlink dance from
    /// spec.md §4.5: bind `<path>.<pid>`, chmod 0700, try to `link` it
    /// into place. If the link fails, probe the existing listener with a
    /// `status` request; a live peer aborts bind-up entirely, a dead one
    /// gets unlinked and we retry. Bounded to avoid hanging forever
    /// against a peer that's wedged rather than simply slow to start.
    pub fn bind(path: &Path) -> Result<Self> {
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("resolving current directory")?
                .join(path)
        };

        const MAX_ATTEMPTS: u32 = 10;
        for attempt in 0..MAX_ATTEMPTS {
            let scratch = scratch_name(&path);
            let _ = std::fs::remove_file(&scratch);
            let listener = UnixListener::bind(&scratch)
                .with_context(|| format!("binding scratch socket {scratch:?}"))?;
            std::fs::set_permissions(&scratch, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("chmod 0700 {scratch:?}"))?;

            match std::fs::hard_link(&scratch, &path) {
                Ok(()) => {
                    let _ = std::fs::remove_file(&scratch);
                    listener
                        .set_nonblocking(true)
                        .context("setting control listener non-blocking")?;
                    return Ok(ControlListener {
                        listener,
                        path,
                        conn: None,
                    });
                }
                Err(_) => {
                    let _ = std::fs::remove_file(&scratch);
                    if checkopen(&path) {
                        bail!("another supervisor already up on {path:?}");
                    }
                    let _ = std::fs::remove_file(&path);
                    if attempt + 1 == MAX_ATTEMPTS {
                        bail!("couldn't take ownership of control socket {path:?} after {MAX_ATTEMPTS} attempts");
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        unreachable!()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn conn_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().map(|c| c.stream.as_raw_fd())
    }

    /// Accept a new connection, superseding and closing any existing one
    /// with the reply spec.md names for that case.
    pub fn accept(&mut self) -> Result<()> {
        let (stream, _addr) = self.listener.accept().context("accepting control connection")?;
        stream.set_nonblocking(true).context("setting connection non-blocking")?;
        if let Some(mut old) = self.conn.take() {
            let _ = old.stream.write_all(b"Command superseded by new command\n");
        }
        self.conn = Some(CommandConn {
            stream,
            buf: Vec::new(),
        });
        Ok(())
    }

    /// Read whatever is available on the live connection. Returns a parsed
    /// request once a full line has arrived; the connection is left open
    /// until the caller sends a reply and calls `close`.
    pub fn recv(&mut self) -> Result<Option<Request>> {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return Ok(None),
        };

        let mut chunk = [0u8; 4096];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    self.conn = None;
                    return Ok(None);
                }
                Ok(n) => {
                    conn.buf.extend_from_slice(&chunk[..n]);
                    if conn.buf.len() > MAX_COMMAND_BYTES {
                        let mut conn = self.conn.take().unwrap();
                        let _ = conn.stream.write_all(b"Command exceeds 10 KB\n");
                        return Ok(None);
                    }
                    if let Some(pos) = conn.buf.iter().position(|&b| b == b'\n') {
                        let line = conn.buf[..pos].to_vec();
                        conn.buf.drain(..=pos);
                        return Ok(Some(parse_line(&line)));
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("reading control connection"),
            }
        }
    }

    /// Send a reply and close the connection, matching spec.md's "reply,
    /// then close" protocol.
    pub fn reply(&mut self, text: &str) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let mut out = text.as_bytes().to_vec();
            if !out.ends_with(b"\n") {
                out.push(b'\n');
            }
            let _ = conn.stream.write_all(&out);
        }
        Ok(())
    }

    pub fn has_conn(&self) -> bool {
        self.conn.is_some()
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn scratch_name(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{pid}"));
    PathBuf::from(name)
}

/// Connect to `path` and send `status\n`; a reply means a live peer is
/// listening, silence or a connect failure means it's dead.
fn checkopen(path: &Path) -> bool {
    let stream = match UnixStream::connect(path) {
        Ok(s) => s,
        Err(_) => return false,
    };
    if stream.set_read_timeout(Some(Duration::from_millis(500))).is_err() {
        return false;
    }
    let mut stream = stream;
    if stream.write_all(b"status\n").is_err() {
        return false;
    }
    let mut buf = [0u8; 1];
    matches!(stream.read(&mut buf), Ok(n) if n > 0)
}

fn parse_line(line: &[u8]) -> Request {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();
    let command = parts.next().unwrap_or("").to_string();
    let args = parts.map(|s| s.to_string()).collect();
    Request { command, args }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    #[test]
    fn bind_creates_socket_with_0700_perms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = ControlListener::bind(&path).unwrap();
        let meta = std::fs::metadata(listener.path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn bind_recovers_from_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        {
            let _dead = ControlListener::bind(&path).unwrap();
            // dropped here: unlinks `path`, simulating a clean prior exit
        }
        let second = ControlListener::bind(&path);
        assert!(second.is_ok());
    }

    #[test]
    fn bind_rejects_when_a_live_peer_answers_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let path2 = path.clone();
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                let _ = reader.read_line(&mut line);
                let _ = stream.write_all(b"status=running\n");
            }
        });
        std::thread::sleep(Duration::from_millis(100));
        let result = ControlListener::bind(&path2);
        assert!(result.is_err());
        let _ = handle.join();
    }

    #[test]
    fn parse_line_splits_command_and_args() {
        let req = parse_line(b"kill 9");
        assert_eq!(req.command, "kill");
        assert_eq!(req.args, vec!["9".to_string()]);
    }

    #[test]
    fn parse_empty_line() {
        let req = parse_line(b"");
        assert_eq!(req.command, "");
        assert!(req.args.is_empty());
    }

    #[test]
    fn recv_and_reply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let mut listener = ControlListener::bind(&path).unwrap();

        let client_path = path.clone();
        let client = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let mut stream = UnixStream::connect(&client_path).unwrap();
            stream.write_all(b"status\n").unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            response
        });

        wait_for(|| {
            listener.accept().ok();
            listener.has_conn()
        });

        let req = wait_for_some(|| listener.recv().unwrap());
        assert_eq!(req.command, "status");
        listener.reply("status=stopped").unwrap();

        let response = client.join().unwrap();
        assert_eq!(response, "status=stopped\n");
    }

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition never became true");
    }

    fn wait_for_some<T>(mut f: impl FnMut() -> Option<T>) -> T {
        for _ in 0..100 {
            if let Some(v) = f() {
                return v;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("value never became available");
    }
}
