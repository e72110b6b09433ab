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

//! Redirects the managed child's stdout/stderr into an append-only file,
//! with live reopen for log rotation (`SIGUSR2`).

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Owns the pipe's write end (dup2'd into fds 1 and 2 of the process, so
/// children inherit it across fork) and the file the copier thread writes
/// into. Cloning is cheap; all clones share the same underlying file lock.
#[derive(Clone)]
pub struct Transcript {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    write_fd: RawFd,
}

impl Transcript {
    /// Open `path` in append mode, create the pipe, and dup2 its write end
    /// into fds 1 and 2. Must be called before `fork`, so the child
    /// inherits the redirected fds. Spawns the copier thread and returns.
    pub fn install(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening transcript {path:?}"))?;

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error()).context("creating transcript pipe");
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        for target in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if unsafe { libc::dup2(write_fd, target) } == -1 {
                return Err(std::io::Error::last_os_error()).context("dup2'ing transcript pipe");
            }
        }

        let transcript = Transcript {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
            write_fd,
        };

        transcript.spawn_copier(read_fd);
        Ok(transcript)
    }

    fn spawn_copier(&self, read_fd: RawFd) {
        let file = self.file.clone();
        std::thread::Builder::new()
            .name("transcript-copier".into())
            .spawn(move || {
                let mut reader = unsafe { File::from_raw_fd(read_fd) };
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => return,
                        Ok(n) => {
                            let mut guard = file.lock().unwrap();
                            if guard.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => return,
                    }
                }
            })
            .expect("spawning transcript copier thread");
    }

    /// Close the current file and open a fresh one at the same path under
    /// the same lock, so a concurrent write from the copier thread either
    /// fully lands in the old file or fully lands in the new one.
    pub fn reopen(&self) -> Result<()> {
        let fresh = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("reopening transcript {:?}", self.path))?;
        let mut guard = self.file.lock().unwrap();
        *guard = fresh;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The fd dup2'd into stdout/stderr, for tests that want to assert on
    /// fd plumbing without going through a real fork.
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

impl AsRawFd for Transcript {
    fn as_raw_fd(&self) -> RawFd {
        self.write_fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_for(mut predicate: impl FnMut() -> bool) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition never became true");
    }

    #[test]
    fn writes_to_stdout_land_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        let transcript = Transcript::install(&path).unwrap();

        unsafe {
            let msg = b"hello from stdout\n";
            libc::write(libc::STDOUT_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        }

        wait_for(|| std::fs::read_to_string(&path).map(|s| s.contains("hello from stdout")).unwrap_or(false));
    }

    #[test]
    fn reopen_preserves_earlier_content_and_continues_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.log");
        let transcript = Transcript::install(&path).unwrap();

        unsafe {
            let msg = b"before rotation\n";
            libc::write(libc::STDOUT_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        }
        wait_for(|| std::fs::read_to_string(&path).map(|s| s.contains("before rotation")).unwrap_or(false));

        let rotated = dir.path().join("transcript.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        transcript.reopen().unwrap();

        unsafe {
            let msg = b"after rotation\n";
            libc::write(libc::STDOUT_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        }
        wait_for(|| std::fs::read_to_string(&path).map(|s| s.contains("after rotation")).unwrap_or(false));

        let old_contents = std::fs::read_to_string(&rotated).unwrap();
        assert!(old_contents.contains("before rotation"));
        assert!(!old_contents.contains("after rotation"));
    }
}
