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

//! Fork once, have the parent exit immediately, and let the child become
//! session leader. No `monitor_daemon` restart loop here: the supervisor
//! loop (`crate::supervisor`) is the only restart mechanism this crate
//! carries.

use anyhow::{Context, Result};
use std::path::Path;

/// Fork; the parent calls `_exit(0)` immediately and never returns from
/// this function. The child chdirs (if `directory` is set), calls
/// `setsid`, and applies `umask` if set. Does not touch `SIGHUP` — relying
/// on `setsid` to drop the controlling terminal is sufficient, and a
/// second signal disposition change here would just be redundant.
pub fn daemonize(directory: Option<&Path>, umask: Option<u32>) -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()).context("fork failed during detach"),
        0 => {
            if let Some(dir) = directory {
                std::env::set_current_dir(dir).with_context(|| format!("chdir to {dir:?}"))?;
            }
            if unsafe { libc::setsid() } == -1 {
                return Err(std::io::Error::last_os_error()).context("setsid failed");
            }
            if let Some(mask) = umask {
                unsafe {
                    libc::umask(mask as libc::mode_t);
                }
            }
            Ok(())
        }
        _parent_pid => {
            unsafe { libc::_exit(0) };
        }
    }
}
