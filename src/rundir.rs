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

//! Creates the run directory and the control socket's parent directory,
//! one level deep only. Deeper missing chains are a hard error — this is
//! deliberately narrower than `mkdir -p` to avoid silently creating a
//! tree of directories somewhere unexpected.

use anyhow::{bail, Context, Result};
use std::path::Path;

/// Ensure `dir` exists as a directory. If it has to be created and
/// `target_uid`/`target_gid` is given (only meaningful when running as
/// root), chown it afterward.
pub fn ensure_directory(dir: &Path, target_uid: Option<u32>, target_gid: Option<u32>) -> Result<()> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => bail!("{dir:?} exists and is not a directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("stat {dir:?}")),
    }

    let parent = dir.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        if !parent.is_dir() {
            bail!("can't create {dir:?}: parent {parent:?} does not exist (one-level mkdir only)");
        }
    }

    std::fs::create_dir(dir).with_context(|| format!("creating directory {dir:?}"))?;

    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        if let (Some(uid), Some(gid)) = (target_uid, target_gid) {
            if uid != 0 {
                chown(dir, uid, gid)?;
            }
        }
    }
    Ok(())
}

fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
    if unsafe { libc::chown(c_path.as_ptr(), uid, gid) } != 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("chown {path:?} to {uid}:{gid}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("rundir");
        ensure_directory(&target, None, None).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn existing_directory_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        ensure_directory(dir.path(), None, None).unwrap();
    }

    #[test]
    fn refuses_to_create_through_a_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing-parent").join("rundir");
        assert!(ensure_directory(&target, None, None).is_err());
    }

    #[test]
    fn rejects_a_path_that_is_a_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(ensure_directory(&file, None, None).is_err());
    }
}
