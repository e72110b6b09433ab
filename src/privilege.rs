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

//! Drops privileges to a configured user on startup. Order matters:
//! `setgid` then `setgroups` then `setuid` — reversing any pair leaves a
//! window where the process still holds elevated group or user rights.

use anyhow::{bail, Context, Result};
use users::{Groups, Users, UsersCache};

/// Resolve `username` to its primary uid/gid, without changing anything.
/// Used by `rundir`'s directory-ownership dance, which must run (as root)
/// before `drop_privileges` gives up the ability to `chown`.
pub fn resolve_user(username: &str) -> Result<(libc::uid_t, libc::gid_t)> {
    let cache = UsersCache::new();
    let user = cache
        .get_user_by_name(username)
        .ok_or_else(|| anyhow::anyhow!("no such user {username:?}"))?;
    Ok((user.uid(), user.primary_group_id()))
}

/// Resolve `username` and drop to it. Requires running as root unless
/// the effective uid already matches the target (a no-op drop is allowed
/// so the same invocation works whether or not it was started as root).
pub fn drop_privileges(username: &str) -> Result<()> {
    let (target_uid, target_gid) = resolve_user(username)?;

    let euid = unsafe { libc::geteuid() };
    if euid == target_uid {
        return Ok(());
    }
    if euid != 0 {
        bail!("must be root to switch to user {username:?} (euid is {euid})");
    }

    let mut groups: Vec<libc::gid_t> = users::get_user_groups(username, target_gid)
        .map(|gs| gs.iter().map(|g| g.gid()).collect())
        .unwrap_or_else(|| vec![target_gid]);
    groups.sort_unstable();
    groups.dedup();

    if unsafe { libc::setgid(target_gid) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setgid failed");
    }
    if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setgroups failed");
    }
    if unsafe { libc::setuid(target_uid) } != 0 {
        return Err(std::io::Error::last_os_error()).context("setuid failed");
    }

    tracing::info!(user = username, uid = target_uid, gid = target_gid, "dropped privileges");
    Ok(())
}
