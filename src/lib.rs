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

//! `daemon-manager`: run a command as a reliably-restarting background
//! service, with a UNIX-domain control socket for starting, stopping,
//! signalling, and querying it.
//!
//! The supervisor binary (`daemon-managerd`) wires these modules
//! together in [`supervisor::Supervisor`]; the operator CLI
//! (`daemon-managerctl`) is the socket's only real client.

pub mod child;
pub mod config;
pub mod control;
pub mod detach;
pub mod privilege;
pub mod proctitle;
pub mod prober;
pub mod rundir;
pub mod signals;
pub mod supervisor;
pub mod transcript;
