// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::mem;
use std::time::Duration;

use libc::{c_int, pid_t, uid_t};

use crate::descriptor::{AsRawDescriptor, RawDescriptor};
use crate::errno::{errno_result, Result};

pub type Pid = pid_t;
pub type Uid = uid_t;

/// Wraps a libc call that returns a negative value on error, converting it into our `Result`.
#[macro_export]
macro_rules! syscall {
    ($e:expr) => {{
        let ret = unsafe { $e };
        if ret < 0 {
            $crate::errno_result()
        } else {
            Ok(ret)
        }
    }};
}

pub mod net;

/// Returns the system's page size in bytes.
pub fn pagesize() -> usize {
    // Safe because this merely returns an integer.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds `v` up to the next multiple of the page size.
pub fn round_up_to_page_size(v: usize) -> usize {
    let page_mask = pagesize() - 1;
    (v + page_mask) & !page_mask
}

/// Returns the caller's thread id by way of `gettid(2)`, bypassing libc's pid cache.
pub fn gettid() -> Pid {
    // Safe because this syscall can never fail and only queries the current thread id.
    unsafe { libc::syscall(libc::SYS_gettid) as Pid }
}

/// Returns the caller's process id.
pub fn getpid() -> Pid {
    // Safe because this syscall can never fail and only queries the current process id.
    unsafe { libc::getpid() }
}

/// A value that can be interpreted as a process or thread id for waiting/signalling.
pub trait AsRawPid {
    fn as_raw_pid(&self) -> Pid;
}

impl AsRawPid for Pid {
    fn as_raw_pid(&self) -> Pid {
        *self
    }
}

impl AsRawPid for std::process::Child {
    fn as_raw_pid(&self) -> Pid {
        self.id() as Pid
    }
}

/// Blocks until `pid` exits, reaping it. Returns the wait status as given by `waitpid(2)`.
pub fn wait_for_pid<A: AsRawPid>(pid: A, options: c_int) -> Result<(Pid, c_int)> {
    let mut status: c_int = 0;
    let ret = syscall!(libc::waitpid(pid.as_raw_pid(), &mut status, options))?;
    Ok((ret, status))
}

/// Sends `signal` to every process in `pid`'s process group.
pub fn kill_process_group(pid: Pid, signal: c_int) -> Result<()> {
    syscall!(libc::kill(-pid, signal))?;
    Ok(())
}

/// Converts a [`Duration`] into a `libc::timespec` suitable for `poll`/`pidfd` family calls.
pub fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

/// Polls a single descriptor for readability or hangup.
///
/// `timeout_ms` follows `poll(2)` conventions: `0` returns immediately, negative blocks forever.
/// Returns `Ok(true)` if the descriptor became readable or hung up before the timeout elapsed.
pub fn poll_in(desc: &dyn AsRawDescriptor, timeout_ms: i32) -> Result<bool> {
    let mut fds = libc::pollfd {
        fd: desc.as_raw_descriptor(),
        events: libc::POLLIN | libc::POLLHUP,
        revents: 0,
    };

    // Safe because we give a valid pointer to a list of a single valid pollfd and we check
    // the return value.
    let ret = syscall!(libc::poll(&mut fds, 1, timeout_ms))?;
    Ok(ret > 0)
}

fn get_fd_flags(fd: RawDescriptor) -> Result<c_int> {
    syscall!(libc::fcntl(fd, libc::F_GETFD))
}

fn set_fd_flags(fd: RawDescriptor, flags: c_int) -> Result<()> {
    syscall!(libc::fcntl(fd, libc::F_SETFD, flags))?;
    Ok(())
}

/// Adds `FD_CLOEXEC` to `fd`'s flags.
pub fn add_cloexec(fd: RawDescriptor) -> Result<()> {
    let flags = get_fd_flags(fd)?;
    set_fd_flags(fd, flags | libc::FD_CLOEXEC)
}

/// Removes `FD_CLOEXEC` from `fd`'s flags, so it survives across `execve`. Used on the socket fd
/// handed to a freshly forked child right before it execs the jail binary.
pub fn clear_cloexec(fd: RawDescriptor) -> Result<()> {
    let flags = get_fd_flags(fd)?;
    set_fd_flags(fd, flags & !libc::FD_CLOEXEC)
}

/// A pidfd obtained via `pidfd_open(2)`, used to wait for and signal a process without races
/// against pid reuse.
pub struct PidFd {
    fd: RawDescriptor,
}

impl PidFd {
    pub fn open(pid: Pid) -> Result<PidFd> {
        // Safe because this merely opens a new fd referring to an existing pid and we check
        // the return value.
        let fd = syscall!(libc::syscall(libc::SYS_pidfd_open, pid, 0) as c_int)?;
        Ok(PidFd { fd })
    }

    /// Sends `signal` to the process referred to by this pidfd.
    pub fn send_signal(&self, signal: c_int) -> Result<()> {
        syscall!(libc::syscall(
            libc::SYS_pidfd_send_signal,
            self.fd,
            signal,
            std::ptr::null::<libc::siginfo_t>(),
            0
        ))?;
        Ok(())
    }
}

impl AsRawDescriptor for PidFd {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.fd
    }
}

impl Drop for PidFd {
    fn drop(&mut self) {
        // Safe because self.fd is uniquely owned by this struct.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Disposition of a waited-for child process, as used by both the sandbox (jail) and thread
/// (subjail) quit sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    Signalled(i32),
    ForceKilled,
}

/// Polls `pidfd` for exit, with a millisecond timeout; force-kills with `SIGKILL` if the timeout
/// elapses, then always reaps the child via `waitid`.
///
/// `ForceKilled` takes precedence in the return value even though the process is, by then, also
/// reaped: callers care primarily about whether the deadline was honored.
pub fn pidfd_wait_or_force_kill(pidfd: &PidFd, timeout_ms: i32) -> Result<WaitOutcome> {
    let became_ready = poll_in(pidfd, timeout_ms)?;

    let force_killed = if !became_ready {
        pidfd.send_signal(libc::SIGKILL)?;
        true
    } else {
        false
    };

    // Safe because we zero-initialize a plain-old-data struct and check the return value.
    let mut siginfo: libc::siginfo_t = unsafe { mem::zeroed() };
    syscall!(libc::waitid(
        libc::P_PIDFD,
        pidfd.as_raw_descriptor() as libc::id_t,
        &mut siginfo,
        libc::WEXITED
    ))?;

    if force_killed {
        return Ok(WaitOutcome::ForceKilled);
    }

    let si_code = siginfo.si_code;
    // Safe: si_status() reads a union member valid for the CLD_* si_code values checked below.
    let si_status = unsafe { siginfo.si_status() };

    match si_code {
        libc::CLD_EXITED => Ok(WaitOutcome::Exited(si_status)),
        libc::CLD_KILLED | libc::CLD_DUMPED => Ok(WaitOutcome::Signalled(si_status)),
        other => Ok(WaitOutcome::Exited(other)),
    }
}

/// Drop guard that unlinks a bound unix socket path on scope exit.
pub struct UnlinkOnDrop<'a>(pub &'a std::path::Path);

impl Drop for UnlinkOnDrop<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(self.0);
    }
}
