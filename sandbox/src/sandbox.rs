// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The sandbox controller: forks and execs the embedded jail binary, holds the
//! controller end of its IPC channel, and tears it down on drop.

use std::os::unix::io::{AsRawFd, RawFd};

use ipc::{Channel, Message, Mode};
use jail::options::SandboxOptions;

use crate::embedded_jail;

pub const QUIT_TIMEOUT_MS: i32 = 4000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    EmbeddedJail(#[from] embedded_jail::Error),
    #[error("creating the sandbox's ipc pair failed: {0}")]
    IpcCreate(ipc::Error),
    #[error("fork failed: {0}")]
    Fork(base::Error),
    #[error("writing sandbox options to the handoff memfd failed: {0}")]
    OptionsWrite(#[from] jail::options::Error),
    #[error("failed to kill sandbox child {pid} after a setup failure: {source}")]
    KillChildAfterSetupFailure { pid: libc::pid_t, source: base::Error },
    #[error("opening a pidfd for the jail failed: {0}")]
    PidFd(base::Error),
    #[error("sending a message to the jail failed: {0}")]
    Send(ipc::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of waiting for the jail to exit, surfaced to the caller even though the
/// sandbox itself is already torn down by the time this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    NonZero(i32),
    KilledBySignal(i32),
    ForceKilled,
}

/// A running jail process plus the controller's end of its IPC channel. Forked and
/// exec'd in [`Sandbox::new`]; torn down by [`Sandbox::quit`] or on drop.
#[derive(Debug)]
pub struct Sandbox {
    ipc: Channel,
    pid: libc::pid_t,
    options: SandboxOptions,
}

impl Sandbox {
    /// Forks a child, hands it the controller-chosen `options` (with `jail_ipc_sockfd`
    /// overwritten to name its end of a freshly created IPC pair), and execs the
    /// embedded jail binary in that child. Blocks in the parent only long enough to
    /// send the initial `Hello`.
    pub fn new(mut options: SandboxOptions) -> Result<Sandbox> {
        if !embedded_jail::available() {
            return Err(embedded_jail::Error::Unavailable.into());
        }

        let (controller_ipc, child_ipc) = Channel::pair().map_err(Error::IpcCreate)?;
        let child_fd = child_ipc.as_raw_fd();
        options.jail_ipc_sockfd = child_fd;

        // Safe: fork() duplicates this process; each branch runs disjoint code below.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::Fork(base::Error::last()));
        }

        if pid == 0 {
            drop(controller_ipc);
            let code = match spawn_jail_child(child_ipc, &options) {
                Ok(never) => match never {},
                Err(e) => {
                    eprintln!("scriptcage-sandbox: jail child cannot live outside the jail: {e}");
                    1
                }
            };
            std::process::exit(code);
        }

        // We hold the controller's own copy of child_fd only via `child_ipc`'s Drop;
        // drop it explicitly here so the jail's exec'd process owns the sole remaining
        // reference to that socket fd.
        drop(child_ipc);

        let sandbox = Sandbox {
            ipc: controller_ipc,
            pid,
            options,
        };

        if let Err(e) = sandbox
            .ipc
            .send(&Message::Hello { pid: base::getpid() }, None)
        {
            // Safe: pid is the child this process just forked; return value is checked.
            if unsafe { libc::kill(pid, libc::SIGKILL) } < 0 {
                return Err(Error::KillChildAfterSetupFailure {
                    pid,
                    source: base::Error::last(),
                });
            }
            let _ = base::wait_for_pid(pid, 0);
            return Err(Error::Send(e));
        }

        Ok(sandbox)
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    pub fn channel(&self) -> &Channel {
        &self.ipc
    }

    /// Sends `Quit` and waits up to [`QUIT_TIMEOUT_MS`] for the jail to exit,
    /// force-killing it past the deadline. Consumes `self`; dropping a `Sandbox`
    /// without calling this does the same thing best-effort.
    pub fn quit(self) -> Result<ExitStatus> {
        self.request_quit()
    }

    fn request_quit(&self) -> Result<ExitStatus> {
        // A peer that already exited makes this a harmless no-op; only escalate real
        // transport errors.
        if let Err(e) = self.ipc.send(&Message::Quit, None) {
            log::debug!("sandbox: quit send failed (jail likely already gone): {e}");
        }

        let pidfd = base::PidFd::open(self.pid).map_err(Error::PidFd)?;
        match base::pidfd_wait_or_force_kill(&pidfd, QUIT_TIMEOUT_MS)
            .map_err(Error::PidFd)?
        {
            base::WaitOutcome::Exited(0) => Ok(ExitStatus::Clean),
            base::WaitOutcome::Exited(code) => Ok(ExitStatus::NonZero(code)),
            base::WaitOutcome::Signalled(sig) => Ok(ExitStatus::KilledBySignal(sig)),
            base::WaitOutcome::ForceKilled => Ok(ExitStatus::ForceKilled),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = self.request_quit() {
            log::warn!("sandbox: cleanup on drop failed: {e}");
        }
    }
}

/// Runs in the forked child, before it becomes the jail via `fexecve`. `child_ipc` is
/// not used directly here: `fork` preserves fd numbers across the fork, so the fd
/// `options.jail_ipc_sockfd` already names is this process's own copy of it, and the
/// jail will pick it up again by that same number once it execs. We hold `child_ipc`
/// only so it isn't dropped (and its fd closed) before `fexecve` runs.
fn spawn_jail_child(child_ipc: Channel, options: &SandboxOptions) -> Result<std::convert::Infallible> {
    let fd = memfd_create_options()?;
    options.write_to(fd)?;
    let err = embedded_jail::exec(&options.name, fd);
    drop(child_ipc);
    Err(Error::EmbeddedJail(err))
}

fn memfd_create_options() -> Result<RawFd> {
    let name = std::ffi::CString::new("scriptcage-sandbox-options").unwrap();
    // Safe: name is a valid NUL-terminated string; return value is checked.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), 0) };
    if fd < 0 {
        return Err(Error::EmbeddedJail(embedded_jail::Error::CreateFd(
            base::Error::last(),
        )));
    }
    Ok(fd)
}
