// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Subjail spawn and message loop: the smallest process in the tree, forked directly
//! from the already-locked-down jail (no exec, so it inherits the jail's seccomp filter).
//!
//! A subjail never runs a script interpreter itself here — that lives one layer up,
//! wired in through the same message loop this module drives. What's security-critical
//! at this layer is the protocol skeleton: only `Quit` may end the loop cleanly, and any
//! message this tier shouldn't be receiving at all (`Hello` twice, `SubjailAlive`,
//! `NewSubjail`) or doesn't recognize is a fatal protocol violation, not a thing to log
//! and ignore.

use std::os::unix::io::RawFd;

use ipc::{Channel, Message, Mode};

pub const HELLO_TIMEOUT_MS: i32 = 5000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ipc error: {0}")]
    Ipc(#[from] ipc::Error),
    #[error("timed out waiting for hello")]
    HelloTimeout,
    #[error("expected hello, received {0:?}")]
    ExpectedHello(ipc::Tag),
    #[error("received a second hello")]
    MultiHello,
    #[error("message type {0:?} is never valid at this tier")]
    UnsupportedMessage(ipc::Tag),
    #[error("received unknown message type {0:?}")]
    UnknownMessage(ipc::Tag),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Forks a subjail that takes over `channel_fd` as its whole connection to the
/// controller: the direct-IPC end carried as ancillary data on a `NewSubjail` message.
/// Returns the subjail's pid to the caller (the jail process) in the parent branch
/// only — the caller is responsible for closing its own copy of `channel_fd` once this
/// returns, since the subjail now owns the only copy that matters. The child branch
/// never returns, exiting with the subjail's own status instead.
pub fn spawn(index: u32, channel_fd: RawFd) -> base::Result<libc::pid_t> {
    // Safe: fork() duplicates the calling process; both branches inherit the fd table
    // and seccomp filter untouched.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return base::errno_result();
    }
    if pid == 0 {
        let status = match subjail_main(index, channel_fd) {
            Ok(()) => 0,
            Err(e) => {
                log::error!("subjail {index}: {e}");
                1
            }
        };
        std::process::exit(status);
    }
    Ok(pid)
}

fn subjail_main(index: u32, channel_fd: RawFd) -> Result<()> {
    let ipc = Channel::from_raw(Mode::Child, channel_fd);

    ipc.send(
        &Message::SubjailAlive {
            index,
            pid: base::getpid(),
        },
        None,
    )?;

    log::info!("subjail {index}: started by jail pid {}", base::getpid());
    log::debug!("subjail {index}: waiting for hello");

    let (hello, _fd) = match ipc.recv(HELLO_TIMEOUT_MS) {
        Ok(got) => got,
        Err(ipc::Error::ReceiveTimeout) => return Err(Error::HelloTimeout),
        Err(e) => return Err(Error::Ipc(e)),
    };
    if !matches!(hello, Message::Hello { .. }) {
        return Err(Error::ExpectedHello(hello.tag()));
    }
    log::debug!("subjail {index}: received hello");

    log::debug!("subjail {index}: entering message loop");
    loop {
        let (msg, _fd) = ipc.recv(ipc::NO_TIMEOUT)?;
        match msg {
            Message::Hello { .. } => return Err(Error::MultiHello),
            Message::Quit => {
                log::info!("subjail {index}: received request to exit");
                break;
            }
            Message::SubjailAlive { .. } | Message::NewSubjail => {
                return Err(Error::UnsupportedMessage(msg.tag()))
            }
            other => return Err(Error::UnknownMessage(other.tag())),
        }
    }

    log::info!("subjail {index}: quitting normally");
    Ok(())
}
