// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A bidirectional, fd-passing datagram channel built on `SOCK_SEQPACKET`.

use std::os::unix::io::{AsRawFd, RawFd};

use base::sys::unix::net::UnixSeqpacket;
use base::{poll_in, AsRawDescriptor, FromRawDescriptor, SafeDescriptor};

use crate::message::{self, Message};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to create socket pair: {0}")]
    SocketCreate(base::Error),
    #[error("send failed: {0}")]
    Send(base::Error),
    #[error("receive failed: {0}")]
    Receive(base::Error),
    #[error("poll failed: {0}")]
    Poll(base::Error),
    #[error("receive timed out")]
    ReceiveTimeout,
    #[error("received message truncated ({0} bytes)")]
    ReceiveTruncated(usize),
    #[error("received message too small ({0} bytes)")]
    TooSmall(usize),
    #[error("message carries no ancillary fd where one was required")]
    MissingControlData,
    #[error("message encode/decode error: {0}")]
    Message(#[from] message::Error),
    #[error("only a controller-mode channel may attach an ancillary fd")]
    ControllerOnlySend,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which end of the pair this channel is. Only the controller end may attach an
/// ancillary fd to an outgoing message — mirrors the host (controller) / jail or
/// jail (controller) / subjail (child) relationship at every hop of the process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Controller,
    Child,
}

/// `0` means block forever; `libc::poll`-style semantics otherwise.
pub const NO_TIMEOUT: i32 = 0;

#[derive(Debug)]
pub struct Channel {
    mode: Mode,
    sock: UnixSeqpacket,
}

impl Channel {
    /// Creates a connected pair: `.0` is the controller end, `.1` is the child end.
    pub fn pair() -> Result<(Channel, Channel)> {
        let (a, b) = UnixSeqpacket::pair().map_err(Error::SocketCreate)?;
        Ok((
            Channel {
                mode: Mode::Controller,
                sock: a,
            },
            Channel {
                mode: Mode::Child,
                sock: b,
            },
        ))
    }

    /// Wraps an already-connected socket fd as the given mode's end of a channel.
    pub fn from_raw(mode: Mode, fd: RawFd) -> Channel {
        Channel {
            mode,
            // Safe: caller is handing over a connected SOCK_SEQPACKET fd they uniquely own.
            sock: unsafe { UnixSeqpacket::from_raw_descriptor(fd) },
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Sends `msg`, attaching `fd` as ancillary data if the message type carries one.
    /// Attaching an fd is only permitted from the controller end.
    pub fn send(&self, msg: &Message, fd: Option<RawFd>) -> Result<()> {
        if fd.is_some() && self.mode != Mode::Controller {
            return Err(Error::ControllerOnlySend);
        }
        let mut buf = [0u8; message::MAXSIZE];
        let len = msg.encode(&mut buf)?;
        self.sock
            .send_with_fd(&buf[..len], fd)
            .map_err(Error::Send)?;
        Ok(())
    }

    /// Receives one message, waiting up to `timeout_ms` (poll semantics: `0` = no
    /// timeout / block forever). Returns the decoded message plus any ancillary fd,
    /// owned, as a [`SafeDescriptor`].
    pub fn recv(&self, timeout_ms: i32) -> Result<(Message, Option<SafeDescriptor>)> {
        if timeout_ms != NO_TIMEOUT {
            let ready = poll_in(&self.sock, timeout_ms).map_err(Error::Poll)?;
            if !ready {
                return Err(Error::ReceiveTimeout);
            }
        }

        let mut buf = [0u8; message::MAXSIZE];
        let (len, fd) = self.sock.recv_with_fd(&mut buf).map_err(Error::Receive)?;
        if len == 0 {
            return Err(Error::TooSmall(len));
        }
        if len > message::MAXSIZE {
            return Err(Error::ReceiveTruncated(len));
        }

        let msg = Message::decode(&buf, len)?;
        if msg.tag().carries_fd() && fd.is_none() && msg.tag() != crate::message::Tag::FunctionReturn
        {
            return Err(Error::MissingControlData);
        }

        // Safe: fd, if present, was just uniquely received via recvmsg/SCM_RIGHTS.
        let owned_fd = fd.map(|fd| unsafe { SafeDescriptor::from_raw_descriptor(fd) });
        Ok((msg, owned_fd))
    }

    /// Sends a `FunctionCall` and blocks until the matching `FunctionReturn` arrives.
    /// Convenience wrapper used by the `rpc` crate's caller side.
    pub fn call(&self, msg: &Message, timeout_ms: i32) -> Result<(Message, Option<SafeDescriptor>)> {
        debug_assert!(matches!(msg, Message::FunctionCall { .. }));
        self.send(msg, None)?;
        self.recv(timeout_ms)
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn controller_sends_an_ancillary_fd_to_child() {
        let (controller, child) = Channel::pair().unwrap();
        let memfd = tempfile::tempfile().unwrap();

        controller
            .send(&Message::NewSubjail, Some(memfd.as_raw_fd()))
            .unwrap();
        let (msg, fd) = child.recv(2000).unwrap();
        assert!(matches!(msg, Message::NewSubjail));
        assert!(fd.is_some());
    }

    #[test]
    fn child_may_not_attach_an_ancillary_fd() {
        let (_controller, child) = Channel::pair().unwrap();
        let memfd = tempfile::tempfile().unwrap();
        let err = child
            .send(&Message::NewSubjail, Some(memfd.as_raw_fd()))
            .unwrap_err();
        assert!(matches!(err, Error::ControllerOnlySend));
    }

    #[test]
    fn a_message_that_requires_an_fd_without_one_is_rejected() {
        let (controller, child) = Channel::pair().unwrap();
        // NewSubjail normally carries an fd; sending it bare should surface as
        // MissingControlData on the receiving end rather than silently proceeding.
        controller.send(&Message::NewSubjail, None).unwrap();
        let err = child.recv(2000).unwrap_err();
        assert!(matches!(err, Error::MissingControlData));
    }

    #[test]
    fn recv_times_out_when_nothing_arrives() {
        let (_controller, child) = Channel::pair().unwrap();
        let err = child.recv(50).unwrap_err();
        assert!(matches!(err, Error::ReceiveTimeout));
    }

    #[test]
    fn plain_messages_round_trip_without_an_fd() {
        let (controller, child) = Channel::pair().unwrap();
        controller.send(&Message::Hello { pid: 42 }, None).unwrap();
        let (msg, fd) = child.recv(2000).unwrap();
        assert!(matches!(msg, Message::Hello { pid: 42 }));
        assert!(fd.is_none());
    }
}
