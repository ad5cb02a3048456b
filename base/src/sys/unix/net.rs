// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! `SOCK_SEQPACKET` unix sockets with single-fd ancillary-data passing, the transport the
//! `ipc` crate builds its framed channel on top of.

use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;

use libc::{c_void, cmsghdr, iovec, msghdr, sockaddr_un, socklen_t};

use crate::descriptor::{FromRawDescriptor, RawDescriptor};
use crate::errno::{errno_result, Result};

/// Builds a `sockaddr_un` for `path`, as required by `bind`/`connect`.
fn sockaddr_un(path: &Path) -> Result<(sockaddr_un, socklen_t)> {
    let mut addr = sockaddr_un {
        sun_family: libc::AF_UNIX as libc::sa_family_t,
        sun_path: [0; 108],
    };

    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(crate::errno::Error::new(libc::ENAMETOOLONG));
    }

    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as socklen_t))
}

/// One end of a `SOCK_SEQPACKET` unix socket, used for the direct jail<->subjail and
/// host<->jail message channels.
#[derive(Debug)]
pub struct UnixSeqpacket {
    fd: RawFd,
}

impl UnixSeqpacket {
    /// Creates a connected pair of seqpacket sockets, close-on-exec by default.
    pub fn pair() -> Result<(UnixSeqpacket, UnixSeqpacket)> {
        let mut fds = [0, 0];
        // Safe because we give a valid pointer to two ints and check the return value.
        syscall!(libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        ))?;
        // Safe because socketpair established both fds on success.
        Ok(unsafe {
            (
                UnixSeqpacket::from_raw_descriptor(fds[0]),
                UnixSeqpacket::from_raw_descriptor(fds[1]),
            )
        })
    }

    /// Connects to a seqpacket socket bound at `path`.
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<UnixSeqpacket> {
        let (addr, len) = sockaddr_un(path.as_ref())?;
        // Safe because this doesn't modify any memory and we check the return value.
        let fd = syscall!(libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0
        ))?;
        let ret = unsafe {
            libc::connect(
                fd as RawFd,
                &addr as *const sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            let e = errno_result::<()>();
            // Safe because fd is uniquely owned here.
            unsafe { libc::close(fd as RawFd) };
            return e.map(|_| unreachable!());
        }
        // Safe because fd is a freshly created, uniquely owned socket.
        Ok(unsafe { UnixSeqpacket::from_raw_descriptor(fd as RawFd) })
    }

    /// Sends `buf` with at most one ancillary fd attached, refusing to raise `SIGPIPE` on a
    /// peer that has already shut down its end.
    pub fn send_with_fd(&self, buf: &[u8], fd: Option<RawFd>) -> Result<usize> {
        let mut iov = iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };

        let mut cmsg_buf = [0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }];
        let mut msg: msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        if let Some(fd) = fd {
            msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
            msg.msg_controllen = cmsg_buf.len();

            // Safe because msg_control points at a buffer of at least CMSG_SPACE(fd) bytes.
            unsafe {
                let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
                std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
                msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize;
            }
        }

        // Safe because msg is fully initialized and its buffers outlive the call.
        let ret = syscall!(libc::sendmsg(self.fd, &msg, libc::MSG_NOSIGNAL))?;
        Ok(ret as usize)
    }

    /// Receives into `buf`, returning the number of bytes read and at most one ancillary fd.
    pub fn recv_with_fd(&self, buf: &mut [u8]) -> Result<(usize, Option<RawFd>)> {
        let mut iov = iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };

        let mut cmsg_buf = [0u8; unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as usize }];
        let mut msg: msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
        msg.msg_controllen = cmsg_buf.len();

        // Safe because msg is fully initialized and its buffers outlive the call.
        let ret = syscall!(libc::recvmsg(self.fd, &mut msg, 0))?;

        let mut fd = None;
        // Safe: msg was populated by a successful recvmsg above.
        unsafe {
            let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg);
            if !cmsg.is_null()
                && (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                fd = Some(std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd));
            }
        }

        Ok((ret as usize, fd))
    }
}

impl AsRawFd for UnixSeqpacket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawDescriptor for UnixSeqpacket {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        UnixSeqpacket { fd: descriptor }
    }
}

impl FromRawFd for UnixSeqpacket {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        UnixSeqpacket { fd }
    }
}

impl Drop for UnixSeqpacket {
    fn drop(&mut self) {
        // Safe because self.fd is uniquely owned by this struct.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A bound, listening seqpacket socket. Used only by the embedded-jail binary's own listener
/// in test harnesses; the production jail/subjail channels are always created with `pair()`.
pub struct UnixSeqpacketListener {
    fd: RawFd,
}

impl UnixSeqpacketListener {
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<UnixSeqpacketListener> {
        let (addr, len) = sockaddr_un(path.as_ref())?;
        let fd = syscall!(libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
            0
        ))?;
        let ret = unsafe {
            libc::bind(
                fd as RawFd,
                &addr as *const sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            let e = errno_result::<()>();
            unsafe { libc::close(fd as RawFd) };
            return e.map(|_| unreachable!());
        }
        syscall!(libc::listen(fd as RawFd, 128))?;
        Ok(UnixSeqpacketListener { fd: fd as RawFd })
    }

    pub fn accept(&self) -> Result<UnixSeqpacket> {
        // Safe because we pass null address/len pointers, which accept(2) permits.
        let fd = syscall!(libc::accept4(
            self.fd,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_CLOEXEC,
        ))?;
        // Safe because accept4 established a freshly owned fd on success.
        Ok(unsafe { UnixSeqpacket::from_raw_descriptor(fd) })
    }
}

impl AsRawFd for UnixSeqpacketListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for UnixSeqpacketListener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
