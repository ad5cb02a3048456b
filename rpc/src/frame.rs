// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::io::RawFd;

use ipc::FunctionArg;

use crate::registry::Function;
use crate::{Error, Result};

/// Per-call state: a local copy of the caller's argument bytes (read with one gather
/// `process_vm_readv`), a scratch return buffer sized by the caller's declared return
/// size, and the remote locations both were read from / will be written to.
pub struct Frame {
    remote_pid: libc::pid_t,
    buf: Vec<u8>,
    arg_spans: Vec<(usize, usize)>,
    return_span: (usize, usize),
    return_remote: FunctionArg,
    executed: bool,
    return_fd: Option<RawFd>,
}

impl Frame {
    /// Reads every argument named in `args` out of `remote_pid`'s address space into one
    /// local buffer, sized to the sum of argument sizes plus `return_remote.size`. Fails
    /// if that total exceeds `frame_limit_bytes`.
    pub fn from_call(
        remote_pid: libc::pid_t,
        args: &[FunctionArg],
        return_remote: FunctionArg,
        frame_limit_bytes: usize,
    ) -> Result<Frame> {
        if args.len() > 16 {
            return Err(Error::TooManyArgs);
        }

        let args_total: u64 = args.iter().map(|a| a.size).sum();
        let total = args_total
            .checked_add(return_remote.size)
            .ok_or(Error::FrameTooLarge {
                bytes: usize::MAX,
                limit: frame_limit_bytes,
            })? as usize;
        if total > frame_limit_bytes {
            return Err(Error::FrameTooLarge {
                bytes: total,
                limit: frame_limit_bytes,
            });
        }

        let mut buf = vec![0u8; total];
        let mut arg_spans = Vec::with_capacity(args.len());
        let mut offset = 0usize;
        let mut remote_iov = Vec::with_capacity(args.len());
        let mut local_iov = Vec::with_capacity(args.len());

        for arg in args {
            let size = arg.size as usize;
            arg_spans.push((offset, size));
            remote_iov.push(libc::iovec {
                iov_base: arg.addr as *mut libc::c_void,
                iov_len: size,
            });
            offset += size;
        }
        let return_span = (offset, return_remote.size as usize);

        // Build local_iov only after `buf` stops moving: all slices point into `buf`.
        for (start, len) in &arg_spans {
            local_iov.push(libc::iovec {
                iov_base: buf[*start..*start + *len].as_mut_ptr() as *mut libc::c_void,
                iov_len: *len,
            });
        }

        if !args.is_empty() {
            // Safe: remote_iov/local_iov name exactly `args_total` bytes on each side,
            // and buf is sized to hold all of it; we check the return value below.
            let ret = unsafe {
                libc::process_vm_readv(
                    remote_pid,
                    local_iov.as_ptr(),
                    local_iov.len() as u64,
                    remote_iov.as_ptr(),
                    remote_iov.len() as u64,
                    0,
                )
            };
            if ret < 0 {
                return Err(Error::ReadArgs(base::Error::last()));
            }
        }

        Ok(Frame {
            remote_pid,
            buf,
            arg_spans,
            return_span,
            return_remote,
            executed: false,
            return_fd: None,
        })
    }

    /// Runs `function`'s handler against this frame's locally-copied argument bytes,
    /// filling the local return-buffer span. The handler may additionally set a return
    /// fd, retrieved afterward with [`Frame::take_return_fd`].
    pub(crate) fn invoke(&mut self, function: &Function) -> std::result::Result<(), String> {
        self.executed = true;
        let (ret_start, ret_len) = self.return_span;

        // Every arg span lies within [0, ret_start) by construction (see from_call),
        // so splitting at ret_start gives disjoint immutable arg views and a mutable
        // return view without any unsafe aliasing.
        let (args_part, ret_part) = self.buf.split_at_mut(ret_start);
        let arg_slices: Vec<&[u8]> = self
            .arg_spans
            .iter()
            .map(|(start, len)| &args_part[*start..*start + *len])
            .collect();
        (function.handler)(&arg_slices, &mut ret_part[..ret_len], &mut self.return_fd)
    }

    /// Takes the return fd the handler set during `invoke`, if any.
    pub(crate) fn take_return_fd(&mut self) -> Option<RawFd> {
        self.return_fd.take()
    }

    /// Scatters the local return-buffer span back into the caller's address space with
    /// one `process_vm_writev`. No-op if the return span is empty.
    pub fn write_back(&self) -> Result<()> {
        let (start, len) = self.return_span;
        if len == 0 {
            return Ok(());
        }
        let local_iov = [libc::iovec {
            iov_base: self.buf[start..start + len].as_ptr() as *mut libc::c_void,
            iov_len: len,
        }];
        let remote_iov = [libc::iovec {
            iov_base: self.return_remote.addr as *mut libc::c_void,
            iov_len: len,
        }];
        // Safe: remote_iov names exactly the caller-declared return span, local_iov
        // names an equally sized span inside our own buffer; return value is checked.
        let ret = unsafe {
            libc::process_vm_writev(
                self.remote_pid,
                local_iov.as_ptr(),
                local_iov.len() as u64,
                remote_iov.as_ptr(),
                remote_iov.len() as u64,
                0,
            )
        };
        if ret < 0 {
            return Err(Error::WriteReturn(base::Error::last()));
        }
        Ok(())
    }

    pub fn was_executed(&self) -> bool {
        self.executed
    }
}
