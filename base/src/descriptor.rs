// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

pub type RawDescriptor = RawFd;

/// A trait for retrieving a raw file descriptor without transferring ownership.
pub trait AsRawDescriptor {
    fn as_raw_descriptor(&self) -> RawDescriptor;
}

/// # Safety
///
/// `from_raw_descriptor` takes ownership of a raw descriptor and assumes it is a valid,
/// otherwise-unowned descriptor of the correct kind for `Self`.
pub trait FromRawDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self;
}

pub trait IntoRawDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor;
}

impl<T: AsRawFd> AsRawDescriptor for T {
    fn as_raw_descriptor(&self) -> RawDescriptor {
        self.as_raw_fd()
    }
}

/// An owned file descriptor of unspecified kind. Closed on drop.
#[derive(Debug)]
pub struct SafeDescriptor {
    descriptor: RawDescriptor,
}

impl SafeDescriptor {
    pub fn try_clone(&self) -> crate::Result<SafeDescriptor> {
        // Safe because this doesn't modify any memory and we check the return value.
        let ret = unsafe { libc::fcntl(self.descriptor, libc::F_DUPFD_CLOEXEC, 0) };
        if ret < 0 {
            return crate::errno_result();
        }
        // Safe because we uniquely own the new descriptor.
        Ok(unsafe { SafeDescriptor::from_raw_descriptor(ret) })
    }
}

impl AsRawFd for SafeDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.descriptor
    }
}

impl FromRawDescriptor for SafeDescriptor {
    unsafe fn from_raw_descriptor(descriptor: RawDescriptor) -> Self {
        SafeDescriptor { descriptor }
    }
}

impl FromRawFd for SafeDescriptor {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        SafeDescriptor { descriptor: fd }
    }
}

impl IntoRawDescriptor for SafeDescriptor {
    fn into_raw_descriptor(self) -> RawDescriptor {
        let descriptor = self.descriptor;
        std::mem::forget(self);
        descriptor
    }
}

impl IntoRawFd for SafeDescriptor {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw_descriptor()
    }
}

impl Drop for SafeDescriptor {
    fn drop(&mut self) {
        // Safe because self.descriptor is uniquely owned by this struct.
        unsafe {
            libc::close(self.descriptor);
        }
    }
}

/// A non-owning wrapper around a raw descriptor, for APIs that want to express
/// "borrowed descriptor" without lifetimes.
#[derive(Copy, Clone, Debug)]
pub struct Descriptor(pub RawDescriptor);

impl AsRawFd for Descriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}
