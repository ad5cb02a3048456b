// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io;

/// Wraps an errno value captured from the current thread's `errno`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error(i32);

impl Error {
    /// Constructs an `Error` from the last OS error available via `errno`.
    pub fn last() -> Error {
        Error(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    pub fn new(errno: i32) -> Error {
        Error(errno)
    }

    pub fn errno(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "errno {} ({})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::from_raw_os_error(e.0)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Returns `Err(Error::last())`. Intended to directly follow a libc call whose return value
/// has already been checked to indicate failure.
pub fn errno_result<T>() -> Result<T> {
    Err(Error::last())
}
