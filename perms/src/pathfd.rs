// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Path-fd handles and `/proc/self/fd` canonicalization.
//!
//! A [`PathFd`] is either an `O_PATH` handle to an existing file, or a handle to its
//! parent directory plus the final path component kept as text — used when a policy
//! must be able to gate creation of a file that doesn't exist yet.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use base::{FromRawDescriptor, SafeDescriptor};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("open failed: {0}")]
    Open(base::Error),
    #[error("readlinkat failed: {0}")]
    Readlink(base::Error),
    #[error("fstat failed: {0}")]
    Stat(base::Error),
    #[error("basename {0:?} is not a valid path component")]
    InvalidBasename(String),
    #[error("path has no parent directory")]
    NoParent,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Either a handle to an existing file (`trailing_name` empty) or a handle to its
/// parent directory plus the final component as text (used for not-yet-created files).
pub struct PathFd {
    dir_fd: SafeDescriptor,
    trailing_name: Option<String>,
}

impl PathFd {
    /// Opens `path` with `O_PATH | O_NOFOLLOW`. The referent is guaranteed to exist.
    pub fn open_existing(path: &Path) -> Result<PathFd> {
        let c = cstring(path);
        // Safe: c is a valid NUL-terminated string and we check the return value.
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_PATH | libc::O_NOFOLLOW) };
        if fd < 0 {
            return Err(Error::Open(base::Error::last()));
        }
        Ok(PathFd {
            // Safe: fd was just opened and is uniquely owned here.
            dir_fd: unsafe { SafeDescriptor::from_raw_descriptor(fd) },
            trailing_name: None,
        })
    }

    /// Splits `path` into dirname/basename, opens the dirname `O_PATH | O_DIRECTORY`,
    /// and keeps the basename as text. Used to gate creation of a not-yet-existing file.
    pub fn open_trailing(path: &Path) -> Result<PathFd> {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidBasename(path.display().to_string()))?;
        if basename == "." || basename == ".." || basename.contains('/') {
            return Err(Error::InvalidBasename(basename.to_string()));
        }
        let dirname = path.parent().ok_or(Error::NoParent)?;
        let dirname = if dirname.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dirname
        };
        let c = cstring(dirname);
        // Safe: c is a valid NUL-terminated string and we check the return value.
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_PATH | libc::O_DIRECTORY) };
        if fd < 0 {
            return Err(Error::Open(base::Error::last()));
        }
        Ok(PathFd {
            // Safe: fd was just opened and is uniquely owned here.
            dir_fd: unsafe { SafeDescriptor::from_raw_descriptor(fd) },
            trailing_name: Some(basename.to_string()),
        })
    }

    /// Tries [`PathFd::open_existing`] first, falling back to [`PathFd::open_trailing`]
    /// on `ENOENT` — the `ALLOWMISSING` open mode.
    pub fn open_allow_missing(path: &Path) -> Result<PathFd> {
        match Self::open_existing(path) {
            Ok(p) => Ok(p),
            Err(Error::Open(e)) if e.errno() == libc::ENOENT => Self::open_trailing(path),
            Err(e) => Err(e),
        }
    }

    pub fn trailing_name(&self) -> Option<&str> {
        self.trailing_name.as_deref()
    }

    /// Reads `/proc/self/fd/<n>` to recover this handle's canonical absolute path,
    /// stripping the kernel's `" (deleted)"` suffix when the referent has been unlinked,
    /// then appending the trailing name if this is a not-yet-existing-file handle.
    pub fn canonical_path(&self) -> Result<String> {
        let mut base = readlink_proc_fd(self.dir_fd.as_raw_fd())?;
        if let Some(name) = &self.trailing_name {
            if !base.ends_with('/') {
                base.push('/');
            }
            base.push_str(name);
        }
        Ok(base)
    }

    /// Reopens this handle with real access flags: for a not-yet-existing file, opens
    /// the basename inside the parent directory fd; otherwise reopens
    /// `/proc/self/fd/<n>` with the requested flags.
    pub fn reopen(&self, flags: i32, create_mode: libc::mode_t) -> Result<RawFd> {
        if let Some(name) = &self.trailing_name {
            let c = CString::new(name.as_str()).map_err(|_| Error::InvalidBasename(name.clone()))?;
            // Safe: dir_fd is a valid directory fd, c is a valid relative path, and we
            // check the return value.
            let fd = unsafe { libc::openat(self.dir_fd.as_raw_fd(), c.as_ptr(), flags, create_mode as libc::c_uint) };
            if fd < 0 {
                return Err(Error::Open(base::Error::last()));
            }
            Ok(fd)
        } else {
            let proc_path = format!("/proc/self/fd/{}\0", self.dir_fd.as_raw_fd());
            // Safe: proc_path is a valid NUL-terminated string and we check the return.
            let fd = unsafe { libc::open(proc_path.as_ptr() as *const libc::c_char, flags) };
            if fd < 0 {
                return Err(Error::Open(base::Error::last()));
            }
            Ok(fd)
        }
    }
}

fn cstring(path: &Path) -> CString {
    CString::new(path.as_os_str().as_encoded_bytes()).expect("path must not contain a NUL byte")
}

/// Resolves `fd` to its canonical absolute path via `readlinkat("/proc/self/fd/<fd>")`,
/// growing the buffer geometrically until the link fits, and stripping the Linux
/// `" (deleted)"` suffix when the referent has `st_nlink == 0`.
pub fn readlink_proc_fd(fd: RawFd) -> Result<String> {
    let proc_path = CString::new(format!("/proc/self/fd/{fd}")).unwrap();
    let mut cap = 256usize;
    loop {
        let mut buf = vec![0u8; cap];
        // Safe: proc_path is valid, buf has `cap` bytes of capacity, and we check the
        // return value before trusting it as a length.
        let n = unsafe { libc::readlink(proc_path.as_ptr(), buf.as_mut_ptr() as *mut i8, cap) };
        if n < 0 {
            return Err(Error::Readlink(base::Error::last()));
        }
        let n = n as usize;
        if n < cap {
            buf.truncate(n);
            let mut s = String::from_utf8_lossy(&buf).into_owned();
            if nlink_is_zero(fd)? {
                if let Some(stripped) = s.strip_suffix(" (deleted)") {
                    s = stripped.to_string();
                }
            }
            return Ok(s);
        }
        cap *= 2;
    }
}

fn nlink_is_zero(fd: RawFd) -> Result<bool> {
    // Safe: zero-initializing a plain-old-data struct and checking the return value.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd, &mut st) };
    if ret < 0 {
        return Err(Error::Stat(base::Error::last()));
    }
    Ok(st.st_nlink == 0)
}
