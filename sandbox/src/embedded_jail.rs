// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The jail executable, embedded into this crate's binary so the controller never has
//! to ship a second file alongside itself. A build without a jail binary available
//! still links, with [`available`] reporting `false` and every exec attempt failing.

use std::ffi::CString;
use std::os::unix::io::RawFd;

static EXE_DATA: &[u8] = include_bytes!(env!("SCRIPTCAGE_JAIL_BIN_PATH"));

extern "C" {
    static environ: *const *const libc::c_char;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no jail binary was embedded into this build")]
    Unavailable,
    #[error("memfd_create failed: {0}")]
    CreateFd(base::Error),
    #[error("writing the jail binary into its memfd failed: {0}")]
    Write(base::Error),
    #[error("wrote only {wrote} of {want} bytes of the jail binary")]
    WriteTruncated { wrote: usize, want: usize },
    #[error("sandbox name contains an interior NUL: {0}")]
    NameNotCString(#[from] std::ffi::NulError),
    #[error("fexecve failed: {0}")]
    Exec(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// True if a real jail binary was linked in at build time.
pub fn available() -> bool {
    !EXE_DATA.is_empty()
}

fn create_fd() -> Result<RawFd> {
    if !available() {
        return Err(Error::Unavailable);
    }
    let name = CString::new("scriptcage-jail").unwrap();
    // Safe: name is a valid, NUL-terminated C string; return value is checked.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC as libc::c_uint) };
    if fd < 0 {
        return Err(Error::CreateFd(base::Error::last()));
    }
    // Safe: fd was just created above and is not yet aliased; pointer/len describe the
    // static embedded byte slice.
    let written = unsafe {
        libc::write(
            fd,
            EXE_DATA.as_ptr() as *const libc::c_void,
            EXE_DATA.len(),
        )
    };
    if written < 0 {
        let err = base::Error::last();
        // Safe: fd is uniquely owned by this function up to this point.
        unsafe { libc::close(fd) };
        return Err(Error::Write(err));
    }
    if written as usize != EXE_DATA.len() {
        // Safe: fd is uniquely owned by this function up to this point.
        unsafe { libc::close(fd) };
        return Err(Error::WriteTruncated {
            wrote: written as usize,
            want: EXE_DATA.len(),
        });
    }
    Ok(fd)
}

/// Execs the embedded jail binary in the current process, passing `options_fd`'s number
/// as `argv[1]`. Never returns on success; `options_fd` must remain open (not
/// `FD_CLOEXEC`) across this call since the jail reads it right after exec.
pub fn exec(name: &str, options_fd: RawFd) -> Error {
    let fd = match create_fd() {
        Ok(fd) => fd,
        Err(e) => return e,
    };

    let name = match CString::new(name) {
        Ok(n) => n,
        Err(e) => return Error::NameNotCString(e),
    };
    let options_fd_str = match CString::new(options_fd.to_string()) {
        Ok(s) => s,
        Err(e) => return Error::NameNotCString(e),
    };
    let argv: [*const libc::c_char; 3] = [name.as_ptr(), options_fd_str.as_ptr(), std::ptr::null()];

    // Safe: fd names a just-written, executable memfd; argv is NUL-terminated and its
    // backing CStrings outlive this call. fexecve only returns on failure.
    unsafe {
        libc::fexecve(fd, argv.as_ptr(), environ);
    }
    Error::Exec(base::Error::last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_unavailable_without_embedded_bytes() {
        // This build's SCRIPTCAGE_JAIL_BIN_PATH placeholder is empty unless a real jail
        // binary was configured at build time.
        assert_eq!(available(), !EXE_DATA.is_empty());
    }
}
