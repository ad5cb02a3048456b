// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sandbox options: constructed once by the controller, written to an anonymous
//! memfd, and read back by the jail process named by that fd's number in `argv[1]`.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::{FromRawFd, RawFd};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const NAME_MAX: usize = 256;
/// Sentinel for "no limit" in either `memory_limit_bytes` or
/// `functioncall_frame_limit_bytes`.
pub const NOLIMIT: u64 = 0;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sandbox name is longer than {NAME_MAX} bytes")]
    NameTooLong,
    #[error("failed to seek options fd: {0}")]
    Seek(std::io::Error),
    #[error("failed to read/write options fd: {0}")]
    Io(std::io::Error),
    #[error("options fd held a truncated record")]
    Truncated,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct RawOptions {
    name: [u8; NAME_MAX],
    memory_limit_bytes: u64,
    functioncall_frame_limit_bytes: u64,
    jail_ipc_sockfd: i32,
    _pad: u32,
}

/// Per-sandbox configuration, handed from the controller to the jail process across
/// an anonymous memfd rather than argv (keeps the name and limits out of `/proc/*/cmdline`).
#[derive(Debug, Clone)]
pub struct SandboxOptions {
    pub name: String,
    pub memory_limit_bytes: u64,
    pub functioncall_frame_limit_bytes: u64,
    /// Fd number of the jail's end of the controller<->jail IPC pair, valid only in the
    /// child process between fork and exec. Not meant to be set by callers constructing
    /// options for [`crate::options::SandboxOptions::write_to`] ahead of time; the
    /// sandbox controller overwrites it right before handing the options to the child.
    pub jail_ipc_sockfd: RawFd,
}

impl SandboxOptions {
    /// Convenience constructor for callers who don't yet know the IPC fd; equivalent to
    /// building the struct directly with `jail_ipc_sockfd: -1`.
    pub fn new(name: impl Into<String>, memory_limit_bytes: u64, functioncall_frame_limit_bytes: u64) -> SandboxOptions {
        SandboxOptions {
            name: name.into(),
            memory_limit_bytes,
            functioncall_frame_limit_bytes,
            jail_ipc_sockfd: -1,
        }
    }

    fn to_raw(&self) -> Result<RawOptions> {
        let mut name = [0u8; NAME_MAX];
        let bytes = self.name.as_bytes();
        if bytes.len() >= NAME_MAX {
            return Err(Error::NameTooLong);
        }
        name[..bytes.len()].copy_from_slice(bytes);
        Ok(RawOptions {
            name,
            memory_limit_bytes: self.memory_limit_bytes,
            functioncall_frame_limit_bytes: self.functioncall_frame_limit_bytes,
            jail_ipc_sockfd: self.jail_ipc_sockfd,
            _pad: 0,
        })
    }

    /// Writes this options record to `fd` at offset 0, per the sandbox lifecycle: the
    /// controller writes then seeks back to 0 before handing the fd number to the jail.
    pub fn write_to(&self, fd: RawFd) -> Result<()> {
        let raw = self.to_raw()?;
        // Safe: fd is caller-owned for the duration of this call; the File is
        // forgotten afterward so this does not take ownership or close it.
        let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
        file.seek(SeekFrom::Start(0)).map_err(Error::Seek)?;
        file.write_all(raw.as_bytes()).map_err(Error::Io)?;
        file.seek(SeekFrom::Start(0)).map_err(Error::Seek)?;
        Ok(())
    }

    /// Reads an options record back out of `fd`, as the jail process does on startup.
    pub fn read_from(fd: RawFd) -> Result<SandboxOptions> {
        // Safe: fd is caller-owned for the duration of this call; the File is
        // forgotten afterward so this does not take ownership or close it.
        let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
        file.seek(SeekFrom::Start(0)).map_err(Error::Seek)?;
        let mut buf = vec![0u8; std::mem::size_of::<RawOptions>()];
        file.read_exact(&mut buf).map_err(Error::Io)?;
        let raw = RawOptions::read_from(buf.as_slice()).ok_or(Error::Truncated)?;

        let name_end = raw.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        let name = String::from_utf8_lossy(&raw.name[..name_end]).into_owned();
        Ok(SandboxOptions {
            name,
            memory_limit_bytes: raw.memory_limit_bytes,
            functioncall_frame_limit_bytes: raw.functioncall_frame_limit_bytes,
            jail_ipc_sockfd: raw.jail_ipc_sockfd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn round_trips_through_a_memfd() {
        let memfd = tempfile::tempfile().unwrap();
        let fd = memfd.as_raw_fd();
        let mut options = SandboxOptions::new("demo", 1 << 20, 4096);
        options.jail_ipc_sockfd = 7;
        options.write_to(fd).unwrap();
        let read_back = SandboxOptions::read_from(fd).unwrap();
        assert_eq!(read_back.name, "demo");
        assert_eq!(read_back.memory_limit_bytes, 1 << 20);
        assert_eq!(read_back.functioncall_frame_limit_bytes, 4096);
        assert_eq!(read_back.jail_ipc_sockfd, 7);
    }

    #[test]
    fn name_longer_than_the_limit_is_rejected() {
        let options = SandboxOptions::new("x".repeat(NAME_MAX), 0, 0);
        assert!(matches!(options.to_raw(), Err(Error::NameTooLong)));
    }
}
