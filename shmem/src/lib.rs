// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An anonymous, resizable, sealable shared-memory arena addressed by virtual pointers
//! (byte offset + 1; zero is reserved for null) so that remapping on resize never
//! invalidates an in-flight message's pointers.
//!
//! Typical lifecycle: the producer creates an [`Arena`], bump-allocates
//! [`Variant`](ArenaValue) records into it, [`Arena::sync`]s to remap at the current
//! size, then [`Arena::seal`]s it read-only before handing the fd to the consumer. The
//! consumer opens the same fd with [`Arena::from_fd`] and resolves virtual pointers with
//! [`Arena::read`], which bounds-checks every access against the occupied cursor.

use std::ffi::CString;
use std::num::NonZeroU64;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use base::{FromRawDescriptor, IntoRawDescriptor, SafeDescriptor};

/// Initial arena capacity in bytes. Matches the upper bound of a handful of call
/// arguments, so most scripts never trigger a resize.
pub const INITIAL_CAPACITY: usize = 1024;

const HEADER_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("memfd_create failed: {0}")]
    CreateFailed(base::Error),
    #[error("ftruncate failed: {0}")]
    TruncateFailed(base::Error),
    #[error("mmap failed: {0}")]
    MapFailed(base::Error),
    #[error("mremap failed: {0}")]
    RemapFailed(base::Error),
    #[error("fcntl(F_ADD_SEALS) failed: {0}")]
    SealFailed(base::Error),
    #[error("lseek failed: {0}")]
    SeekFailed(base::Error),
    #[error("requested allocation would exceed addressable arena size")]
    TooLarge,
    #[error("pointer/size pair resolves outside the occupied region")]
    OutOfBounds,
    #[error("arena is sealed read-only")]
    Sealed,
    #[error("unknown variant tag {0} read from arena")]
    UnknownTag(u8),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A virtual pointer into an [`Arena`]: byte offset + 1. Zero is never a valid value,
/// which is how [`Arena`] APIs represent "no value" as `None` at no extra storage cost.
pub type VirtPtr = NonZeroU64;

fn vp_from_offset(offset: usize) -> Result<VirtPtr> {
    VirtPtr::new(offset as u64 + 1).ok_or(Error::TooLarge)
}

fn offset_from_vp(vp: VirtPtr) -> usize {
    (vp.get() - 1) as usize
}

/// A value stored in the arena: the same tagged shape IPC messages use for host/script
/// values, placed here so arguments and return values can be passed by virtual pointer
/// instead of by value in the fixed-size message itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ArenaValue {
    Nil,
    Int(i64),
    Double(f64),
    String(String),
}

pub struct Arena {
    fd: SafeDescriptor,
    ptr: *mut u8,
    size: usize,
    occupied: usize,
    sealed: bool,
    writable: bool,
}

// The arena's raw pointer refers to a memory-mapped fd, not thread-local state; callers
// are responsible for not mutating concurrently from multiple threads, the same
// discipline required of any `&mut` API.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates a fresh, writable arena backed by a new anonymous, sealable memfd.
    pub fn new() -> Result<Arena> {
        let name = CString::new("scriptcage-arena").unwrap();
        // Safe: name is a valid NUL-terminated C string and we check the return value.
        let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
        if fd < 0 {
            return Err(Error::CreateFailed(base::Error::last()));
        }
        // Safe: fd was just created and is uniquely owned here.
        let fd = unsafe { SafeDescriptor::from_raw_descriptor(fd) };
        truncate(fd.as_raw_fd(), INITIAL_CAPACITY)?;
        let ptr = map(fd.as_raw_fd(), INITIAL_CAPACITY, true)?;
        Ok(Arena {
            fd,
            ptr,
            size: INITIAL_CAPACITY,
            occupied: 0,
            sealed: false,
            writable: true,
        })
    }

    /// Opens an existing arena fd (received over IPC) for reading. If `writable` is
    /// true the mapping is `PROT_READ|PROT_WRITE` (used by a subjail that still needs to
    /// grow the arena it was handed, e.g. to write a return value); otherwise it's
    /// mapped `PROT_READ` only, matching the sealed state the producer leaves it in.
    pub fn from_fd(fd: SafeDescriptor, occupied: usize, writable: bool) -> Result<Arena> {
        let size = file_size(fd.as_raw_fd())?;
        let ptr = map(fd.as_raw_fd(), size, writable)?;
        Ok(Arena {
            fd,
            ptr,
            size,
            occupied,
            sealed: !writable,
            writable,
        })
    }

    pub fn occupied(&self) -> usize {
        self.occupied
    }

    /// Bump-allocates `size` bytes, doubling capacity (and remapping via `MREMAP_MAYMOVE`)
    /// as many times as needed for the allocation to fit.
    pub fn alloc(&mut self, size: usize) -> Result<VirtPtr> {
        if self.sealed || !self.writable {
            return Err(Error::Sealed);
        }
        let start = self.occupied;
        let end = start.checked_add(size).ok_or(Error::TooLarge)?;
        if end > self.size {
            let mut new_size = self.size.max(1);
            while new_size < end {
                new_size = new_size.checked_mul(2).ok_or(Error::TooLarge)?;
            }
            self.resize(new_size)?;
        }
        self.occupied = end;
        vp_from_offset(start)
    }

    fn resize(&mut self, new_size: usize) -> Result<()> {
        truncate(self.fd.as_raw_fd(), new_size)?;
        // Safe: self.ptr is a live mapping of self.fd sized self.size; MREMAP_MAYMOVE
        // lets the kernel relocate it, and we adopt whatever address it returns.
        let new_ptr = unsafe {
            libc::mremap(
                self.ptr as *mut libc::c_void,
                self.size,
                new_size,
                libc::MREMAP_MAYMOVE,
            )
        };
        if new_ptr == libc::MAP_FAILED {
            return Err(Error::RemapFailed(base::Error::last()));
        }
        self.ptr = new_ptr as *mut u8;
        self.size = new_size;
        Ok(())
    }

    /// Remaps to exactly the current occupied size. Producers call this right before
    /// [`Arena::seal`] so the consumer's `from_fd` sees a file sized to its contents.
    pub fn sync(&mut self) -> Result<()> {
        truncate(self.fd.as_raw_fd(), self.occupied.max(1))?;
        // Safe: see resize().
        let new_ptr = unsafe {
            libc::mremap(
                self.ptr as *mut libc::c_void,
                self.size,
                self.occupied.max(1),
                libc::MREMAP_MAYMOVE,
            )
        };
        if new_ptr == libc::MAP_FAILED {
            return Err(Error::RemapFailed(base::Error::last()));
        }
        self.ptr = new_ptr as *mut u8;
        self.size = self.occupied.max(1);
        Ok(())
    }

    /// Re-derives size and occupied from the underlying fd's current length and remaps,
    /// picking up growth written by a peer holding the same memfd (e.g. a subjail that
    /// wrote a return value into an arena after this side already mapped it). Unlike
    /// [`Arena::sync`], which a producer uses to shrink its own view down to exactly what
    /// it itself wrote, `refresh` trusts the fd's actual length over this side's stale
    /// `occupied` count.
    pub fn refresh(&mut self) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        let new_size = file_size(self.fd.as_raw_fd())?;
        // Safe: see resize().
        let new_ptr = unsafe {
            libc::mremap(
                self.ptr as *mut libc::c_void,
                self.size,
                new_size.max(1),
                libc::MREMAP_MAYMOVE,
            )
        };
        if new_ptr == libc::MAP_FAILED {
            return Err(Error::RemapFailed(base::Error::last()));
        }
        self.ptr = new_ptr as *mut u8;
        self.size = new_size.max(1);
        self.occupied = new_size;
        Ok(())
    }

    /// Forbids further grow/shrink/write on the underlying fd, then remaps this
    /// process's own view `PROT_READ`. After sealing the fd can be handed to a
    /// consumer that must not be able to corrupt memory the producer still trusts.
    pub fn seal(&mut self) -> Result<()> {
        let seals = libc::F_SEAL_SEAL | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE;
        // Safe: self.fd is a valid memfd and we check the return value.
        let ret = unsafe { libc::fcntl(self.fd.as_raw_fd(), libc::F_ADD_SEALS, seals) };
        if ret < 0 {
            return Err(Error::SealFailed(base::Error::last()));
        }
        // Safe: unmapping our own prior mapping before remapping read-only.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        self.ptr = map(self.fd.as_raw_fd(), self.size, false)?;
        self.sealed = true;
        self.writable = false;
        Ok(())
    }

    /// Resolves `vp` to a byte slice of `size` bytes, bounds-checked against the
    /// occupied cursor — out-of-range pointers (or pointer+size overflowing it) fail
    /// rather than reading adjacent memory.
    pub fn real_bytes(&self, vp: VirtPtr, size: usize) -> Result<&[u8]> {
        let offset = offset_from_vp(vp);
        let end = offset.checked_add(size).ok_or(Error::OutOfBounds)?;
        if end > self.occupied {
            return Err(Error::OutOfBounds);
        }
        // Safe: [offset, end) was just checked to lie within the mapped, occupied region.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), size) })
    }

    fn real_bytes_mut(&mut self, vp: VirtPtr, size: usize) -> Result<&mut [u8]> {
        if !self.writable {
            return Err(Error::Sealed);
        }
        let offset = offset_from_vp(vp);
        let end = offset.checked_add(size).ok_or(Error::OutOfBounds)?;
        if end > self.occupied {
            return Err(Error::OutOfBounds);
        }
        // Safe: see real_bytes(); self.writable rules out a read-only mapping.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), size) })
    }

    /// Converts a real pointer previously returned by this arena's mapping back into a
    /// virtual pointer, bounds-checked the same way `real_bytes` is.
    pub fn virt_ptr_of(&self, real: *const u8, size: usize) -> Result<VirtPtr> {
        let base = self.ptr as usize;
        let addr = real as usize;
        if addr < base {
            return Err(Error::OutOfBounds);
        }
        let offset = addr - base;
        let end = offset.checked_add(size).ok_or(Error::OutOfBounds)?;
        if end > self.occupied {
            return Err(Error::OutOfBounds);
        }
        vp_from_offset(offset)
    }

    fn push_variant(&mut self, tag: u8, int_value: i64, double_value: f64, bytes: &[u8]) -> Result<VirtPtr> {
        let total = HEADER_SIZE + bytes.len();
        let vp = self.alloc(total)?;
        let slot = self.real_bytes_mut(vp, total)?;
        slot[0] = tag;
        slot[1..8].fill(0);
        slot[8..16].copy_from_slice(&int_value.to_ne_bytes());
        slot[16..24].copy_from_slice(&double_value.to_ne_bytes());
        slot[24..28].copy_from_slice(&(bytes.len() as u32).to_ne_bytes());
        slot[28..32].fill(0);
        slot[HEADER_SIZE..].copy_from_slice(bytes);
        Ok(vp)
    }

    pub fn push_nil(&mut self) -> Result<VirtPtr> {
        self.push_variant(0, 0, 0.0, &[])
    }

    pub fn push_int(&mut self, v: i64) -> Result<VirtPtr> {
        self.push_variant(1, v, 0.0, &[])
    }

    pub fn push_double(&mut self, v: f64) -> Result<VirtPtr> {
        self.push_variant(2, 0, v, &[])
    }

    pub fn push_string(&mut self, s: &str) -> Result<VirtPtr> {
        self.push_variant(3, 0, 0.0, s.as_bytes())
    }

    /// Reads a [`Variant`](ArenaValue) record previously written by `push_*`, checking
    /// the tag and the record's string length against the occupied region.
    pub fn read(&self, vp: VirtPtr) -> Result<ArenaValue> {
        let header = self.real_bytes(vp, HEADER_SIZE)?;
        let tag = header[0];
        let int_value = i64::from_ne_bytes(header[8..16].try_into().unwrap());
        let double_value = f64::from_ne_bytes(header[16..24].try_into().unwrap());
        let string_len = u32::from_ne_bytes(header[24..28].try_into().unwrap()) as usize;

        Ok(match tag {
            0 => ArenaValue::Nil,
            1 => ArenaValue::Int(int_value),
            2 => ArenaValue::Double(double_value),
            3 => {
                let full = self.real_bytes(vp, HEADER_SIZE + string_len)?;
                ArenaValue::String(String::from_utf8_lossy(&full[HEADER_SIZE..]).into_owned())
            }
            other => return Err(Error::UnknownTag(other)),
        })
    }
}

impl AsRawFd for Arena {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Arena {
    /// Consumes this arena, handing back ownership of its fd (e.g. to attach as
    /// ancillary data on an outgoing `ScriptCall`).
    pub fn into_raw_fd(self) -> RawFd {
        let mut this = std::mem::ManuallyDrop::new(self);
        let ptr = this.ptr;
        let size = this.size;
        // Safe: `this` is wrapped in ManuallyDrop so its destructor (which would also
        // unmap `ptr`) never runs; we read the fd out exactly once and never touch it
        // through `this` again.
        let fd = unsafe { std::ptr::read(&mut this.fd) };
        let fd = fd.into_raw_descriptor();
        // Safe: unmapping this process's own mapping; the fd itself survives, now owned
        // by the caller.
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, size);
        }
        fd
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Safe: self.ptr is a live mapping uniquely owned by this Arena.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

fn truncate(fd: RawFd, size: usize) -> Result<()> {
    // Safe: fd is a valid, writable memfd and we check the return value.
    let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if ret < 0 {
        return Err(Error::TruncateFailed(base::Error::last()));
    }
    Ok(())
}

fn file_size(fd: RawFd) -> Result<usize> {
    // Safe: fd is a valid fd and we check the return value.
    let size = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
    if size < 0 {
        return Err(Error::SeekFailed(base::Error::last()));
    }
    Ok(size as usize)
}

fn map(fd: RawFd, size: usize, writable: bool) -> Result<*mut u8> {
    let prot = if writable {
        libc::PROT_READ | libc::PROT_WRITE
    } else {
        libc::PROT_READ
    };
    // Safe: fd refers to a memfd of at least `size` bytes and we check for MAP_FAILED.
    let ptr = unsafe { libc::mmap(ptr::null_mut(), size.max(1), prot, libc::MAP_SHARED, fd, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(Error::MapFailed(base::Error::last()));
    }
    Ok(ptr as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_round_trips() {
        let mut arena = Arena::new().unwrap();
        let i = arena.push_int(42).unwrap();
        let d = arena.push_double(2.5).unwrap();
        let s = arena.push_string("hello").unwrap();
        assert_eq!(arena.read(i).unwrap(), ArenaValue::Int(42));
        assert_eq!(arena.read(d).unwrap(), ArenaValue::Double(2.5));
        assert_eq!(arena.read(s).unwrap(), ArenaValue::String("hello".into()));
    }

    #[test]
    fn allocation_past_initial_capacity_triggers_resize() {
        let mut arena = Arena::new().unwrap();
        let big = "x".repeat(INITIAL_CAPACITY * 3);
        let vp = arena.push_string(&big).unwrap();
        assert_eq!(arena.read(vp).unwrap(), ArenaValue::String(big));
    }

    #[test]
    fn pointers_past_occupied_are_out_of_bounds() {
        let mut arena = Arena::new().unwrap();
        let vp = arena.push_int(1).unwrap();
        // Within occupied: fine.
        assert!(arena.real_bytes(vp, HEADER_SIZE).is_ok());
        // One byte past occupied: must fail, not read adjacent unallocated memory.
        assert!(arena.real_bytes(vp, HEADER_SIZE + 1).is_err());
    }

    #[test]
    fn sealed_arena_rejects_further_allocation() {
        let mut arena = Arena::new().unwrap();
        arena.push_int(1).unwrap();
        arena.sync().unwrap();
        arena.seal().unwrap();
        assert!(matches!(arena.push_int(2), Err(Error::Sealed)));
    }

    #[test]
    fn consumer_can_read_a_sealed_handoff() {
        let mut producer = Arena::new().unwrap();
        let vp = producer.push_string("payload").unwrap();
        let occupied = producer.occupied();
        producer.sync().unwrap();
        producer.seal().unwrap();
        let fd = producer.into_raw_fd();
        // Safe: fd was just uniquely produced by into_raw_fd above.
        let handed_off = unsafe { SafeDescriptor::from_raw_descriptor(fd) };

        let consumer = Arena::from_fd(handed_off, occupied, false).unwrap();
        assert_eq!(
            consumer.read(vp).unwrap(),
            ArenaValue::String("payload".into())
        );
    }
}
