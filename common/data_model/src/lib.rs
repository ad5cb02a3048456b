// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Plain-old-data wrappers shared by the wire-format structs in `ipc` and `shmem`.

use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Asserts at compile time that `$t` has exactly `$sz` bytes, catching accidental padding
/// in `#[repr(C)]` wire structs before it ever reaches a socket.
#[macro_export]
macro_rules! static_assert_size {
    ($t:ty, $sz:expr) => {
        const _: () = assert!(
            ::std::mem::size_of::<$t>() == $sz,
            concat!(stringify!($t), " size mismatch")
        );
    };
}

/// Casts `val` to its raw byte representation. Panics (via the `AsBytes` contract) only if
/// `T` is not actually POD, which is a compile-time property enforced by the trait bound.
pub fn as_bytes<T: AsBytes>(val: &T) -> &[u8] {
    val.as_bytes()
}

/// Reinterprets a byte slice as `&T`, returning `None` if the length doesn't match or the
/// alignment is wrong.
pub fn ref_from_bytes<T: FromBytes>(bytes: &[u8]) -> Option<&T> {
    if bytes.len() != size_of::<T>() {
        return None;
    }
    T::ref_from(bytes)
}

/// Builds a zeroed `T`, for messages where only a prefix is meaningfully populated before
/// the whole struct is sent.
pub fn zeroed<T: FromZeroes>() -> T {
    T::new_zeroed()
}
