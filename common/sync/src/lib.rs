// Copyright 2021 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A `Mutex` that panics on lock poisoning instead of propagating it.
//!
//! Every lock site in this codebase treats a poisoned mutex as a fatal bug, not a
//! recoverable condition, so the ordinary `std::sync` API's `Result`-wrapped guards
//! would just be unwrapped at every call site anyway.

use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized> {
    inner: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(val: T) -> Self {
        Mutex {
            inner: StdMutex::new(val),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
