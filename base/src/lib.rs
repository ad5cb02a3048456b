// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Ambient primitives shared by every process tier (host, jail, subjail):
//! descriptor ownership, errno-backed results, and logging setup.

mod descriptor;
mod errno;
pub mod logging;

pub mod sys;

pub use descriptor::{AsRawDescriptor, Descriptor, FromRawDescriptor, IntoRawDescriptor, SafeDescriptor};
pub use errno::{errno_result, Error, Result};
pub use sys::unix::*;

pub use log::*;
