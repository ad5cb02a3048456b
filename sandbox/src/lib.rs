// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The sandbox controller: owns the jail process and, through it, one or more
//! script-interpreter threads (subjails), each with its own permission policy and
//! host/script call surface.

pub mod embedded_jail;
pub mod sandbox;
pub mod thread;

pub use sandbox::{ExitStatus, Sandbox};
pub use thread::{Callframe, FunctionCallNotif, Notification, Thread};
