// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-upper-bound, fd-passing message channel connecting the host, jail, and
//! subjail process tiers.

mod channel;
mod message;

pub use channel::{Channel, Error, Mode, Result, NO_TIMEOUT};
pub use message::{
    FunctionArg, FunctionOutcome, Message, ScriptOutcome, Tag, Variant, MAXSIZE, MAX_PARAMS,
};
