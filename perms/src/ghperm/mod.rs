// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The GHPERM textual policy format: a hand-written recursive-descent tokenizer,
//! parser, and writer over the grammar documented in [`parser`].

pub mod parser;
pub mod tokenizer;
pub mod writer;

pub use parser::{ParseError, Parser};
pub use writer::write_policy;
