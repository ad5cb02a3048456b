// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Process-wide logging setup shared by the host, jail, and subjail binaries.
//!
//! Each process tier calls [`init`] once at startup with a tag identifying which
//! tier is logging (`"host"`, `"jail"`, `"subjail"`), so interleaved stderr from
//! the process tree stays attributable.

use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes `env_logger` with a format that prefixes every line with `tag` and
/// the process id. Safe to call more than once; only the first call takes effect.
pub fn init(tag: &'static str) {
    INIT.call_once(|| {
        let pid = std::process::id();
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .format(move |buf, record| {
            writeln!(
                buf,
                "{tag}[{pid}] {level}: {args}",
                tag = tag,
                pid = pid,
                level = record.level(),
                args = record.args()
            )
        })
        .init();
    });
}
