// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exercises `sandbox::Sandbox` setup. Full fork/exec/teardown round trips require a
//! real jail binary embedded at build time (`SCRIPTCAGE_JAIL_BIN`, see `build.rs`);
//! without one, `Sandbox::new` must fail fast rather than forking a child doomed to
//! exit immediately. This binary runs with `harness = false` so it stays consistent
//! with `jail`'s own fork-requiring test binary even though this particular test does
//! not itself fork.

use libtest_mimic::{Arguments, Trial};
use sandbox::sandbox::{Error, Sandbox};

fn new_fails_fast_without_an_embedded_jail_binary() {
    if sandbox::embedded_jail::available() {
        // A real jail binary is linked into this build; the fast-fail path this test
        // pins does not apply.
        return;
    }

    let options = jail::options::SandboxOptions::new("test", 1 << 20, 4096);
    let err = Sandbox::new(options).expect_err("sandbox::new should refuse to fork without a jail binary");
    assert!(matches!(
        err,
        Error::EmbeddedJail(sandbox::embedded_jail::Error::Unavailable)
    ));
}

fn main() {
    let args = Arguments::from_args();
    let tests = vec![Trial::test(
        "new_fails_fast_without_an_embedded_jail_binary",
        || {
            new_fails_fast_without_an_embedded_jail_binary();
            Ok(())
        },
    )];
    libtest_mimic::run(&args, tests).exit();
}
