// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resolves the path `embedded_jail.rs` feeds to `include_bytes!`: `SCRIPTCAGE_JAIL_BIN`
//! if the environment names one, otherwise an empty placeholder so the workspace still
//! builds without a circular dependency on the `jail` binary crate.

use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=SCRIPTCAGE_JAIL_BIN");

    let path = match env::var_os("SCRIPTCAGE_JAIL_BIN") {
        Some(path) => PathBuf::from(path),
        None => {
            let out_dir = PathBuf::from(env::var_os("OUT_DIR").unwrap());
            let placeholder = out_dir.join("jail-placeholder.bin");
            std::fs::write(&placeholder, []).expect("failed to write jail binary placeholder");
            placeholder
        }
    };

    println!("cargo:rerun-if-changed={}", path.display());
    println!(
        "cargo:rustc-env=SCRIPTCAGE_JAIL_BIN_PATH={}",
        path.display()
    );
}
