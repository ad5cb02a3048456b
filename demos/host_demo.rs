// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal host embedding a scripting interpreter: builds an engine, registers one
//! host function, runs a script string, then calls a script-defined function with a
//! [`Callframe`](scriptcage::Callframe).
//!
//! Requires a real jail binary embedded at build time (`SCRIPTCAGE_JAIL_BIN`, see
//! `sandbox/build.rs`); without one, `Engine::new` fails immediately with
//! [`sandbox::embedded_jail::Error::Unavailable`].

use scriptcage::prompter::TerminalPrompter;
use scriptcage::{Concurrency, Engine, SandboxOptions};

fn main() -> anyhow::Result<()> {
    base::logging::init("host");

    let options = SandboxOptions::new("host-demo", 1 << 24, 1 << 16);
    let engine = Engine::new(options, 1 << 16)?;

    engine
        .registry()
        .register("host_log", Concurrency::ThreadSafe, |args, _ret, _fd| {
            let msg = std::str::from_utf8(args[0]).unwrap_or("<invalid utf8>");
            println!("script: {msg}");
            Ok(())
        })
        .map_err(|e| anyhow::anyhow!("registering host_log failed: {e}"))?;

    let thread = engine.spawn_thread(
        "main",
        "main",
        Box::new(TerminalPrompter),
        ipc::NO_TIMEOUT,
    )?;

    thread.run_string_sync(
        r#"
            host_log("hello from the sandbox")
            function add(a, b)
                return a + b
            end
        "#,
    )?;

    let mut frame = scriptcage::Callframe::new()?;
    frame.push_int(2)?;
    frame.push_int(3)?;
    thread.call("add", &mut frame)?;
    println!("add(2, 3) = {:?}", frame.get_int());

    thread.quit()?;
    engine.quit()?;
    Ok(())
}
