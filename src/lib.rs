// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Embeds an untrusted scripting language in a host process behind a jail/subjail
//! process boundary.
//!
//! A host builds an [`Engine`] around [`jail::options::SandboxOptions`], registers the
//! host functions scripts are allowed to call on its [`rpc::Registry`], then spawns one
//! [`sandbox::Thread`] per script interpreter instance it wants running. Each thread
//! gets its own [`perms::Perms`] policy, loaded from GHPERM text via
//! [`perms::Perms::read_file`]/[`perms::Perms::readbuffer`], and its own subjail
//! process forked off the shared jail.
//!
//! ```no_run
//! use perms::prompter::{Decision, FixedPrompter};
//!
//! let engine = scriptcage::Engine::new(
//!     jail::options::SandboxOptions::new("demo", 1 << 24, 1 << 16),
//!     4096,
//! )?;
//! engine.registry().register("host_log", rpc::Concurrency::ThreadSafe, |args, _ret, _fd| {
//!     println!("script says: {:?}", args[0]);
//!     Ok(())
//! })?;
//! let thread = engine.spawn_thread(
//!     "main",
//!     "main",
//!     Box::new(FixedPrompter(Decision::RejectOnce)),
//!     ipc::NO_TIMEOUT,
//! )?;
//! thread.run_string_sync("host_log('hello')")?;
//! thread.quit()?;
//! engine.quit()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::sync::Arc;

pub use jail::options::SandboxOptions;
pub use perms::prompter;
pub use rpc::Concurrency;
pub use sandbox::{Callframe, ExitStatus, Notification, Thread};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sandbox(#[from] sandbox::sandbox::Error),
    #[error(transparent)]
    Thread(#[from] sandbox::thread::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A running jail plus the host function registry every thread spawned from it shares.
///
/// One `Engine` corresponds to one jailed process: all threads spawned from it are
/// subjails of that same jail and so share its memory limit and seccomp filter, but
/// each gets an independent permission policy and RPC call surface view.
pub struct Engine {
    sandbox: sandbox::Sandbox,
    registry: Arc<rpc::Registry>,
}

impl Engine {
    /// Forks and execs the embedded jail with `options`, and creates an empty function
    /// registry capped at `functioncall_frame_limit_bytes` per call (ordinarily the
    /// same value already carried in `options`; kept separate since the registry has
    /// no other dependency on `SandboxOptions`).
    pub fn new(options: SandboxOptions, functioncall_frame_limit_bytes: usize) -> Result<Engine> {
        let sandbox = sandbox::Sandbox::new(options)?;
        Ok(Engine {
            sandbox,
            registry: Arc::new(rpc::Registry::new(functioncall_frame_limit_bytes)),
        })
    }

    /// The function registry scripts call into. Register every host function before
    /// spawning the first thread: [`rpc::Registry::register`] fails once any thread
    /// holds a reference to it.
    pub fn registry(&self) -> &rpc::Registry {
        &self.registry
    }

    pub fn pid(&self) -> libc::pid_t {
        self.sandbox.pid()
    }

    /// Forks a subjail off this engine's jail and completes its handshake. `name` is a
    /// human-readable label; `safe_id` identifies the thread in contexts (logging,
    /// permission prompts) that must not leak `name` if it was script- or
    /// attacker-influenced. `default_timeout_ms` bounds how long
    /// [`Thread::process`](sandbox::Thread::process) waits for the subjail's next
    /// message; pass [`ipc::NO_TIMEOUT`] to block indefinitely.
    pub fn spawn_thread(
        &self,
        name: impl Into<String>,
        safe_id: impl Into<String>,
        prompter: Box<dyn prompter::Prompter>,
        default_timeout_ms: i32,
    ) -> Result<Thread> {
        let thread = sandbox::Thread::new(
            &self.sandbox,
            self.registry.clone(),
            prompter,
            name,
            safe_id,
            default_timeout_ms,
        )?;
        Ok(thread)
    }

    /// Sends `Quit` to the jail and waits for it to exit, force-killing past
    /// [`sandbox::sandbox::QUIT_TIMEOUT_MS`]. Any threads spawned from this engine
    /// should be quit first: a jail asked to quit while subjails are still attached
    /// will not wait for them.
    pub fn quit(self) -> Result<ExitStatus> {
        Ok(self.sandbox.quit()?)
    }
}
