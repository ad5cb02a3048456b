// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ipc::{FunctionOutcome, Message};
use sync::Mutex;

use crate::frame::Frame;
use crate::{Error, Result};

/// How a registered function may be called concurrently with itself and with other
/// registered functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// May run concurrently with any other call, including itself; the handler is
    /// responsible for its own internal synchronization.
    ThreadSafe,
    /// Serialized against concurrent invocations of the same function via a
    /// per-function mutex; unrelated functions may still run concurrently.
    ThreadUnsafeLocal,
    /// Serialized against every other `ThreadUnsafeGlobal` call in the registry via one
    /// registry-wide mutex.
    ThreadUnsafeGlobal,
}

/// A host-side function body: reads each argument as a byte slice, writes its result
/// into the return buffer, optionally sets a return fd to hand back to the caller, and
/// reports success or a short failure message.
pub type Handler = dyn Fn(&[&[u8]], &mut [u8], &mut Option<RawFd>) -> std::result::Result<(), String>
    + Send
    + Sync;

pub struct Function {
    pub name: String,
    pub concurrency: Concurrency,
    pub(crate) handler: Box<Handler>,
    local_lock: Mutex<()>,
}

/// The set of host functions a script may call, shared by every [`Thread`] (in the
/// `sandbox` crate) spawned from one sandbox. Mutation is gated by a live-thread
/// reference count: once any thread references the registry, `register` fails rather
/// than racing a concurrent caller reading the function list.
pub struct Registry {
    functions: Mutex<Vec<Arc<Function>>>,
    global_lock: Mutex<()>,
    live_threads: AtomicUsize,
    frame_limit_bytes: usize,
}

impl Registry {
    pub fn new(frame_limit_bytes: usize) -> Registry {
        Registry {
            functions: Mutex::new(Vec::new()),
            global_lock: Mutex::new(()),
            live_threads: AtomicUsize::new(0),
            frame_limit_bytes,
        }
    }

    /// Registers `name` with the given concurrency class and handler body. Fails while
    /// any thread still references this registry.
    pub fn register<F>(&self, name: impl Into<String>, concurrency: Concurrency, handler: F) -> Result<()>
    where
        F: Fn(&[&[u8]], &mut [u8], &mut Option<RawFd>) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        let live = self.live_threads.load(Ordering::SeqCst);
        if live != 0 {
            return Err(Error::RegistryInUse(live));
        }
        self.functions.lock().push(Arc::new(Function {
            name: name.into(),
            concurrency,
            handler: Box::new(handler),
            local_lock: Mutex::new(()),
        }));
        Ok(())
    }

    fn find(&self, name: &str) -> Option<Arc<Function>> {
        self.functions
            .lock()
            .iter()
            .find(|f| f.name == name)
            .cloned()
    }

    /// Called when a `Thread` attaches to this registry, before it can receive any
    /// `FunctionCall`. Blocks future `register` calls until the matching
    /// `release_thread_ref`.
    pub fn acquire_thread_ref(&self) {
        self.live_threads.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_thread_ref(&self) {
        self.live_threads.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn frame_limit_bytes(&self) -> usize {
        self.frame_limit_bytes
    }

    /// Handles one `FunctionCall` message from a subjail owned by process `remote_pid`,
    /// returning the `FunctionReturn` to send back plus the return fd, if any, the
    /// caller should attach to it. A call naming an unregistered function short-circuits
    /// to a failure response rather than propagating an error, so the caller is never
    /// left waiting.
    pub fn dispatch(&self, remote_pid: libc::pid_t, call: &Message) -> (Message, Option<RawFd>) {
        let (name, args, return_arg) = match call {
            Message::FunctionCall {
                name,
                args,
                return_arg,
            } => (name, args, return_arg),
            _ => {
                return (
                    Message::FunctionReturn {
                        outcome: FunctionOutcome::Failed,
                    },
                    None,
                )
            }
        };

        let function = match self.find(name) {
            Some(f) => f,
            None => {
                log::warn!("rpc: call to unregistered function {name:?}");
                return (
                    Message::FunctionReturn {
                        outcome: FunctionOutcome::Failed,
                    },
                    None,
                );
            }
        };

        let mut frame = match Frame::from_call(remote_pid, args, *return_arg, self.frame_limit_bytes) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("rpc: failed to construct frame for {name:?}: {e}");
                return (
                    Message::FunctionReturn {
                        outcome: FunctionOutcome::Failed,
                    },
                    None,
                );
            }
        };

        let outcome = match function.concurrency {
            Concurrency::ThreadSafe => frame.invoke(&function),
            Concurrency::ThreadUnsafeLocal => {
                let _guard = function.local_lock.lock();
                frame.invoke(&function)
            }
            Concurrency::ThreadUnsafeGlobal => {
                let _guard = self.global_lock.lock();
                frame.invoke(&function)
            }
        };

        let (outcome, return_fd) = match outcome {
            Ok(()) => match frame.write_back() {
                Ok(()) => (FunctionOutcome::Ok, frame.take_return_fd()),
                Err(e) => {
                    log::warn!("rpc: failed to write back return value for {name:?}: {e}");
                    (FunctionOutcome::Failed, None)
                }
            },
            Err(e) => {
                log::debug!("rpc: handler {name:?} failed: {e}");
                (FunctionOutcome::Failed, None)
            }
        };

        (Message::FunctionReturn { outcome }, return_fd)
    }
}
