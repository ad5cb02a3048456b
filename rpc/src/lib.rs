// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host-side function registry and per-call frame marshalling.
//!
//! A script calls a host function by sending a [`ipc::Message::FunctionCall`] naming
//! remote (address, size) spans in its own address space for each argument plus the
//! return buffer; [`Frame::from_call`] gathers those bytes across the process boundary
//! with a single `process_vm_readv`, the registered handler runs under whatever lock its
//! [`Concurrency`] class demands, and [`Frame::write_back`] scatters the result with a
//! single `process_vm_writev`.

mod frame;
mod registry;

pub use frame::Frame;
pub use registry::{Concurrency, Handler, Registry};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no function named {0:?} is registered")]
    MissingFunction(String),
    #[error("call frame ({bytes} bytes) exceeds the {limit} byte sandbox frame limit")]
    FrameTooLarge { bytes: usize, limit: usize },
    #[error("process_vm_readv failed: {0}")]
    ReadArgs(base::Error),
    #[error("process_vm_writev failed: {0}")]
    WriteReturn(base::Error),
    #[error("cannot register a function while {0} thread(s) still reference this registry")]
    RegistryInUse(usize),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
    #[error("call named more than 16 arguments")]
    TooManyArgs,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex};

    use ipc::{FunctionArg, FunctionOutcome, Message};

    use super::*;

    fn arg_of(val: &i64) -> FunctionArg {
        FunctionArg {
            addr: val as *const i64 as u64,
            size: std::mem::size_of::<i64>() as u64,
        }
    }

    #[test]
    fn missing_function_short_circuits() {
        let registry = Registry::new(4096);
        let call = Message::FunctionCall {
            name: "nope".into(),
            args: vec![],
            return_arg: FunctionArg { addr: 0, size: 0 },
        };
        let (reply, fd) = registry.dispatch(std::process::id() as libc::pid_t, &call);
        assert!(matches!(
            reply,
            Message::FunctionReturn {
                outcome: FunctionOutcome::Failed
            }
        ));
        assert!(fd.is_none());
    }

    #[test]
    fn doubles_an_in_process_argument() {
        let registry = Registry::new(4096);
        registry
            .register("double", Concurrency::ThreadSafe, |args, ret, _fd| {
                let v = i64::from_ne_bytes(args[0].try_into().unwrap());
                ret.copy_from_slice(&(v * 2).to_ne_bytes());
                Ok(())
            })
            .unwrap();

        let input: i64 = 21;
        let mut output: i64 = 0;
        let call = Message::FunctionCall {
            name: "double".into(),
            args: vec![arg_of(&input)],
            return_arg: FunctionArg {
                addr: &mut output as *mut i64 as u64,
                size: std::mem::size_of::<i64>() as u64,
            },
        };
        let (reply, fd) = registry.dispatch(std::process::id() as libc::pid_t, &call);
        assert!(matches!(
            reply,
            Message::FunctionReturn {
                outcome: FunctionOutcome::Ok
            }
        ));
        assert_eq!(output, 42);
        assert!(fd.is_none());
    }

    #[test]
    fn a_handler_may_set_a_return_fd() {
        let registry = Registry::new(4096);
        registry
            .register("open_something", Concurrency::ThreadSafe, |_args, _ret, fd| {
                *fd = Some(libc::STDIN_FILENO);
                Ok(())
            })
            .unwrap();

        let call = Message::FunctionCall {
            name: "open_something".into(),
            args: vec![],
            return_arg: FunctionArg { addr: 0, size: 0 },
        };
        let (reply, fd) = registry.dispatch(std::process::id() as libc::pid_t, &call);
        assert!(matches!(
            reply,
            Message::FunctionReturn {
                outcome: FunctionOutcome::Ok
            }
        ));
        assert_eq!(fd, Some(libc::STDIN_FILENO));
    }

    #[test]
    fn eight_concurrent_thread_safe_calls_produce_eight_ids() {
        let registry = Arc::new(Registry::new(4096));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = seen.clone();
            registry
                .register("record", Concurrency::ThreadSafe, move |args, _ret, _fd| {
                    let id = i64::from_ne_bytes(args[0].try_into().unwrap());
                    seen.lock().unwrap().push(id);
                    Ok(())
                })
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id: i64 = i;
                    let call = Message::FunctionCall {
                        name: "record".into(),
                        args: vec![arg_of(&id)],
                        return_arg: FunctionArg { addr: 0, size: 0 },
                    };
                    registry.dispatch(std::process::id() as libc::pid_t, &call)
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut ids = seen.lock().unwrap().clone();
        ids.sort();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn registration_fails_while_a_thread_reference_is_held() {
        let registry = Registry::new(4096);
        registry.acquire_thread_ref();
        let err = registry
            .register("f", Concurrency::ThreadSafe, |_, _, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, Error::RegistryInUse(1)));
        registry.release_thread_ref();
        registry
            .register("f", Concurrency::ThreadSafe, |_, _, _| Ok(()))
            .unwrap();
    }
}
