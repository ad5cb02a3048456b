// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The jail process: reads sandbox options from a handoff memfd, locks itself down
//! with `PR_SET_NO_NEW_PRIVS` + an optional rlimit + a seccomp allow-list, then forks
//! one subjail per `NewSubjail` request from its controller.

pub mod lockdown;
pub mod options;
pub mod subjail;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Options(#[from] options::Error),
    #[error(transparent)]
    Lockdown(#[from] lockdown::Error),
    #[error(transparent)]
    Ipc(#[from] ipc::Error),
    #[error("jail invoked without an options fd argument")]
    NoOptionsFd,
    #[error("argv[1] is not a valid fd number: {0:?}")]
    OptionsFdParse(String),
    #[error("controller's first message was {0:?}, expected Hello")]
    ExpectedHello(ipc::Tag),
    #[error("message type {0:?} is not valid at this tier")]
    UnsupportedMessage(ipc::Tag),
    #[error("received unknown message type {0:?}")]
    UnknownMessage(ipc::Tag),
}

pub type Result<T> = std::result::Result<T, Error>;
