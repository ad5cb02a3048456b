// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Entry point for the embedded jail executable. Invoked by the sandbox controller as
//! `jail <options-fd>`, with `<options-fd>` already open and readable in this process.

use std::os::unix::io::RawFd;

use ipc::{Channel, Message, Mode};
use jail::options::SandboxOptions;
use jail::{subjail, Error, Result};

fn read_options_fd() -> Result<RawFd> {
    let arg = std::env::args().nth(1).ok_or(Error::NoOptionsFd)?;
    arg.parse::<RawFd>()
        .map_err(|_| Error::OptionsFdParse(arg))
}

fn run() -> Result<()> {
    base::logging::init("jail");
    log::info!("started with pid {}", base::getpid());

    let options_fd = read_options_fd()?;
    let options = SandboxOptions::read_from(options_fd)?;
    log::info!("responsible for sandbox {:?}", options.name);

    jail::lockdown::lockdown(&options)?;
    log::info!("security policy in effect");

    let to_controller = Channel::from_raw(Mode::Child, options.jail_ipc_sockfd);

    let (hello, _fd) = to_controller.recv(ipc::NO_TIMEOUT)?;
    if !matches!(hello, Message::Hello { .. }) {
        return Err(Error::ExpectedHello(hello.tag()));
    }
    log::debug!("received hello from controller, entering steady state");

    let mut next_index: u32 = 0;
    loop {
        let (msg, fd) = to_controller.recv(ipc::NO_TIMEOUT)?;
        match msg {
            Message::NewSubjail => {
                let fd = fd.ok_or(ipc::Error::MissingControlData)?;
                let index = next_index;
                next_index += 1;
                // Safe: fd was just uniquely received as ancillary data on this message.
                let channel_fd = std::os::unix::io::IntoRawFd::into_raw_fd(fd);
                match subjail::spawn(index, channel_fd) {
                    Ok(pid) => log::debug!("forked subjail {index} as pid {pid}"),
                    Err(e) => log::error!("failed to fork subjail {index}: {e}"),
                }
                // The subjail now owns the only copy of channel_fd that matters; this
                // process's copy would otherwise keep the direct IPC pair from hanging
                // up once the controller and subjail are done with each other.
                // Safe: channel_fd was just uniquely received above and either handed
                // to a forked child (which has its own table entry) or, on spawn
                // failure, is otherwise leaked; either way this process must not keep
                // using it.
                unsafe {
                    libc::close(channel_fd);
                }
            }
            Message::Quit => {
                log::info!("received request to exit");
                break;
            }
            Message::Hello { .. } | Message::SubjailAlive { .. } => {
                return Err(Error::UnsupportedMessage(msg.tag()))
            }
            other => return Err(Error::UnknownMessage(other.tag())),
        }
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("jail: fatal: {e}");
        std::process::exit(1);
    }
}
