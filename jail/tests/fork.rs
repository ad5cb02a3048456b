// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exercises `jail::subjail::spawn`, which forks, so this binary runs with
//! `harness = false` (libtest-mimic drives it single-threaded instead).

use std::os::unix::io::AsRawFd;

use base::{pidfd_wait_or_force_kill, PidFd, WaitOutcome};
use ipc::{Channel, Message};
use libtest_mimic::{Arguments, Trial};

fn quit_after_hello_exits_cleanly() {
    let (controller, child) = Channel::pair().unwrap();
    let pid = jail::subjail::spawn(0, child.as_raw_fd()).unwrap();
    drop(child);

    let (alive, _fd) = controller.recv(2000).unwrap();
    assert!(matches!(alive, Message::SubjailAlive { index: 0, .. }));

    controller
        .send(&Message::Hello { pid: std::process::id() as i32 }, None)
        .unwrap();
    controller.send(&Message::Quit, None).unwrap();

    let pidfd = PidFd::open(pid).unwrap();
    let outcome = pidfd_wait_or_force_kill(&pidfd, 2000).unwrap();
    assert_eq!(outcome, WaitOutcome::Exited(0));
}

fn unsupported_message_after_hello_exits_nonzero() {
    let (controller, child) = Channel::pair().unwrap();
    let pid = jail::subjail::spawn(1, child.as_raw_fd()).unwrap();
    drop(child);

    let (alive, _fd) = controller.recv(2000).unwrap();
    assert!(matches!(alive, Message::SubjailAlive { index: 1, .. }));

    controller
        .send(&Message::Hello { pid: std::process::id() as i32 }, None)
        .unwrap();
    controller.send(&Message::NewSubjail, None).unwrap();

    let pidfd = PidFd::open(pid).unwrap();
    let outcome = pidfd_wait_or_force_kill(&pidfd, 2000).unwrap();
    assert_eq!(outcome, WaitOutcome::Exited(1));
}

fn hello_timeout_exits_nonzero() {
    let (controller, child) = Channel::pair().unwrap();
    let pid = jail::subjail::spawn(2, child.as_raw_fd()).unwrap();
    drop(child);

    let (alive, _fd) = controller.recv(2000).unwrap();
    assert!(matches!(alive, Message::SubjailAlive { index: 2, .. }));
    // Deliberately never send Hello: the subjail should time out and exit nonzero
    // rather than wait forever.

    let pidfd = PidFd::open(pid).unwrap();
    let outcome = pidfd_wait_or_force_kill(&pidfd, jail::subjail::HELLO_TIMEOUT_MS + 2000).unwrap();
    assert_eq!(outcome, WaitOutcome::Exited(1));
}

fn main() {
    let args = Arguments::from_args();
    let tests = vec![
        Trial::test("quit_after_hello_exits_cleanly", || {
            quit_after_hello_exits_cleanly();
            Ok(())
        }),
        Trial::test("unsupported_message_after_hello_exits_nonzero", || {
            unsupported_message_after_hello_exits_nonzero();
            Ok(())
        }),
        Trial::test("hello_timeout_exits_nonzero", || {
            hello_timeout_exits_nonzero();
            Ok(())
        }),
    ];
    libtest_mimic::run(&args, tests).exit();
}
