// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exercises process-wait primitives that require an actual fork, so this binary
//! runs with `harness = false` (libtest-mimic drives it single-threaded instead).

use std::process::Command;
use std::time::Duration;

use base::{pidfd_wait_or_force_kill, PidFd, WaitOutcome};
use libtest_mimic::{Arguments, Trial};

fn exits_cleanly() {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id() as i32;
    let pidfd = PidFd::open(pid).expect("pidfd_open");
    let outcome = pidfd_wait_or_force_kill(&pidfd, 2000).expect("wait");
    assert_eq!(outcome, WaitOutcome::Exited(0));
    let _ = child.wait();
}

fn nonzero_exit_is_reported() {
    let mut child = Command::new("false").spawn().expect("spawn false");
    let pid = child.id() as i32;
    let pidfd = PidFd::open(pid).expect("pidfd_open");
    let outcome = pidfd_wait_or_force_kill(&pidfd, 2000).expect("wait");
    assert_eq!(outcome, WaitOutcome::Exited(1));
    let _ = child.wait();
}

fn wedged_child_is_force_killed() {
    let mut child = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");
    let pid = child.id() as i32;
    let pidfd = PidFd::open(pid).expect("pidfd_open");
    let outcome = pidfd_wait_or_force_kill(&pidfd, 200).expect("wait");
    assert_eq!(outcome, WaitOutcome::ForceKilled);
    let _ = child.wait();
}

fn killed_by_signal_is_reported() {
    let mut child = Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn sleep");
    let pid = child.id() as i32;
    // Safe: pid refers to the freshly spawned, uniquely owned child above.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    std::thread::sleep(Duration::from_millis(50));
    let pidfd = PidFd::open(pid).expect("pidfd_open");
    let outcome = pidfd_wait_or_force_kill(&pidfd, 2000).expect("wait");
    assert_eq!(outcome, WaitOutcome::Signalled(libc::SIGTERM));
    let _ = child.wait();
}

fn main() {
    let args = Arguments::from_args();
    let tests = vec![
        Trial::test("exits_cleanly", || {
            exits_cleanly();
            Ok(())
        }),
        Trial::test("nonzero_exit_is_reported", || {
            nonzero_exit_is_reported();
            Ok(())
        }),
        Trial::test("wedged_child_is_force_killed", || {
            wedged_child_is_force_killed();
            Ok(())
        }),
        Trial::test("killed_by_signal_is_reported", || {
            killed_by_signal_is_reported();
            Ok(())
        }),
    ];
    libtest_mimic::run(&args, tests).exit();
}
