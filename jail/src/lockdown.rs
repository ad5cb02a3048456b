// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Kernel lockdown applied once per jail, after options are read and before the
//! message loop runs: `PR_SET_NO_NEW_PRIVS`, an optional `RLIMIT_DATA` cap, then a
//! seccomp BPF allow-list. Any failure refuses the jail from entering its loop.
//!
//! `libc` doesn't carry the BPF/seccomp struct layouts or opcode constants (they come
//! from `linux/filter.h`/`linux/seccomp.h`/`linux/audit.h`, not glibc), so this module
//! defines the handful it needs directly.

use crate::options::SandboxOptions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("prctl(PR_SET_NO_NEW_PRIVS) failed: {0}")]
    NoNewPrivs(base::Error),
    #[error("setrlimit(RLIMIT_DATA) failed: {0}")]
    MemoryLimit(base::Error),
    #[error("prctl(PR_SET_SECCOMP) failed: {0}")]
    Seccomp(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(C)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const AUDIT_ARCH_X86_64: u32 = 0x8000_0000 | 62 /* EM_X86_64 */;

/// Byte offsets of `struct seccomp_data { int nr; __u32 arch; __u64 instruction_pointer;
/// __u64 args[6]; }` on x86_64: `nr` first, `arch` immediately after as the next u32.
const SECCOMP_DATA_NR_OFFSET: u32 = 0;
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;

const PR_SET_SECCOMP: libc::c_int = 22;
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

/// The allow-listed syscall numbers (x86_64), in the same fixed order as the jail's
/// BPF program: every other syscall number falls through to `SECCOMP_RET_KILL_PROCESS`.
const ALLOWED_SYSCALLS: &[i64] = &[
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_munmap,
    libc::SYS_msync,
    libc::SYS_fstat,
    libc::SYS_gettid,
    libc::SYS_getpid,
    libc::SYS_recvfrom,
    libc::SYS_recvmsg,
    libc::SYS_sendto,
    libc::SYS_clock_nanosleep,
    libc::SYS_getrandom,
    libc::SYS_brk,
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_exit,
    libc::SYS_exit_group,
];

fn stmt(code: u16, k: u32) -> SockFilter {
    SockFilter { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

fn build_filter() -> Vec<SockFilter> {
    let mut filter = vec![
        // Kill the process outright on an architecture mismatch.
        stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_ARCH_OFFSET),
        jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_X86_64, 1, 0),
        stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS),
        stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR_OFFSET),
    ];

    let n = ALLOWED_SYSCALLS.len();
    for (i, &syscall_nr) in ALLOWED_SYSCALLS.iter().enumerate() {
        // jt counts down to the final ALLOW statement, which sits right after the
        // trailing KILL_PROCESS statement.
        let jt = (n - i) as u8;
        filter.push(jump(BPF_JMP | BPF_JEQ | BPF_K, syscall_nr as u32, jt, 0));
    }
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));
    filter.push(stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    filter
}

/// Installs the jail's security posture: no-new-privs, an optional data-segment
/// rlimit, then the seccomp filter. Order matters: seccomp is installed last so a
/// failure in an earlier step never leaves a half-locked-down process believing it's
/// fully sandboxed.
pub fn lockdown(options: &SandboxOptions) -> Result<()> {
    // Safe: PR_SET_NO_NEW_PRIVS takes no pointers; return value is checked.
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(Error::NoNewPrivs(base::Error::last()));
    }

    if options.memory_limit_bytes != crate::options::NOLIMIT {
        let limit = libc::rlimit {
            rlim_cur: options.memory_limit_bytes,
            rlim_max: options.memory_limit_bytes,
        };
        // Safe: limit is a valid, fully-initialized rlimit; return value is checked.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_DATA, &limit) };
        if ret != 0 {
            return Err(Error::MemoryLimit(base::Error::last()));
        }
    }

    let filter = build_filter();
    let prog = SockFprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };
    // Safe: prog.filter points at `filter`, which outlives this call; return value is
    // checked.
    let ret = unsafe { libc::prctl(PR_SET_SECCOMP, SECCOMP_MODE_FILTER, &prog) };
    if ret != 0 {
        return Err(Error::Seccomp(base::Error::last()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_program_ends_with_kill_then_allow() {
        let filter = build_filter();
        let last_two: Vec<u32> = filter[filter.len() - 2..].iter().map(|s| s.k).collect();
        assert_eq!(last_two, vec![SECCOMP_RET_KILL_PROCESS, SECCOMP_RET_ALLOW]);
    }

    #[test]
    fn every_allowed_syscall_gets_a_jump_instruction() {
        let filter = build_filter();
        // 4 header instructions + one jump per allowed syscall + 2 trailing returns.
        assert_eq!(filter.len(), 4 + ALLOWED_SYSCALLS.len() + 2);
    }
}
