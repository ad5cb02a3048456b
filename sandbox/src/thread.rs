// Copyright 2022 The Scriptcage Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A thread: one subjail, its direct IPC channel, its permission policy, and the script
//! instance running inside it. Constructed against a running [`Sandbox`](crate::Sandbox),
//! which still owns the jail that actually forks the subjail process.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use base::AsRawDescriptor;
use ipc::{Channel, Message};
use perms::Perms;

use crate::sandbox::{self, ExitStatus, Sandbox};

/// How long to wait for the subjail to announce itself after `NewSubjail` is sent.
pub const SUBJAIL_ALIVE_TIMEOUT_MS: i32 = 5000;
/// How long to wait for a script run or host-variable set to be acknowledged.
pub const SCRIPT_INFO_TIMEOUT_MS: i32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ipc error: {0}")]
    Ipc(#[from] ipc::Error),
    #[error("shared memory error: {0}")]
    Shmem(#[from] shmem::Error),
    #[error("creating the thread's direct ipc pair failed: {0}")]
    IpcCreate(ipc::Error),
    #[error("sending newsubjail to the jail failed: {0}")]
    SendNewSubjail(ipc::Error),
    #[error("timed out waiting for the subjail to announce itself")]
    SubjailAliveTimeout,
    #[error("expected subjailalive, received {0:?}")]
    ExpectedSubjailAlive(ipc::Tag),
    #[error("timed out waiting for scriptinfo")]
    ScriptInfoTimeout,
    #[error("expected scriptinfo, received {0:?}")]
    ExpectedScriptInfo(ipc::Tag),
    #[error("message type {0:?} is never valid for a thread to receive")]
    UnsupportedMessage(ipc::Tag),
    #[error("script run failed: {0}")]
    ScriptFailed(String),
    #[error("return value named a virtual pointer of zero")]
    NullReturnPointer,
    #[error("callframe holds at most {0} arguments")]
    TooManyArgs(usize),
    #[error("opening a pidfd for the subjail failed: {0}")]
    PidFd(base::Error),
    #[error("poll failed while waiting on the subjail: {0}")]
    Poll(base::Error),
    #[error("failed to kill the subjail after a setup failure: {0}")]
    KillAfterSetupFailure(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One message worth of progress reported back to the caller driving [`Thread::process`].
#[derive(Debug)]
pub enum Notification {
    FunctionCalled(FunctionCallNotif),
    ScriptResult {
        script_id: u64,
        outcome: ipc::ScriptOutcome,
    },
}

#[derive(Debug)]
pub struct FunctionCallNotif {
    pub name: String,
    pub outcome: ipc::FunctionOutcome,
}

/// A running subjail plus the host-side state needed to drive scripts and host/script
/// calls through it: its direct IPC channel, its permission policy, and a reference into
/// the sandbox-wide RPC registry scripts call back into.
pub struct Thread {
    ipc: Channel,
    pid: libc::pid_t,
    name: String,
    safe_id: String,
    rpc: Arc<rpc::Registry>,
    perms: Perms,
    default_timeout_ms: i32,
}

impl Thread {
    /// Asks the jail (through `sandbox`) to fork a new subjail, waits for it to announce
    /// itself, and completes its side of the handshake. `default_timeout_ms` governs how
    /// long [`Thread::process`] will wait for the next message once the thread is steady.
    pub fn new(
        sandbox: &Sandbox,
        rpc: Arc<rpc::Registry>,
        prompter: Box<dyn perms::prompter::Prompter>,
        name: impl Into<String>,
        safe_id: impl Into<String>,
        default_timeout_ms: i32,
    ) -> Result<Thread> {
        let name = name.into();
        let safe_id = safe_id.into();

        let (direct_controller, direct_child) = Channel::pair().map_err(Error::IpcCreate)?;

        sandbox
            .channel()
            .send(&Message::NewSubjail, Some(direct_child.as_raw_fd()))
            .map_err(Error::SendNewSubjail)?;
        // The subjail now owns the only copy of this fd that matters; our own copy would
        // otherwise keep the other end from ever seeing a hangup once we're done with it.
        drop(direct_child);

        let pid = match direct_controller.recv(SUBJAIL_ALIVE_TIMEOUT_MS) {
            Ok((Message::SubjailAlive { pid, .. }, _)) => pid,
            Ok((other, _)) => return Err(Error::ExpectedSubjailAlive(other.tag())),
            Err(ipc::Error::ReceiveTimeout) => return Err(Error::SubjailAliveTimeout),
            Err(e) => return Err(Error::Ipc(e)),
        };

        if let Err(e) = direct_controller.send(&Message::Hello { pid: base::getpid() }, None) {
            kill_and_reap(pid)?;
            return Err(Error::Ipc(e));
        }

        rpc.acquire_thread_ref();

        Ok(Thread {
            ipc: direct_controller,
            pid,
            name,
            safe_id,
            rpc,
            perms: Perms::new(prompter),
            default_timeout_ms,
        })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn safe_id(&self) -> &str {
        &self.safe_id
    }

    pub fn perms(&self) -> &Perms {
        &self.perms
    }

    pub fn perms_mut(&mut self) -> &mut Perms {
        &mut self.perms
    }

    /// Receives one message and acts on it. A script's function calls into the host
    /// arrive here and are dispatched through the RPC registry; script completions
    /// arrive here too and are handed back for the caller to reconcile by script id. Any
    /// other message a thread should never receive is a fatal protocol violation, not
    /// something to log and ignore.
    pub fn process(&self) -> Result<Notification> {
        let (msg, _fd) = self.ipc.recv(self.default_timeout_ms)?;
        match msg {
            Message::FunctionCall { ref name, .. } => {
                let name = name.clone();
                let (response, fd) = self.rpc.dispatch(self.pid, &msg);
                let response = match self.ipc.send(&response, fd) {
                    Ok(()) => response,
                    Err(ipc::Error::Send(e)) if fd.is_some() && e.errno() == libc::EBADF => {
                        log::warn!("function {name:?} return fd went stale before send, retrying without it");
                        let response = Message::FunctionReturn {
                            outcome: ipc::FunctionOutcome::InvalidFd,
                        };
                        self.ipc.send(&response, None)?;
                        response
                    }
                    Err(e) => return Err(Error::Ipc(e)),
                };
                let outcome = match response {
                    Message::FunctionReturn { outcome } => outcome,
                    _ => ipc::FunctionOutcome::Failed,
                };
                Ok(Notification::FunctionCalled(FunctionCallNotif { name, outcome }))
            }
            Message::ScriptResult { outcome, script_id } => {
                Ok(Notification::ScriptResult { script_id, outcome })
            }
            other => Err(Error::UnsupportedMessage(other.tag())),
        }
    }

    fn await_script_info(&self) -> Result<u64> {
        match self.ipc.recv(SCRIPT_INFO_TIMEOUT_MS) {
            Ok((Message::ScriptInfo { script_id }, _)) => Ok(script_id),
            Ok((other, _)) => Err(Error::ExpectedScriptInfo(other.tag())),
            Err(ipc::Error::ReceiveTimeout) => Err(Error::ScriptInfoTimeout),
            Err(e) => Err(Error::Ipc(e)),
        }
    }

    /// Processes messages until the `ScriptResult` for `script_id` arrives. Function
    /// calls and results for other, already-running scripts are handled in passing and
    /// otherwise dropped on the floor, same as the C original's sync helpers.
    fn sync_script(&self, script_id: u64) -> Result<ipc::ScriptOutcome> {
        loop {
            match self.process()? {
                Notification::ScriptResult { script_id: got, outcome } if got == script_id => {
                    return Ok(outcome)
                }
                _ => continue,
            }
        }
    }

    pub fn run_string(&self, content: impl Into<String>) -> Result<u64> {
        self.ipc
            .send(&Message::ScriptString { content: content.into() }, None)?;
        self.await_script_info()
    }

    pub fn run_file(
        &self,
        fd: base::SafeDescriptor,
        chunk_name: impl Into<String>,
    ) -> Result<u64> {
        self.ipc.send(
            &Message::ScriptFile { chunk_name: chunk_name.into() },
            Some(fd.as_raw_fd()),
        )?;
        self.await_script_info()
    }

    pub fn run_string_sync(&self, content: impl Into<String>) -> Result<ipc::ScriptOutcome> {
        let script_id = self.run_string(content)?;
        self.sync_script(script_id)
    }

    pub fn run_file_sync(
        &self,
        fd: base::SafeDescriptor,
        chunk_name: impl Into<String>,
    ) -> Result<ipc::ScriptOutcome> {
        let script_id = self.run_file(fd, chunk_name)?;
        self.sync_script(script_id)
    }

    fn set_host_variable(
        &self,
        name: impl Into<String>,
        table_index: Option<u32>,
        value: ipc::Variant,
    ) -> Result<()> {
        self.ipc.send(
            &Message::HostVariable { name: name.into(), table_index, value },
            None,
        )?;
        let script_id = self.await_script_info()?;
        self.sync_script(script_id)?;
        Ok(())
    }

    pub fn set_int(&self, name: impl Into<String>, v: i64) -> Result<()> {
        self.set_host_variable(name, None, ipc::Variant::Int(v))
    }

    pub fn set_double(&self, name: impl Into<String>, v: f64) -> Result<()> {
        self.set_host_variable(name, None, ipc::Variant::Double(v))
    }

    pub fn set_string(&self, name: impl Into<String>, v: impl Into<String>) -> Result<()> {
        self.set_host_variable(name, None, ipc::Variant::String(v.into()))
    }

    pub fn set_lstring(
        &self,
        name: impl Into<String>,
        table_index: u32,
        v: impl Into<String>,
    ) -> Result<()> {
        self.set_host_variable(name, Some(table_index), ipc::Variant::String(v.into()))
    }

    /// Sets an entire string table in one go, one `HostVariable` per entry, indices
    /// starting at 1 to match the script-side table convention.
    pub fn set_string_table(
        &self,
        name: impl Into<String>,
        entries: &[impl AsRef<str>],
    ) -> Result<()> {
        let name = name.into();
        for (i, entry) in entries.iter().enumerate() {
            self.set_lstring(name.clone(), (i + 1) as u32, entry.as_ref())?;
        }
        Ok(())
    }

    /// Invokes a script-defined function by name, passing `frame`'s already-pushed
    /// arguments, and loads its return value back into `frame`.
    pub fn call(&self, name: impl Into<String>, frame: &mut Callframe) -> Result<()> {
        let fdmem_occupied = frame.arena.occupied() as u64;
        let params = frame.params.clone();
        self.ipc.send(
            &Message::ScriptCall { name: name.into(), fdmem_occupied, params },
            Some(frame.arena.as_raw_fd()),
        )?;
        let script_id = self.await_script_info()?;
        let outcome = self.sync_script(script_id)?;
        frame.load_return_value(outcome)
    }

    /// Sends `Quit` and waits for the subjail to exit, force-killing it past
    /// [`sandbox::QUIT_TIMEOUT_MS`]. Consumes `self`; dropping a `Thread` without calling
    /// this does the same thing best-effort.
    pub fn quit(self) -> Result<ExitStatus> {
        self.request_quit()
    }

    fn request_quit(&self) -> Result<ExitStatus> {
        if let Err(e) = self.ipc.send(&Message::Quit, None) {
            log::debug!(
                "thread {}: quit send failed (subjail likely already gone): {e}",
                self.name
            );
        }
        self.wait_and_reap(sandbox::QUIT_TIMEOUT_MS)
    }

    /// Polls both the subjail's pidfd and its own IPC socket concurrently, servicing
    /// function calls that arrive while we wait so a script mid-call doesn't starve the
    /// deadline, force-killing once the wall-clock budget (tracked via [`Instant`], not
    /// re-armed per poll) runs out.
    fn wait_and_reap(&self, timeout_ms: i32) -> Result<ExitStatus> {
        let pidfd = base::PidFd::open(self.pid).map_err(Error::PidFd)?;
        let mut fds = [
            libc::pollfd { fd: pidfd.as_raw_descriptor(), events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: self.ipc.as_raw_fd(), events: libc::POLLIN, revents: 0 },
        ];
        let mut remaining = timeout_ms;

        loop {
            let start = Instant::now();
            // Safe: fds is a live array of two valid pollfd entries and the return value
            // is checked below.
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, remaining) };
            if ready < 0 {
                return Err(Error::Poll(base::Error::last()));
            }
            if ready == 0 {
                pidfd.send_signal(libc::SIGKILL).map_err(Error::PidFd)?;
                reap(&pidfd)?;
                return Ok(ExitStatus::ForceKilled);
            }
            if fds[0].revents != 0 {
                return reap(&pidfd);
            }
            if fds[1].fd >= 0 && fds[1].revents != 0 {
                if let Err(e) = self.process() {
                    log::debug!(
                        "thread {}: ipc error while waiting to quit, now polling its pidfd only: {e}",
                        self.name
                    );
                    fds[1].fd = -1;
                }
            }

            let elapsed = start.elapsed().as_millis() as i32;
            remaining = (remaining - elapsed).max(0);
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Err(e) = self.request_quit() {
            log::warn!("thread {}: cleanup on drop failed: {e}", self.name);
        }
        self.rpc.release_thread_ref();
    }
}

fn reap(pidfd: &base::PidFd) -> Result<ExitStatus> {
    // Safe: zero-initialized siginfo_t is a valid argument to waitid, which fills it in.
    let mut siginfo: libc::siginfo_t = unsafe { std::mem::zeroed() };
    base::syscall!(libc::waitid(
        libc::P_PIDFD,
        pidfd.as_raw_descriptor() as libc::id_t,
        &mut siginfo,
        libc::WEXITED
    ))
    .map_err(Error::Poll)?;
    let si_code = siginfo.si_code;
    // Safe: si_status() reads a union member valid for the CLD_* codes matched below.
    let si_status = unsafe { siginfo.si_status() };
    Ok(match si_code {
        libc::CLD_EXITED if si_status == 0 => ExitStatus::Clean,
        libc::CLD_EXITED => ExitStatus::NonZero(si_status),
        libc::CLD_KILLED | libc::CLD_DUMPED => ExitStatus::KilledBySignal(si_status),
        _ => ExitStatus::NonZero(si_status),
    })
}

fn kill_and_reap(pid: libc::pid_t) -> Result<()> {
    let pidfd = base::PidFd::open(pid).map_err(Error::PidFd)?;
    pidfd.send_signal(libc::SIGKILL).map_err(Error::KillAfterSetupFailure)?;
    reap(&pidfd)?;
    Ok(())
}

/// A shared-memory argument/return-value frame for a single [`Thread::call`].
///
/// Arguments are bump-allocated into the arena as they're pushed; each push also records
/// a virtual pointer in the up-to-16-slot parameter list sent alongside `ScriptCall`.
/// After a call completes, [`Callframe::get_int`]/[`get_double`](Callframe::get_double)/
/// [`get_string`](Callframe::get_string) expose whatever the script wrote back.
pub struct Callframe {
    arena: shmem::Arena,
    params: Vec<u64>,
    return_value: Option<shmem::ArenaValue>,
}

impl Callframe {
    pub fn new() -> Result<Callframe> {
        Ok(Callframe {
            arena: shmem::Arena::new()?,
            params: Vec::new(),
            return_value: None,
        })
    }

    fn push(&mut self, vp: shmem::VirtPtr) -> Result<()> {
        if self.params.len() >= ipc::MAX_PARAMS {
            return Err(Error::TooManyArgs(ipc::MAX_PARAMS));
        }
        self.params.push(vp.get());
        Ok(())
    }

    pub fn push_int(&mut self, v: i64) -> Result<()> {
        let vp = self.arena.push_int(v)?;
        self.push(vp)
    }

    pub fn push_double(&mut self, v: f64) -> Result<()> {
        let vp = self.arena.push_double(v)?;
        self.push(vp)
    }

    pub fn push_string(&mut self, v: &str) -> Result<()> {
        let vp = self.arena.push_string(v)?;
        self.push(vp)
    }

    /// Picks up whatever the subjail wrote into the arena after we handed it off, seals
    /// it against further writes, then resolves `return_ptr` against the now-current
    /// occupied size.
    fn load_return_value(&mut self, outcome: ipc::ScriptOutcome) -> Result<()> {
        let return_ptr = match outcome {
            ipc::ScriptOutcome::Error(msg) => return Err(Error::ScriptFailed(msg)),
            ipc::ScriptOutcome::Ok { return_ptr } => return_ptr,
        };

        self.arena.refresh()?;
        self.arena.seal()?;

        self.return_value = match return_ptr {
            Some(raw) => {
                let vp = shmem::VirtPtr::new(raw).ok_or(Error::NullReturnPointer)?;
                Some(self.arena.read(vp)?)
            }
            None => None,
        };
        Ok(())
    }

    pub fn get_int(&self) -> Option<i64> {
        match self.return_value {
            Some(shmem::ArenaValue::Int(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_double(&self) -> Option<f64> {
        match self.return_value {
            Some(shmem::ArenaValue::Double(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_string(&self) -> Option<&str> {
        match &self.return_value {
            Some(shmem::ArenaValue::String(v)) => Some(v),
            _ => None,
        }
    }
}
