//! Live-process trace backend built on ptrace.
//!
//! Attaches to every thread of a running process, tracks threads created
//! via clone, and waits for events from any of them with
//! `waitpid(-1, __WALL)`. Registers are moved as raw `NT_PRSTATUS` regsets so
//! the same code serves native and 32-bit compat targets.

use std::collections::{HashMap, HashSet};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::arch::Arch;
use crate::backend::TraceBackend;
use crate::error::{Error, Result};
use crate::procfs;
use crate::registers::Registers;
use crate::types::{ProcessState, StopReason, VirtAddr};

/// `NT_PRSTATUS` from `<elf.h>`: the general-purpose register set.
const NT_PRSTATUS: usize = 1;

/// Large enough for any supported `NT_PRSTATUS` regset.
const REGSET_BUF: usize = 512;

/// Log a failed ptrace request on `tid` that the caller can carry on without.
fn warn_on_err<T>(request: &str, tid: Pid, res: nix::Result<T>) -> Option<T> {
    match res {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("{} on new thread {}: {}", request, tid, e);
            None
        }
    }
}

fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACECLONE
}

/// A running process traced through ptrace.
pub struct PtraceBackend {
    /// Thread-group leader PID.
    pid: Pid,
    /// All known thread TIDs (includes the leader).
    threads: Vec<Pid>,
    state: ProcessState,
    /// Threads seen stopping before their parent's clone event arrived.
    early_children: HashSet<Pid>,
    /// Signals that arrived while we were single-stepping, redelivered on
    /// the thread's next resume.
    deferred: HashMap<Pid, Signal>,
    /// Threads currently in a ptrace stop that we have not resumed.
    stopped: HashSet<Pid>,
}

impl PtraceBackend {
    /// Attach to every thread of an already-running process.
    ///
    /// All threads are left stopped; call [`TraceBackend::resume_all`] once
    /// the breakpoints are in place.
    pub fn attach(pid: Pid) -> Result<Self> {
        let mut backend = PtraceBackend {
            pid,
            threads: Vec::new(),
            state: ProcessState::Halted,
            early_children: HashSet::new(),
            deferred: HashMap::new(),
            stopped: HashSet::new(),
        };
        backend.attach_thread(pid)?;

        // Threads can be created while we attach; rescan until stable.
        loop {
            let mut added = false;
            for tid in procfs::list_tasks(pid)? {
                if !backend.threads.contains(&tid) && backend.attach_thread(tid).is_ok() {
                    added = true;
                }
            }
            if !added {
                break;
            }
        }

        log::info!(
            "attached to process {} ({} threads)",
            pid,
            backend.threads.len()
        );
        Ok(backend)
    }

    fn attach_thread(&mut self, tid: Pid) -> Result<()> {
        ptrace::attach(tid)?;
        match waitpid(tid, Some(WaitPidFlag::__WALL))
            .map_err(|e| Error::Process(format!("waitpid after attach: {}", e)))?
        {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            // Another signal won the race; keep it for the target. Our SIGSTOP
            // is still pending and will be swallowed when it shows up.
            WaitStatus::Stopped(_, sig) => {
                self.deferred.insert(tid, sig);
            }
            other => {
                return Err(Error::Process(format!(
                    "unexpected status after attaching {}: {:?}",
                    tid, other
                )));
            }
        }
        ptrace::setoptions(tid, trace_options())?;
        self.threads.push(tid);
        self.stopped.insert(tid);
        Ok(())
    }

    /// Get the list of all known thread TIDs.
    pub fn thread_list(&self) -> &[Pid] {
        &self.threads
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    fn forget_thread(&mut self, tid: Pid) {
        self.threads.retain(|&t| t != tid);
        self.deferred.remove(&tid);
        self.stopped.remove(&tid);
    }

    fn on_clone(&mut self, tid: Pid) -> Result<StopReason> {
        let raw = ptrace::getevent(tid)
            .map_err(|e| Error::Process(format!("getevent: {}", e)))?;
        let child = Pid::from_raw(raw as i32);

        if !self.early_children.remove(&child) {
            // Wait for the new thread's initial SIGSTOP, then let it run.
            warn_on_err("waitpid", child, waitpid(child, Some(WaitPidFlag::__WALL)));
            if warn_on_err("setoptions", child, ptrace::setoptions(child, trace_options()))
                .is_none()
            {
                log::warn!("threads created by {} will not be traced", child);
            }
            if !self.threads.contains(&child) {
                self.threads.push(child);
            }
            warn_on_err("cont", child, ptrace::cont(child, None));
        }
        Ok(StopReason::ThreadCreated { tid, child })
    }

    fn getregset(tid: Pid, buf: &mut [u8]) -> Result<usize> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                tid.as_raw(),
                NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut libc::iovec as *mut libc::c_void,
            )
        };
        Errno::result(ret)?;
        Ok(iov.iov_len)
    }

    fn setregset(tid: Pid, buf: &mut [u8]) -> Result<()> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGSET,
                tid.as_raw(),
                NT_PRSTATUS as *mut libc::c_void,
                &mut iov as *mut libc::iovec as *mut libc::c_void,
            )
        };
        Errno::result(ret)?;
        Ok(())
    }
}

impl TraceBackend for PtraceBackend {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_word(&self, tid: Pid, addr: VirtAddr) -> Result<u64> {
        let val = ptrace::read(tid, addr.addr() as ptrace::AddressType)?;
        Ok(val as u64)
    }

    fn write_word(&self, tid: Pid, addr: VirtAddr, value: u64) -> Result<()> {
        ptrace::write(
            tid,
            addr.addr() as ptrace::AddressType,
            value as libc::c_long,
        )?;
        Ok(())
    }

    fn registers(&self, tid: Pid, arch: Arch) -> Result<Registers> {
        let mut buf = [0u8; REGSET_BUF];
        let len = Self::getregset(tid, &mut buf)?;
        Registers::from_regset(arch, &buf[..len])
    }

    fn set_registers(&self, tid: Pid, regs: &Registers) -> Result<()> {
        let mut buf = regs.to_regset();
        Self::setregset(tid, &mut buf)
    }

    fn single_step(&mut self, tid: Pid) -> Result<()> {
        ptrace::step(tid, None)?;
        loop {
            match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => return Ok(()),
                // Signal-delivery stop before the step ran: hold the signal
                // back and step again.
                Ok(WaitStatus::Stopped(_, sig)) => {
                    if sig != Signal::SIGSTOP {
                        self.deferred.insert(tid, sig);
                    }
                    ptrace::step(tid, None)?;
                }
                Ok(WaitStatus::PtraceEvent(..)) => {
                    ptrace::step(tid, None)?;
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    self.forget_thread(tid);
                    return Err(Error::ThreadGone(tid));
                }
                Ok(other) => {
                    return Err(Error::Process(format!(
                        "unexpected status while stepping {}: {:?}",
                        tid, other
                    )));
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn resume(&mut self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        let signal = signal.or_else(|| self.deferred.remove(&tid));
        ptrace::cont(tid, signal)?;
        self.stopped.remove(&tid);
        self.state = ProcessState::Running;
        Ok(())
    }

    fn resume_all(&mut self) -> Result<()> {
        for tid in self.threads.clone() {
            let signal = self.deferred.remove(&tid);
            ptrace::cont(tid, signal)?;
            self.stopped.remove(&tid);
        }
        self.state = ProcessState::Running;
        Ok(())
    }

    fn wait_event(&mut self) -> Result<StopReason> {
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => return Ok(StopReason::Interrupted),
                Err(e) => return Err(Error::Process(format!("waitpid: {}", e))),
            };

            if let Some(tid) = status.pid() {
                if matches!(status, WaitStatus::Stopped(..) | WaitStatus::PtraceEvent(..)) {
                    self.stopped.insert(tid);
                }
            }

            let reason = match status {
                WaitStatus::Stopped(tid, Signal::SIGTRAP) => StopReason::Trap { tid },
                WaitStatus::Stopped(tid, Signal::SIGSTOP) if !self.threads.contains(&tid) => {
                    // A new thread reported before its clone event.
                    let _ = ptrace::setoptions(tid, trace_options());
                    self.threads.push(tid);
                    self.early_children.insert(tid);
                    ptrace::cont(tid, None)?;
                    self.stopped.remove(&tid);
                    continue;
                }
                WaitStatus::Stopped(tid, signal) => StopReason::Signal { tid, signal },
                WaitStatus::Exited(tid, code) => {
                    self.forget_thread(tid);
                    if tid == self.pid {
                        self.state = ProcessState::Exited;
                        StopReason::Exited(code)
                    } else {
                        StopReason::ThreadExited { tid }
                    }
                }
                WaitStatus::Signaled(tid, sig, _) => {
                    self.forget_thread(tid);
                    if tid == self.pid {
                        self.state = ProcessState::Exited;
                        StopReason::Terminated(sig)
                    } else {
                        StopReason::ThreadExited { tid }
                    }
                }
                WaitStatus::PtraceEvent(tid, _, event) => {
                    if event == libc::PTRACE_EVENT_CLONE {
                        self.on_clone(tid)?
                    } else {
                        ptrace::cont(tid, None)?;
                        self.stopped.remove(&tid);
                        continue;
                    }
                }
                other => {
                    return Err(Error::Process(format!(
                        "unexpected wait status: {:?}",
                        other
                    )));
                }
            };
            return Ok(reason);
        }
    }

    fn halt(&mut self) -> Result<Vec<Pid>> {
        let mut trapped = Vec::new();
        if self.state == ProcessState::Exited {
            return Ok(trapped);
        }

        // Threads we already hold stopped would never report the SIGSTOP.
        let mut pending: Vec<Pid> = self
            .threads
            .iter()
            .copied()
            .filter(|tid| !self.stopped.contains(tid))
            .collect();
        for &tid in &pending {
            unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    self.pid.as_raw(),
                    tid.as_raw(),
                    libc::SIGSTOP,
                );
            }
        }

        while let Some(tid) = pending.pop() {
            self.stopped.insert(tid);
            loop {
                match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
                    Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                        trapped.push(tid);
                        break;
                    }
                    Ok(WaitStatus::Stopped(_, sig)) => {
                        self.deferred.insert(tid, sig);
                        break;
                    }
                    Ok(WaitStatus::PtraceEvent(_, _, event))
                        if event == libc::PTRACE_EVENT_CLONE =>
                    {
                        // The new thread starts stopped; it only needs
                        // recording before we detach.
                        if let Ok(raw) = ptrace::getevent(tid) {
                            let child = Pid::from_raw(raw as i32);
                            let _ = waitpid(child, Some(WaitPidFlag::__WALL));
                            if !self.threads.contains(&child) {
                                self.threads.push(child);
                            }
                        }
                        break;
                    }
                    Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                        self.forget_thread(tid);
                        break;
                    }
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => {
                        self.forget_thread(tid);
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if self.threads.is_empty() {
            self.state = ProcessState::Exited;
        } else {
            self.state = ProcessState::Halted;
        }
        Ok(trapped)
    }

    fn detach(&mut self) -> Result<()> {
        if matches!(self.state, ProcessState::Exited | ProcessState::Detached) {
            return Ok(());
        }
        for tid in self.threads.clone() {
            let signal = self.deferred.remove(&tid);
            if let Err(e) = ptrace::detach(tid, signal) {
                log::debug!("detach {}: {}", tid, e);
            }
        }
        // Undo any SIGSTOP from `halt` that the kernel had not consumed yet.
        let _ = nix::sys::signal::kill(self.pid, Signal::SIGCONT);
        self.state = ProcessState::Detached;
        log::info!("detached from process {}", self.pid);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !matches!(self.state, ProcessState::Exited)
    }
}

impl Drop for PtraceBackend {
    fn drop(&mut self) {
        if self.state == ProcessState::Halted {
            let _ = self.detach();
        }
    }
}
