//! The debug-trap primitive the tracer is written against.
//!
//! [`crate::process::PtraceBackend`] implements it for a live Linux process;
//! tests drive the same code through an in-memory fake.

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::arch::Arch;
use crate::error::Result;
use crate::registers::Registers;
use crate::types::{StopReason, VirtAddr};

pub trait TraceBackend {
    /// Thread-group leader of the target.
    fn pid(&self) -> Pid;

    /// Read one word of target memory through stopped thread `tid`.
    fn read_word(&self, tid: Pid, addr: VirtAddr) -> Result<u64>;

    /// Write one word of target memory through stopped thread `tid`.
    fn write_word(&self, tid: Pid, addr: VirtAddr, value: u64) -> Result<()>;

    fn registers(&self, tid: Pid, arch: Arch) -> Result<Registers>;

    fn set_registers(&self, tid: Pid, regs: &Registers) -> Result<()>;

    /// Execute exactly one instruction on `tid` and wait until it stops again.
    fn single_step(&mut self, tid: Pid) -> Result<()>;

    /// Let `tid` run, optionally delivering `signal` to it.
    fn resume(&mut self, tid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Let every stopped thread run. Used once after the traps are installed.
    fn resume_all(&mut self) -> Result<()>;

    /// Block until any traced thread stops or exits.
    fn wait_event(&mut self) -> Result<StopReason>;

    /// Stop every thread. Returns the threads that were caught on a trap
    /// instruction while stopping, whose pc may need rewinding.
    fn halt(&mut self) -> Result<Vec<Pid>>;

    /// Let the target go. Called after every trap has been removed.
    fn detach(&mut self) -> Result<()>;

    /// Whether the target is still there to be written to.
    fn is_alive(&self) -> bool;
}
