//! A single software trap patched into target code.
//!
//! Both kinds of trap the tracer plants (function entries and return sites)
//! are `TrapSite`s; they differ only in who owns them and for how long.

use nix::unistd::Pid;

use crate::arch::AbiAccessor;
use crate::backend::TraceBackend;
use crate::error::Result;
use crate::types::VirtAddr;

#[derive(Debug)]
pub struct TrapSite {
    addr: VirtAddr,
    /// Instruction word as it was before the first install.
    saved_word: u64,
    enabled: bool,
}

impl TrapSite {
    /// Read the original word at `addr` and write the trap over it.
    pub fn install<B: TraceBackend + ?Sized>(
        backend: &B,
        abi: &dyn AbiAccessor,
        tid: Pid,
        addr: VirtAddr,
    ) -> Result<Self> {
        let saved_word = backend.read_word(tid, addr)?;
        let mut site = TrapSite {
            addr,
            saved_word,
            enabled: false,
        };
        site.enable(backend, abi, tid)?;
        Ok(site)
    }

    /// Write the trap instruction.
    pub fn enable<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        tid: Pid,
    ) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        let current = backend.read_word(tid, self.addr)?;
        backend.write_word(tid, self.addr, abi.encode_trap(current))?;
        self.enabled = true;
        Ok(())
    }

    /// Put the original instruction back.
    pub fn disable<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        tid: Pid,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let current = backend.read_word(tid, self.addr)?;
        backend.write_word(tid, self.addr, abi.restore_word(current, self.saved_word))?;
        self.enabled = false;
        Ok(())
    }

    /// Let `tid` execute the original instruction under the trap: disable,
    /// single-step, re-enable.
    ///
    /// The caller must already have pointed the thread's pc at the trap.
    pub fn step_over<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        abi: &dyn AbiAccessor,
        tid: Pid,
    ) -> Result<()> {
        if !self.enabled {
            return backend.single_step(tid);
        }
        self.disable(&*backend, abi, tid)?;
        backend.single_step(tid)?;
        self.enable(&*backend, abi, tid)
    }

    pub fn addr(&self) -> VirtAddr {
        self.addr
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn saved_word(&self) -> u64 {
        self.saved_word
    }
}
