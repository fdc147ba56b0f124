//! Scripted in-memory target for unit tests.
//!
//! Memory is a sparse word map, registers are kept per thread, and every
//! single-step, resume and memory write is recorded so tests can check what
//! the tracer did to the target.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::arch::Arch;
use crate::backend::TraceBackend;
use crate::error::{Error, Result};
use crate::registers::Registers;
use crate::types::{StopReason, VirtAddr};

/// One recorded single-step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub tid: Pid,
    pub pc: u64,
    /// Memory word at `pc` while the step ran.
    pub word: u64,
}

pub struct FakeTarget {
    pid: Pid,
    arch: Arch,
    memory: RefCell<HashMap<u64, u64>>,
    regs: RefCell<HashMap<Pid, Registers>>,
    writes: RefCell<Vec<(u64, u64)>>,
    steps: Vec<Step>,
    resumed: Vec<(Pid, Option<Signal>)>,
    events: VecDeque<StopReason>,
    halt_trapped: Vec<Pid>,
    alive: bool,
    detached: bool,
}

impl FakeTarget {
    pub fn new(arch: Arch) -> Self {
        FakeTarget {
            pid: Pid::from_raw(4242),
            arch,
            memory: RefCell::new(HashMap::new()),
            regs: RefCell::new(HashMap::new()),
            writes: RefCell::new(Vec::new()),
            steps: Vec::new(),
            resumed: Vec::new(),
            events: VecDeque::new(),
            halt_trapped: Vec::new(),
            alive: true,
            detached: false,
        }
    }

    pub fn poke(&self, addr: u64, word: u64) {
        self.memory.borrow_mut().insert(addr, word);
    }

    pub fn peek(&self, addr: u64) -> u64 {
        self.memory.borrow().get(&addr).copied().unwrap_or(0)
    }

    /// Every value written to `addr`, in order.
    pub fn writes_at(&self, addr: u64) -> Vec<u64> {
        self.writes
            .borrow()
            .iter()
            .filter(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn set_reg(&self, tid: Pid, name: &str, value: u64) {
        let arch = self.arch;
        self.regs
            .borrow_mut()
            .entry(tid)
            .or_insert_with(|| Registers::new(arch))
            .set(name, value)
            .unwrap();
    }

    pub fn set_pc(&self, tid: Pid, pc: u64) {
        let arch = self.arch;
        self.regs
            .borrow_mut()
            .entry(tid)
            .or_insert_with(|| Registers::new(arch))
            .set_pc(pc);
    }

    pub fn pc(&self, tid: Pid) -> u64 {
        self.regs.borrow().get(&tid).map(|r| r.pc()).unwrap_or(0)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn resumed(&self) -> &[(Pid, Option<Signal>)] {
        &self.resumed
    }

    pub fn push_event(&mut self, event: StopReason) {
        self.events.push_back(event);
    }

    /// Threads `halt` will report as caught on a trap.
    pub fn set_halt_trapped(&mut self, tids: Vec<Pid>) {
        self.halt_trapped = tids;
    }

    /// Make every further access fail as if the process had exited.
    pub fn kill(&mut self) {
        self.alive = false;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive {
            Ok(())
        } else {
            Err(Error::Ptrace(Errno::ESRCH))
        }
    }
}

impl TraceBackend for FakeTarget {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_word(&self, _tid: Pid, addr: VirtAddr) -> Result<u64> {
        self.check_alive()?;
        self.memory
            .borrow()
            .get(&addr.addr())
            .copied()
            .ok_or(Error::Ptrace(Errno::EIO))
    }

    fn write_word(&self, _tid: Pid, addr: VirtAddr, value: u64) -> Result<()> {
        self.check_alive()?;
        self.memory.borrow_mut().insert(addr.addr(), value);
        self.writes.borrow_mut().push((addr.addr(), value));
        Ok(())
    }

    fn registers(&self, tid: Pid, arch: Arch) -> Result<Registers> {
        self.check_alive()?;
        Ok(self
            .regs
            .borrow_mut()
            .entry(tid)
            .or_insert_with(|| Registers::new(arch))
            .clone())
    }

    fn set_registers(&self, tid: Pid, regs: &Registers) -> Result<()> {
        self.check_alive()?;
        self.regs.borrow_mut().insert(tid, regs.clone());
        Ok(())
    }

    fn single_step(&mut self, tid: Pid) -> Result<()> {
        self.check_alive()?;
        let pc = self.pc(tid);
        let word = self.peek(pc);
        self.steps.push(Step { tid, pc, word });
        Ok(())
    }

    fn resume(&mut self, tid: Pid, signal: Option<Signal>) -> Result<()> {
        self.check_alive()?;
        self.resumed.push((tid, signal));
        Ok(())
    }

    fn resume_all(&mut self) -> Result<()> {
        self.check_alive()
    }

    fn wait_event(&mut self) -> Result<StopReason> {
        Ok(self.events.pop_front().unwrap_or(StopReason::Exited(0)))
    }

    fn halt(&mut self) -> Result<Vec<Pid>> {
        Ok(std::mem::take(&mut self.halt_trapped))
    }

    fn detach(&mut self) -> Result<()> {
        self.detached = true;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}
