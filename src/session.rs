//! The tracing session: installs the allocator traps, routes every stop of
//! the target through the registry and the call tracker, and puts the
//! target's code back when tracing ends.
//!
//! A trap stop at address A on thread T is classified as:
//!
//! 1. a return, when T has a pending call at A that it can be returning from;
//! 2. an entry, when A is a monitored function's entry;
//! 3. a pass-through, when A is another call's return site;
//! 4. foreign otherwise.
//!
//! Exactly the trapped thread is resumed afterwards; every other thread keeps
//! running throughout.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::arch::{AbiAccessor, Arch};
use crate::backend::TraceBackend;
use crate::backtrace;
use crate::breakpoint::Registry;
use crate::config::TraceConfig;
use crate::correlate::{CallState, CallTracker, PendingCall};
use crate::error::{Error, Result};
use crate::hooks::{self, CallHandler, CompletedCall, HookContext};
use crate::ledger::Ledger;
use crate::registers::Registers;
use crate::symbols::SymbolResolver;
use crate::types::{StopReason, VirtAddr};

/// How a traced run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The target exited with a status code.
    Exited(i32),
    /// The target was killed by a signal.
    Killed(Signal),
    /// Tracing was stopped from our side; the target keeps running.
    Interrupted,
}

pub struct Session<B: TraceBackend, L: Ledger> {
    backend: B,
    ledger: L,
    abi: &'static dyn AbiAccessor,
    resolver: Box<dyn SymbolResolver>,
    registry: Registry,
    tracker: CallTracker,
    config: TraceConfig,
    /// Thread stopped on one of our traps and not yet resumed.
    held: Option<Pid>,
    finished: bool,
}

impl<B: TraceBackend, L: Ledger> Session<B, L> {
    /// Wrap an attached, stopped target. Nothing is written until
    /// [`Session::init`].
    pub fn new(
        backend: B,
        ledger: L,
        arch: Arch,
        resolver: Box<dyn SymbolResolver>,
        config: TraceConfig,
    ) -> Self {
        Session {
            backend,
            ledger,
            abi: arch.abi(),
            resolver,
            registry: Registry::new(),
            tracker: CallTracker::new(),
            config,
            held: None,
            finished: false,
        }
    }

    /// Trap every allocator function and let the target run.
    pub fn init(&mut self) -> Result<()> {
        for (name, handler) in hooks::allocator_hooks() {
            self.install_hook(name, handler)?;
        }
        log::info!(
            "{} allocator functions trapped in process {} ({})",
            self.registry.len(),
            self.backend.pid(),
            self.abi.arch()
        );
        self.backend.resume_all()
    }

    /// Trap one function. Must be called while the target is stopped.
    pub fn install_hook(&mut self, name: &str, handler: Box<dyn CallHandler>) -> Result<VirtAddr> {
        self.registry.install(
            &self.backend,
            self.abi,
            self.resolver.as_ref(),
            name,
            handler,
        )
    }

    /// Dispatch stops until the target exits or `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<RunOutcome> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(RunOutcome::Interrupted);
            }
            let event = self.backend.wait_event()?;
            if let Some(outcome) = self.handle_event(event)? {
                return Ok(outcome);
            }
        }
    }

    /// Process one stop reported by the backend.
    pub fn handle_event(&mut self, event: StopReason) -> Result<Option<RunOutcome>> {
        match event {
            StopReason::Trap { tid } => match self.handle_trap(tid) {
                Err(Error::ThreadGone(gone)) => {
                    self.held = None;
                    log::info!("thread {} vanished while handling its trap", gone);
                    self.tracker.discard_thread(gone);
                }
                other => other?,
            },
            StopReason::Signal { tid, signal } => {
                // Our own attach/halt SIGSTOPs are not the target's business.
                let forward = (signal != Signal::SIGSTOP).then_some(signal);
                log::debug!("thread {} stopped by {:?}, forwarding {:?}", tid, signal, forward);
                self.backend.resume(tid, forward)?;
            }
            StopReason::ThreadCreated { tid, child } => {
                log::info!("thread {} created thread {}", tid, child);
                self.backend.resume(tid, None)?;
            }
            StopReason::ThreadExited { tid } => {
                let abandoned = self.tracker.discard_thread(tid);
                log::debug!("thread {} exited ({} calls abandoned)", tid, abandoned);
            }
            StopReason::Exited(code) => {
                log::info!("process {} exited with status {}", self.backend.pid(), code);
                return Ok(Some(RunOutcome::Exited(code)));
            }
            StopReason::Terminated(signal) => {
                log::info!("process {} killed by {:?}", self.backend.pid(), signal);
                return Ok(Some(RunOutcome::Killed(signal)));
            }
            StopReason::Interrupted => {}
        }
        Ok(None)
    }

    fn handle_trap(&mut self, tid: Pid) -> Result<()> {
        let abi = self.abi;
        let regs = self.backend.registers(tid, abi.arch())?;
        let mut rewound = regs.clone();
        let addr = abi.rewind_pc(&mut rewound);

        // Bookkeeping that needs some stopped thread to write through.
        self.registry.rearm(&self.backend, abi, tid)?;
        let retired = self.tracker.reconcile(&self.backend, abi, tid)?;

        let is_entry = self.registry.is_entry(addr);
        let is_return = self.tracker.has_return_site(addr);
        // A trap already written back still left its SIGTRAP behind; the
        // thread has to be moved back onto the restored instruction.
        let was_ours = retired.contains(&addr) || self.tracker.was_trap(addr);
        if !is_entry && !is_return && !was_ours {
            log::debug!(
                "trap on thread {} at pc 0x{:x} is not ours",
                tid,
                regs.pc()
            );
            return self.backend.resume(tid, None);
        }

        self.held = Some(tid);
        if abi.rewinds_pc() {
            self.backend.set_registers(tid, &rewound)?;
        }

        let sp = abi.stack_pointer(&rewound);
        if is_return && self.tracker.has_eligible(tid, addr, sp) {
            self.on_return(tid, addr, &rewound)?;
            if self.registry.is_entry(addr) {
                self.registry.step_over(&mut self.backend, abi, addr, tid)?;
            } else if self.tracker.owns_trap(addr) {
                self.tracker
                    .step_over_return_site(&mut self.backend, abi, addr, tid)?;
            }
        } else if is_entry {
            self.on_entry(tid, addr, &rewound)?;
        } else if self.tracker.owns_trap(addr) {
            // Another thread's return site, or a deeper frame running the
            // same code.
            self.tracker
                .step_over_return_site(&mut self.backend, abi, addr, tid)?;
        }

        self.backend.resume(tid, None)?;
        self.held = None;
        Ok(())
    }

    fn on_entry(&mut self, tid: Pid, addr: VirtAddr, regs: &Registers) -> Result<()> {
        let abi = self.abi;
        let backend = &self.backend;
        let read = |a: VirtAddr| backend.read_word(tid, a);
        let args = abi.arguments(regs, &read)?;
        let return_address = abi.return_address(regs, &read)?;
        let mut call = PendingCall::new(tid, addr, args, return_address, abi.stack_pointer(regs));

        if log::log_enabled!(log::Level::Debug) {
            let name = self.registry.lookup_by_entry(addr).map_or("?", |s| s.name());
            log::debug!(
                "enter {} on thread {} (return {}, sp 0x{:x})",
                name,
                tid,
                return_address,
                call.entry_sp
            );
        }

        self.registry.step_over(&mut self.backend, abi, addr, tid)?;
        call.advance(CallState::Stepped)?;
        let shares_entry_trap = self.registry.is_entry(return_address);
        self.tracker.arm(&self.backend, abi, call, shares_entry_trap)
    }

    fn on_return(&mut self, tid: Pid, addr: VirtAddr, regs: &Registers) -> Result<()> {
        let abi = self.abi;
        let sp = abi.stack_pointer(regs);
        let Some(call) = self.tracker.resolve(&self.backend, abi, tid, addr, sp)? else {
            return Ok(());
        };
        let spec = self.registry.lookup_by_entry(call.entry).ok_or_else(|| {
            Error::Breakpoint(format!("return for unknown entry {}", call.entry))
        })?;

        let completed = CompletedCall {
            function: spec.name(),
            tid,
            return_value: abi.return_value(regs)?,
            args: call.args,
            word_mask: abi.arch().word_mask(),
        };

        let backend = &self.backend;
        let resolver = self.resolver.as_ref();
        let depth = self.config.backtrace_depth;
        let read = |a: VirtAddr| backend.read_word(tid, a);
        let capture = || {
            if depth == 0 {
                return Vec::new();
            }
            match backtrace::walk(abi, regs, &read, depth) {
                Ok(frames) => backtrace::symbolize(&frames, resolver),
                Err(e) => vec![format!("<backtrace unavailable: {}>", e)],
            }
        };
        let mut ctx = HookContext {
            ledger: &mut self.ledger,
            read_word: &read,
            backtrace: &capture,
        };
        spec.handler().on_return(&completed, &mut ctx)
    }

    /// Put every original instruction back and let the target go.
    ///
    /// All threads are stopped first so none can be executing a trap while
    /// it is removed; a thread caught on one has its pc moved back onto the
    /// restored instruction. Safe to call more than once, and after the
    /// target has exited.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if !self.backend.is_alive() {
            log::debug!("target gone; nothing to restore");
            self.tracker = CallTracker::new();
            return Ok(());
        }

        let mut parked = match self.backend.halt() {
            Ok(trapped) => trapped,
            Err(e) => {
                log::warn!("could not stop every thread: {}", e);
                Vec::new()
            }
        };
        parked.extend(self.held.take());
        for tid in parked {
            if let Err(e) = self.park_on_trap(tid) {
                log::warn!("could not rewind thread {}: {}", tid, e);
            }
        }

        let failed = self.registry.restore_all(&self.backend, self.abi)
            + self.tracker.disarm_all(&self.backend, self.abi);
        if failed > 0 {
            log::warn!("{} traps could not be removed", failed);
        }
        self.backend.detach()
    }

    // A thread stopped by one of our traps has not run the instruction
    // under it yet; on x86 its pc must be moved back onto it.
    fn park_on_trap(&mut self, tid: Pid) -> Result<()> {
        if !self.abi.rewinds_pc() {
            return Ok(());
        }
        let mut regs = self.backend.registers(tid, self.abi.arch())?;
        let addr = self.abi.rewind_pc(&mut regs);
        if self.registry.is_entry(addr) || self.tracker.owns_trap(addr) {
            log::debug!("rewinding thread {} onto {}", tid, addr);
            self.backend.set_registers(tid, &regs)?;
        }
        Ok(())
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tracker(&self) -> &CallTracker {
        &self.tracker
    }
}

impl<B: TraceBackend, L: Ledger> Drop for Session<B, L> {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("cleanup failed: {}", e);
        }
    }
}
