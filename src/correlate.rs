//! Pairing function entries with their returns.
//!
//! When an entry trap fires, the call's arguments and return address are
//! captured into a [`PendingCall`] and a trap is armed at the return address.
//! Many calls (from many threads, or recursion within one) can be waiting on
//! the same return address, so return-site traps are reference counted and
//! pending calls are kept in per-(thread, return address) stacks.
//!
//! A trap at an armed return site belongs to the most recent pending call of
//! the trapped thread whose entry stack pointer is not above the current one.
//! On every supported architecture the stack grows down and a return leaves
//! the stack pointer at or above its entry value, so a deeper frame executing
//! the same code cannot claim an outer call.

use std::collections::{HashMap, HashSet};

use nix::unistd::Pid;

use crate::arch::{AbiAccessor, MAX_ARGS};
use crate::backend::TraceBackend;
use crate::error::{Error, Result};
use crate::trap::TrapSite;
use crate::types::VirtAddr;

/// Lifecycle of one intercepted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    /// Entry trap fired; arguments captured.
    EntryHit,
    /// The original entry instruction has been executed.
    Stepped,
    /// Waiting on the return-site trap.
    ArmedReturn,
    /// Return trap fired; return value is about to be captured.
    ReturnHit,
}

#[derive(Debug, Clone)]
pub struct PendingCall {
    pub tid: Pid,
    /// Entry address of the monitored function.
    pub entry: VirtAddr,
    pub args: [u64; MAX_ARGS],
    pub return_address: VirtAddr,
    pub entry_sp: u64,
    state: CallState,
}

impl PendingCall {
    pub fn new(
        tid: Pid,
        entry: VirtAddr,
        args: [u64; MAX_ARGS],
        return_address: VirtAddr,
        entry_sp: u64,
    ) -> Self {
        PendingCall {
            tid,
            entry,
            args,
            return_address,
            entry_sp,
            state: CallState::EntryHit,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Move to `next`. States only ever move forward.
    pub fn advance(&mut self, next: CallState) -> Result<()> {
        if next <= self.state {
            return Err(Error::Breakpoint(format!(
                "call of {} on thread {} cannot go from {:?} to {:?}",
                self.entry, self.tid, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// The trap at one return address and how many pending calls wait on it.
#[derive(Debug)]
struct ReturnSiteTrap {
    /// `None` when the address is also a monitored entry and its trap is
    /// owned by the registry.
    site: Option<TrapSite>,
    refcount: usize,
}

#[derive(Debug, Default)]
pub struct CallTracker {
    pending: HashMap<(Pid, VirtAddr), Vec<PendingCall>>,
    return_sites: HashMap<VirtAddr, ReturnSiteTrap>,
    /// Addresses whose return trap has been written back. A thread can
    /// still report a SIGTRAP from one of them after the fact.
    removed: HashSet<VirtAddr>,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the return trap for a call that has stepped past its entry, and
    /// start waiting on it.
    ///
    /// `shares_entry_trap` says the return address is itself a monitored
    /// entry, whose trap then doubles as the return trap.
    pub fn arm<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        mut call: PendingCall,
        shares_entry_trap: bool,
    ) -> Result<()> {
        let addr = call.return_address;
        match self.return_sites.get_mut(&addr) {
            Some(ret) => {
                // A retired site (refcount 0) is still in memory; reuse it.
                if let Some(site) = ret.site.as_mut() {
                    site.enable(backend, abi, call.tid)?;
                }
                ret.refcount += 1;
            }
            None => {
                let site = if shares_entry_trap {
                    None
                } else {
                    Some(TrapSite::install(backend, abi, call.tid, addr)?)
                };
                self.return_sites
                    .insert(addr, ReturnSiteTrap { site, refcount: 1 });
            }
        }
        call.advance(CallState::ArmedReturn)?;
        log::debug!(
            "armed return {} for thread {} (sp 0x{:x}, refs {})",
            addr,
            call.tid,
            call.entry_sp,
            self.refcount(addr)
        );
        self.pending.entry((call.tid, addr)).or_default().push(call);
        Ok(())
    }

    /// Whether `addr` has a return trap that pending calls wait on.
    pub fn has_return_site(&self, addr: VirtAddr) -> bool {
        self.return_sites
            .get(&addr)
            .is_some_and(|ret| ret.refcount > 0)
    }

    /// Whether `tid` has a call at `addr` it could be returning from with
    /// stack pointer `sp`.
    pub fn has_eligible(&self, tid: Pid, addr: VirtAddr, sp: u64) -> bool {
        self.pending
            .get(&(tid, addr))
            .is_some_and(|calls| calls.iter().any(|c| c.entry_sp <= sp))
    }

    /// Take the call `tid` is returning from at `addr`, dropping its
    /// reference on the return trap. When the last reference goes the
    /// original instruction is written back.
    pub fn resolve<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        tid: Pid,
        addr: VirtAddr,
        sp: u64,
    ) -> Result<Option<PendingCall>> {
        let key = (tid, addr);
        let Some(calls) = self.pending.get_mut(&key) else {
            return Ok(None);
        };
        let Some(index) = calls.iter().rposition(|c| c.entry_sp <= sp) else {
            return Ok(None);
        };
        let mut call = calls.remove(index);
        if calls.is_empty() {
            self.pending.remove(&key);
        }
        call.advance(CallState::ReturnHit)?;
        self.release(backend, abi, tid, addr)?;
        Ok(Some(call))
    }

    fn release<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        tid: Pid,
        addr: VirtAddr,
    ) -> Result<()> {
        let Some(ret) = self.return_sites.get_mut(&addr) else {
            return Ok(());
        };
        ret.refcount = ret.refcount.saturating_sub(1);
        if ret.refcount == 0 {
            if let Some(site) = ret.site.as_mut() {
                site.disable(backend, abi, tid)?;
                self.removed.insert(addr);
            }
            self.return_sites.remove(&addr);
        }
        Ok(())
    }

    /// Whether a return trap this tracker owned was once written at `addr`
    /// and has since been removed.
    pub fn was_trap(&self, addr: VirtAddr) -> bool {
        !self.has_return_site(addr) && self.removed.contains(&addr)
    }

    pub fn refcount(&self, addr: VirtAddr) -> usize {
        self.return_sites.get(&addr).map_or(0, |ret| ret.refcount)
    }

    /// Whether a trap this tracker owns is currently written at `addr`.
    pub fn owns_trap(&self, addr: VirtAddr) -> bool {
        self.return_sites
            .get(&addr)
            .and_then(|ret| ret.site.as_ref())
            .is_some_and(TrapSite::is_enabled)
    }

    /// Run the original instruction under the return trap at `addr` on `tid`.
    pub fn step_over_return_site<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        abi: &dyn AbiAccessor,
        addr: VirtAddr,
        tid: Pid,
    ) -> Result<()> {
        let site = self
            .return_sites
            .get_mut(&addr)
            .and_then(|ret| ret.site.as_mut())
            .ok_or_else(|| Error::Breakpoint(format!("no return trap at {}", addr)))?;
        site.step_over(backend, abi, tid)
    }

    /// Abandon every call of a thread that has exited.
    ///
    /// The thread cannot be used to write memory any more, so traps left
    /// without references stay in place, retired, until
    /// [`CallTracker::reconcile`] runs on a stopped thread.
    pub fn discard_thread(&mut self, tid: Pid) -> usize {
        let keys: Vec<(Pid, VirtAddr)> = self
            .pending
            .keys()
            .filter(|(t, _)| *t == tid)
            .copied()
            .collect();
        let mut abandoned = 0;
        for key in keys {
            let calls = self.pending.remove(&key).unwrap_or_default();
            for call in &calls {
                log::warn!(
                    "thread {} exited inside call of {} (return {})",
                    tid,
                    call.entry,
                    call.return_address
                );
            }
            if let Some(ret) = self.return_sites.get_mut(&key.1) {
                ret.refcount = ret.refcount.saturating_sub(calls.len());
            }
            abandoned += calls.len();
        }
        abandoned
    }

    /// Bring return traps in memory in line with their reference counts,
    /// writing through stopped thread `tid`: retired traps are removed and
    /// referenced traps left disabled by an unfinished step are re-armed.
    /// Returns the addresses whose original instruction is back.
    pub fn reconcile<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        tid: Pid,
    ) -> Result<Vec<VirtAddr>> {
        let mut retired = Vec::new();
        for (addr, ret) in self.return_sites.iter_mut() {
            let Some(site) = ret.site.as_mut() else {
                if ret.refcount == 0 {
                    retired.push(*addr);
                }
                continue;
            };
            if ret.refcount == 0 {
                site.disable(backend, abi, tid)?;
                self.removed.insert(*addr);
                retired.push(*addr);
            } else if !site.is_enabled() {
                site.enable(backend, abi, tid)?;
            }
        }
        for addr in &retired {
            self.return_sites.remove(addr);
        }
        Ok(retired)
    }

    /// Restore every return trap and forget all pending calls.
    ///
    /// Like [`crate::breakpoint::Registry::restore_all`] this tolerates a
    /// dead target; returns the number of traps that could not be removed.
    pub fn disarm_all<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
    ) -> usize {
        let tid = backend.pid();
        let pending: usize = self.pending.values().map(Vec::len).sum();
        if pending > 0 {
            log::info!("dropping {} calls still in flight", pending);
        }
        self.pending.clear();

        let mut failed = 0;
        for (addr, mut ret) in self.return_sites.drain() {
            if let Some(site) = ret.site.as_mut() {
                if let Err(e) = site.disable(backend, abi, tid) {
                    log::warn!("could not restore return site {}: {}", addr, e);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Number of calls waiting on a return.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}
