//! Entry breakpoints on the monitored functions.
//!
//! The registry owns one [`BreakpointSpec`] per monitored function, keyed by
//! runtime entry address. Specs are created when the session starts and their
//! original code is written back when it ends.

use std::collections::HashMap;
use std::fmt;

use nix::unistd::Pid;

use crate::arch::AbiAccessor;
use crate::backend::TraceBackend;
use crate::error::{Error, Result};
use crate::hooks::CallHandler;
use crate::symbols::SymbolResolver;
use crate::trap::TrapSite;
use crate::types::VirtAddr;

/// A monitored function: where it lives, what was there, who handles it.
pub struct BreakpointSpec {
    name: String,
    entry: VirtAddr,
    site: TrapSite,
    handler: Box<dyn CallHandler>,
}

impl BreakpointSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> VirtAddr {
        self.entry
    }

    pub fn handler(&self) -> &dyn CallHandler {
        self.handler.as_ref()
    }

    pub fn is_installed(&self) -> bool {
        self.site.is_enabled()
    }

    pub fn saved_word(&self) -> u64 {
        self.site.saved_word()
    }
}

impl fmt::Debug for BreakpointSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakpointSpec")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct Registry {
    specs: HashMap<VirtAddr, BreakpointSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `name`, trap its entry and remember `handler` for it.
    ///
    /// Two monitored names resolving to the same address (aliases) would
    /// share a trap, so that is refused.
    pub fn install<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        resolver: &dyn SymbolResolver,
        name: &str,
        handler: Box<dyn CallHandler>,
    ) -> Result<VirtAddr> {
        let entry = resolver
            .resolve(name)
            .ok_or_else(|| Error::Symbol(name.to_string()))?;
        if let Some(existing) = self.specs.get(&entry) {
            return Err(Error::Breakpoint(format!(
                "{} resolves to {}, already trapped for {}",
                name, entry, existing.name
            )));
        }

        let site = TrapSite::install(backend, abi, backend.pid(), entry)?;
        log::debug!(
            "trapped {} at {} (saved 0x{:x})",
            name,
            entry,
            site.saved_word()
        );
        self.specs.insert(
            entry,
            BreakpointSpec {
                name: name.to_string(),
                entry,
                site,
                handler,
            },
        );
        Ok(entry)
    }

    /// Write every saved instruction back.
    ///
    /// Safe to call repeatedly and on a target that has already exited:
    /// failures are logged and the remaining sites are still attempted.
    /// Returns the number of sites that could not be restored.
    pub fn restore_all<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
    ) -> usize {
        let tid = backend.pid();
        let mut failed = 0;
        for spec in self.specs.values_mut() {
            if let Err(e) = spec.site.disable(backend, abi, tid) {
                log::warn!("could not restore {} at {}: {}", spec.name, spec.entry, e);
                failed += 1;
            }
        }
        failed
    }

    /// Re-write any entry trap left disabled by a step that never finished
    /// (its thread died mid-step). Costs nothing when all traps are in place.
    pub fn rearm<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &B,
        abi: &dyn AbiAccessor,
        tid: Pid,
    ) -> Result<()> {
        for spec in self.specs.values_mut() {
            if !spec.site.is_enabled() {
                log::debug!("re-arming {} at {}", spec.name, spec.entry);
                spec.site.enable(backend, abi, tid)?;
            }
        }
        Ok(())
    }

    pub fn lookup_by_entry(&self, addr: VirtAddr) -> Option<&BreakpointSpec> {
        self.specs.get(&addr)
    }

    pub fn is_entry(&self, addr: VirtAddr) -> bool {
        self.specs.contains_key(&addr)
    }

    /// Run the original instruction under the entry trap at `addr` on `tid`.
    pub fn step_over<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        abi: &dyn AbiAccessor,
        addr: VirtAddr,
        tid: Pid,
    ) -> Result<()> {
        let spec = self
            .specs
            .get_mut(&addr)
            .ok_or_else(|| Error::Breakpoint(format!("no entry trap at {}", addr)))?;
        spec.site.step_over(backend, abi, tid)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BreakpointSpec> {
        self.specs.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::hooks::{Free, Malloc};
    use crate::testing::FakeTarget;

    fn resolver() -> HashMap<String, VirtAddr> {
        HashMap::from([
            ("malloc".to_string(), VirtAddr(0x7f00_1000)),
            ("free".to_string(), VirtAddr(0x7f00_2000)),
            ("__libc_malloc".to_string(), VirtAddr(0x7f00_1000)),
        ])
    }

    fn target() -> FakeTarget {
        let target = FakeTarget::new(Arch::X86_64);
        target.poke(0x7f00_1000, 0x1111_2222_3333_4455);
        target.poke(0x7f00_2000, 0x6666_7777_8888_9955);
        target
    }

    #[test]
    fn install_then_restore_is_byte_exact() {
        let target = target();
        let abi = Arch::X86_64.abi();
        let mut registry = Registry::new();
        registry
            .install(&target, abi, &resolver(), "malloc", Box::new(Malloc))
            .unwrap();
        registry
            .install(&target, abi, &resolver(), "free", Box::new(Free))
            .unwrap();

        assert!(abi.is_trap(target.peek(0x7f00_1000)));
        assert!(abi.is_trap(target.peek(0x7f00_2000)));
        let spec = registry.lookup_by_entry(VirtAddr(0x7f00_1000)).unwrap();
        assert_eq!(spec.name(), "malloc");
        assert_eq!(spec.saved_word(), 0x1111_2222_3333_4455);

        assert_eq!(registry.restore_all(&target, abi), 0);
        assert_eq!(target.peek(0x7f00_1000), 0x1111_2222_3333_4455);
        assert_eq!(target.peek(0x7f00_2000), 0x6666_7777_8888_9955);

        // Second restore writes nothing.
        let writes = target.writes_at(0x7f00_1000).len();
        registry.restore_all(&target, abi);
        assert_eq!(target.writes_at(0x7f00_1000).len(), writes);
    }

    #[test]
    fn unresolved_and_duplicate_names_fail() {
        let target = target();
        let abi = Arch::X86_64.abi();
        let mut registry = Registry::new();

        let err = registry
            .install(&target, abi, &resolver(), "calloc", Box::new(Malloc))
            .unwrap_err();
        assert!(matches!(err, Error::Symbol(ref n) if n == "calloc"));

        registry
            .install(&target, abi, &resolver(), "malloc", Box::new(Malloc))
            .unwrap();
        let err = registry
            .install(&target, abi, &resolver(), "__libc_malloc", Box::new(Malloc))
            .unwrap_err();
        assert!(matches!(err, Error::Breakpoint(_)));
        assert_eq!(registry.len(), 1);
        // The original word was saved once, not re-read through the trap.
        assert_eq!(target.writes_at(0x7f00_1000).len(), 1);
    }

    #[test]
    fn restore_on_exited_target_does_not_panic() {
        let mut target = target();
        let abi = Arch::X86_64.abi();
        let mut registry = Registry::new();
        registry
            .install(&target, abi, &resolver(), "malloc", Box::new(Malloc))
            .unwrap();
        target.kill();
        assert_eq!(registry.restore_all(&target, abi), 1);
        assert!(registry.lookup_by_entry(VirtAddr(0x7f00_1000)).unwrap().is_installed());
    }

    #[test]
    fn rearm_restores_a_trap_lost_mid_step() {
        let target = target();
        let abi = Arch::X86_64.abi();
        let mut registry = Registry::new();
        let tid = target.pid();
        registry
            .install(&target, abi, &resolver(), "malloc", Box::new(Malloc))
            .unwrap();
        registry
            .specs
            .get_mut(&VirtAddr(0x7f00_1000))
            .unwrap()
            .site
            .disable(&target, abi, tid)
            .unwrap();
        assert!(!abi.is_trap(target.peek(0x7f00_1000)));

        registry.rearm(&target, abi, tid).unwrap();
        assert!(abi.is_trap(target.peek(0x7f00_1000)));
        let writes = target.writes_at(0x7f00_1000).len();
        registry.rearm(&target, abi, tid).unwrap();
        assert_eq!(target.writes_at(0x7f00_1000).len(), writes);
    }

    #[test]
    fn step_over_unknown_address_is_an_error() {
        let mut target = target();
        let abi = Arch::X86_64.abi();
        let mut registry = Registry::new();
        let tid = target.pid();
        assert!(registry
            .step_over(&mut target, abi, VirtAddr(0x1234), tid)
            .is_err());
    }
}
