//! Bookkeeping of live allocations in the target.
//!
//! The tracer only ever talks to the [`Ledger`] trait. [`MemoryLedger`] keeps
//! entries in address order, journals every mutation, and renders the
//! unfreed-allocation report printed when tracing stops.

use std::collections::BTreeMap;
use std::fmt;

use colored::Colorize;
use nix::unistd::Pid;

use crate::types::VirtAddr;

/// One tracked allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub address: VirtAddr,
    pub size: u64,
    /// Thread whose call created the entry.
    pub owner: Pid,
    /// Creation order across the whole session.
    pub serial: u64,
}

/// A ledger mutation, as journaled by [`MemoryLedger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Create { address: VirtAddr, size: u64, owner: Pid },
    UpdateSize { address: VirtAddr, size: u64 },
    Delete { address: VirtAddr },
}

pub trait Ledger {
    /// Start tracking an allocation. An existing entry at the same address
    /// (whose free we missed) is replaced.
    fn create(&mut self, address: VirtAddr, size: u64, owner: Pid);

    /// Change the size of a tracked allocation. Returns false on a miss.
    fn update_size(&mut self, address: VirtAddr, size: u64) -> bool;

    /// Stop tracking an allocation.
    fn delete(&mut self, address: VirtAddr) -> Option<Allocation>;

    fn lookup(&self, address: VirtAddr) -> Option<&Allocation>;

    /// Everything still tracked, in address order.
    fn live(&self) -> Vec<&Allocation>;
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: BTreeMap<VirtAddr, Allocation>,
    journal: Vec<LedgerEvent>,
    next_serial: u64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mutation so far, in order.
    pub fn journal(&self) -> &[LedgerEvent] {
        &self.journal
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summary of allocations that were never freed.
    pub fn report(&self) -> LeakReport {
        let mut entries: Vec<Allocation> = self.entries.values().cloned().collect();
        entries.sort_by_key(|a| a.serial);
        LeakReport { entries }
    }
}

impl Ledger for MemoryLedger {
    fn create(&mut self, address: VirtAddr, size: u64, owner: Pid) {
        let serial = self.next_serial;
        self.next_serial += 1;
        if let Some(stale) = self.entries.insert(
            address,
            Allocation {
                address,
                size,
                owner,
                serial,
            },
        ) {
            log::warn!(
                "allocation at {} created again; dropping stale entry of {} bytes",
                address,
                stale.size
            );
        }
        self.journal.push(LedgerEvent::Create {
            address,
            size,
            owner,
        });
    }

    fn update_size(&mut self, address: VirtAddr, size: u64) -> bool {
        match self.entries.get_mut(&address) {
            Some(entry) => {
                entry.size = size;
                self.journal.push(LedgerEvent::UpdateSize { address, size });
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, address: VirtAddr) -> Option<Allocation> {
        let removed = self.entries.remove(&address)?;
        self.journal.push(LedgerEvent::Delete { address });
        Some(removed)
    }

    fn lookup(&self, address: VirtAddr) -> Option<&Allocation> {
        self.entries.get(&address)
    }

    fn live(&self) -> Vec<&Allocation> {
        self.entries.values().collect()
    }
}

/// Allocations still live when tracing stopped, oldest first.
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub entries: Vec<Allocation>,
}

impl LeakReport {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|a| a.size).sum()
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return writeln!(f, "{}", "no unfreed allocations".green());
        }
        writeln!(
            f,
            "{} {} unfreed allocations, {} bytes",
            "==".bold(),
            self.entries.len().to_string().red().bold(),
            self.total_bytes()
        )?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {:>18}  {:>10} bytes  thread {}",
                entry.address.to_string().cyan(),
                entry.size,
                entry.owner
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> Pid {
        Pid::from_raw(7)
    }

    #[test]
    fn create_update_delete() {
        let mut ledger = MemoryLedger::new();
        ledger.create(VirtAddr(0x1000), 64, tid());
        assert_eq!(ledger.lookup(VirtAddr(0x1000)).unwrap().size, 64);

        assert!(ledger.update_size(VirtAddr(0x1000), 128));
        assert!(!ledger.update_size(VirtAddr(0x2000), 1));
        assert_eq!(ledger.lookup(VirtAddr(0x1000)).unwrap().size, 128);

        assert_eq!(ledger.delete(VirtAddr(0x1000)).unwrap().size, 128);
        assert!(ledger.delete(VirtAddr(0x1000)).is_none());
        assert!(ledger.is_empty());

        assert_eq!(
            ledger.journal(),
            &[
                LedgerEvent::Create {
                    address: VirtAddr(0x1000),
                    size: 64,
                    owner: tid()
                },
                LedgerEvent::UpdateSize {
                    address: VirtAddr(0x1000),
                    size: 128
                },
                LedgerEvent::Delete {
                    address: VirtAddr(0x1000)
                },
            ]
        );
    }

    #[test]
    fn recreate_replaces_stale_entry() {
        let mut ledger = MemoryLedger::new();
        ledger.create(VirtAddr(0x1000), 64, tid());
        ledger.create(VirtAddr(0x1000), 32, tid());
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.lookup(VirtAddr(0x1000)).unwrap().serial, 1);
    }

    #[test]
    fn report_lists_oldest_first() {
        let mut ledger = MemoryLedger::new();
        ledger.create(VirtAddr(0x3000), 30, tid());
        ledger.create(VirtAddr(0x1000), 10, tid());
        ledger.create(VirtAddr(0x2000), 20, tid());
        ledger.delete(VirtAddr(0x1000));

        let report = ledger.report();
        let order: Vec<u64> = report.entries.iter().map(|a| a.address.addr()).collect();
        assert_eq!(order, vec![0x3000, 0x2000]);
        assert_eq!(report.total_bytes(), 50);

        colored::control::set_override(false);
        let text = report.to_string();
        assert!(text.contains("2 unfreed allocations, 50 bytes"));
        assert!(text.contains("0x3000"));
    }
}
