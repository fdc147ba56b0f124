//! Allocator hooks: turn completed allocator calls into ledger mutations.
//!
//! Each handler sees the call's six argument words as captured at entry and
//! the return value captured at the return site. Argument positions follow
//! the C prototypes:
//!
//! | function         | args                                     | result         |
//! |------------------|------------------------------------------|----------------|
//! | `malloc`         | size                                     | pointer        |
//! | `free`           | ptr                                      |                |
//! | `realloc`        | ptr, size                                | pointer        |
//! | `calloc`         | nmemb, size                              | pointer        |
//! | `posix_memalign` | memptr, alignment, size                  | 0 or errno     |
//! | `mmap`           | addr, length, prot, flags, fd, offset    | pointer        |
//! | `munmap`         | addr, length                             | 0 or -1        |

use nix::unistd::Pid;

use crate::arch::{WordReader, MAX_ARGS};
use crate::error::Result;
use crate::ledger::Ledger;
use crate::types::VirtAddr;

/// `MAP_FIXED` from the Linux uapi headers; identical on every supported arch.
const MAP_FIXED: u64 = 0x10;

/// A monitored call that has returned.
#[derive(Debug, Clone)]
pub struct CompletedCall<'a> {
    pub function: &'a str,
    pub tid: Pid,
    pub return_value: u64,
    pub args: [u64; MAX_ARGS],
    /// Mask of one target machine word.
    pub word_mask: u64,
}

impl CompletedCall<'_> {
    fn arg(&self, index: usize) -> u64 {
        self.args[index] & self.word_mask
    }

    fn arg_ptr(&self, index: usize) -> VirtAddr {
        VirtAddr(self.arg(index))
    }

    fn ret_ptr(&self) -> VirtAddr {
        VirtAddr(self.return_value & self.word_mask)
    }

    /// C `int` results only occupy the low 32 bits of the return register.
    fn ret_int(&self) -> i32 {
        self.return_value as u32 as i32
    }

    /// `(void *) -1`, the mmap failure value, at the target's word size.
    fn map_failed(&self) -> VirtAddr {
        VirtAddr(self.word_mask)
    }
}

/// What a handler may touch while processing a call.
pub struct HookContext<'a> {
    pub ledger: &'a mut dyn Ledger,
    /// Reads one word of target memory.
    pub read_word: WordReader<'a>,
    /// Symbolized frames of the calling thread, innermost first.
    pub backtrace: &'a dyn Fn() -> Vec<String>,
}

impl HookContext<'_> {
    fn log_backtrace(&self) {
        for (depth, frame) in (self.backtrace)().iter().enumerate() {
            log::warn!("  #{:<2} {}", depth, frame);
        }
    }

    fn delete(&mut self, call: &CompletedCall<'_>, address: VirtAddr) {
        if self.ledger.delete(address).is_none() {
            log::warn!(
                "{}: {} not tracked (thread {})",
                call.function,
                address,
                call.tid
            );
        }
    }
}

/// Receives every completed call of one monitored function, in return order.
pub trait CallHandler {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()>;
}

impl<F> CallHandler for F
where
    F: Fn(&CompletedCall<'_>, &mut HookContext<'_>) -> Result<()>,
{
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        self(call, ctx)
    }
}

pub struct Malloc;

impl CallHandler for Malloc {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        let (ptr, size) = (call.ret_ptr(), call.arg(0));
        log::debug!("malloc({}) = {} [{}]", size, ptr, call.tid);
        if !ptr.is_null() {
            ctx.ledger.create(ptr, size, call.tid);
        }
        Ok(())
    }
}

pub struct Free;

impl CallHandler for Free {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        let ptr = call.arg_ptr(0);
        log::debug!("free({}) [{}]", ptr, call.tid);
        if !ptr.is_null() {
            ctx.delete(call, ptr);
        }
        Ok(())
    }
}

pub struct Realloc;

impl CallHandler for Realloc {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        let (old, size, new) = (call.arg_ptr(0), call.arg(1), call.ret_ptr());
        log::debug!("realloc({}, {}) = {} [{}]", old, size, new, call.tid);

        if new.is_null() {
            // realloc(p, 0) may free p and return NULL; any other NULL result
            // leaves p untouched.
            if size == 0 && !old.is_null() {
                ctx.delete(call, old);
            }
            return Ok(());
        }
        if new == old {
            if !ctx.ledger.update_size(old, size) {
                log::warn!("realloc: {} not tracked (thread {})", old, call.tid);
                ctx.ledger.create(new, size, call.tid);
            }
            return Ok(());
        }
        if !old.is_null() {
            ctx.delete(call, old);
        }
        ctx.ledger.create(new, size, call.tid);
        Ok(())
    }
}

pub struct Calloc;

impl CallHandler for Calloc {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        let (nmemb, size, ptr) = (call.arg(0), call.arg(1), call.ret_ptr());
        log::debug!("calloc({}, {}) = {} [{}]", nmemb, size, ptr, call.tid);
        if !ptr.is_null() {
            ctx.ledger.create(ptr, nmemb.saturating_mul(size), call.tid);
        }
        Ok(())
    }
}

pub struct PosixMemalign;

impl CallHandler for PosixMemalign {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        let (memptr, alignment, size) = (call.arg_ptr(0), call.arg(1), call.arg(2));
        let status = call.ret_int();
        if status != 0 {
            log::warn!(
                "posix_memalign(align {}, size {}) failed with {} [{}]",
                alignment,
                size,
                status,
                call.tid
            );
            ctx.log_backtrace();
            return Ok(());
        }
        // The block address was stored through memptr in the target.
        let ptr = VirtAddr((ctx.read_word)(memptr)? & call.word_mask);
        log::debug!(
            "posix_memalign({}, {}, {}) -> {} [{}]",
            memptr,
            alignment,
            size,
            ptr,
            call.tid
        );
        ctx.ledger.create(ptr, size, call.tid);
        Ok(())
    }
}

pub struct Mmap;

impl CallHandler for Mmap {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        let (addr, length, flags, offset) = (call.arg_ptr(0), call.arg(1), call.arg(3), call.arg(5));
        let ret = call.ret_ptr();
        log::debug!(
            "mmap({}, {}, flags 0x{:x}, offset 0x{:x}) = {} [{}]",
            addr,
            length,
            flags,
            offset,
            ret,
            call.tid
        );
        if ret == call.map_failed() {
            return Ok(());
        }
        // A fixed mapping silently replaces whatever was mapped at addr.
        if !addr.is_null() && flags & MAP_FIXED != 0 && ctx.ledger.delete(addr).is_some() {
            log::debug!("mmap: MAP_FIXED replaced mapping at {}", addr);
        }
        ctx.ledger.create(ret, length.saturating_sub(offset), call.tid);
        Ok(())
    }
}

pub struct Munmap;

impl CallHandler for Munmap {
    fn on_return(&self, call: &CompletedCall<'_>, ctx: &mut HookContext<'_>) -> Result<()> {
        let (addr, length) = (call.arg_ptr(0), call.arg(1));
        let status = call.ret_int();
        log::debug!("munmap({}, {}) = {} [{}]", addr, length, status, call.tid);
        if status == 0 {
            ctx.delete(call, addr);
        }
        Ok(())
    }
}

/// The monitored function set, in install order.
pub fn allocator_hooks() -> Vec<(&'static str, Box<dyn CallHandler>)> {
    vec![
        ("malloc", Box::new(Malloc)),
        ("free", Box::new(Free)),
        ("realloc", Box::new(Realloc)),
        ("calloc", Box::new(Calloc)),
        ("posix_memalign", Box::new(PosixMemalign)),
        ("mmap", Box::new(Mmap)),
        ("munmap", Box::new(Munmap)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::ledger::MemoryLedger;
    use std::cell::Cell;

    const MASK: u64 = u64::MAX;

    fn tid() -> Pid {
        Pid::from_raw(100)
    }

    fn call<'a>(function: &'a str, return_value: u64, args: &[u64]) -> CompletedCall<'a> {
        let mut words = [0u64; MAX_ARGS];
        words[..args.len()].copy_from_slice(args);
        CompletedCall {
            function,
            tid: tid(),
            return_value,
            args: words,
            word_mask: MASK,
        }
    }

    fn no_memory(_: VirtAddr) -> Result<u64> {
        Err(Error::Ptrace(nix::errno::Errno::EIO))
    }

    fn no_frames() -> Vec<String> {
        Vec::new()
    }

    fn run(ledger: &mut MemoryLedger, handler: &dyn CallHandler, call: CompletedCall<'_>) {
        let mut ctx = HookContext {
            ledger,
            read_word: &no_memory,
            backtrace: &no_frames,
        };
        handler.on_return(&call, &mut ctx).unwrap();
    }

    fn size_at(ledger: &MemoryLedger, addr: u64) -> Option<u64> {
        ledger.lookup(VirtAddr(addr)).map(|a| a.size)
    }

    #[test]
    fn malloc_and_free() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &Malloc, call("malloc", 0x5000, &[1024]));
        assert_eq!(size_at(&ledger, 0x5000), Some(1024));

        // Failed allocation leaves the ledger alone.
        run(&mut ledger, &Malloc, call("malloc", 0, &[1 << 40]));
        assert_eq!(ledger.len(), 1);

        run(&mut ledger, &Free, call("free", 0, &[0x5000]));
        assert!(ledger.is_empty());

        // Unknown pointer and free(NULL) are harmless.
        run(&mut ledger, &Free, call("free", 0, &[0x9999]));
        run(&mut ledger, &Free, call("free", 0, &[0]));
        assert!(ledger.is_empty());
    }

    #[test]
    fn realloc_in_place_updates_size() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &Malloc, call("malloc", 0x5000, &[64]));
        run(&mut ledger, &Realloc, call("realloc", 0x5000, &[0x5000, 128]));
        assert_eq!(ledger.len(), 1);
        assert_eq!(size_at(&ledger, 0x5000), Some(128));
    }

    #[test]
    fn realloc_move_replaces_entry() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &Malloc, call("malloc", 0x5000, &[64]));
        run(&mut ledger, &Realloc, call("realloc", 0x8000, &[0x5000, 4096]));
        assert_eq!(size_at(&ledger, 0x5000), None);
        assert_eq!(size_at(&ledger, 0x8000), Some(4096));
    }

    #[test]
    fn realloc_edge_cases() {
        let mut ledger = MemoryLedger::new();

        // realloc(NULL, n) is malloc(n).
        run(&mut ledger, &Realloc, call("realloc", 0x5000, &[0, 32]));
        assert_eq!(size_at(&ledger, 0x5000), Some(32));

        // Failure keeps the old block.
        run(&mut ledger, &Realloc, call("realloc", 0, &[0x5000, 1 << 40]));
        assert_eq!(size_at(&ledger, 0x5000), Some(32));

        // realloc(p, 0) returning NULL frees p.
        run(&mut ledger, &Realloc, call("realloc", 0, &[0x5000, 0]));
        assert!(ledger.is_empty());
    }

    #[test]
    fn calloc_multiplies() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &Calloc, call("calloc", 0x7000, &[16, 24]));
        assert_eq!(size_at(&ledger, 0x7000), Some(384));
    }

    #[test]
    fn posix_memalign_reads_result_from_target() {
        let mut ledger = MemoryLedger::new();
        let read = |addr: VirtAddr| -> Result<u64> {
            assert_eq!(addr, VirtAddr(0x7ffd_0010));
            Ok(0x0060_0040)
        };
        let mut ctx = HookContext {
            ledger: &mut ledger,
            read_word: &read,
            backtrace: &no_frames,
        };
        PosixMemalign
            .on_return(
                &call("posix_memalign", 0, &[0x7ffd_0010, 64, 256]),
                &mut ctx,
            )
            .unwrap();
        assert_eq!(size_at(&ledger, 0x0060_0040), Some(256));
    }

    #[test]
    fn posix_memalign_failure_logs_backtrace_only() {
        let mut ledger = MemoryLedger::new();
        let walked = Cell::new(false);
        let frames = || {
            walked.set(true);
            vec!["main+0x10".to_string()]
        };
        let mut ctx = HookContext {
            ledger: &mut ledger,
            read_word: &no_memory,
            backtrace: &frames,
        };
        // EINVAL, with garbage in the upper half of the register.
        PosixMemalign
            .on_return(
                &call("posix_memalign", 0xffff_ffff_0000_0016, &[0x7ffd_0010, 3, 256]),
                &mut ctx,
            )
            .unwrap();
        assert!(walked.get());
        assert!(ledger.is_empty());
    }

    #[test]
    fn mmap_fixed_overlap_replaces_entry() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &Mmap, call("mmap", 0x7f00_0000, &[0, 8192, 3, 0x22, u64::MAX, 0]));
        assert_eq!(size_at(&ledger, 0x7f00_0000), Some(8192));

        // MAP_FIXED | MAP_PRIVATE | MAP_ANONYMOUS at the same address.
        run(
            &mut ledger,
            &Mmap,
            call("mmap", 0x7f00_0000, &[0x7f00_0000, 4096, 3, 0x32, u64::MAX, 0]),
        );
        assert_eq!(ledger.len(), 1);
        assert_eq!(size_at(&ledger, 0x7f00_0000), Some(4096));

        // A hint without MAP_FIXED never deletes anything.
        run(&mut ledger, &Mmap, call("mmap", 0x7f10_0000, &[0x7f00_0000, 4096, 3, 0x22, u64::MAX, 0]));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn mmap_failure_and_offset() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &Mmap, call("mmap", u64::MAX, &[0x7f00_0000, 4096, 3, 0x32, 3, 0]));
        assert!(ledger.is_empty());

        run(&mut ledger, &Mmap, call("mmap", 0x7f20_0000, &[0, 0x3000, 1, 0x2, 3, 0x1000]));
        assert_eq!(size_at(&ledger, 0x7f20_0000), Some(0x2000));
    }

    #[test]
    fn mmap_failure_on_32_bit_target() {
        let mut ledger = MemoryLedger::new();
        let mut c = call("mmap", 0xffff_ffff, &[0, 4096, 3, 0x22, 0xffff_ffff, 0]);
        c.word_mask = 0xffff_ffff;
        run(&mut ledger, &Mmap, c);
        assert!(ledger.is_empty());
    }

    #[test]
    fn munmap_only_on_success() {
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &Mmap, call("mmap", 0x7f00_0000, &[0, 4096, 3, 0x22, u64::MAX, 0]));
        run(&mut ledger, &Munmap, call("munmap", u64::MAX, &[0x7f00_0000, 4096]));
        assert_eq!(ledger.len(), 1);
        run(&mut ledger, &Munmap, call("munmap", 0, &[0x7f00_0000, 4096]));
        assert!(ledger.is_empty());
    }

    fn handler<F>(f: F) -> F
    where
        F: Fn(&CompletedCall<'_>, &mut HookContext<'_>) -> Result<()>,
    {
        f
    }

    #[test]
    fn closures_are_handlers() {
        let seen = Cell::new(0u64);
        let record = handler(|c, _| {
            seen.set(c.return_value);
            Ok(())
        });
        let mut ledger = MemoryLedger::new();
        run(&mut ledger, &record, call("malloc", 0x42, &[1]));
        assert_eq!(seen.get(), 0x42);
    }

    #[test]
    fn hook_set_is_complete() {
        let names: Vec<&str> = allocator_hooks().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            ["malloc", "free", "realloc", "calloc", "posix_memalign", "mmap", "munmap"]
        );
    }
}
