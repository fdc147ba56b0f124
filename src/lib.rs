//! rleax — attach to a running Linux process and track its heap and mapping
//! allocations through software breakpoints, without recompiling, relinking or
//! restarting it.
//!
//! Every monitored allocator function gets a trap at its entry. When a thread
//! hits one, its arguments are captured, the original instruction is stepped
//! over, and a second, shared trap is armed at the return address. When the
//! call returns, arguments and return value are handed to the function's hook
//! together. This works when many threads call the same function from the
//! same call site at once.
//!
//! # Module overview
//!
//! ## Target control
//!
//! - [`error`] — Error types used throughout the crate.
//! - [`types`] — Core types: `VirtAddr`, `StopReason`, `ProcessState`.
//! - [`backend`] — The `TraceBackend` trait the tracer is written against.
//! - [`procfs`] — Linux procfs utilities (`/proc/pid/maps`, tasks, exe).
//! - [`process`] — `TraceBackend` over ptrace for a live process. *(Linux-only)*
//! - [`registers`] — Table-driven `NT_PRSTATUS` register snapshots.
//! - [`arch`] — Per-architecture calling conventions and trap encodings
//!   (x86, x86-64, ARMv7, AArch64).
//!
//! ## Symbols
//!
//! - [`elf`] — ELF symbol tables and architecture detection.
//! - [`symbols`] — Runtime symbol resolution across the process's images.
//! - [`backtrace`] — Frame-pointer stack walks for diagnostics.
//!
//! ## Tracing
//!
//! - [`trap`] — A single patched trap instruction.
//! - [`breakpoint`] — The registry of monitored entry points.
//! - [`correlate`] — Pairing entries with returns across threads.
//! - [`session`] — The event loop tying it all together.
//! - [`hooks`] — Allocator handlers turning calls into ledger updates.
//! - [`ledger`] — Live-allocation bookkeeping and the leak report.
//! - [`config`] — Session settings.

// Platform-independent modules
pub mod error;
pub mod types;
pub mod procfs;
pub mod elf;
pub mod arch;
pub mod registers;
pub mod backend;
pub mod symbols;
pub mod backtrace;
pub mod trap;
pub mod breakpoint;
pub mod correlate;
pub mod hooks;
pub mod ledger;
pub mod config;
pub mod session;

// Linux-only modules (ptrace, regsets)
#[cfg(target_os = "linux")]
pub mod process;

#[cfg(test)]
pub(crate) mod testing;
