//! Register snapshots of a stopped thread.
//!
//! Table-driven: each architecture describes its `NT_PRSTATUS` regset as an
//! ordered list of register names, so a snapshot is just the raw regset words
//! and every register is addressable by name. The same layout is used to
//! decode what `PTRACE_GETREGSET` returns and to encode what
//! `PTRACE_SETREGSET` writes back.

use crate::arch::Arch;
use crate::error::{Error, Result};

/// `struct user_regs_struct` on x86_64.
const X86_64_LAYOUT: &[&str] = &[
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx",
    "rsi", "rdi", "orig_rax", "rip", "cs", "rflags", "rsp", "ss", "fs_base", "gs_base", "ds",
    "es", "fs", "gs",
];

/// `struct user_regs_struct` on i386 (also the compat view of a 32-bit task).
const X86_LAYOUT: &[&str] = &[
    "ebx", "ecx", "edx", "esi", "edi", "ebp", "eax", "ds", "es", "fs", "gs", "orig_eax", "eip",
    "cs", "eflags", "esp", "ss",
];

/// `struct pt_regs` on ARM: r0-r15, cpsr, orig_r0.
const ARMV7_LAYOUT: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "cpsr", "orig_r0",
];

/// `struct user_pt_regs` on AArch64.
const AARCH64_LAYOUT: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30", "sp", "pc", "pstate",
];

/// Ordered register names of the regset for `arch`.
pub fn layout(arch: Arch) -> &'static [&'static str] {
    match arch {
        Arch::X86 => X86_LAYOUT,
        Arch::X86_64 => X86_64_LAYOUT,
        Arch::Armv7 => ARMV7_LAYOUT,
        Arch::Aarch64 => AARCH64_LAYOUT,
    }
}

/// Names of the program counter and stack pointer for `arch`.
fn pc_and_sp(arch: Arch) -> (&'static str, &'static str) {
    match arch {
        Arch::X86 => ("eip", "esp"),
        Arch::X86_64 => ("rip", "rsp"),
        Arch::Armv7 => ("r15", "r13"),
        Arch::Aarch64 => ("pc", "sp"),
    }
}

/// Snapshot of one thread's general-purpose registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    arch: Arch,
    values: Vec<u64>,
}

impl Registers {
    /// An all-zero snapshot for `arch`.
    pub fn new(arch: Arch) -> Self {
        Registers {
            arch,
            values: vec![0; layout(arch).len()],
        }
    }

    /// Decode raw `NT_PRSTATUS` bytes (native endian).
    pub fn from_regset(arch: Arch, bytes: &[u8]) -> Result<Self> {
        let width = arch.word_size();
        let count = layout(arch).len();
        if bytes.len() < count * width {
            return Err(Error::Register(format!(
                "short {} regset: {} bytes, need {}",
                arch,
                bytes.len(),
                count * width
            )));
        }
        let values = bytes
            .chunks_exact(width)
            .take(count)
            .map(|chunk| match width {
                4 => u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as u64,
                _ => {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(chunk);
                    u64::from_ne_bytes(word)
                }
            })
            .collect();
        Ok(Registers { arch, values })
    }

    /// Encode back into the `NT_PRSTATUS` byte layout.
    pub fn to_regset(&self) -> Vec<u8> {
        let width = self.arch.word_size();
        let mut out = Vec::with_capacity(self.values.len() * width);
        for &value in &self.values {
            match width {
                4 => out.extend_from_slice(&(value as u32).to_ne_bytes()),
                _ => out.extend_from_slice(&value.to_ne_bytes()),
            }
        }
        out
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        layout(self.arch)
            .iter()
            .position(|&n| n == name)
            .ok_or_else(|| Error::Register(format!("unknown {} register: {}", self.arch, name)))
    }

    /// Get a register value by name.
    pub fn get(&self, name: &str) -> Result<u64> {
        Ok(self.values[self.index_of(name)?])
    }

    /// Set a register value by name. Values are truncated to the word size.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()> {
        let idx = self.index_of(name)?;
        self.values[idx] = value & self.arch.word_mask();
        Ok(())
    }

    /// Get the instruction pointer.
    pub fn pc(&self) -> u64 {
        let (pc, _) = pc_and_sp(self.arch);
        self.get(pc).unwrap_or(0)
    }

    /// Set the instruction pointer.
    pub fn set_pc(&mut self, addr: u64) {
        let (pc, _) = pc_and_sp(self.arch);
        let _ = self.set(pc, addr);
    }

    /// Get the stack pointer.
    pub fn sp(&self) -> u64 {
        let (_, sp) = pc_and_sp(self.arch);
        self.get(sp).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_kernel_regset_sizes() {
        assert_eq!(layout(Arch::X86_64).len(), 27);
        assert_eq!(layout(Arch::X86).len(), 17);
        assert_eq!(layout(Arch::Armv7).len(), 18);
        assert_eq!(layout(Arch::Aarch64).len(), 34);
    }

    #[test]
    fn get_set_by_name() {
        let mut regs = Registers::new(Arch::X86_64);
        regs.set("rdi", 0x400).unwrap();
        regs.set_pc(0x401000);
        assert_eq!(regs.get("rdi").unwrap(), 0x400);
        assert_eq!(regs.pc(), 0x401000);
        assert!(regs.get("eax").is_err());
        assert!(regs.set("x0", 1).is_err());
    }

    #[test]
    fn thirty_two_bit_values_are_truncated() {
        let mut regs = Registers::new(Arch::X86);
        regs.set("eax", 0x1_2345_6789).unwrap();
        assert_eq!(regs.get("eax").unwrap(), 0x2345_6789);
    }

    #[test]
    fn regset_bytes_round_trip_preserves_layout() {
        let mut regs = Registers::new(Arch::Armv7);
        regs.set("r0", 7).unwrap();
        regs.set("r13", 0xbeef_0000).unwrap();
        let bytes = regs.to_regset();
        assert_eq!(bytes.len(), 18 * 4);
        assert_eq!(&bytes[0..4], &7u32.to_ne_bytes());

        let decoded = Registers::from_regset(Arch::Armv7, &bytes).unwrap();
        assert_eq!(decoded, regs);
        assert_eq!(decoded.sp(), 0xbeef_0000);
    }

    #[test]
    fn short_regset_is_rejected() {
        let err = Registers::from_regset(Arch::Aarch64, &[0u8; 16]).unwrap_err();
        assert!(err.to_string().contains("short"));
    }
}
