//! Per-architecture calling-convention and trap-instruction accessors.
//!
//! The rest of the crate only sees [`AbiAccessor`]; which implementation backs
//! it is decided once per session from the target's ELF header.
//!
//! The x86 family and the ARM family differ in two ways that must stay
//! visible here:
//!
//! - x86 traps with a one-byte `int3` patched over the low byte of the
//!   instruction word, and the kernel reports the pc *after* it, so the pc must
//!   be rewound by one before the original instruction can run.
//! - ARM traps with a full 4-byte undefined/`brk` instruction and the reported
//!   pc already points at it, so there is nothing to rewind.

use std::fmt;

use crate::error::{Error, Result};
use crate::registers::Registers;
use crate::types::VirtAddr;

/// Reads one word of target memory. Words are 8 bytes wide as returned by
/// `PTRACE_PEEKDATA`; 32-bit accessors mask what they need.
pub type WordReader<'a> = &'a dyn Fn(VirtAddr) -> Result<u64>;

/// Number of argument words captured per call.
pub const MAX_ARGS: usize = 6;

/// Target instruction-set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Armv7,
    Aarch64,
}

impl Arch {
    /// Width of a machine word in bytes.
    pub fn word_size(self) -> usize {
        match self {
            Arch::X86 | Arch::Armv7 => 4,
            Arch::X86_64 | Arch::Aarch64 => 8,
        }
    }

    /// Mask selecting the bits of one machine word.
    pub fn word_mask(self) -> u64 {
        match self.word_size() {
            4 => 0xFFFF_FFFF,
            _ => u64::MAX,
        }
    }

    /// Map an `object` architecture onto the supported set.
    pub fn from_object(arch: object::Architecture) -> Result<Self> {
        match arch {
            object::Architecture::I386 => Ok(Arch::X86),
            object::Architecture::X86_64 => Ok(Arch::X86_64),
            object::Architecture::Arm => Ok(Arch::Armv7),
            object::Architecture::Aarch64 => Ok(Arch::Aarch64),
            other => Err(Error::UnsupportedArch(format!("{:?}", other))),
        }
    }

    /// The accessor implementing this architecture's conventions.
    pub fn abi(self) -> &'static dyn AbiAccessor {
        match self {
            Arch::X86 => &X86,
            Arch::X86_64 => &X86_64,
            Arch::Armv7 => &Armv7,
            Arch::Aarch64 => &Aarch64,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Armv7 => "armv7",
            Arch::Aarch64 => "aarch64",
        };
        f.write_str(name)
    }
}

/// Uniform view of a calling convention and its trap instruction.
pub trait AbiAccessor: Sync {
    fn arch(&self) -> Arch;

    /// Argument `index` (0-based) at function entry.
    fn argument(&self, regs: &Registers, index: usize, read: WordReader<'_>) -> Result<u64>;

    /// Address the current call returns to, read at function entry.
    fn return_address(&self, regs: &Registers, read: WordReader<'_>) -> Result<VirtAddr>;

    /// Integer return value, read at the return site.
    fn return_value(&self, regs: &Registers) -> Result<u64>;

    fn stack_pointer(&self, regs: &Registers) -> u64 {
        regs.sp()
    }

    fn frame_pointer(&self, regs: &Registers) -> Result<u64>;

    /// Slots of a frame record: (saved caller frame pointer, return address).
    fn frame_record(&self, fp: u64) -> (VirtAddr, VirtAddr);

    /// Turn the reported pc of a trap stop into the trap's address, adjusting
    /// `regs` so that resuming executes the instruction at that address.
    fn rewind_pc(&self, regs: &mut Registers) -> VirtAddr;

    /// Whether [`AbiAccessor::rewind_pc`] modifies the snapshot.
    fn rewinds_pc(&self) -> bool;

    /// The word to write at a breakpoint address given its original word.
    fn encode_trap(&self, original: u64) -> u64;

    /// The word that undoes [`AbiAccessor::encode_trap`], given what is in
    /// memory now and what was saved at install time.
    fn restore_word(&self, current: u64, original: u64) -> u64;

    fn is_trap(&self, word: u64) -> bool;

    /// All six argument words.
    fn arguments(&self, regs: &Registers, read: WordReader<'_>) -> Result<[u64; MAX_ARGS]> {
        let mut args = [0u64; MAX_ARGS];
        for (i, slot) in args.iter_mut().enumerate() {
            *slot = self.argument(regs, i, read)?;
        }
        Ok(args)
    }
}

const INT3: u64 = 0xCC;
const ARM_UDF_TRAP: u64 = 0xE7F0_01F0;
const AARCH64_BRK: u64 = 0xD420_0000;
const LOW_WORD: u64 = 0xFFFF_FFFF;

fn check_index(arch: Arch, index: usize) -> Result<()> {
    if index >= MAX_ARGS {
        return Err(Error::Register(format!(
            "{} argument index {} out of range",
            arch, index
        )));
    }
    Ok(())
}

fn int3_encode(original: u64) -> u64 {
    (original & !0xFF) | INT3
}

fn int3_restore(current: u64, original: u64) -> u64 {
    (current & !0xFF) | (original & 0xFF)
}

fn word_encode(original: u64, trap: u64) -> u64 {
    (original & !LOW_WORD) | trap
}

// The whole 4-byte instruction comes back; the next instruction, which shares
// the 8-byte ptrace word, is left as it is now.
fn word_restore(current: u64, original: u64) -> u64 {
    (current & !LOW_WORD) | (original & LOW_WORD)
}

// ── x86 (cdecl) ──────────────────────────────────────────────────────

pub struct X86;

impl AbiAccessor for X86 {
    fn arch(&self) -> Arch {
        Arch::X86
    }

    fn argument(&self, regs: &Registers, index: usize, read: WordReader<'_>) -> Result<u64> {
        check_index(Arch::X86, index)?;
        let esp = regs.get("esp")?;
        Ok(read(VirtAddr(esp + 4 * (index as u64 + 1)))? & LOW_WORD)
    }

    fn return_address(&self, regs: &Registers, read: WordReader<'_>) -> Result<VirtAddr> {
        Ok(VirtAddr(read(VirtAddr(regs.get("esp")?))? & LOW_WORD))
    }

    fn return_value(&self, regs: &Registers) -> Result<u64> {
        regs.get("eax")
    }

    fn frame_pointer(&self, regs: &Registers) -> Result<u64> {
        regs.get("ebp")
    }

    fn frame_record(&self, fp: u64) -> (VirtAddr, VirtAddr) {
        (VirtAddr(fp), VirtAddr(fp.wrapping_add(4)))
    }

    fn rewind_pc(&self, regs: &mut Registers) -> VirtAddr {
        let pc = regs.pc().wrapping_sub(1) & LOW_WORD;
        regs.set_pc(pc);
        VirtAddr(pc)
    }

    fn rewinds_pc(&self) -> bool {
        true
    }

    fn encode_trap(&self, original: u64) -> u64 {
        int3_encode(original)
    }

    fn restore_word(&self, current: u64, original: u64) -> u64 {
        int3_restore(current, original)
    }

    fn is_trap(&self, word: u64) -> bool {
        word & 0xFF == INT3
    }
}

// ── x86-64 (System V) ───────────────────────────────────────────────

pub struct X86_64;

const X86_64_ARGS: [&str; MAX_ARGS] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];

impl AbiAccessor for X86_64 {
    fn arch(&self) -> Arch {
        Arch::X86_64
    }

    fn argument(&self, regs: &Registers, index: usize, _read: WordReader<'_>) -> Result<u64> {
        check_index(Arch::X86_64, index)?;
        regs.get(X86_64_ARGS[index])
    }

    fn return_address(&self, regs: &Registers, read: WordReader<'_>) -> Result<VirtAddr> {
        Ok(VirtAddr(read(VirtAddr(regs.get("rsp")?))?))
    }

    fn return_value(&self, regs: &Registers) -> Result<u64> {
        regs.get("rax")
    }

    fn frame_pointer(&self, regs: &Registers) -> Result<u64> {
        regs.get("rbp")
    }

    fn frame_record(&self, fp: u64) -> (VirtAddr, VirtAddr) {
        (VirtAddr(fp), VirtAddr(fp.wrapping_add(8)))
    }

    fn rewind_pc(&self, regs: &mut Registers) -> VirtAddr {
        let pc = regs.pc().wrapping_sub(1);
        regs.set_pc(pc);
        VirtAddr(pc)
    }

    fn rewinds_pc(&self) -> bool {
        true
    }

    fn encode_trap(&self, original: u64) -> u64 {
        int3_encode(original)
    }

    fn restore_word(&self, current: u64, original: u64) -> u64 {
        int3_restore(current, original)
    }

    fn is_trap(&self, word: u64) -> bool {
        word & 0xFF == INT3
    }
}

// ── ARMv7 (AAPCS) ───────────────────────────────────────────────────

pub struct Armv7;

impl AbiAccessor for Armv7 {
    fn arch(&self) -> Arch {
        Arch::Armv7
    }

    fn argument(&self, regs: &Registers, index: usize, read: WordReader<'_>) -> Result<u64> {
        check_index(Arch::Armv7, index)?;
        match index {
            0..=3 => regs.get(["r0", "r1", "r2", "r3"][index]),
            // Arguments 5 and 6 are spilled to the stack.
            _ => {
                let sp = regs.get("r13")?;
                Ok(read(VirtAddr(sp + 4 * (index as u64 - 4)))? & LOW_WORD)
            }
        }
    }

    fn return_address(&self, regs: &Registers, _read: WordReader<'_>) -> Result<VirtAddr> {
        Ok(VirtAddr(regs.get("r14")?))
    }

    fn return_value(&self, regs: &Registers) -> Result<u64> {
        regs.get("r0")
    }

    fn frame_pointer(&self, regs: &Registers) -> Result<u64> {
        regs.get("r11")
    }

    // `push {fp, lr}; add fp, sp, #4` leaves fp pointing at the saved lr.
    fn frame_record(&self, fp: u64) -> (VirtAddr, VirtAddr) {
        (VirtAddr(fp.wrapping_sub(4)), VirtAddr(fp))
    }

    fn rewind_pc(&self, regs: &mut Registers) -> VirtAddr {
        VirtAddr(regs.pc())
    }

    fn rewinds_pc(&self) -> bool {
        false
    }

    fn encode_trap(&self, original: u64) -> u64 {
        word_encode(original, ARM_UDF_TRAP)
    }

    fn restore_word(&self, current: u64, original: u64) -> u64 {
        word_restore(current, original)
    }

    fn is_trap(&self, word: u64) -> bool {
        word & LOW_WORD == ARM_UDF_TRAP
    }
}

// ── AArch64 (AAPCS64) ───────────────────────────────────────────────

pub struct Aarch64;

impl AbiAccessor for Aarch64 {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn argument(&self, regs: &Registers, index: usize, _read: WordReader<'_>) -> Result<u64> {
        check_index(Arch::Aarch64, index)?;
        regs.get(["x0", "x1", "x2", "x3", "x4", "x5"][index])
    }

    fn return_address(&self, regs: &Registers, _read: WordReader<'_>) -> Result<VirtAddr> {
        Ok(VirtAddr(regs.get("x30")?))
    }

    fn return_value(&self, regs: &Registers) -> Result<u64> {
        regs.get("x0")
    }

    fn frame_pointer(&self, regs: &Registers) -> Result<u64> {
        regs.get("x29")
    }

    fn frame_record(&self, fp: u64) -> (VirtAddr, VirtAddr) {
        (VirtAddr(fp), VirtAddr(fp.wrapping_add(8)))
    }

    fn rewind_pc(&self, regs: &mut Registers) -> VirtAddr {
        VirtAddr(regs.pc())
    }

    fn rewinds_pc(&self) -> bool {
        false
    }

    fn encode_trap(&self, original: u64) -> u64 {
        word_encode(original, AARCH64_BRK)
    }

    fn restore_word(&self, current: u64, original: u64) -> u64 {
        word_restore(current, original)
    }

    fn is_trap(&self, word: u64) -> bool {
        word & LOW_WORD == AARCH64_BRK
    }
}
