//! Frame-pointer stack walking, for diagnostics only.
//!
//! Allocator failures are reported with the caller's stack. The walk follows
//! the saved frame-pointer chain, so frames compiled without a frame pointer
//! are skipped or end the walk early. That is acceptable for log output.

use crate::arch::{AbiAccessor, WordReader};
use crate::error::Result;
use crate::registers::Registers;
use crate::symbols::SymbolResolver;
use crate::types::VirtAddr;

/// Hard ceiling on the walk, whatever depth is configured.
const MAX_FRAMES: usize = 256;

/// A single frame from stack walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub pc: VirtAddr,
    /// Frame pointer the pc was found through (0 for the innermost frame).
    pub fp: u64,
}

/// Walk the stack of a stopped thread, innermost frame first.
///
/// Returns at least the current pc. The walk stops at `max_depth` frames, at
/// a null or unreadable link, or when the chain stops moving up the stack.
pub fn walk(
    abi: &dyn AbiAccessor,
    regs: &Registers,
    read: WordReader<'_>,
    max_depth: usize,
) -> Result<Vec<Frame>> {
    let mask = abi.arch().word_mask();
    let limit = max_depth.min(MAX_FRAMES);
    let mut frames = vec![Frame {
        pc: VirtAddr(regs.pc()),
        fp: 0,
    }];
    let mut fp = abi.frame_pointer(regs)? & mask;

    while frames.len() < limit && fp != 0 {
        let (prev_slot, ret_slot) = abi.frame_record(fp);
        // A garbage frame pointer at the top of the address space.
        if prev_slot.0.abs_diff(ret_slot.0) > 8 || prev_slot.0.max(ret_slot.0) > mask {
            break;
        }
        let (Ok(prev), Ok(ret)) = (read(prev_slot), read(ret_slot)) else {
            break;
        };
        let (prev, ret) = (prev & mask, ret & mask);
        if ret == 0 {
            break;
        }
        frames.push(Frame {
            pc: VirtAddr(ret),
            fp,
        });
        if prev <= fp {
            break;
        }
        fp = prev;
    }
    Ok(frames)
}

/// Render frames as `function+offset`, or the bare address when unknown.
pub fn symbolize(frames: &[Frame], resolver: &dyn SymbolResolver) -> Vec<String> {
    frames
        .iter()
        .map(|frame| match resolver.symbolize(frame.pc) {
            Some(name) => format!("{} ({})", frame.pc, name),
            None => frame.pc.to_string(),
        })
        .collect()
}
