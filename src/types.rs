use std::fmt;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Virtual address in the traced process (post-ASLR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u64> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_sub(rhs))
    }
}

/// Why the tracer regained control, as reported by the trace backend.
///
/// The trap address is deliberately absent from `Trap`: locating it needs the
/// register snapshot and the target's pc-rewind rule, which the dispatcher
/// owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A thread executed a trap instruction.
    Trap { tid: Pid },
    /// A thread stopped with a signal that belongs to the target.
    Signal { tid: Pid, signal: Signal },
    /// `tid` spawned a new thread `child`; both are traced.
    ThreadCreated { tid: Pid, child: Pid },
    /// A non-leader thread exited.
    ThreadExited { tid: Pid },
    /// The thread-group leader exited with a status code.
    Exited(i32),
    /// The thread-group leader was killed by a signal.
    Terminated(Signal),
    /// The wait was interrupted before any thread stopped.
    Interrupted,
}

/// Target execution state from the backend's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Halted,
    Exited,
    Detached,
}
