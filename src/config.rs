//! Session settings.

use nix::unistd::Pid;

/// Default number of frames logged with an allocator failure.
pub const DEFAULT_BACKTRACE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceConfig {
    /// Process to attach to.
    pub pid: Pid,
    /// Frames captured when a handler asks for a backtrace. 0 disables it.
    pub backtrace_depth: usize,
    /// Print unfreed allocations when tracing stops.
    pub report: bool,
}

impl TraceConfig {
    pub fn new(pid: Pid) -> Self {
        TraceConfig {
            pid,
            ..Self::default()
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            pid: Pid::from_raw(0),
            backtrace_depth: DEFAULT_BACKTRACE_DEPTH,
            report: true,
        }
    }
}
