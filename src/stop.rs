//! Classification of `wait(2)` statuses reported for a tracee.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// The kind of state change reported for a tracee by its most recent wait.
///
/// With `PTRACE_O_TRACESYSGOOD` in effect, syscall-stops are reported distinctly from
/// signal-delivery-stops, including deliveries of a genuine `SIGTRAP`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    // syscall-enter-stop or syscall-exit-stop, indistinguishable to the tracer.
    SyscallBoundary,

    // signal-delivery-stop, including the trace-trap raised after a traced `execve()`.
    SignalDelivery { signal: Signal },

    // Terminal.
    Exited { exit_code: i32 },
    Killed { signal: Signal, core_dumped: bool },
}

impl Stop {
    /// Classify a raw wait status.
    ///
    /// Returns `None` for statuses outside the four kinds, such as ptrace-event-stops
    /// (which are never requested) or `WCONTINUED` reports.
    pub fn classify(status: WaitStatus) -> Option<Self> {
        let stop = match status {
            WaitStatus::PtraceSyscall(_) => Stop::SyscallBoundary,
            WaitStatus::Stopped(_, signal) => Stop::SignalDelivery { signal },
            WaitStatus::Exited(_, exit_code) => Stop::Exited { exit_code },
            WaitStatus::Signaled(_, signal, core_dumped) => Stop::Killed { signal, core_dumped },
            WaitStatus::PtraceEvent(..) | WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                return None;
            },
        };

        Some(stop)
    }

    /// The process no longer exists, and has been reaped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stop::Exited { .. } | Stop::Killed { .. })
    }

    pub fn is_trace_trap(&self) -> bool {
        matches!(self, Stop::SignalDelivery { signal: Signal::SIGTRAP })
    }
}
