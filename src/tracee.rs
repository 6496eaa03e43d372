//! Syscall-boundary tracking and syscall injection for a single traced process.

use std::marker::PhantomData;
use std::process::{Child, Command};

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{self, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::cmd;
use crate::error::{Error, Result, ResultExt};
use crate::regs::{RegisterFile, Registers, SyscallArgs};
use crate::stop::Stop;

/// Largest errno the kernel encodes in a syscall return value, as `-errno`.
const MAX_ERRNO: i64 = 4095;

/// Syscall substituted for an aborted call: no side effects, and always succeeds.
const NOOP_SYSNO: i64 = libc::SYS_getpid as i64;

/// Side of a syscall a tracee is stopped at.
///
/// Syscall-enter-stops and syscall-exit-stops look the same to the tracer, so the phase
/// is tracked by counting stops. It flips on every observed syscall-stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    // Not at a syscall-stop. The next syscall-stop is an entry.
    Unknown,

    Entry,
    Exit,
}

impl Phase {
    fn next(self) -> Self {
        match self {
            Phase::Unknown | Phase::Exit => Phase::Entry,
            Phase::Entry => Phase::Exit,
        }
    }
}

/// Side of a syscall to wait for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Entry,
    Exit,
}

impl Side {
    fn matches(self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (Side::Entry, Phase::Entry) | (Side::Exit, Phase::Exit)
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Liveness {
    Attached,

    // A fatal error left the register or stop state unknown.
    Faulted,

    // Terminated and reaped.
    Dead,

    Detached,
}

/// Exclusive tracing handle for one process in ptrace-stop.
///
/// Every request is issued from the thread that owns the handle, which must be the
/// thread the process was spawned from: the kernel binds the tracing relationship to it.
/// The handle is neither `Clone` nor `Send`.
///
/// After any [fatal](Error::is_fatal()) error, the handle only supports
/// [`detach()`](Tracee::detach()) and [`kill()`](Tracee::kill()); all other operations fail
/// with [`Error::Unusable`]. Dropping an attached handle detaches from the process.
#[derive(Debug)]
pub struct Tracee {
    pid: Pid,
    phase: Phase,
    status: WaitStatus,
    liveness: Liveness,
    last_remote_error: Option<Errno>,
    boundaries: u64,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Tracee {
    /// Take control of `pid`, a child which requested `PTRACE_TRACEME` before `exec()`.
    ///
    /// Blocks until the child reports its first stop, which must be the trace-trap that
    /// follows the exec.
    pub fn new(pid: Pid) -> Result<Self> {
        let status = wait::waitpid(pid, None).os_call("waitpid", pid)?;

        match Stop::classify(status) {
            Some(stop) if stop.is_trace_trap() => {},
            Some(stop) => {
                return Err(Error::UnexpectedStop { pid, expected: "trace-trap stop", stop });
            },
            None => {
                return Err(Error::UnclassifiedStatus { pid, status });
            },
        }

        let mut tracee = Self {
            pid,
            phase: Phase::Unknown,
            status,
            liveness: Liveness::Attached,
            last_remote_error: None,
            boundaries: 0,
            _not_send: PhantomData,
        };

        // Report syscall-stops as `SIGTRAP | 0x80`, so a real `SIGTRAP` is never mistaken
        // for a syscall boundary.
        let res = ptrace::setoptions(pid, Options::PTRACE_O_TRACESYSGOOD)
            .os_call("PTRACE_SETOPTIONS", pid);
        tracee.guard(res)?;

        info!(pid = pid.as_raw(), "attached to tracee");

        Ok(tracee)
    }

    /// Spawn `cmd` under trace, and take control of it once it has exec'd.
    pub fn spawn(cmd: Command) -> Result<(Child, Self)> {
        let child = cmd::spawn(cmd)?;
        let pid = Pid::from_raw(child.id() as i32);
        let tracee = Self::new(pid)?;

        Ok((child, tracee))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Raw status from the most recent wait.
    pub fn last_status(&self) -> WaitStatus {
        self.status
    }

    /// Error code of the most recent injected syscall, if it failed.
    pub fn last_remote_error(&self) -> Option<Errno> {
        self.last_remote_error
    }

    /// Number of syscall boundaries crossed since attaching.
    pub fn boundaries(&self) -> u64 {
        self.boundaries
    }

    /// The terminal stop, once the process has exited or been killed.
    pub fn exit_stop(&self) -> Option<Stop> {
        Stop::classify(self.status).filter(Stop::is_terminal)
    }

    pub fn is_dead(&self) -> bool {
        self.liveness == Liveness::Dead
    }

    pub fn registers(&self) -> Result<Registers> {
        self.ensure_attached()?;
        Registers::fetch(self.pid)
    }

    pub fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        self.ensure_attached()?;
        let res = regs.store(self.pid);
        self.guard(res)
    }

    /// Resume the tracee until its next syscall-stop, and return the new phase.
    ///
    /// Trace-trap stops, such as the one following an `execve()` by the tracee, are passed
    /// over. Fails with [`Error::UnexpectedStop`] if the tracee instead stops for any other
    /// signal, exits, or is killed.
    pub fn advance(&mut self) -> Result<Phase> {
        self.ensure_attached()?;
        let res = self.step();
        self.guard(res)?;

        Ok(self.phase)
    }

    /// Advance until the tracee is stopped at the given `side` of syscall `sysno`, and
    /// return its registers there.
    ///
    /// Returns immediately if the tracee is already at that stop. There is no timeout: if
    /// the tracee never makes the call, this only returns once it terminates.
    pub fn wait_for_syscall(&mut self, sysno: i64, side: Side) -> Result<Registers> {
        self.ensure_attached()?;
        let res = self.wait_for_syscall_inner(sysno, side);
        self.guard(res)
    }

    fn wait_for_syscall_inner(&mut self, sysno: i64, side: Side) -> Result<Registers> {
        loop {
            let regs = Registers::fetch(self.pid)?;

            if side.matches(self.phase) && regs.syscall_number() == sysno {
                return Ok(regs);
            }

            self.step()?;
        }
    }

    /// Make the tracee execute syscall `sysno` with `args`, and return its result.
    ///
    /// The injection happens at a syscall-entry stop, advancing to the next one if the
    /// tracee is not at one. Afterwards, the intercepted syscall is replayed with its own
    /// arguments and runs to completion, so the tracee is left at its syscall-exit stop
    /// having observed nothing but the injected call's side effects.
    ///
    /// If the injected call fails, returns [`Error::RemoteSyscall`] once the tracee has
    /// been restored; the handle remains usable.
    pub fn execute_syscall(&mut self, sysno: i64, args: &[u64]) -> Result<i64> {
        let args = SyscallArgs::try_from(args)?;

        self.ensure_attached()?;
        let res = self.inject(sysno, &args);
        self.guard(res)
    }

    fn inject(&mut self, sysno: i64, args: &SyscallArgs) -> Result<i64> {
        if self.phase != Phase::Entry {
            self.step()?;
        }

        let original = Registers::fetch(self.pid)?;

        let mut injected = original;
        injected.set_syscall_number(sysno);
        injected.set_args(args);
        injected.store(self.pid)?;

        debug!(
            pid = self.pid.as_raw(),
            sysno,
            args = ?args.as_slice(),
            intercepted = original.syscall_number(),
            "injecting syscall"
        );

        // Entry to exit, running the injected call.
        self.step()?;

        let result = Registers::fetch(self.pid)?.return_value();
        let errno = errno_from_return(result);
        self.last_remote_error = errno;

        debug!(pid = self.pid.as_raw(), sysno, result, "injected syscall returned");

        // Trap into the intercepted syscall again, and let it run.
        let mut restored = original;
        restored.rewind_syscall();
        restored.store(self.pid)?;

        self.step()?;
        self.step()?;

        match errno {
            Some(errno) => Err(Error::RemoteSyscall { pid: self.pid, sysno, errno }),
            None => Ok(result),
        }
    }

    /// Cancel the syscall the tracee is entering.
    ///
    /// The call is swapped for a side-effect-free one, and the tracee resumes after it
    /// seeing `-EINTR`, its registers otherwise as they were at entry. The tracee is left
    /// at the syscall-exit stop.
    pub fn abort_syscall(&mut self) -> Result<()> {
        self.ensure_attached()?;

        if self.phase != Phase::Entry {
            return Err(Error::NotAtSyscallEntry { pid: self.pid, phase: self.phase });
        }

        let res = self.abort_inner();
        self.guard(res)
    }

    fn abort_inner(&mut self) -> Result<()> {
        let original = Registers::fetch(self.pid)?;

        let mut noop = original;
        noop.set_syscall_number(NOOP_SYSNO);
        noop.store(self.pid)?;

        debug!(
            pid = self.pid.as_raw(),
            aborted = original.syscall_number(),
            "aborting syscall"
        );

        self.step()?;

        let mut restored = original;
        restored.set_return_value(-(libc::EINTR as i64));
        restored.store(self.pid)
    }

    /// Stop tracing the process, letting it run freely.
    pub fn detach(mut self) -> Result<()> {
        self.release()
    }

    /// Kill the process with `SIGKILL`, and reap it.
    pub fn kill(mut self) -> Result<Stop> {
        if let Some(stop) = self.exit_stop() {
            return Ok(stop);
        }

        signal::kill(self.pid, Signal::SIGKILL).os_call("kill", self.pid)?;

        loop {
            let status = wait::waitpid(self.pid, None).os_call("waitpid", self.pid)?;
            self.status = status;

            if let Some(stop) = self.exit_stop() {
                self.liveness = Liveness::Dead;
                info!(pid = self.pid.as_raw(), ?stop, "killed tracee");

                return Ok(stop);
            }
        }
    }

    // Restart with `PTRACE_SYSCALL`, and wait for the next syscall-stop.
    fn step(&mut self) -> Result<()> {
        let stop = loop {
            ptrace::syscall(self.pid, None).os_call("PTRACE_SYSCALL", self.pid)?;

            let status = wait::waitpid(self.pid, None).os_call("waitpid", self.pid)?;
            self.status = status;

            let stop = match Stop::classify(status) {
                Some(stop) => stop,
                None => return Err(Error::UnclassifiedStatus { pid: self.pid, status }),
            };

            // Raised after the tracee's own `execve()` returns. Suppress it, and keep going.
            if stop.is_trace_trap() {
                debug!(pid = self.pid.as_raw(), "trace-trap stop");
                continue;
            }

            break stop;
        };

        if stop != Stop::SyscallBoundary {
            if stop.is_terminal() {
                self.liveness = Liveness::Dead;
                info!(pid = self.pid.as_raw(), ?stop, "tracee terminated");
            }

            return Err(Error::UnexpectedStop { pid: self.pid, expected: "syscall-stop", stop });
        }

        self.phase = self.phase.next();
        self.boundaries += 1;

        debug!(pid = self.pid.as_raw(), phase = ?self.phase, "syscall-stop");

        Ok(())
    }

    fn ensure_attached(&self) -> Result<()> {
        let reason = match self.liveness {
            Liveness::Attached => return Ok(()),
            Liveness::Faulted => "an earlier request failed",
            Liveness::Dead => "the process has terminated",
            Liveness::Detached => "the process was detached",
        };

        Err(Error::Unusable { pid: self.pid, reason })
    }

    // Mark the handle faulted if `res` is a fatal error.
    fn guard<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if err.is_fatal() && self.liveness == Liveness::Attached {
                warn!(pid = self.pid.as_raw(), %err, "tracee faulted");
                self.liveness = Liveness::Faulted;
            }
        }

        res
    }

    fn release(&mut self) -> Result<()> {
        match self.liveness {
            Liveness::Dead | Liveness::Detached => return Ok(()),
            Liveness::Attached | Liveness::Faulted => {},
        }

        self.liveness = Liveness::Detached;
        ptrace::detach(self.pid, None).os_call("PTRACE_DETACH", self.pid)?;

        info!(pid = self.pid.as_raw(), "detached from tracee");

        Ok(())
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(pid = self.pid.as_raw(), %err, "unable to detach from tracee");
        }
    }
}

// Decode `-errno` from a raw syscall return value.
fn errno_from_return(value: i64) -> Option<Errno> {
    if (-MAX_ERRNO..0).contains(&value) {
        Some(Errno::from_i32((-value) as i32))
    } else {
        None
    }
}
