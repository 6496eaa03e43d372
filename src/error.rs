use std::io;

use nix::errno::Errno;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::stop::Stop;
use crate::tracee::Phase;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{call}` failed for tracee = {pid}")]
    Os {
        call: &'static str,
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not spawn tracee `{program}`")]
    Spawn { program: String, source: io::Error },

    #[error("`{call}` failed on coordination channel")]
    Socket {
        call: &'static str,
        source: io::Error,
    },

    #[error("Unexpected stop for tracee = {pid}: expected {expected}, got {stop:?}")]
    UnexpectedStop {
        pid: Pid,
        expected: &'static str,
        stop: Stop,
    },

    #[error("Unclassifiable wait status for tracee = {pid}: {status:?}")]
    UnclassifiedStatus { pid: Pid, status: WaitStatus },

    #[error("Injected syscall {sysno} failed in tracee = {pid}: {errno}")]
    RemoteSyscall { pid: Pid, sysno: i64, errno: Errno },

    #[error("Socket path is {len} bytes, must be shorter than {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("Syscalls take at most 6 arguments, got {count}")]
    TooManyArguments { count: usize },

    #[error("Tracee = {pid} is not at a syscall-entry stop (phase = {phase:?})")]
    NotAtSyscallEntry { pid: Pid, phase: Phase },

    #[error("Tracee = {pid} can no longer be used: {reason}")]
    Unusable { pid: Pid, reason: &'static str },
}

impl Error {
    /// Whether the error ends the tracing session for the affected tracee.
    ///
    /// Injected syscall failures and caller-correctable input errors are not fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Os { .. }
            | Error::UnexpectedStop { .. }
            | Error::UnclassifiedStatus { .. }
            | Error::Unusable { .. } => true,
            Error::Spawn { .. }
            | Error::Socket { .. }
            | Error::RemoteSyscall { .. }
            | Error::PathTooLong { .. }
            | Error::TooManyArguments { .. }
            | Error::NotAtSyscallEntry { .. } => false,
        }
    }

    /// Whether the error indicates that the traced process no longer exists.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::Os { source, .. } => *source == Errno::ESRCH,
            Error::UnexpectedStop { stop, .. } => stop.is_terminal(),
            _ => false,
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Attach the failing call and tracee to a raw OS error.
    fn os_call(self, call: &'static str, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn os_call(self, call: &'static str, pid: Pid) -> Result<T> {
        self.map_err(|source| Error::Os { call, pid, source })
    }
}

pub(crate) trait IoResultExt<T> {
    fn socket_call(self, call: &'static str) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn socket_call(self, call: &'static str) -> Result<T> {
        self.map_err(|source| Error::Socket { call, source })
    }
}
