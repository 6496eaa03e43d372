//! Observe, redirect, and inject system calls in a traced child process.
//!
//! A [`Tracee`] owns the tracing relationship with one process. It steps the process one
//! syscall boundary at a time, and can make it execute syscalls chosen by the controller
//! while keeping its own pending syscall intact.

pub mod aarch64;
pub mod channel;
pub mod cmd;
pub mod error;
pub mod regs;
pub mod stop;
pub mod tracee;
pub mod x86;

pub use channel::{Channel, Listener};
pub use error::{Error, Result};
pub use regs::{RegisterFile, Registers, SyscallArgs};
pub use stop::Stop;
pub use tracee::{Phase, Side, Tracee};

pub use nix::errno::Errno;
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
