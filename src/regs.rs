//! Register access for stopped tracees.
//!
//! Each supported CPU family provides a [`RegisterFile`] describing where the syscall
//! number, arguments, return value, and program counter live, and how to move a full
//! register set in and out of a stopped tracee. The rest of the crate only names the
//! native implementation through [`Registers`].

use std::fmt::Debug;
use std::mem::{self, MaybeUninit};

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::trace;

use crate::error::{Error, Result, ResultExt};

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

#[cfg(target_arch = "x86_64")]
use crate::x86;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("Unsupported architecture: only x86_64 and aarch64 are supported.");

/// Register state of a tracee on the host architecture.
#[cfg(target_arch = "x86_64")]
pub type Registers = x86::Registers;

/// Register state of a tracee on the host architecture.
#[cfg(target_arch = "aarch64")]
pub type Registers = aarch64::Registers;

/// Maximum number of syscall arguments on every supported architecture.
pub const MAX_SYSCALL_ARGS: usize = 6;

/// Linux constant defined in `include/uapi/linux/elf.h`.
pub(crate) const NT_PRSTATUS: libc::c_int = 0x1;

/// Full general-purpose register set of a stopped tracee.
pub trait RegisterFile: Copy + Debug + Eq {
    /// Width in bytes of the trap instruction that enters the kernel.
    const SYSCALL_INSN_LEN: u64;

    /// Read the register set of the stopped tracee `pid`.
    fn fetch(pid: Pid) -> Result<Self>;

    /// Write the register set into the stopped tracee `pid`.
    fn store(&self, pid: Pid) -> Result<()>;

    fn syscall_number(&self) -> i64;

    fn set_syscall_number(&mut self, sysno: i64);

    /// Argument slots in syscall ABI order.
    fn args(&self) -> [u64; MAX_SYSCALL_ARGS];

    /// Overwrite the first `args.len()` argument slots, leaving the rest untouched.
    fn set_args(&mut self, args: &SyscallArgs);

    fn return_value(&self) -> i64;

    fn set_return_value(&mut self, value: i64);

    fn pc(&self) -> u64;

    fn set_pc(&mut self, pc: u64);

    /// Rewind the program counter onto the trap instruction, and arrange for it to
    /// re-issue the syscall number held in [`syscall_number()`](Self::syscall_number).
    fn rewind_syscall(&mut self);
}

/// Arguments for an injected syscall: up to six slots, and how many are used.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyscallArgs {
    slots: [u64; MAX_SYSCALL_ARGS],
    len: usize,
}

impl SyscallArgs {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.slots[..self.len]
    }
}

impl TryFrom<&[u64]> for SyscallArgs {
    type Error = Error;

    fn try_from(args: &[u64]) -> Result<Self> {
        if args.len() > MAX_SYSCALL_ARGS {
            return Err(Error::TooManyArguments { count: args.len() });
        }

        let mut slots = [0; MAX_SYSCALL_ARGS];
        slots[..args.len()].copy_from_slice(args);

        Ok(Self { slots, len: args.len() })
    }
}

/// Read the regset identified by the ELF note type `note` via `PTRACE_GETREGSET`.
///
/// `T` must be a plain-old-data `repr(C)` mirror of the kernel layout for `note`.
pub(crate) fn get_regset<T: Copy>(pid: Pid, note: libc::c_int) -> Result<T> {
    let mut data = MaybeUninit::<T>::zeroed();
    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr() as *mut libc::c_void,
        iov_len: mem::size_of::<T>(),
    };

    // SAFETY: the kernel writes at most `iov_len` bytes into `data`, which was zeroed and
    // only holds integer fields.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            note as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec as *mut libc::c_void,
        )
    };
    Errno::result(res).os_call("PTRACE_GETREGSET", pid)?;

    trace!(pid = pid.as_raw(), note, len = iov.iov_len, "read regset");

    Ok(unsafe { data.assume_init() })
}

/// Write the regset identified by the ELF note type `note` via `PTRACE_SETREGSET`.
pub(crate) fn set_regset<T: Copy>(pid: Pid, note: libc::c_int, data: &T) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: data as *const T as *mut libc::c_void,
        iov_len: mem::size_of::<T>(),
    };

    // SAFETY: the kernel only reads from `iov_base` for a SETREGSET request.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            note as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec as *mut libc::c_void,
        )
    };
    Errno::result(res).os_call("PTRACE_SETREGSET", pid)?;

    trace!(pid = pid.as_raw(), note, "wrote regset");

    Ok(())
}
