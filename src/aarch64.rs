use nix::unistd::Pid;

use crate::error::Result;
use crate::regs::{self, RegisterFile, SyscallArgs, MAX_SYSCALL_ARGS, NT_PRSTATUS};

/// Defined in [`include/uapi/linux/elf.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/include/uapi/linux/elf.h#424).
const NT_ARM_SYSTEM_CALL: libc::c_int = 0x404;

/// Register holding the syscall number for the `svc` trap.
const SYSNO_REG: usize = 8;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// AArch64 register state.
///
/// The kernel latches the syscall number at entry, so writes to `x8` at a syscall-stop
/// are ignored. It is instead read and written through its own `NT_ARM_SYSTEM_CALL`
/// regset, carried here as `syscallno`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    pub regs: user_pt_regs,
    pub syscallno: libc::c_int,
}

impl RegisterFile for Registers {
    /// `svc #0` is one fixed-width instruction.
    const SYSCALL_INSN_LEN: u64 = 4;

    fn fetch(pid: Pid) -> Result<Self> {
        let regs = regs::get_regset(pid, NT_PRSTATUS)?;
        let syscallno = regs::get_regset(pid, NT_ARM_SYSTEM_CALL)?;

        Ok(Self { regs, syscallno })
    }

    fn store(&self, pid: Pid) -> Result<()> {
        regs::set_regset(pid, NT_PRSTATUS, &self.regs)?;
        regs::set_regset(pid, NT_ARM_SYSTEM_CALL, &self.syscallno)
    }

    fn syscall_number(&self) -> i64 {
        i64::from(self.syscallno)
    }

    fn set_syscall_number(&mut self, sysno: i64) {
        self.syscallno = sysno as libc::c_int;
    }

    fn args(&self) -> [u64; MAX_SYSCALL_ARGS] {
        let mut args = [0; MAX_SYSCALL_ARGS];
        args.copy_from_slice(&self.regs.regs[..MAX_SYSCALL_ARGS]);
        args
    }

    fn set_args(&mut self, args: &SyscallArgs) {
        let args = args.as_slice();
        self.regs.regs[..args.len()].copy_from_slice(args);
    }

    // `x0` doubles as the first argument on entry and the result on exit.
    fn return_value(&self) -> i64 {
        self.regs.regs[0] as i64
    }

    fn set_return_value(&mut self, value: i64) {
        self.regs.regs[0] = value as u64;
    }

    fn pc(&self) -> u64 {
        self.regs.pc
    }

    fn set_pc(&mut self, pc: u64) {
        self.regs.pc = pc;
    }

    fn rewind_syscall(&mut self) {
        self.regs.pc = self.regs.pc.wrapping_sub(Self::SYSCALL_INSN_LEN);

        // The re-executed `svc` reads the number from `x8`.
        self.regs.regs[SYSNO_REG] = self.syscallno as u64;
    }
}
