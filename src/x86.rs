use nix::unistd::Pid;

use crate::error::Result;
use crate::regs::{self, RegisterFile, SyscallArgs, MAX_SYSCALL_ARGS, NT_PRSTATUS};

/// Mirror of `struct user_regs_struct`, defined in
/// [`arch/x86/include/asm/user_64.h`](https://github.com/torvalds/linux/blob/v6.1/arch/x86/include/asm/user_64.h#L69).
///
/// Defined here, rather than taken from `libc`, so the layout is usable on any host.
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct user_regs_struct {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// x86-64 register state. The whole file, syscall number included, moves as one
/// `NT_PRSTATUS` regset.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Registers {
    pub regs: user_regs_struct,
}

impl RegisterFile for Registers {
    /// `syscall` is encoded as `0f 05`.
    const SYSCALL_INSN_LEN: u64 = 2;

    fn fetch(pid: Pid) -> Result<Self> {
        let regs = regs::get_regset(pid, NT_PRSTATUS)?;
        Ok(Self { regs })
    }

    fn store(&self, pid: Pid) -> Result<()> {
        regs::set_regset(pid, NT_PRSTATUS, &self.regs)
    }

    // At a syscall-stop, the kernel reports the syscall number in `orig_rax`; `rax` holds
    // `-ENOSYS` on entry and the result on exit.
    fn syscall_number(&self) -> i64 {
        self.regs.orig_rax as i64
    }

    fn set_syscall_number(&mut self, sysno: i64) {
        self.regs.orig_rax = sysno as u64;
    }

    fn args(&self) -> [u64; MAX_SYSCALL_ARGS] {
        let r = &self.regs;
        [r.rdi, r.rsi, r.rdx, r.r10, r.r8, r.r9]
    }

    fn set_args(&mut self, args: &SyscallArgs) {
        let r = &mut self.regs;
        let slots = [
            &mut r.rdi,
            &mut r.rsi,
            &mut r.rdx,
            &mut r.r10,
            &mut r.r8,
            &mut r.r9,
        ];

        for (slot, arg) in slots.into_iter().zip(args.as_slice()) {
            *slot = *arg;
        }
    }

    fn return_value(&self) -> i64 {
        self.regs.rax as i64
    }

    fn set_return_value(&mut self, value: i64) {
        self.regs.rax = value as u64;
    }

    fn pc(&self) -> u64 {
        self.regs.rip
    }

    fn set_pc(&mut self, pc: u64) {
        self.regs.rip = pc;
    }

    fn rewind_syscall(&mut self) {
        self.regs.rip = self.regs.rip.wrapping_sub(Self::SYSCALL_INSN_LEN);

        // The trap instruction reads the syscall number from `rax`.
        self.regs.rax = self.regs.orig_rax;
    }
}
