use std::fs;

use anyhow::Result;
use continuity::{Errno, Error, Phase, RegisterFile, Side, Tracee};
use ntest::timeout;
use pretty_assertions::assert_eq;

mod support;
use support::*;

fn getpid_child() -> i32 {
    bind_abstract(b"continuity-test-inject-getpid")
}

fn failing_child() -> i32 {
    bind_abstract(b"continuity-test-inject-failing")
}

fn rebind_child() -> i32 {
    rebind_abstract(b"continuity-test-inject-rebind")
}

fn dup_child() -> i32 {
    bind_abstract(b"continuity-test-inject-dup")
}

fn unknown_phase_child() -> i32 {
    bind_abstract(b"continuity-test-inject-unknown")
}

fn too_many_args_child() -> i32 {
    bind_abstract(b"continuity-test-inject-args")
}

fn abort_child() -> i32 {
    bind_abstract(b"continuity-test-abort")
}

fn abort_exit_child() -> i32 {
    bind_abstract(b"continuity-test-abort-exit")
}

#[test]
#[timeout(2000)]
fn test_inject_getpid_at_bind_entry() -> Result<()> {
    let pid = fork_tracee(getpid_child)?;
    let mut tracee = Tracee::new(pid)?;

    let before = tracee.wait_for_syscall(sys_bind(), Side::Entry)?;

    let result = tracee.execute_syscall(sys_getpid(), &[])?;
    assert_eq!(result, i64::from(pid.as_raw()));
    assert_eq!(tracee.last_remote_error(), None);

    // The intercepted `bind()` has run to completion, with its own arguments.
    assert_eq!(tracee.phase(), Phase::Exit);

    let after = tracee.registers()?;
    assert_eq!(after.syscall_number(), sys_bind());
    assert_eq!(after.pc(), before.pc());
    assert_eq!(&after.args()[1..], &before.args()[1..]);
    assert_eq!(after.return_value(), 0);

    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_failed_injection_restores_tracee() -> Result<()> {
    let pid = fork_tracee(failing_child)?;
    let mut tracee = Tracee::new(pid)?;

    tracee.wait_for_syscall(sys_bind(), Side::Entry)?;

    let err = tracee
        .execute_syscall(libc::SYS_close as i64, &[9999])
        .unwrap_err();

    assert!(!err.is_fatal());
    match err {
        Error::RemoteSyscall { errno, .. } => assert_eq!(errno, Errno::EBADF),
        err => panic!("expected remote syscall error, got {:?}", err),
    }
    assert_eq!(tracee.last_remote_error(), Some(Errno::EBADF));

    // Still usable, and the original `bind()` still happened.
    let regs = tracee.registers()?;
    assert_eq!(tracee.phase(), Phase::Exit);
    assert_eq!(regs.syscall_number(), sys_bind());
    assert_eq!(regs.return_value(), 0);

    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_failed_original_syscall_keeps_its_error() -> Result<()> {
    let pid = fork_tracee(rebind_child)?;
    let mut tracee = Tracee::new(pid)?;

    tracee.wait_for_syscall(sys_bind(), Side::Entry)?;
    let first = tracee.wait_for_syscall(sys_bind(), Side::Exit)?;
    assert_eq!(first.return_value(), 0);

    // The second `bind()` of the same socket is rejected by the kernel.
    tracee.wait_for_syscall(sys_bind(), Side::Entry)?;

    let result = tracee.execute_syscall(sys_getpid(), &[])?;
    assert_eq!(result, i64::from(pid.as_raw()));
    assert_eq!(tracee.phase(), Phase::Exit);

    let after = tracee.registers()?;
    assert_eq!(after.syscall_number(), sys_bind());
    assert_eq!(after.return_value(), -(libc::EINVAL as i64));

    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, libc::EINVAL);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_injection_side_effects_are_visible() -> Result<()> {
    let pid = fork_tracee(dup_child)?;
    let mut tracee = Tracee::new(pid)?;

    let entry = tracee.wait_for_syscall(sys_bind(), Side::Entry)?;
    let sock = entry.args()[0];

    let target = 100;
    let dup = tracee.execute_syscall(
        libc::SYS_fcntl as i64,
        &[sock, libc::F_DUPFD as u64, target],
    )?;
    assert!(dup >= target as i64);

    let original = fs::read_link(format!("/proc/{}/fd/{}", pid, sock))?;
    let duplicate = fs::read_link(format!("/proc/{}/fd/{}", pid, dup))?;
    assert_eq!(original, duplicate);

    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_inject_advances_to_entry() -> Result<()> {
    let pid = fork_tracee(unknown_phase_child)?;
    let mut tracee = Tracee::new(pid)?;
    assert_eq!(tracee.phase(), Phase::Unknown);

    let result = tracee.execute_syscall(sys_getpid(), &[])?;
    assert_eq!(result, i64::from(pid.as_raw()));

    // Entry, injected exit, replayed entry, replayed exit.
    assert_eq!(tracee.boundaries(), 4);
    assert_eq!(tracee.phase(), Phase::Exit);

    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_too_many_arguments() -> Result<()> {
    let pid = fork_tracee(too_many_args_child)?;
    let mut tracee = Tracee::new(pid)?;

    tracee.wait_for_syscall(sys_bind(), Side::Entry)?;
    let crossed = tracee.boundaries();

    let err = tracee.execute_syscall(sys_getpid(), &[0; 7]).unwrap_err();
    assert!(matches!(err, Error::TooManyArguments { count: 7 }));
    assert!(!err.is_fatal());
    assert_eq!(tracee.boundaries(), crossed);

    // Nothing was touched, so the tracee can carry on.
    tracee.wait_for_syscall(sys_bind(), Side::Exit)?;

    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_abort_bind() -> Result<()> {
    let pid = fork_tracee(abort_child)?;
    let mut tracee = Tracee::new(pid)?;

    let entry = tracee.wait_for_syscall(sys_bind(), Side::Entry)?;
    tracee.abort_syscall()?;

    assert_eq!(tracee.phase(), Phase::Exit);

    let regs = tracee.registers()?;
    assert_eq!(regs.syscall_number(), sys_bind());
    assert_eq!(regs.return_value(), -(libc::EINTR as i64));
    assert_eq!(regs.pc(), entry.pc());

    // The child reports the `errno` of its failed `bind()`.
    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, libc::EINTR);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_abort_requires_entry() -> Result<()> {
    let pid = fork_tracee(abort_exit_child)?;
    let mut tracee = Tracee::new(pid)?;

    let err = tracee.abort_syscall().unwrap_err();
    assert!(matches!(err, Error::NotAtSyscallEntry { phase: Phase::Unknown, .. }));

    tracee.wait_for_syscall(sys_bind(), Side::Exit)?;

    let err = tracee.abort_syscall().unwrap_err();
    assert!(matches!(err, Error::NotAtSyscallEntry { phase: Phase::Exit, .. }));
    assert!(!err.is_fatal());

    tracee.detach()?;
    assert_eq!(wait_exit(pid)?, 0);

    Ok(())
}
