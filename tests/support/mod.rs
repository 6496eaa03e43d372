#![allow(dead_code)]

use anyhow::{bail, Result};
use nix::sys::ptrace;
use nix::sys::signal::{raise, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

/// Fork a child which requests tracing and stops itself with `SIGTRAP`, as a traced
/// `exec()` would. Once resumed, it runs `body` and exits with its return value.
///
/// `body` runs in a forked copy of a multithreaded process, so it must stick to
/// async-signal-safe calls.
pub fn fork_tracee(body: fn() -> i32) -> Result<Pid> {
    match unsafe { fork() }? {
        ForkResult::Child => {
            let code = if ptrace::traceme().is_ok() && raise(Signal::SIGTRAP).is_ok() {
                body()
            } else {
                127
            };

            unsafe { libc::_exit(code) }
        },
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Bind a new `AF_UNIX` stream socket to the abstract address `name`.
///
/// Returns `0` on success, or the `errno` of the first failed call.
pub fn bind_abstract(name: &[u8]) -> i32 {
    bind_abstract_times(name, 1)
}

/// Bind one `AF_UNIX` stream socket to the abstract address `name` twice. The second
/// `bind()` fails with `EINVAL`, which is returned.
pub fn rebind_abstract(name: &[u8]) -> i32 {
    bind_abstract_times(name, 2)
}

fn bind_abstract_times(name: &[u8], times: usize) -> i32 {
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return nix::errno::errno();
        }

        // Abstract addresses start with a NUL byte.
        let mut addr: libc::sockaddr_un = std::mem::zeroed();
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path[1..].iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }

        let len = std::mem::size_of::<libc::sa_family_t>() + 1 + name.len();
        let addr_ptr = &addr as *const libc::sockaddr_un as *const libc::sockaddr;

        for _ in 0..times {
            if libc::bind(fd, addr_ptr, len as libc::socklen_t) < 0 {
                return nix::errno::errno();
            }
        }

        0
    }
}

/// Reap a detached child, and return its exit code.
pub fn wait_exit(pid: Pid) -> Result<i32> {
    match waitpid(pid, None)? {
        WaitStatus::Exited(_, code) => Ok(code),
        status => bail!("expected exit of {}, got {:?}", pid, status),
    }
}

pub fn sys_bind() -> i64 {
    libc::SYS_bind as i64
}

pub fn sys_getpid() -> i64 {
    libc::SYS_getpid as i64
}
