use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};

use nix::sys::ptrace;
use tracing::info;

use crate::error::{Error, Result};

/// Spawn `cmd` as a tracee of the calling thread.
///
/// The child requests `PTRACE_TRACEME` after `fork()` and pre-`exec()`, so the kernel
/// stops it with a `SIGTRAP` once the exec succeeds. The caller must construct the
/// [`Tracee`](crate::Tracee) from the same thread, which consumes that stop.
pub fn spawn(mut cmd: Command) -> Result<Child> {
    let program = cmd.get_program().to_string_lossy().into_owned();

    // SAFETY: the hook only issues a single raw `ptrace(2)` request, which is
    // async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32))
        });
    }

    let child = cmd
        .spawn()
        .map_err(|source| Error::Spawn { program: program.clone(), source })?;

    info!(pid = child.id(), %program, "spawned tracee");

    Ok(child)
}
