use std::path::PathBuf;
use std::process::{self, Command};

use anyhow::{Context, Result};
use continuity::{Error, Listener, RegisterFile, Side, Stop, Tracee};
use nix::sys::wait::{self, WaitStatus};
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Launch a program under trace, and follow it until it binds a socket.
#[derive(StructOpt, Debug)]
#[structopt(name = "continuity")]
struct Opt {
    /// Path of the Unix domain socket to create for coordination.
    ///
    /// The endpoint is created and held for the whole run, but no peer is accepted on it
    /// yet.
    #[structopt(long, default_value = "/tmp/continuity.sock", parse(from_os_str))]
    socket_path: PathBuf,

    /// Program to run, followed by its arguments.
    #[structopt(required = true, min_values = 1)]
    argv: Vec<String>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(socket_path = %opt.socket_path.display(), "using coordination socket");

    let code = run(&opt)?;
    process::exit(code);
}

fn run(opt: &Opt) -> Result<i32> {
    let _listener = Listener::bind(&opt.socket_path, true)
        .with_context(|| format!("cannot listen on {}", opt.socket_path.display()))?;

    let mut cmd = Command::new(&opt.argv[0]);
    cmd.args(&opt.argv[1..]);

    let (_child, mut tracee) = Tracee::spawn(cmd)?;
    let pid = tracee.pid();

    let bound = match follow_bind(&mut tracee) {
        Ok(bound) => bound,
        Err(Error::UnexpectedStop { stop: Stop::Exited { exit_code }, .. }) => {
            warn!(exit_code, "program exited without binding a socket");
            return Ok(exit_code);
        },
        Err(Error::UnexpectedStop { stop: Stop::Killed { signal, .. }, .. }) => {
            warn!(%signal, "program was killed before binding a socket");
            return Ok(128 + signal as i32);
        },
        Err(err) => return Err(err).context("tracing failed"),
    };

    info!(fd = bound.0, result = bound.1, "program bound listening socket");

    tracee.detach()?;

    let code = match wait::waitpid(pid, None).context("cannot wait for program")? {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        status => {
            warn!(?status, "unexpected wait status after detach");
            1
        },
    };

    info!(code, "program finished");

    Ok(code)
}

// Follow the tracee through its next `bind()`, returning the bound descriptor and result.
fn follow_bind(tracee: &mut Tracee) -> continuity::Result<(u64, i64)> {
    let sysno = libc::SYS_bind as i64;

    let entry = tracee.wait_for_syscall(sysno, Side::Entry)?;
    let fd = entry.args()[0];

    let exit = tracee.wait_for_syscall(sysno, Side::Exit)?;

    Ok((fd, exit.return_value()))
}
