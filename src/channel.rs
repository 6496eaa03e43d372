//! Out-of-band coordination channel between the controller and a cooperating process.
//!
//! A channel is a connected `AF_UNIX` stream socket. Besides bytes, it can transfer
//! ownership of open file descriptors with `SCM_RIGHTS`.

use std::fs;
use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned, MsgFlags};
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// Capacity of `sockaddr_un.sun_path`, including the terminating NUL.
pub const MAX_PATH_LEN: usize = mem::size_of::<libc::sockaddr_un>()
    - mem::size_of::<libc::sa_family_t>();

/// Most descriptors accepted by a single receive.
pub const MAX_FDS: usize = 16;

/// Listening endpoint bound to a filesystem path.
#[derive(Debug)]
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
}

impl Listener {
    /// Bind and listen on `path`, first unlinking any file already there if
    /// `remove_existing` is set.
    pub fn bind(path: impl AsRef<Path>, remove_existing: bool) -> Result<Self> {
        let path = path.as_ref();
        check_path(path)?;

        if remove_existing {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {},
                Err(err) => return Err(Error::Socket { call: "unlink", source: err }),
            }
        }

        let inner = UnixListener::bind(path).socket_call("bind")?;
        let path = path.to_owned();

        debug!(path = %path.display(), "listening");

        Ok(Self { inner, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until a peer connects.
    pub fn accept(&self) -> Result<Channel> {
        let (stream, _) = self.inner.accept().socket_call("accept")?;
        Ok(Channel { stream })
    }
}

/// Connected endpoint of a coordination channel.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        check_path(path)?;

        let stream = UnixStream::connect(path).socket_call("connect")?;
        Ok(Self { stream })
    }

    /// Create a pair of connected, anonymous endpoints.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair().socket_call("socketpair")?;
        Ok((Self { stream: a }, Self { stream: b }))
    }

    /// Send all of `data`.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).socket_call("send")
    }

    /// Send `data` along with duplicates of `fds`. The caller keeps its own copies.
    ///
    /// A stream socket cannot carry descriptors without payload, so an empty `data` is
    /// sent as a single zero byte.
    pub fn send_with_fds(&mut self, data: &[u8], fds: &[BorrowedFd<'_>]) -> Result<usize> {
        let data = if data.is_empty() { &[0u8][..] } else { data };
        let raw: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();

        let iov = [IoSlice::new(data)];
        let cmsgs = [ControlMessage::ScmRights(&raw)];

        let sent = socket::sendmsg::<()>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::empty(),
            None,
        )
        .map_err(|err| Error::Socket { call: "sendmsg", source: err.into() })?;

        debug!(bytes = sent, fds = raw.len(), "sent descriptors");

        Ok(sent)
    }

    /// Receive up to `buf.len()` bytes. Returns `0` once the peer has hung up.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).socket_call("recv")
    }

    /// Receive up to `buf.len()` bytes, and any descriptors sent with them.
    ///
    /// Received descriptors are close-on-exec.
    pub fn recv_with_fds(&mut self, buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);
        let mut iov = [IoSliceMut::new(buf)];

        let msg = socket::recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(|err| Error::Socket { call: "recvmsg", source: err.into() })?;

        let mut fds = vec![];

        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // SAFETY: the kernel installed these descriptors for us, and nothing
                // else refers to them.
                fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }

        if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
            warn!(received = fds.len(), "descriptors truncated, peer sent more than {}", MAX_FDS);
        }

        debug!(bytes = msg.bytes, fds = fds.len(), "received message");

        Ok((msg.bytes, fds))
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

// Reject paths that cannot fit in `sun_path` before touching the filesystem.
fn check_path(path: &Path) -> Result<()> {
    let len = path.as_os_str().as_bytes().len();

    if len >= MAX_PATH_LEN {
        return Err(Error::PathTooLong { len, max: MAX_PATH_LEN });
    }

    Ok(())
}
