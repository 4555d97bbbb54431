// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! `SOCK_SEQPACKET` control-channel transport.
//!
//! One datagram is one message; the kernel preserves record boundaries, so
//! there is no re-assembly. Standard-I/O descriptors travel in a single
//! `SCM_RIGHTS` control message of three `int`s.

mod async_channel;

pub use async_channel::{AsyncChannel, AsyncListener};

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    accept4, bind, connect, listen, sendmsg, socket, AddressFamily, Backlog, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use tracing::warn;

use crate::msg::MSG_SIZE_MAX;

/// A request carries stdin, stdout, stderr; never more.
pub const MAX_FDS: usize = 3;

const LISTEN_BACKLOG: i32 = 5;

/// Send-side standard-I/O triple. `-1` marks an unused slot; ownership of
/// the descriptors stays with the caller, the kernel duplicates them into
/// the receiver at `sendmsg` time.
#[derive(Debug, Clone, Copy)]
pub struct StdioFds {
    pub stdin: RawFd,
    pub stdout: RawFd,
    pub stderr: RawFd,
}

impl StdioFds {
    pub const NONE: StdioFds = StdioFds {
        stdin: -1,
        stdout: -1,
        stderr: -1,
    };

    /// The control message is attached iff stdin is present; the kernel
    /// refuses `SCM_RIGHTS` slots of -1, so the peer either gets all three
    /// or none.
    fn attach(&self) -> bool {
        self.stdin >= 0
    }
}

/// Receive-side triple. These descriptors are owned by the receiving
/// process and close on drop when a malformed datagram gets discarded.
#[derive(Debug, Default)]
pub struct ReceivedFds {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl ReceivedFds {
    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

fn seqpacket_socket() -> io::Result<OwnedFd> {
    Ok(socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

/// One connected end of a control channel.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Connects to the control channel at `path` and switches the socket to
    /// non-blocking, readiness-driven operation.
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Channel> {
        let addr = UnixAddr::new(path.as_ref())?;
        let fd = seqpacket_socket()?;
        connect(fd.as_raw_fd(), &addr)?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Channel { fd })
    }

    /// Sends one framed message, attaching the descriptor triple when
    /// present. Anything short of a full datagram is an error on this
    /// connection.
    pub fn send_msg(&self, frame: &[u8], fds: &StdioFds) -> io::Result<()> {
        let iov = [IoSlice::new(frame)];
        let sent = if fds.attach() {
            debug_assert!(fds.stdout >= 0 && fds.stderr >= 0);
            let raw = [fds.stdin, fds.stdout, fds.stderr];
            let cmsg = [ControlMessage::ScmRights(&raw)];
            sendmsg::<UnixAddr>(self.fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?
        } else {
            sendmsg::<UnixAddr>(self.fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None)?
        };
        if sent != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {sent} of {} bytes", frame.len()),
            ));
        }
        Ok(())
    }

    /// Receives one datagram into `buf`, extracting up to [`MAX_FDS`]
    /// descriptors from the first `SCM_RIGHTS` control message.
    ///
    /// `WouldBlock` means no datagram is pending; `UnexpectedEof` means the
    /// peer closed and the connection must be torn down.
    pub fn recv_msg(&self, buf: &mut [u8]) -> io::Result<(usize, ReceivedFds)> {
        debug_assert!(buf.len() >= MSG_SIZE_MAX);
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);

        let mut iov = [IoSliceMut::new(buf)];
        let msg = nix::sys::socket::recvmsg::<UnixAddr>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buf),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        let mut fds = ReceivedFds::default();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                let mut received = received.into_iter();
                // SAFETY: fresh descriptors installed by the kernel, owned
                // by nobody else in this process
                unsafe {
                    fds.stdin = received.next().map(|fd| OwnedFd::from_raw_fd(fd));
                    fds.stdout = received.next().map(|fd| OwnedFd::from_raw_fd(fd));
                    fds.stderr = received.next().map(|fd| OwnedFd::from_raw_fd(fd));
                    for surplus in received {
                        drop(OwnedFd::from_raw_fd(surplus));
                    }
                }
                break;
            }
        }

        if msg.bytes == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed"));
        }
        Ok((msg.bytes, fds))
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<OwnedFd> for Channel {
    fn from(fd: OwnedFd) -> Self {
        Channel { fd }
    }
}

/// The listening end of a control channel. Unlinking the path at shutdown
/// is the owner's concern, not the listener's.
#[derive(Debug)]
pub struct Listener {
    fd: OwnedFd,
}

impl Listener {
    /// Binds and listens on `path`. A stale socket inode from a previous
    /// run is removed first; the fresh one is opened up to mode 0666 so the
    /// channel is gated by directory permissions alone.
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Listener> {
        let path = path.as_ref();
        let addr = UnixAddr::new(path)?;
        let fd = seqpacket_socket()?;

        let _ = std::fs::remove_file(path);
        bind(fd.as_raw_fd(), &addr)?;

        // explicit chmod overrides the umask
        if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
            warn!("chmod failed for {}: {err}", path.display());
        }

        listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Listener { fd })
    }

    pub fn accept(&self) -> io::Result<Channel> {
        let fd = accept4(
            self.fd.as_raw_fd(),
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )?;
        // SAFETY: accept4 returned a fresh, open descriptor
        Ok(Channel {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
