// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Standard-I/O plumbing for a command.
//!
//! The client owns its side of whatever gets opened here, the server owns
//! the child's side. The handoff is the `SCM_RIGHTS` transfer: once a
//! request is on the wire, [`CommandStdio::close_child_side`] drops every
//! child-end descriptor so the client retains no reference to them.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::unistd::pipe;
use nscage_ipc::channel::StdioFds;

/// How a command's standard streams are wired, selectable per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Streams closed.
    None,
    /// Caller-supplied descriptors, sent verbatim.
    Fd,
    /// Three pipes; the caller keeps the parent ends.
    Pipe,
    /// A pseudo-terminal; the caller keeps the master.
    Pty,
}

/// Pipe plumbing: parent ends stay with the caller, child ends travel.
#[derive(Debug)]
pub struct StdioPipe {
    pub stdin_writer: Option<OwnedFd>,
    pub stdout_reader: Option<OwnedFd>,
    pub stderr_reader: Option<OwnedFd>,
    child_stdin: Option<OwnedFd>,
    child_stdout: Option<OwnedFd>,
    child_stderr: Option<OwnedFd>,
}

/// PTY plumbing: the master stays with the caller, the slave travels.
#[derive(Debug)]
pub struct StdioPty {
    pub master: PtyMaster,
    slave: Option<OwnedFd>,
}

#[derive(Debug)]
pub enum CommandStdio {
    None,
    Fd {
        stdin: RawFd,
        stdout: RawFd,
        stderr: RawFd,
    },
    Pipe(StdioPipe),
    Pty(StdioPty),
}

impl CommandStdio {
    pub fn none() -> CommandStdio {
        CommandStdio::None
    }

    /// Uses the caller's descriptors directly. They are borrowed, not
    /// owned: the caller keeps them open after the request.
    pub fn from_fds(stdin: RawFd, stdout: RawFd, stderr: RawFd) -> CommandStdio {
        CommandStdio::Fd {
            stdin,
            stdout,
            stderr,
        }
    }

    pub fn pipe() -> io::Result<CommandStdio> {
        let (stdin_read, stdin_write) = pipe()?;
        let (stdout_read, stdout_write) = pipe()?;
        let (stderr_read, stderr_write) = pipe()?;
        Ok(CommandStdio::Pipe(StdioPipe {
            stdin_writer: Some(stdin_write),
            stdout_reader: Some(stdout_read),
            stderr_reader: Some(stderr_read),
            child_stdin: Some(stdin_read),
            child_stdout: Some(stdout_write),
            child_stderr: Some(stderr_write),
        }))
    }

    pub fn pty() -> io::Result<CommandStdio> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
        grantpt(&master)?;
        unlockpt(&master)?;
        let name = ptsname_r(&master)?;
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&name)?;
        Ok(CommandStdio::Pty(StdioPty {
            master,
            slave: Some(slave.into()),
        }))
    }

    /// The raw triple that goes out with the request. The child gets the
    /// same pty slave on all three streams.
    pub(crate) fn child_fds(&self) -> StdioFds {
        match self {
            CommandStdio::None => StdioFds::NONE,
            CommandStdio::Fd {
                stdin,
                stdout,
                stderr,
            } => StdioFds {
                stdin: *stdin,
                stdout: *stdout,
                stderr: *stderr,
            },
            CommandStdio::Pipe(pipe) => StdioFds {
                stdin: raw(&pipe.child_stdin),
                stdout: raw(&pipe.child_stdout),
                stderr: raw(&pipe.child_stderr),
            },
            CommandStdio::Pty(pty) => {
                let slave = raw(&pty.slave);
                StdioFds {
                    stdin: slave,
                    stdout: slave,
                    stderr: slave,
                }
            }
        }
    }

    /// Drops the child-side descriptors once they have been duplicated
    /// into the server. Caller-supplied descriptors in `Fd` mode stay
    /// untouched.
    pub(crate) fn close_child_side(&mut self) {
        match self {
            CommandStdio::None | CommandStdio::Fd { .. } => {}
            CommandStdio::Pipe(pipe) => {
                pipe.child_stdin = None;
                pipe.child_stdout = None;
                pipe.child_stderr = None;
            }
            CommandStdio::Pty(pty) => {
                pty.slave = None;
            }
        }
    }
}

fn raw(fd: &Option<OwnedFd>) -> RawFd {
    fd.as_ref().map_or(-1, |fd| fd.as_raw_fd())
}
