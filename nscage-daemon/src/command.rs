// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Command spawning.
//!
//! The child gets a fresh session, the client-supplied descriptors dup2'd
//! onto its standard streams, and, when one of them is a terminal, a
//! controlling tty, before `execvp` replaces it with the requested program.

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{dup2, execvp, fork, isatty, setsid, ForkResult};
use nscage_ipc::channel::ReceivedFds;
use tracing::{info, warn};

/// One in-flight command on the server. References are ids, never
/// pointers: `owner` names the client the ack went to, and the entry
/// outlives that client if it disconnects early.
#[derive(Debug)]
pub struct CommandEntry {
    pub cmdid: i32,
    pub pid: i32,
    pub owner: u64,
}

fn clear_nonblock(fd: RawFd) {
    let flags = match fcntl(fd, FcntlArg::F_GETFL) {
        Ok(flags) => OFlag::from_bits_truncate(flags),
        Err(_) => OFlag::empty(),
    };
    if fcntl(fd, FcntlArg::F_SETFL(flags & !OFlag::O_NONBLOCK)).is_err() {
        warn!("clearing O_NONBLOCK failed for fd {fd}");
    }
}

fn child_stdio(fds: &ReceivedFds) -> nix::Result<()> {
    let targets = [
        (fds.stdin.as_ref(), libc::STDIN_FILENO),
        (fds.stdout.as_ref(), libc::STDOUT_FILENO),
        (fds.stderr.as_ref(), libc::STDERR_FILENO),
    ];
    for (src, target) in targets {
        if let Some(src) = src {
            if src.as_raw_fd() != target {
                dup2(src.as_raw_fd(), target)?;
            }
        }
    }
    Ok(())
}

/// Forks and executes `args` with the received descriptors wired onto the
/// child's standard streams. Returns the child pid, or -1 when the fork
/// failed. The parent's copies of the descriptors are closed either way;
/// they live on in the child.
pub fn fork_exec(args: &[CString], fds: ReceivedFds) -> i32 {
    info!("spawning '{}'", args[0].to_string_lossy());

    // SAFETY: the child calls only exec-or-exit style functions below
    let pid = match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => child.as_raw(),
        Ok(ForkResult::Child) => {
            let _ = setsid();

            if child_stdio(&fds).is_err() {
                unsafe { libc::_exit(1) };
            }
            drop(fds); // sources are on 0/1/2 now

            clear_nonblock(libc::STDIN_FILENO);
            clear_nonblock(libc::STDOUT_FILENO);
            clear_nonblock(libc::STDERR_FILENO);

            // take a controlling terminal without stealing one; errors are
            // of no interest
            if isatty(libc::STDIN_FILENO).unwrap_or(false) {
                unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) };
            } else if isatty(libc::STDOUT_FILENO).unwrap_or(false) {
                unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCSCTTY, 0) };
            }

            let _ = execvp(&args[0], args);
            unsafe { libc::_exit(1) };
        }
        Err(err) => {
            warn!("fork failed: {err}");
            -1
        }
    };

    pid
}
