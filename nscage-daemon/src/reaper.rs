// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Child reaping.
//!
//! As PID 1 of its namespace the supervisor is the reaper for every orphan,
//! not just its own commands, so the wait loop always targets `-1` and the
//! raw wait status travels to clients untouched.

use nix::errno::Errno;

/// How a reaped child went away, for the log line.
pub fn describe_status(status: i32) -> (&'static str, i32) {
    if libc::WIFEXITED(status) {
        ("normally", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ("due to signal", libc::WTERMSIG(status))
    } else {
        ("for unknown reason", status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A descendant was reaped: `(pid, raw wait status)`.
    Reaped(i32, i32),
    /// Descendants exist but none has exited yet.
    Pending,
    /// Nothing left to wait for.
    NoChildren,
}

/// One non-blocking `waitpid(-1, ..)` round.
pub fn poll_children() -> WaitOutcome {
    let mut status: libc::c_int = 0;
    loop {
        // raw waitpid: the wire carries the undecoded status word
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid > 0 {
            return WaitOutcome::Reaped(pid, status);
        }
        if pid == 0 {
            return WaitOutcome::Pending;
        }
        match Errno::last() {
            Errno::EINTR => continue,
            _ => return WaitOutcome::NoChildren, // ECHILD
        }
    }
}

/// Non-blocking reap of one descendant. `None` when nothing is waiting.
pub fn wait_any() -> Option<(i32, i32)> {
    match poll_children() {
        WaitOutcome::Reaped(pid, status) => Some((pid, status)),
        WaitOutcome::Pending | WaitOutcome::NoChildren => None,
    }
}
