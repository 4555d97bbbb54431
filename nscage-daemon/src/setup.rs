// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Daemon bring-up.
//!
//! Runs before the async runtime exists: the namespace fork and the
//! descriptor sweep must not happen under a live reactor. The parent's
//! only jobs are reporting the container pid and getting out of the way.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::Context;
use nix::unistd::{chdir, dup2, getpid, setsid, ForkResult};
use nscage_ipc::channel::Listener;
use tracing::warn;

use crate::config::DaemonConfig;
use crate::ns;
use crate::server::ControlEndpoint;

pub enum BringUp {
    /// Parent side of the namespace fork: pid reported, nothing left to do.
    Parent,
    /// The serving process, ready to enter the event loop.
    Serve {
        listener: Listener,
        endpoint: ControlEndpoint,
    },
}

/// Establishes the control channel and, unless running in debug mode,
/// moves into a fresh namespace set. A startup failure leaves no socket
/// behind.
pub fn bring_up(config: &DaemonConfig) -> anyhow::Result<BringUp> {
    // detach from the invoker's controlling terminal; fails harmlessly
    // when already a session leader
    let _ = setsid();

    let listener = Listener::bind(&config.control_path)
        .with_context(|| format!("cannot listen on {}", config.control_path.display()))?;

    let pid = if config.namespaces {
        match ns::fork_into_namespaces() {
            Ok(ForkResult::Parent { child }) => child.as_raw(),
            Ok(ForkResult::Child) => 0,
            Err(err) => {
                drop(listener);
                let _ = std::fs::remove_file(&config.control_path);
                return Err(err);
            }
        }
    } else {
        getpid().as_raw()
    };

    if pid != 0 {
        // the orchestrator reads the container pid from stdout
        println!("{pid}");
        let _ = io::stdout().flush();

        if let Some(pid_file) = &config.pid_file {
            if let Err(err) = std::fs::write(pid_file, format!("{pid}\n")) {
                warn!("writing pid file {} failed: {err}", pid_file.display());
            }
        }

        if config.namespaces {
            return Ok(BringUp::Parent);
        }
    }

    close_inherited_fds(listener.as_raw_fd());
    redirect_stdio(config.log_file.as_deref());

    if let Some(dir) = &config.working_dir {
        if let Err(err) = chdir(dir.as_path()) {
            warn!("chdir to {} failed: {err}", dir.display());
        }
    }

    let endpoint = ControlEndpoint::new(config.control_path.clone(), config.pid_file.clone());
    Ok(BringUp::Serve { listener, endpoint })
}

/// Closes everything inherited from the invoker except the listener and
/// the standard streams.
fn close_inherited_fds(keep: i32) {
    let openmax = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        max if max > 0 => max as i32,
        _ => 1024,
    };
    for fd in 3..openmax {
        if fd != keep {
            unsafe { libc::close(fd) };
        }
    }
}

/// stdin from /dev/null, stdout and stderr onto the logfile. Failures are
/// reported and tolerated; a daemon without a log is still a daemon.
fn redirect_stdio(log_file: Option<&Path>) {
    match File::open("/dev/null") {
        Ok(devnull) => {
            if dup2(devnull.as_raw_fd(), libc::STDIN_FILENO).is_err() {
                warn!("redirecting stdin failed");
            }
        }
        Err(err) => warn!("open failed for /dev/null: {err}"),
    }

    let target = log_file.unwrap_or(Path::new("/dev/null"));
    for stream in [libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        match OpenOptions::new()
            .write(true)
            .create(true)
            .custom_flags(libc::O_TRUNC | libc::O_APPEND)
            .mode(0o644)
            .open(target)
        {
            Ok(file) => {
                if dup2(file.as_raw_fd(), stream).is_err() {
                    warn!("redirecting fd {stream} failed");
                }
            }
            Err(err) => warn!("open failed for {}: {err}", target.display()),
        }
    }
}
