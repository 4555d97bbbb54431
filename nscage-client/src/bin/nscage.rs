// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Run a command inside a container behind an nscage control channel.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use nscage_client::{Client, CommandStdio, IoMode};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_COMMAND: &str = "/bin/bash";

/// Run a command in the Linux namespace container reachable through the
/// given control channel and report its exit status.
#[derive(Parser, Debug)]
#[command(name = "nscage", version)]
struct Cli {
    /// Control channel of the target container (e.g. '/tmp/nscage.4512/n3')
    #[arg(short = 'c', long = "control", value_name = "PATH")]
    control: PathBuf,

    /// Run the command quietly, without local input or output
    #[arg(short = 'q', conflicts_with_all = ["interactive", "plain"])]
    quiet: bool,

    /// Run the command interactively on a pseudo-terminal
    #[arg(short = 'i', conflicts_with = "plain")]
    interactive: bool,

    /// Run the command on the caller's descriptors, without a pseudo-terminal
    #[arg(short = 'I')]
    plain: bool,

    /// Raise log verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Command and arguments to run; defaults to /bin/bash
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug)]
enum Outcome {
    Done { pid: i32, status: i32 },
    IoError,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A terminal talking to an interactive command: all three streams are
/// ttys and we are the foreground process group.
fn stdio_is_interactive() -> bool {
    let all_ttys = unsafe {
        libc::isatty(libc::STDIN_FILENO) == 1
            && libc::isatty(libc::STDOUT_FILENO) == 1
            && libc::isatty(libc::STDERR_FILENO) == 1
    };
    all_ttys && unsafe { libc::tcgetpgrp(libc::STDOUT_FILENO) == libc::getpgrp() }
}

fn choose_io_mode(cli: &Cli) -> IoMode {
    if cli.quiet {
        IoMode::None
    } else if cli.interactive {
        IoMode::Pty
    } else if cli.plain {
        IoMode::Fd
    } else if stdio_is_interactive() {
        IoMode::Pty
    } else {
        IoMode::Fd
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("nscage: {err:#}");
            ExitCode::from(255)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let mode = choose_io_mode(&cli);
    let args: Vec<CString> = if cli.command.is_empty() {
        vec![CString::new(DEFAULT_COMMAND)?]
    } else {
        cli.command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<_, _>>()?
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_command(cli.control, mode, args))
}

async fn run_command(control: PathBuf, mode: IoMode, args: Vec<CString>) -> anyhow::Result<u8> {
    let mut stdio = match mode {
        IoMode::None => CommandStdio::none(),
        IoMode::Fd => CommandStdio::from_fds(
            libc::STDIN_FILENO,
            libc::STDOUT_FILENO,
            libc::STDERR_FILENO,
        ),
        IoMode::Pipe => CommandStdio::pipe()?,
        IoMode::Pty => CommandStdio::pty()?,
    };

    let (events_tx, mut events) = mpsc::unbounded_channel();

    let io_error_tx = events_tx.clone();
    let client = std::sync::Arc::new(Client::connect(
        &control,
        Box::new(move || {
            let _ = io_error_tx.send(Outcome::IoError);
        }),
    )?);

    // local terminal preparation for the interactive case
    let mut master_fd = None;
    let mut session = None;
    if let CommandStdio::Pty(pty) = &stdio {
        let master = pty.master.as_raw_fd();
        master_fd = Some(master);
        copy_winsize(master);
        session = Some(PtySession::enter(master)?);
    }

    let done_tx = events_tx.clone();
    let cmdid = client.submit(
        &mut stdio,
        &args,
        Box::new(move |_, pid, status| {
            let _ = done_tx.send(Outcome::Done { pid, status });
        }),
    )?;

    spawn_signal_forwarders(client.clone(), cmdid, master_fd);

    // each pump registers its fds with the reactor, so the write side of
    // the stdin pump gets its own duplicate of the master
    let mut _master_writer = None;
    if let Some(master) = master_fd {
        let writer = unsafe { OwnedFd::from_raw_fd(nix::unistd::dup(master)?) };
        tokio::spawn(pump(libc::STDIN_FILENO, writer.as_raw_fd()));
        tokio::spawn(pump(master, libc::STDOUT_FILENO));
        _master_writer = Some(writer);
    }

    let code = match events.recv().await {
        Some(Outcome::Done { pid, status }) => exit_code(pid, status),
        Some(Outcome::IoError) | None => {
            drop(session);
            anyhow::bail!("i/o error on control channel");
        }
    };

    if let Some(master) = master_fd {
        drain_master(master);
    }
    drop(session); // restores the local terminal
    Ok(code)
}

/// Exit with the child's code when it exited normally, 255 for signals,
/// spawn failures, and lost connections.
fn exit_code(pid: i32, status: i32) -> u8 {
    if pid == -1 || status == -1 {
        return 255;
    }
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status) as u8
    } else {
        255
    }
}

/// Catchable signals go to the remote command; SIGWINCH instead resizes
/// the remote terminal.
fn spawn_signal_forwarders(
    client: std::sync::Arc<Client>,
    cmdid: i32,
    master_fd: Option<RawFd>,
) {
    for signum in [
        libc::SIGHUP,
        libc::SIGINT,
        libc::SIGQUIT,
        libc::SIGTERM,
        libc::SIGUSR1,
        libc::SIGUSR2,
    ] {
        let client = client.clone();
        tokio::spawn(async move {
            let Ok(mut stream) = signal(SignalKind::from_raw(signum)) else {
                return;
            };
            while stream.recv().await.is_some() {
                if let Err(err) = client.kill(cmdid, signum) {
                    warn!("forwarding signal {signum} failed: {err}");
                }
            }
        });
    }

    if let Some(master) = master_fd {
        tokio::spawn(async move {
            let Ok(mut stream) = signal(SignalKind::window_change()) else {
                return;
            };
            while stream.recv().await.is_some() {
                copy_winsize(master);
            }
        });
    }
}

/// Mirrors the local window size onto the remote terminal.
fn copy_winsize(master: RawFd) {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut size) } != 0 {
        warn!("reading the terminal size failed");
        return;
    }
    if unsafe { libc::ioctl(master, libc::TIOCSWINSZ, &size) } != 0 {
        warn!("setting the remote terminal size failed");
    }
}

/// Local terminal state for an interactive session. The terminal goes
/// raw and stdin non-blocking for the pumps; dropping the session puts
/// both back.
struct PtySession {
    saved_termios: Option<Termios>,
    saved_stdin_flags: Option<OFlag>,
}

impl PtySession {
    fn enter(master: RawFd) -> io::Result<PtySession> {
        let mut session = PtySession {
            saved_termios: None,
            saved_stdin_flags: None,
        };

        match tcgetattr(std::io::stdout()) {
            Ok(saved) => {
                let mut raw = saved.clone();
                cfmakeraw(&mut raw);
                if tcsetattr(std::io::stdout(), SetArg::TCSADRAIN, &raw).is_ok() {
                    session.saved_termios = Some(saved);
                } else {
                    warn!("switching the terminal to raw mode failed");
                }
            }
            Err(err) => warn!("reading terminal attributes failed: {err}"),
        }

        session.saved_stdin_flags = set_nonblock(libc::STDIN_FILENO);
        if set_nonblock(master).is_none() {
            warn!("setting O_NONBLOCK on the pty master failed");
        }

        Ok(session)
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved_termios {
            let _ = tcsetattr(std::io::stdout(), SetArg::TCSADRAIN, saved);
        }
        if let Some(flags) = self.saved_stdin_flags {
            let _ = fcntl(libc::STDIN_FILENO, FcntlArg::F_SETFL(flags));
        }
    }
}

/// Returns the previous flags on success.
fn set_nonblock(fd: RawFd) -> Option<OFlag> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).ok()?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).ok()?;
    Some(flags)
}

/// Writes the whole buffer, suspending on the event loop whenever the
/// descriptor is not ready to take more.
async fn write_all(afd: &AsyncFd<RawFd>, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|fd| {
            // SAFETY: fd stays open for the lifetime of the pump
            nix::unistd::write(unsafe { BorrowedFd::borrow_raw(*fd.get_ref()) }, buf)
                .map_err(io::Error::from)
        }) {
            Ok(Ok(written)) => buf = &buf[written..],
            Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(err)) => {
                warn!("write failed: {err}");
                return Err(err);
            }
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

/// Forwards bytes between the local terminal and the pty master until EOF
/// or error.
async fn pump(from: RawFd, to: RawFd) {
    let rfd = match AsyncFd::with_interest(from, Interest::READABLE) {
        Ok(afd) => afd,
        Err(err) => {
            warn!("watching fd {from} failed: {err}");
            return;
        }
    };
    let wfd = match AsyncFd::with_interest(to, Interest::WRITABLE) {
        Ok(afd) => afd,
        Err(err) => {
            warn!("watching fd {to} failed: {err}");
            return;
        }
    };
    let mut buf = [0u8; 8192];
    loop {
        let mut guard = match rfd.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match guard.try_io(|fd| nix::unistd::read(*fd.get_ref(), &mut buf).map_err(io::Error::from))
        {
            Ok(Ok(0)) => return,
            Ok(Ok(count)) => {
                if write_all(&wfd, &buf[..count]).await.is_err() {
                    return;
                }
            }
            Ok(Err(_)) => return,
            Err(_would_block) => continue,
        }
    }
}

/// After completion the master may still hold buffered output; push it
/// out before the terminal is restored. stdout is a blocking descriptor,
/// so only EINTR gets retried here.
fn drain_master(master: RawFd) {
    let mut buf = [0u8; 8192];
    loop {
        match nix::unistd::read(master, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(count) => {
                if write_blocking(libc::STDOUT_FILENO, &buf[..count]).is_err() {
                    break;
                }
            }
        }
    }
}

fn write_blocking(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, buf) {
            Ok(written) => buf = &buf[written..],
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
