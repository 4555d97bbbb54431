// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! The supervisor's event loop and state.
//!
//! Single-threaded and readiness-driven: one task accepts clients and reaps
//! children, one task per client reads and dispatches datagrams. Handlers
//! run to completion; the only suspension points are the readiness waits.
//!
//! A client that disappears does not cancel its commands. The children keep
//! running, the reaper collects them, and their status reports are dropped
//! with a log line. This is observable behavior a caller may rely on.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use nscage_ipc::channel::{AsyncChannel, AsyncListener, Channel, Listener, ReceivedFds, StdioFds};
use nscage_ipc::msg::{self, MsgType, MsgView, MSG_SIZE_MAX};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{self, CommandEntry};
use crate::reaper::{self, WaitOutcome};

/// How long terminated descendants get before the SIGKILL broadcast.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Filesystem residue of a running supervisor: the socket inode and the
/// optional pid file. Cleanup runs once; dropping the endpoint is the
/// safety net for paths that must not outlive the process.
#[derive(Debug)]
pub struct ControlEndpoint {
    socket_path: PathBuf,
    pid_file: Option<PathBuf>,
    cleaned: bool,
}

impl ControlEndpoint {
    pub fn new(socket_path: PathBuf, pid_file: Option<PathBuf>) -> Self {
        ControlEndpoint {
            socket_path,
            pid_file,
            cleaned: false,
        }
    }

    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if let Err(err) = std::fs::remove_file(&self.socket_path) {
            warn!("unlink failed for {}: {err}", self.socket_path.display());
        }
        if let Some(pid_file) = &self.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
    }
}

impl Drop for ControlEndpoint {
    fn drop(&mut self) {
        self.cleanup();
    }
}

struct ClientHandle {
    chan: Arc<AsyncChannel>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    clients: HashMap<u64, ClientHandle>,
    commands: Vec<CommandEntry>,
    next_client_id: u64,
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    #[allow(clippy::unwrap_used)]
    state.lock().unwrap()
}

/// Requests a supervisor shutdown from another task, equivalent to a
/// SIGTERM. Handlers never do work themselves; the event loop observes the
/// request at its next wait.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn request(&self) {
        self.0.notify_one();
    }
}

pub struct Server {
    listener: AsyncListener,
    endpoint: ControlEndpoint,
    state: Arc<Mutex<State>>,
    shutdown: Arc<Notify>,
}

impl Server {
    pub fn new(listener: Listener, endpoint: ControlEndpoint) -> io::Result<Server> {
        Ok(Server {
            listener: AsyncListener::new(listener)?,
            endpoint,
            state: Arc::new(Mutex::new(State::default())),
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Serves until SIGTERM, SIGINT, or a [`ShutdownHandle`] request, then
    /// tears the endpoint down. As PID 1 this includes terminating every
    /// process left in the namespace.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigchld = signal(SignalKind::child())?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("exiting due to SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!("exiting due to SIGINT");
                    break;
                }
                _ = self.shutdown.notified() => {
                    debug!("shutdown requested");
                    break;
                }
                _ = sigchld.recv() => self.reap_children(),
                accepted = self.listener.accept() => match accepted {
                    Ok(chan) => self.add_client(chan),
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }

        self.cleanup(&mut sigchld).await;
        Ok(())
    }

    fn add_client(&self, chan: Channel) {
        let chan = match AsyncChannel::new(chan) {
            Ok(chan) => Arc::new(chan),
            Err(err) => {
                warn!("client setup failed: {err}");
                return;
            }
        };

        let mut state = lock_state(&self.state);
        let id = state.next_client_id;
        state.next_client_id += 1;
        debug!("new client {id}");

        let reader = tokio::spawn(client_loop(id, chan.clone(), self.state.clone()));
        state.clients.insert(id, ClientHandle { chan, reader });
    }

    fn reap_children(&self) {
        while let Some((pid, status)) = reaper::wait_any() {
            let (how, code) = reaper::describe_status(status);
            let mut state = lock_state(&self.state);

            let Some(idx) = state.commands.iter().position(|cmd| cmd.pid == pid) else {
                warn!("pid {pid} not found in command list: completed {how} with status {code}");
                continue;
            };
            let cmd = state.commands.swap_remove(idx);
            info!(
                "cmd completed {how}: pid {pid}; cmdid {}; status {code}",
                cmd.cmdid
            );

            let Some(client) = state.clients.get(&cmd.owner) else {
                info!(
                    "client {} is gone; dropping status for cmdid {}",
                    cmd.owner, cmd.cmdid
                );
                continue;
            };
            match msg::encode_cmdstatus(cmd.cmdid, status) {
                Ok(frame) => {
                    if let Err(err) = client.chan.send_msg(&frame, &StdioFds::NONE) {
                        warn!("sending command status failed: {err}");
                    }
                }
                Err(err) => warn!("encoding command status failed: {err}"),
            }
        }
    }

    async fn cleanup(&mut self, sigchld: &mut tokio::signal::unix::Signal) {
        self.endpoint.cleanup();

        let mut state = lock_state(&self.state);
        for (_, client) in state.clients.drain() {
            client.reader.abort();
        }
        state.commands.clear();
        drop(state);

        if getpid().as_raw() == 1 {
            sweep_namespace(sigchld).await;
        }
    }
}

/// PID-1 duty: nobody else will terminate the namespace's processes.
/// SIGTERM everyone, reap with a bounded grace period, then SIGKILL the
/// stragglers.
async fn sweep_namespace(sigchld: &mut tokio::signal::unix::Signal) {
    let _ = kill(Pid::from_raw(-1), Signal::SIGTERM);
    loop {
        match reaper::poll_children() {
            WaitOutcome::Reaped(..) => continue,
            WaitOutcome::NoChildren => break,
            WaitOutcome::Pending => {
                // SIGCHLD cuts the grace period short
                if tokio::time::timeout(SHUTDOWN_GRACE, sigchld.recv())
                    .await
                    .is_err()
                {
                    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);
                    break;
                }
            }
        }
    }
}

async fn client_loop(id: u64, chan: Arc<AsyncChannel>, state: Arc<Mutex<State>>) {
    let mut buf = vec![0u8; MSG_SIZE_MAX];
    loop {
        let (len, fds) = match chan.recv_msg(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                info!("i/o error for client {id}; deleting client: {err}");
                lock_state(&state).clients.remove(&id);
                return;
            }
        };

        // a malformed datagram is dropped together with any descriptors it
        // carried; the connection stays up
        let Some(view) = MsgView::from_datagram(&buf[..len]) else {
            continue;
        };

        match view.msgtype {
            MsgType::CmdReq => handle_cmdreq(id, &chan, &state, &view, fds),
            MsgType::CmdSignal => handle_cmdsignal(id, &state, &view),
            other => warn!("no handler for message type {other:?} from client {id}"),
        }
    }
}

fn handle_cmdreq(
    id: u64,
    chan: &AsyncChannel,
    state: &Mutex<State>,
    view: &MsgView<'_>,
    fds: ReceivedFds,
) {
    let req = match msg::decode_cmdreq(view) {
        Ok(req) => req,
        Err(err) => {
            warn!("bad command request from client {id}: {err}");
            return;
        }
    };

    // the table lock spans fork to insert, so the reaper can never see the
    // child before its entry exists
    let mut state = lock_state(state);
    let pid = command::fork_exec(&req.args, fds);
    debug!("cmd '{}': pid {pid}; cmdid {}", req.args[0].to_string_lossy(), req.cmdid);

    let frame = match msg::encode_cmdreqack(req.cmdid, pid) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("encoding command ack failed: {err}");
            return;
        }
    };
    if let Err(err) = chan.send_msg(&frame, &StdioFds::NONE) {
        // the client raced away between request and ack; the child, if
        // any, keeps running and the reaper will collect it
        warn!("command ack for cmdid {} failed: {err}", req.cmdid);
        return;
    }

    if pid != -1 {
        state.commands.push(CommandEntry {
            cmdid: req.cmdid,
            pid,
            owner: id,
        });
    }
}

fn handle_cmdsignal(id: u64, state: &Mutex<State>, view: &MsgView<'_>) {
    let req = match msg::decode_cmdsignal(view) {
        Ok(req) => req,
        Err(err) => {
            warn!("bad command signal from client {id}: {err}");
            return;
        }
    };

    let state = lock_state(state);
    // only the submitting client may signal a command
    let Some(cmd) = state
        .commands
        .iter()
        .find(|cmd| cmd.cmdid == req.cmdid && cmd.owner == id)
    else {
        warn!("cmdid {} not found for client {id}", req.cmdid);
        return;
    };

    match Signal::try_from(req.signum) {
        Ok(signum) => {
            info!("sending pid {} signal {signum}", cmd.pid);
            if let Err(err) = kill(Pid::from_raw(cmd.pid), signum) {
                warn!("kill failed: {err}");
            }
        }
        Err(_) => warn!("invalid signal number {}", req.signum),
    }
}
