// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Command client for a running nscage supervisor.
//!
//! The client submits command requests over the control channel, correlates
//! acks and completions by cmdid, and delivers results through a completion
//! callback. It is built to be embedded: the reader runs as a task on the
//! caller's runtime, and the callback may fire on a different thread than
//! the one that submitted; completions are published under the client's
//! lock either way.
//!
//! Every accepted submission resolves its callback exactly once: on
//! `CMDSTATUS`, on a spawn-failure ack, on an I/O error, or at
//! [`Client::close`], whichever comes first.

pub mod stdio;

pub use stdio::{CommandStdio, IoMode};

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::bail;
use nscage_ipc::channel::{AsyncChannel, Channel, StdioFds};
use nscage_ipc::msg::{self, MsgType, MsgView, ARG_MAX, MSG_SIZE_MAX};
use tokio::task::JoinHandle;
use tracing::warn;

/// Completion callback: `(cmdid, pid, raw wait status)`. A pid of -1 means
/// the spawn failed; a status of -1 means no status will ever arrive.
pub type DoneCallback = Box<dyn FnOnce(i32, i32, i32) + Send>;

/// Invoked once if the control channel fails; every pending completion has
/// already been resolved with status -1 by then.
pub type IoErrorCallback = Box<dyn FnOnce() + Send>;

struct InFlight {
    pid: i32,
    on_done: Option<DoneCallback>,
}

#[derive(Default)]
struct ClientState {
    pending: HashMap<i32, InFlight>,
    next_cmdid: i32,
    failed: bool,
}

fn lock_state(state: &Mutex<ClientState>) -> MutexGuard<'_, ClientState> {
    #[allow(clippy::unwrap_used)]
    state.lock().unwrap()
}

pub struct Client {
    chan: Arc<AsyncChannel>,
    state: Arc<Mutex<ClientState>>,
    reader: JoinHandle<()>,
}

impl Client {
    /// Connects to the supervisor at `path` and starts the message reader
    /// on the current runtime.
    pub fn connect<P: AsRef<Path>>(path: P, on_io_error: IoErrorCallback) -> io::Result<Client> {
        let chan = Arc::new(AsyncChannel::new(Channel::connect(path)?)?);
        let state = Arc::new(Mutex::new(ClientState::default()));
        let reader = tokio::spawn(reader_loop(chan.clone(), state.clone(), on_io_error));
        Ok(Client {
            chan,
            state,
            reader,
        })
    }

    /// Submits a command. The returned cmdid is the one `on_done` will
    /// report. On success the child-side descriptors of `stdio` have been
    /// handed to the server and closed locally.
    pub fn submit(
        &self,
        stdio: &mut CommandStdio,
        args: &[CString],
        on_done: DoneCallback,
    ) -> anyhow::Result<i32> {
        if args.is_empty() {
            bail!("empty command");
        }
        if args.len() >= ARG_MAX {
            bail!("too many command arguments");
        }

        let mut state = lock_state(&self.state);
        if state.failed {
            bail!("control channel is down");
        }

        // wraps at i32::MAX; negative ids are never handed out
        if state.next_cmdid < 0 {
            state.next_cmdid = 0;
        }
        let cmdid = state.next_cmdid;
        state.next_cmdid = state.next_cmdid.wrapping_add(1);

        state.pending.insert(
            cmdid,
            InFlight {
                pid: -1,
                on_done: Some(on_done),
            },
        );

        let frame = msg::encode_cmdreq(cmdid, args)?;
        if let Err(err) = self.chan.send_msg(&frame, &stdio.child_fds()) {
            state.pending.remove(&cmdid);
            return Err(err.into());
        }
        drop(state);

        // the kernel duplicated them into the server; our copies go now
        stdio.close_child_side();
        Ok(cmdid)
    }

    /// Forwards `signum` to the command. Fire-and-forget: no reply exists,
    /// and sending twice signals twice.
    pub fn kill(&self, cmdid: i32, signum: i32) -> anyhow::Result<()> {
        let frame = msg::encode_cmdsignal(cmdid, signum)?;
        self.chan.send_msg(&frame, &StdioFds::NONE)?;
        Ok(())
    }

    /// Stops the reader, closes the channel, and resolves every in-flight
    /// completion with status -1 so no caller waits forever.
    pub fn close(self) {
        self.reader.abort();
        resolve_all_pending(&self.state);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn resolve_all_pending(state: &Mutex<ClientState>) {
    let drained: Vec<(i32, InFlight)> = {
        let mut state = lock_state(state);
        state.failed = true;
        state.pending.drain().collect()
    };
    // callbacks run outside the lock; they may call back into the client
    for (cmdid, mut entry) in drained {
        if let Some(done) = entry.on_done.take() {
            done(cmdid, entry.pid, -1);
        }
    }
}

async fn reader_loop(
    chan: Arc<AsyncChannel>,
    state: Arc<Mutex<ClientState>>,
    on_io_error: IoErrorCallback,
) {
    let mut buf = vec![0u8; MSG_SIZE_MAX];
    loop {
        let (len, _fds) = match chan.recv_msg(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("i/o error on control channel: {err}");
                resolve_all_pending(&state);
                on_io_error();
                return;
            }
        };

        let Some(view) = MsgView::from_datagram(&buf[..len]) else {
            continue;
        };

        match view.msgtype {
            MsgType::CmdReqAck => handle_cmdreqack(&state, &view),
            MsgType::CmdStatus => handle_cmdstatus(&state, &view),
            other => warn!("no handler for message type {other:?}"),
        }
    }
}

fn handle_cmdreqack(state: &Mutex<ClientState>, view: &MsgView<'_>) {
    let ack = match msg::decode_cmdreqack(view) {
        Ok(ack) => ack,
        Err(err) => {
            warn!("bad command ack: {err}");
            return;
        }
    };

    let mut state = lock_state(state);
    let Some(entry) = state.pending.get_mut(&ack.cmdid) else {
        warn!("cmdid {} not found in command list", ack.cmdid);
        return;
    };
    entry.pid = ack.pid;

    if ack.pid == -1 {
        // spawn failed; no status will follow
        let done = entry.on_done.take();
        state.pending.remove(&ack.cmdid);
        drop(state);
        if let Some(done) = done {
            done(ack.cmdid, -1, -1);
        }
    }
}

fn handle_cmdstatus(state: &Mutex<ClientState>, view: &MsgView<'_>) {
    let status = match msg::decode_cmdstatus(view) {
        Ok(status) => status,
        Err(err) => {
            warn!("bad command status: {err}");
            return;
        }
    };

    let mut state = lock_state(state);
    let Some(mut entry) = state.pending.remove(&status.cmdid) else {
        warn!("cmdid {} not found in command list", status.cmdid);
        return;
    };
    let done = entry.on_done.take();
    drop(state);

    if let Some(done) = done {
        done(status.cmdid, entry.pid, status.status);
    }
}
