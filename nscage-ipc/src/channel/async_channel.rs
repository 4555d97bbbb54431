// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

use std::io;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use super::{Channel, Listener, ReceivedFds, StdioFds};

/// Readiness-driven wrapper around a [`Channel`].
///
/// Receives suspend on the event loop until the kernel reports a datagram.
/// Sends never suspend: a frame always fits one datagram, so a send that
/// cannot complete immediately is an error surfaced to the caller, which
/// treats it as fatal for the connection.
#[derive(Debug)]
pub struct AsyncChannel {
    inner: AsyncFd<Channel>,
}

impl AsyncChannel {
    pub fn new(channel: Channel) -> io::Result<Self> {
        Ok(AsyncChannel {
            inner: AsyncFd::with_interest(channel, Interest::READABLE)?,
        })
    }

    pub async fn recv_msg(&self, buf: &mut [u8]) -> io::Result<(usize, ReceivedFds)> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv_msg(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub fn send_msg(&self, frame: &[u8], fds: &StdioFds) -> io::Result<()> {
        self.inner.get_ref().send_msg(frame, fds)
    }

    pub fn channel(&self) -> &Channel {
        self.inner.get_ref()
    }
}

/// Readiness-driven wrapper around a [`Listener`].
#[derive(Debug)]
pub struct AsyncListener {
    inner: AsyncFd<Listener>,
}

impl AsyncListener {
    pub fn new(listener: Listener) -> io::Result<Self> {
        Ok(AsyncListener {
            inner: AsyncFd::with_interest(listener, Interest::READABLE)?,
        })
    }

    pub async fn accept(&self) -> io::Result<Channel> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| inner.get_ref().accept()) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub fn listener(&self) -> &Listener {
        self.inner.get_ref()
    }
}
