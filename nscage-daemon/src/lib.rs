// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Container supervisor.
//!
//! The daemon runs as PID 1 inside a freshly created namespace set and
//! executes commands received over a `SOCK_SEQPACKET` control channel:
//! clients submit an argv plus up to three standard-I/O descriptors, the
//! supervisor forks the command, acknowledges with the child pid, and
//! reports the wait status once the child is reaped.

pub mod command;
pub mod config;
pub mod ns;
pub mod reaper;
pub mod server;
pub mod setup;

pub use config::DaemonConfig;
pub use server::{ControlEndpoint, Server, ShutdownHandle};
