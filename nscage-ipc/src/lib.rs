// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol for the nscage control channel.
//!
//! Each datagram on the `SOCK_SEQPACKET` control socket is exactly one
//! message: an 8-byte native-endian header followed by a run of TLVs.
//! Standard-I/O file descriptors ride along as `SCM_RIGHTS` ancillary data,
//! never inside the payload.

pub mod channel;
pub mod msg;

pub use channel::{AsyncChannel, AsyncListener, Channel, Listener, ReceivedFds, StdioFds};
pub use msg::{MsgBuf, MsgType, MsgView, TlvType, ARG_MAX, MSG_SIZE_MAX};
