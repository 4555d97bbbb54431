// Copyright 2026-Present nscage contributors
// SPDX-License-Identifier: Apache-2.0

//! Message framing and TLV codec.
//!
//! The protocol is intra-host, so integers are native-endian. A message is
//! `{type: u32, datalen: u32}` followed by `datalen` bytes of concatenated
//! TLVs, each `{type: u32, vallen: u32, val}`. `vallen == 0` is invalid.

use std::ffi::{CStr, CString};
use std::io;

use tracing::warn;

/// Largest framed message, header included.
pub const MSG_SIZE_MAX: usize = 65535;
/// Upper bound on argv entries in a command request, terminator included.
pub const ARG_MAX: usize = 1024;

pub(crate) const HDR_LEN: usize = 8;
const TLV_HDR_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    CmdReq = 1,
    CmdReqAck = 2,
    CmdStatus = 3,
    CmdSignal = 4,
}

impl MsgType {
    /// Maps a wire value, rejecting NONE and anything past the catalog.
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MsgType::CmdReq),
            2 => Some(MsgType::CmdReqAck),
            3 => Some(MsgType::CmdStatus),
            4 => Some(MsgType::CmdSignal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TlvType {
    CmdId = 1,
    Stdin = 2,
    Stdout = 3,
    Stderr = 4,
    CmdArg = 5,
    CmdPid = 6,
    CmdStatus = 7,
    SigNum = 8,
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Outgoing message under construction. The buffer grows as TLVs are
/// appended; the header's `datalen` is fixed up by [`MsgBuf::finish`].
#[derive(Debug)]
pub struct MsgBuf {
    buf: Vec<u8>,
}

impl MsgBuf {
    pub fn new(msgtype: MsgType) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(msgtype as u32).to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        MsgBuf { buf }
    }

    fn push_tlv(&mut self, tlvtype: TlvType, val: &[u8]) {
        debug_assert!(!val.is_empty());
        self.buf.extend_from_slice(&(tlvtype as u32).to_ne_bytes());
        self.buf.extend_from_slice(&(val.len() as u32).to_ne_bytes());
        self.buf.extend_from_slice(val);
    }

    pub fn push_i32(&mut self, tlvtype: TlvType, val: i32) {
        self.push_tlv(tlvtype, &val.to_ne_bytes());
    }

    /// Appends a string TLV; the trailing NUL is part of the value.
    pub fn push_str(&mut self, tlvtype: TlvType, val: &CStr) {
        self.push_tlv(tlvtype, val.to_bytes_with_nul());
    }

    /// Finalizes the frame, rejecting anything past the datagram bound.
    pub fn finish(mut self) -> io::Result<Vec<u8>> {
        if self.buf.len() > MSG_SIZE_MAX {
            return Err(invalid_data(format!(
                "message too large: {} bytes",
                self.buf.len()
            )));
        }
        let datalen = (self.buf.len() - HDR_LEN) as u32;
        self.buf[4..8].copy_from_slice(&datalen.to_ne_bytes());
        Ok(self.buf)
    }
}

/// Validated view of one received datagram.
#[derive(Debug, Clone, Copy)]
pub struct MsgView<'a> {
    pub msgtype: MsgType,
    payload: &'a [u8],
}

impl<'a> MsgView<'a> {
    /// Frames a raw datagram. `None` means the datagram must be ignored
    /// without closing the connection: short header, out-of-catalog type,
    /// or a payload length that disagrees with what was received.
    pub fn from_datagram(data: &'a [u8]) -> Option<MsgView<'a>> {
        if data.len() < HDR_LEN {
            warn!(
                "message header truncated: received {} of {} bytes",
                data.len(),
                HDR_LEN
            );
            return None;
        }

        let raw = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        let Some(msgtype) = MsgType::from_wire(raw) else {
            warn!("invalid message type: {raw}");
            return None;
        };

        let datalen = u32::from_ne_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() - HDR_LEN != datalen {
            warn!(
                "message length mismatch: received {} bytes; expected {} bytes",
                data.len() - HDR_LEN,
                datalen
            );
            return None;
        }

        Some(MsgView {
            msgtype,
            payload: &data[HDR_LEN..],
        })
    }

    pub fn tlvs(&self) -> TlvIter<'a> {
        TlvIter {
            data: self.payload,
            offset: 0,
        }
    }
}

/// One TLV inside a message payload.
#[derive(Debug, Clone, Copy)]
pub struct Tlv<'a> {
    pub tlvtype: u32,
    pub val: &'a [u8],
}

impl Tlv<'_> {
    pub fn as_i32(&self) -> io::Result<i32> {
        let bytes: [u8; 4] = self
            .val
            .try_into()
            .map_err(|_| invalid_data(format!("invalid value length for int32: {}", self.val.len())))?;
        Ok(i32::from_ne_bytes(bytes))
    }

    pub fn as_c_str(&self) -> io::Result<&CStr> {
        CStr::from_bytes_with_nul(self.val)
            .map_err(|_| invalid_data("string not null-terminated".to_string()))
    }
}

/// Walks the TLVs of a payload. Malformed entries (`vallen == 0`, or a
/// length that runs past the payload) are skipped, and the walk continues
/// at the position they claim, matching the peer's framing.
#[derive(Debug)]
pub struct TlvIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for TlvIter<'a> {
    type Item = Tlv<'a>;

    fn next(&mut self) -> Option<Tlv<'a>> {
        while self.offset < self.data.len() {
            let rest = &self.data[self.offset..];
            if rest.len() < TLV_HDR_LEN {
                warn!("truncated tlv header: {} bytes left", rest.len());
                self.offset = self.data.len();
                return None;
            }

            let tlvtype = u32::from_ne_bytes([rest[0], rest[1], rest[2], rest[3]]);
            let vallen = u32::from_ne_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
            self.offset += TLV_HDR_LEN + vallen;

            if vallen == 0 || self.offset > self.data.len() {
                warn!("invalid value length: {vallen}");
                continue;
            }

            return Some(Tlv {
                tlvtype,
                val: &rest[TLV_HDR_LEN..TLV_HDR_LEN + vallen],
            });
        }
        None
    }
}

/// Body of a `CMDREQ`. The file descriptors arrive separately as ancillary
/// data and are not part of the parse.
#[derive(Debug, Default)]
pub struct CmdReq {
    pub cmdid: i32,
    pub args: Vec<CString>,
}

pub fn decode_cmdreq(msg: &MsgView<'_>) -> io::Result<CmdReq> {
    debug_assert_eq!(msg.msgtype, MsgType::CmdReq);

    let mut req = CmdReq::default();
    for tlv in msg.tlvs() {
        match tlv.tlvtype {
            t if t == TlvType::CmdId as u32 => req.cmdid = tlv.as_i32()?,
            t if t == TlvType::CmdArg as u32 => {
                // one slot stays free for the exec terminator
                if req.args.len() + 1 >= ARG_MAX {
                    return Err(invalid_data("too many command arguments".to_string()));
                }
                req.args.push(tlv.as_c_str()?.to_owned());
            }
            other => warn!("unknown tlv type: {other}"),
        }
    }

    if req.args.is_empty() {
        return Err(invalid_data("empty command".to_string()));
    }

    Ok(req)
}

pub fn encode_cmdreq(cmdid: i32, args: &[CString]) -> io::Result<Vec<u8>> {
    let mut buf = MsgBuf::new(MsgType::CmdReq);
    buf.push_i32(TlvType::CmdId, cmdid);
    for arg in args {
        buf.push_str(TlvType::CmdArg, arg);
    }
    buf.finish()
}

#[derive(Debug)]
pub struct CmdReqAck {
    pub cmdid: i32,
    pub pid: i32,
}

impl Default for CmdReqAck {
    fn default() -> Self {
        CmdReqAck { cmdid: 0, pid: -1 }
    }
}

pub fn decode_cmdreqack(msg: &MsgView<'_>) -> io::Result<CmdReqAck> {
    debug_assert_eq!(msg.msgtype, MsgType::CmdReqAck);

    let mut ack = CmdReqAck::default();
    for tlv in msg.tlvs() {
        match tlv.tlvtype {
            t if t == TlvType::CmdId as u32 => ack.cmdid = tlv.as_i32()?,
            t if t == TlvType::CmdPid as u32 => ack.pid = tlv.as_i32()?,
            other => warn!("unknown tlv type: {other}"),
        }
    }
    Ok(ack)
}

pub fn encode_cmdreqack(cmdid: i32, pid: i32) -> io::Result<Vec<u8>> {
    let mut buf = MsgBuf::new(MsgType::CmdReqAck);
    buf.push_i32(TlvType::CmdId, cmdid);
    buf.push_i32(TlvType::CmdPid, pid);
    buf.finish()
}

#[derive(Debug)]
pub struct CmdStatus {
    pub cmdid: i32,
    pub status: i32,
}

impl Default for CmdStatus {
    fn default() -> Self {
        CmdStatus {
            cmdid: 0,
            status: -1,
        }
    }
}

pub fn decode_cmdstatus(msg: &MsgView<'_>) -> io::Result<CmdStatus> {
    debug_assert_eq!(msg.msgtype, MsgType::CmdStatus);

    let mut status = CmdStatus::default();
    for tlv in msg.tlvs() {
        match tlv.tlvtype {
            t if t == TlvType::CmdId as u32 => status.cmdid = tlv.as_i32()?,
            t if t == TlvType::CmdStatus as u32 => status.status = tlv.as_i32()?,
            other => warn!("unknown tlv type: {other}"),
        }
    }
    Ok(status)
}

pub fn encode_cmdstatus(cmdid: i32, status: i32) -> io::Result<Vec<u8>> {
    let mut buf = MsgBuf::new(MsgType::CmdStatus);
    buf.push_i32(TlvType::CmdId, cmdid);
    buf.push_i32(TlvType::CmdStatus, status);
    buf.finish()
}

#[derive(Debug, Default)]
pub struct CmdSignal {
    pub cmdid: i32,
    pub signum: i32,
}

pub fn decode_cmdsignal(msg: &MsgView<'_>) -> io::Result<CmdSignal> {
    debug_assert_eq!(msg.msgtype, MsgType::CmdSignal);

    let mut signal = CmdSignal::default();
    for tlv in msg.tlvs() {
        match tlv.tlvtype {
            t if t == TlvType::CmdId as u32 => signal.cmdid = tlv.as_i32()?,
            t if t == TlvType::SigNum as u32 => signal.signum = tlv.as_i32()?,
            other => warn!("unknown tlv type: {other}"),
        }
    }
    Ok(signal)
}

pub fn encode_cmdsignal(cmdid: i32, signum: i32) -> io::Result<Vec<u8>> {
    let mut buf = MsgBuf::new(MsgType::CmdSignal);
    buf.push_i32(TlvType::CmdId, cmdid);
    buf.push_i32(TlvType::SigNum, signum);
    buf.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cstr(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn cmdreq_roundtrip() {
        let args = vec![cstr("/bin/sh"), cstr("-c"), cstr("exit 7")];
        let frame = encode_cmdreq(42, &args).unwrap();

        let msg = MsgView::from_datagram(&frame).expect("well-formed frame");
        assert_eq!(msg.msgtype, MsgType::CmdReq);

        let req = decode_cmdreq(&msg).unwrap();
        assert_eq!(req.cmdid, 42);
        assert_eq!(req.args, args);
    }

    #[test]
    fn cmdreqack_roundtrip() {
        let frame = encode_cmdreqack(7, 1234).unwrap();
        let msg = MsgView::from_datagram(&frame).unwrap();
        let ack = decode_cmdreqack(&msg).unwrap();
        assert_eq!(ack.cmdid, 7);
        assert_eq!(ack.pid, 1234);
    }

    #[test]
    fn cmdstatus_roundtrip() {
        let frame = encode_cmdstatus(3, 0x0f00).unwrap();
        let msg = MsgView::from_datagram(&frame).unwrap();
        let status = decode_cmdstatus(&msg).unwrap();
        assert_eq!(status.cmdid, 3);
        assert_eq!(status.status, 0x0f00);
    }

    #[test]
    fn cmdsignal_roundtrip() {
        let frame = encode_cmdsignal(9, libc::SIGTERM).unwrap();
        let msg = MsgView::from_datagram(&frame).unwrap();
        let signal = decode_cmdsignal(&msg).unwrap();
        assert_eq!(signal.cmdid, 9);
        assert_eq!(signal.signum, libc::SIGTERM);
    }

    #[test]
    fn short_datagram_is_ignored() {
        assert!(MsgView::from_datagram(&[0u8; 7]).is_none());
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let mut frame = encode_cmdreqack(1, 2).unwrap();
        frame[0..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(MsgView::from_datagram(&frame).is_none());
    }

    #[test]
    fn none_message_type_is_ignored() {
        let mut frame = encode_cmdreqack(1, 2).unwrap();
        frame[0..4].copy_from_slice(&0u32.to_ne_bytes());
        assert!(MsgView::from_datagram(&frame).is_none());
    }

    #[test]
    fn length_mismatch_is_ignored() {
        let mut frame = encode_cmdreqack(1, 2).unwrap();
        let bogus = (frame.len() as u32) + 4;
        frame[4..8].copy_from_slice(&bogus.to_ne_bytes());
        assert!(MsgView::from_datagram(&frame).is_none());
    }

    #[test]
    fn header_only_datagram_has_no_tlvs() {
        // datalen == 0 frames well but no catalog message is TLV-free, so
        // every decoder treats it as malformed
        let frame = MsgBuf::new(MsgType::CmdReq).finish().unwrap();
        let msg = MsgView::from_datagram(&frame).unwrap();
        assert!(decode_cmdreq(&msg).is_err());
    }

    #[test]
    fn zero_vallen_tlv_is_skipped() {
        let mut frame = MsgBuf::new(MsgType::CmdReqAck);
        frame.push_i32(TlvType::CmdId, 5);
        let mut frame = frame.finish().unwrap();
        // splice a zero-length TLV in front of the real one
        let mut payload = frame.split_off(HDR_LEN);
        let mut spliced = frame.clone();
        spliced.extend_from_slice(&(TlvType::CmdPid as u32).to_ne_bytes());
        spliced.extend_from_slice(&0u32.to_ne_bytes());
        spliced.append(&mut payload);
        let datalen = (spliced.len() - HDR_LEN) as u32;
        spliced[4..8].copy_from_slice(&datalen.to_ne_bytes());

        let msg = MsgView::from_datagram(&spliced).unwrap();
        let ack = decode_cmdreqack(&msg).unwrap();
        assert_eq!(ack.cmdid, 5);
        assert_eq!(ack.pid, -1); // the zero-length CMDPID never landed
    }

    #[test]
    fn overrunning_tlv_is_skipped() {
        let mut frame = MsgBuf::new(MsgType::CmdSignal);
        frame.push_i32(TlvType::CmdId, 1);
        let mut frame = frame.finish().unwrap();
        // claim more bytes than the payload holds
        frame.extend_from_slice(&(TlvType::SigNum as u32).to_ne_bytes());
        frame.extend_from_slice(&64u32.to_ne_bytes());
        frame.extend_from_slice(&libc::SIGTERM.to_ne_bytes());
        let datalen = (frame.len() - HDR_LEN) as u32;
        frame[4..8].copy_from_slice(&datalen.to_ne_bytes());

        let msg = MsgView::from_datagram(&frame).unwrap();
        let signal = decode_cmdsignal(&msg).unwrap();
        assert_eq!(signal.cmdid, 1);
        assert_eq!(signal.signum, 0);
    }

    #[test]
    fn string_without_nul_fails_decode() {
        let mut frame = MsgBuf::new(MsgType::CmdReq);
        frame.push_i32(TlvType::CmdId, 1);
        frame.push_tlv(TlvType::CmdArg, b"ls"); // no trailing NUL
        let frame = frame.finish().unwrap();

        let msg = MsgView::from_datagram(&frame).unwrap();
        assert!(decode_cmdreq(&msg).is_err());
    }

    #[test]
    fn wrong_width_int_fails_decode() {
        let mut frame = MsgBuf::new(MsgType::CmdStatus);
        frame.push_tlv(TlvType::CmdId, &[1, 2]);
        let frame = frame.finish().unwrap();

        let msg = MsgView::from_datagram(&frame).unwrap();
        assert!(decode_cmdstatus(&msg).is_err());
    }

    #[test]
    fn cmdreq_arg_limit_is_enforced() {
        let args: Vec<CString> = (0..ARG_MAX).map(|i| cstr(&i.to_string())).collect();
        let frame = encode_cmdreq(0, &args).unwrap();
        let msg = MsgView::from_datagram(&frame).unwrap();
        assert!(decode_cmdreq(&msg).is_err());
    }

    #[test]
    fn empty_argv_is_rejected() {
        let frame = encode_cmdreq(0, &[]).unwrap();
        let msg = MsgView::from_datagram(&frame).unwrap();
        assert!(decode_cmdreq(&msg).is_err());
    }

    #[test]
    fn unknown_tlv_types_are_skipped() {
        let mut frame = MsgBuf::new(MsgType::CmdReqAck);
        frame.push_i32(TlvType::CmdId, 11);
        frame.push_tlv(TlvType::Stdin, &[0xff; 4]); // reserved tag
        frame.push_i32(TlvType::CmdPid, 22);
        let frame = frame.finish().unwrap();

        let msg = MsgView::from_datagram(&frame).unwrap();
        let ack = decode_cmdreqack(&msg).unwrap();
        assert_eq!(ack.cmdid, 11);
        assert_eq!(ack.pid, 22);
    }

    #[test]
    fn oversized_message_fails_to_finish() {
        let mut frame = MsgBuf::new(MsgType::CmdReq);
        let big = vec![b'a'; MSG_SIZE_MAX];
        frame.push_tlv(TlvType::CmdArg, &big);
        assert!(frame.finish().is_err());
    }
}
