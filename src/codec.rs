//! Frame/Message Codec (C1).
//!
//! Wire format for engine<->core IPC:
//! `[2-byte magic "DP"][1 ver=1][1 kind][4-byte BE length][payload]`
//!
//! `kind`: 1 = event, 2 = command, 3 = response, 4 = log. Payload is a UTF-8
//! JSON document. Framing mirrors the incremental-buffer-state-machine shape
//! of a streaming text-protocol parser, adapted to a fixed binary header.

use crate::error::{AdapterError, Result};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub const MAGIC: [u8; 2] = *b"DP";
pub const VERSION: u8 = 1;
const HEADER_LEN: usize = 2 + 1 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Event = 1,
    Command = 2,
    Response = 3,
    Log = 4,
}

impl FrameKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(FrameKind::Event),
            2 => Ok(FrameKind::Command),
            3 => Ok(FrameKind::Response),
            4 => Ok(FrameKind::Log),
            other => Err(AdapterError::Framing(format!("unknown frame kind {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Value,
}

/// Serializes a typed payload into a complete wire frame.
pub fn encode<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(payload)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.push(kind as u8);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Incremental decoder: feed bytes as they arrive, drain complete frames.
///
/// On a magic mismatch the stream is considered corrupt and every subsequent
/// call returns the same fatal error — the spec requires no resynchronization
/// attempt.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    poisoned: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            poisoned: false,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if any. Returns `Ok(None)` when more
    /// bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.poisoned {
            return Err(AdapterError::Framing("decoder poisoned by earlier framing error".into()));
        }
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        if self.buffer[0..2] != MAGIC {
            self.poisoned = true;
            return Err(AdapterError::Framing("bad magic".into()));
        }
        let ver = self.buffer[2];
        if ver != VERSION {
            self.poisoned = true;
            return Err(AdapterError::Framing(format!("unsupported version {ver}")));
        }
        let kind = FrameKind::from_u8(self.buffer[3])?;
        let len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        let total = HEADER_LEN + len;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let payload_bytes = &self.buffer[HEADER_LEN..total];
        let payload: Value = serde_json::from_slice(payload_bytes)?;
        self.buffer.drain(0..total);
        Ok(Some(Frame { kind, payload }))
    }
}

/// Convenience: decode a frame's payload into a concrete type.
pub fn parse_payload<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    Ok(serde_json::from_value(frame.payload.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn round_trips_single_frame() {
        let bytes = encode(FrameKind::Command, &Ping { n: 7 }).unwrap();
        let mut dec = FrameDecoder::new();
        dec.feed(&bytes);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Command);
        let ping: Ping = parse_payload(&frame).unwrap();
        assert_eq!(ping, Ping { n: 7 });
        assert!(dec.next_frame().unwrap().is_none());
    }

    #[test]
    fn handles_partial_delivery() {
        let bytes = encode(FrameKind::Event, &Ping { n: 42 }).unwrap();
        let mut dec = FrameDecoder::new();
        dec.feed(&bytes[..5]);
        assert!(dec.next_frame().unwrap().is_none());
        dec.feed(&bytes[5..]);
        let frame = dec.next_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Event);
    }

    #[test]
    fn rejects_bad_magic_permanently() {
        let mut dec = FrameDecoder::new();
        dec.feed(b"XXxx\x00\x00\x00\x00");
        assert!(dec.next_frame().is_err());
        assert!(dec.next_frame().is_err());
    }

    #[test]
    fn decodes_two_back_to_back_frames() {
        let mut bytes = encode(FrameKind::Response, &Ping { n: 1 }).unwrap();
        bytes.extend(encode(FrameKind::Response, &Ping { n: 2 }).unwrap());
        let mut dec = FrameDecoder::new();
        dec.feed(&bytes);
        let a: Ping = parse_payload(&dec.next_frame().unwrap().unwrap()).unwrap();
        let b: Ping = parse_payload(&dec.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(a.n, 1);
        assert_eq!(b.n, 2);
    }
}
