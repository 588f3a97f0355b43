//! Replicated event envelopes and their framing.
//!
//! Packets delivered by the group communication layer carry one or more
//! length-prefixed events. The applier splits packets into frames and the
//! cataloging handler decodes each frame into a typed event; encoding is the
//! inverse, used by originators and by the test rig.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use super::gid::{Gid, Gno};
use super::WriteSetItem;

pub const EVENT_HEADER_LEN: usize = 4;

const KIND_TRANSACTION_CONTEXT: u8 = 0;
const KIND_GID_LOG: u8 = 1;
const KIND_VIEW_CHANGE: u8 = 2;
const KIND_PASSTHROUGH: u8 = 3;

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("event frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("event frame length invalid: {reason}")]
    FrameLengthInvalid { reason: &'static str },
    #[error("unknown event kind {kind}")]
    UnknownKind { kind: u8 },
}

/// Context of one replicated transaction as declared by its originator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionContext {
    pub origin: Uuid,
    pub thread_id: u64,
    pub snapshot_version: Gno,
    pub write_set: Vec<WriteSetItem>,
}

/// Certification state exported by a donor at a view boundary.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificationSnapshot {
    pub db: BTreeMap<WriteSetItem, Gno>,
    pub next_seqno: Gno,
}

/// One event moving through the applier pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Undecoded frame as delivered; the cataloging handler resolves it.
    Raw(Bytes),
    TransactionContext(TransactionContext),
    GidLog { gid: Gid },
    ViewChange {
        view_id: u64,
        snapshot: Option<CertificationSnapshot>,
    },
    /// Engine event replayed verbatim on apply.
    Passthrough(Bytes),
}

/// Encodes one event as a length-prefixed frame.
pub fn encode_event(event: &EventKind) -> Bytes {
    let mut body = Vec::new();
    match event {
        EventKind::Raw(bytes) => return bytes.clone(),
        EventKind::TransactionContext(ctx) => {
            body.push(KIND_TRANSACTION_CONTEXT);
            body.extend_from_slice(ctx.origin.as_bytes());
            body.extend_from_slice(&ctx.thread_id.to_le_bytes());
            body.extend_from_slice(&ctx.snapshot_version.get().to_le_bytes());
            body.extend_from_slice(&(ctx.write_set.len() as u32).to_le_bytes());
            for item in &ctx.write_set {
                body.extend_from_slice(&(item.len() as u32).to_le_bytes());
                body.extend_from_slice(item);
            }
        }
        EventKind::GidLog { gid } => {
            body.push(KIND_GID_LOG);
            body.extend_from_slice(gid.sid.as_bytes());
            body.extend_from_slice(&gid.gno.get().to_le_bytes());
        }
        EventKind::ViewChange { view_id, snapshot } => {
            body.push(KIND_VIEW_CHANGE);
            body.extend_from_slice(&view_id.to_le_bytes());
            match snapshot {
                None => body.push(0),
                Some(snapshot) => {
                    body.push(1);
                    body.extend_from_slice(&(snapshot.db.len() as u32).to_le_bytes());
                    for (item, gno) in &snapshot.db {
                        body.extend_from_slice(&(item.len() as u32).to_le_bytes());
                        body.extend_from_slice(item);
                        body.extend_from_slice(&gno.get().to_le_bytes());
                    }
                    body.extend_from_slice(&snapshot.next_seqno.get().to_le_bytes());
                }
            }
        }
        EventKind::Passthrough(payload) => {
            body.push(KIND_PASSTHROUGH);
            body.extend_from_slice(payload);
        }
    }

    let mut frame = Vec::with_capacity(EVENT_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Bytes::from(frame)
}

/// Decodes one framed event, header included.
pub fn decode_event(frame: &[u8]) -> Result<EventKind, EventDecodeError> {
    if frame.len() < EVENT_HEADER_LEN {
        return Err(EventDecodeError::Truncated {
            need: EVENT_HEADER_LEN,
            got: frame.len(),
        });
    }
    let body_len =
        u32::from_le_bytes(frame[..4].try_into().expect("length checked")) as usize;
    let need = EVENT_HEADER_LEN + body_len;
    if frame.len() < need {
        return Err(EventDecodeError::Truncated {
            need,
            got: frame.len(),
        });
    }
    let body = &frame[EVENT_HEADER_LEN..need];
    if body.is_empty() {
        return Err(EventDecodeError::FrameLengthInvalid {
            reason: "event body cannot be empty",
        });
    }

    let mut cursor = Cursor::new(&body[1..]);
    match body[0] {
        KIND_TRANSACTION_CONTEXT => {
            let origin = cursor.uuid()?;
            let thread_id = cursor.u64()?;
            let snapshot_version = Gno::new(cursor.u64()?);
            let count = cursor.u32()? as usize;
            let mut write_set = Vec::with_capacity(count);
            for _ in 0..count {
                let len = cursor.u32()? as usize;
                write_set.push(Bytes::copy_from_slice(cursor.take(len)?));
            }
            Ok(EventKind::TransactionContext(TransactionContext {
                origin,
                thread_id,
                snapshot_version,
                write_set,
            }))
        }
        KIND_GID_LOG => {
            let sid = cursor.uuid()?;
            let gno = Gno::new(cursor.u64()?);
            Ok(EventKind::GidLog {
                gid: Gid::new(sid, gno),
            })
        }
        KIND_VIEW_CHANGE => {
            let view_id = cursor.u64()?;
            let snapshot = match cursor.take(1)?[0] {
                0 => None,
                _ => {
                    let entries = cursor.u32()? as usize;
                    let mut db = BTreeMap::new();
                    for _ in 0..entries {
                        let len = cursor.u32()? as usize;
                        let item = Bytes::copy_from_slice(cursor.take(len)?);
                        db.insert(item, Gno::new(cursor.u64()?));
                    }
                    Some(CertificationSnapshot {
                        db,
                        next_seqno: Gno::new(cursor.u64()?),
                    })
                }
            };
            Ok(EventKind::ViewChange { view_id, snapshot })
        }
        KIND_PASSTHROUGH => Ok(EventKind::Passthrough(Bytes::copy_from_slice(
            cursor.rest(),
        ))),
        kind => Err(EventDecodeError::UnknownKind { kind }),
    }
}

/// Splits a packet of concatenated frames into events, preserving order.
pub fn decode_event_stream(packet: &[u8]) -> Result<Vec<Bytes>, EventDecodeError> {
    let mut frames = Vec::new();
    let mut at = 0usize;
    while at < packet.len() {
        if packet.len() - at < EVENT_HEADER_LEN {
            return Err(EventDecodeError::Truncated {
                need: at + EVENT_HEADER_LEN,
                got: packet.len(),
            });
        }
        let body_len =
            u32::from_le_bytes(packet[at..at + 4].try_into().expect("length checked")) as usize;
        let end = at + EVENT_HEADER_LEN + body_len;
        if packet.len() < end {
            return Err(EventDecodeError::Truncated {
                need: end,
                got: packet.len(),
            });
        }
        frames.push(Bytes::copy_from_slice(&packet[at..end]));
        at = end;
    }
    Ok(frames)
}

struct Cursor<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], EventDecodeError> {
        if self.data.len() - self.at < len {
            return Err(EventDecodeError::Truncated {
                need: self.at + len,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.at..self.at + len];
        self.at += len;
        Ok(slice)
    }

    fn rest(&self) -> &'a [u8] {
        &self.data[self.at..]
    }

    fn u32(&mut self) -> Result<u32, EventDecodeError> {
        Ok(u32::from_le_bytes(
            self.take(4)?.try_into().expect("length checked"),
        ))
    }

    fn u64(&mut self) -> Result<u64, EventDecodeError> {
        Ok(u64::from_le_bytes(
            self.take(8)?.try_into().expect("length checked"),
        ))
    }

    fn uuid(&mut self) -> Result<Uuid, EventDecodeError> {
        Ok(Uuid::from_slice(self.take(16)?).expect("sixteen bytes parse as a uuid"))
    }
}
