//! Domain types shared across the replication core.

mod event;
mod gid;
mod member;

pub use event::{
    CertificationSnapshot, EventDecodeError, EventKind, TransactionContext, decode_event,
    decode_event_stream, encode_event,
};
pub use gid::{Gid, Gno, GnoSet, GnoSetDecodeError};
pub use member::{Member, MemberRegistry, MemberStatus, View, ViewMember};
pub(crate) use member::{decode_member, encode_member};

/// Opaque fingerprint of one item in a transaction's write-set.
pub type WriteSetItem = bytes::Bytes;
