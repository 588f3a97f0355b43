//! Recovery control messages exchanged over the group.

use thiserror::Error;
use uuid::Uuid;

/// Message type tag for recovery-end announcements.
pub const RECOVERY_END_MESSAGE: u16 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryMessageError {
    #[error("recovery message truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("unknown recovery message type {message_type}")]
    UnknownType { message_type: u16 },
    #[error("recovery message carries an invalid uuid")]
    InvalidUuid,
}

/// A joiner's announcement that it finished recovery and is online.
///
/// Layout: message type, uuid length, uuid text; little-endian.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryEndMessage {
    pub uuid: Uuid,
}

impl RecoveryEndMessage {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn encode(&self) -> Vec<u8> {
        let text = self.uuid.to_string();
        let mut out = Vec::with_capacity(6 + text.len());
        out.extend_from_slice(&RECOVERY_END_MESSAGE.to_le_bytes());
        out.extend_from_slice(&(text.len() as u32).to_le_bytes());
        out.extend_from_slice(text.as_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, RecoveryMessageError> {
        if data.len() < 6 {
            return Err(RecoveryMessageError::Truncated {
                need: 6,
                got: data.len(),
            });
        }
        let message_type = u16::from_le_bytes(data[..2].try_into().expect("length checked"));
        if message_type != RECOVERY_END_MESSAGE {
            return Err(RecoveryMessageError::UnknownType { message_type });
        }
        let uuid_len = u32::from_le_bytes(data[2..6].try_into().expect("length checked")) as usize;
        if data.len() < 6 + uuid_len {
            return Err(RecoveryMessageError::Truncated {
                need: 6 + uuid_len,
                got: data.len(),
            });
        }
        let text = std::str::from_utf8(&data[6..6 + uuid_len])
            .map_err(|_| RecoveryMessageError::InvalidUuid)?;
        let uuid = Uuid::try_parse(text).map_err(|_| RecoveryMessageError::InvalidUuid)?;
        Ok(Self { uuid })
    }
}
