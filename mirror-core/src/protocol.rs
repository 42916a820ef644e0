//! Mirror wire protocol: packet types and their payload layouts.

use crate::identity::{Fingerprint, FingerprintError};
use crate::integrity::{ContentHash, HashParseError};

/// Packet type byte carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Payload: UTF-8 fingerprint of the sender.
    Identify = 1,
    /// Payload: serialized `StateSnapshot`.
    StateSnapshot = 2,
    /// Payload: slot byte + UTF-8 content hash.
    FileRequest = 3,
    /// Payload: slot byte + chunk bytes. Slot byte alone terminates the transfer.
    FileChunk = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            1 => Ok(PacketType::Identify),
            2 => Ok(PacketType::StateSnapshot),
            3 => Ok(PacketType::FileRequest),
            4 => Ok(PacketType::FileChunk),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Identify(Fingerprint),
    StateSnapshot(Vec<u8>),
    FileRequest { slot: u8, hash: ContentHash },
    FileChunk { slot: u8, data: Vec<u8> },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Identify(_) => PacketType::Identify,
            Packet::StateSnapshot(_) => PacketType::StateSnapshot,
            Packet::FileRequest { .. } => PacketType::FileRequest,
            Packet::FileChunk { .. } => PacketType::FileChunk,
        }
    }

    /// Terminator chunk for `slot`: no data after the slot byte.
    pub fn end_of_file(slot: u8) -> Self {
        Packet::FileChunk {
            slot,
            data: Vec::new(),
        }
    }

    /// Payload bytes as they go on the wire (without the frame header).
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Packet::Identify(fp) => fp.as_str().as_bytes().to_vec(),
            Packet::StateSnapshot(blob) => blob.clone(),
            Packet::FileRequest { slot, hash } => {
                let mut out = Vec::with_capacity(1 + hash.as_str().len());
                out.push(*slot);
                out.extend_from_slice(hash.as_str().as_bytes());
                out
            }
            Packet::FileChunk { slot, data } => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(*slot);
                out.extend_from_slice(data);
                out
            }
        }
    }

    /// Decode a payload received under `packet_type`.
    pub fn decode(packet_type: PacketType, payload: &[u8]) -> Result<Self, PacketError> {
        match packet_type {
            PacketType::Identify => {
                let s = std::str::from_utf8(payload).map_err(|_| PacketError::Utf8)?;
                Ok(Packet::Identify(Fingerprint::parse(s)?))
            }
            PacketType::StateSnapshot => Ok(Packet::StateSnapshot(payload.to_vec())),
            PacketType::FileRequest => {
                let (&slot, rest) = payload.split_first().ok_or(PacketError::MissingSlot)?;
                let s = std::str::from_utf8(rest).map_err(|_| PacketError::Utf8)?;
                Ok(Packet::FileRequest {
                    slot,
                    hash: ContentHash::parse(s)?,
                })
            }
            PacketType::FileChunk => {
                let (&slot, rest) = payload.split_first().ok_or(PacketError::MissingSlot)?;
                Ok(Packet::FileChunk {
                    slot,
                    data: rest.to_vec(),
                })
            }
        }
    }
}

/// Error decoding a packet payload.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("payload is missing the slot byte")]
    MissingSlot,
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
    #[error(transparent)]
    Hash(#[from] HashParseError),
}
