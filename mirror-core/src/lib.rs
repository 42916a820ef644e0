//! Mirror protocol reference implementation.
//! Host-driven: no I/O; the node passes connection events in and performs the returned actions.

pub mod chunk;
pub mod identity;
pub mod integrity;
pub mod link;
pub mod protocol;
pub mod snapshot;
pub mod transfer;
pub mod wire;

pub use identity::{Fingerprint, PeerIdentity};
pub use integrity::ContentHash;
pub use link::{ConnectionId, Direction, LinkAction, LinkState, LinkTable, PeerStatus};
pub use protocol::{Packet, PacketType};
pub use snapshot::{StateChange, StateSnapshot};
pub use transfer::{RetryPolicy, TransferKind, TransferPhase, TransferRecord};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
