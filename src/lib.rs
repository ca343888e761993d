//! Low-level protocol logic for synchronizing messages through a shared
//! drop folder.
//!
//! dropsync implements a two-layer protocol for environments where the
//! only transport between two peers is writing files into a folder the
//! other side polls: one-way links, data diodes, badly behaved network
//! shares. There are no sockets and no acknowledgement channel the
//! transport itself could provide; files may appear late, truncated, or
//! corrupted, and the two peers must still converge on the same ordered
//! sequence of delivered messages.
//!
//! Layer 0 (`BinaryWriter`/`BinaryReader`) frames a single packet file:
//! a size sentinel written last for partial-write detection, a gzip body
//! wrapped in a ChaCha20 keystream, and a readiness probe that notices
//! when a writer died mid-file. Layer 1 (`Messenger`) is the per-peer
//! state machine: an append-only outbox and a sparse inbox, a compact
//! vector-clock-like control block in every packet, selective and
//! negative acknowledgements, retransmission, and multipart
//! fragmentation of oversized payloads.
//!
//! The `Endpoint` ties both layers to an actual folder; it is a plain
//! polling loop and owns all clocks, randomness and file handles, so the
//! protocol layers stay deterministic and testable.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod coerce;
pub use crate::coerce::Timestamp;

mod config;
pub use crate::config::Config;

pub mod crypto;
pub use crate::crypto::{decrypt_key, encrypt_key, HashKey, SecretKey, TOKEN_LEN};

mod error;
pub use crate::error::{Error, Result};

mod stream;
pub use crate::stream::{BinaryReader, BinaryWriter};

pub(crate) mod packet;
pub use crate::packet::{
    Content, ContentType, Control, Message, MessageHeader, Packet, PacketHeader,
    MESSAGE_HEADER_SIZE, PACKET_HEADER_SIZE,
};

pub(crate) mod queue;
pub use crate::queue::inbox::{Inbox, InboxItem};
pub use crate::queue::outbox::OutboxItem;

mod messenger;
pub use crate::messenger::{DebugClocks, Messenger};

mod endpoint;
pub use crate::endpoint::Endpoint;
