//! Session descriptor — the identity and advertised state of a
//! transfer, shared between the handshake, the engines, and discovery.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

/// Transfer parameters negotiated by the sender and announced in the
/// metadata control record. These govern pacing and repair behavior on
/// both ends; they are never renegotiated mid-transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferParams {
    pub chunk_size: u32,
    pub block_size_packets: u32,
    pub nack_listen_timeout_ms: u32,
    pub repair_rounds: u32,
}

impl Default for TransferParams {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            block_size_packets: 64,
            nack_listen_timeout_ms: 200,
            repair_rounds: 3,
        }
    }
}

/// Describes the file being transferred. Derived from the sender's
/// local file and carried in the metadata control record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileDescriptor {
    pub file_name: String,
    pub file_size: u64,
    pub file_crc32: u32,
    pub total_chunks: u32,
}

/// Advertised availability of a session, as shown by discovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Available,
    Busy,
}

/// A session as advertised to prospective receivers: who is offering
/// what, and where to connect for the handshake. This is the unit that
/// crosses the discovery boundary — see `pycast_net::discovery`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub session_name: String,
    pub sender_username: String,
    pub handshake_addr: SocketAddr,
    pub status: Status,
}

impl Session {
    pub fn new(session_name: String, sender_username: String, handshake_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_name,
            sender_username,
            handshake_addr,
            status: Status::Available,
        }
    }
}
