//! Wire format — binary data packets and textual control records.
//!
//! A pycast transfer has two kinds of datagrams sharing one multicast
//! group: fixed-size binary data packets carrying file bytes, and
//! single-line JSON control records carrying everything else
//! (metadata, block boundaries, end of file, cancellation, NACKs). A
//! receiver tells them apart by the rule in [`classify`]: a datagram
//! whose first 16 bytes equal the known session id is a data packet;
//! anything else is parsed as a control record.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Default IPv4 multicast group used for the bulk data plane.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 1, 100);
/// Default UDP port for the multicast data plane (data packets and the
/// sender-originated control records that share it).
pub const DEFAULT_MULTICAST_PORT: u16 = 5007;
/// Multicast TTL used by the sender. Kept at 1 — pycast never routes
/// across subnets.
pub const DEFAULT_MULTICAST_TTL: u32 = 1;
/// Default TCP port for the handshake/lobby listener.
pub const DEFAULT_HANDSHAKE_PORT: u16 = 5008;
/// Default unicast UDP port receivers use to send NACKs back to the
/// sender. Shared by every receiver in a lobby session — see the open
/// question in the design notes about collisions under concurrent loss.
pub const DEFAULT_NACK_PORT: u16 = 5009;
/// Default UDP port used by the discovery announcer/listener pair.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5010;

/// Size of the fixed header prefixing every data packet: a 16-byte
/// session UUID followed by a 4-byte big-endian sequence number.
pub const DATA_PACKET_HEADER_LEN: usize = 20;

/// The fixed-size prefix of a binary data packet. The variable-length
/// chunk payload follows immediately after these bytes on the wire; it
/// is not part of this struct because chunks are not fixed-size (the
/// final chunk of a file is typically shorter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DataPacketHeader {
    pub session_id: [u8; 16],
    pub seq_be: [u8; 4],
}

static_assertions::assert_eq_size!(DataPacketHeader, [u8; DATA_PACKET_HEADER_LEN]);

impl DataPacketHeader {
    pub fn new(session_id: Uuid, seq: u32) -> Self {
        Self {
            session_id: *session_id.as_bytes(),
            seq_be: seq.to_be_bytes(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        Uuid::from_bytes(self.session_id)
    }

    pub fn seq(&self) -> u32 {
        u32::from_be_bytes(self.seq_be)
    }
}

/// Build a complete data packet: header followed by the chunk payload.
pub fn encode_data_packet(session_id: Uuid, seq: u32, payload: &[u8]) -> Vec<u8> {
    let header = DataPacketHeader::new(session_id, seq);
    let mut buf = Vec::with_capacity(DATA_PACKET_HEADER_LEN + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Split a received datagram already classified as a data packet into
/// its header and payload. Returns `None` if the datagram is shorter
/// than the fixed header.
pub fn decode_data_packet(datagram: &[u8]) -> Option<(DataPacketHeader, &[u8])> {
    if datagram.len() < DATA_PACKET_HEADER_LEN {
        return None;
    }
    let header = DataPacketHeader::read_from_prefix(datagram)?;
    Some((header, &datagram[DATA_PACKET_HEADER_LEN..]))
}

/// Outcome of classifying an incoming multicast datagram.
pub enum Datagram<'a> {
    Data(DataPacketHeader, &'a [u8]),
    Control(ControlRecord),
}

/// Classify a raw datagram as a binary data packet or a JSON control
/// record, given the session this socket is joined to.
///
/// The binary test runs first: a datagram at least
/// [`DATA_PACKET_HEADER_LEN`] bytes long whose first 16 bytes equal
/// `session_id` is a data packet. Only datagrams that fail that test
/// fall through to JSON control-record parsing. This order matters —
/// a data packet's payload is arbitrary bytes and could coincidentally
/// decode as valid UTF-8 JSON, but it can never coincidentally carry
/// our own session id in its first 16 bytes, so testing the session id
/// first resolves the ambiguity the way the design notes call for
/// (binary first, text only on failure).
pub fn classify<'a>(datagram: &'a [u8], session_id: Uuid) -> Option<Datagram<'a>> {
    if datagram.len() >= DATA_PACKET_HEADER_LEN {
        let (header, payload) = decode_data_packet(datagram)?;
        if header.session_id() == session_id {
            return Some(Datagram::Data(header, payload));
        }
    }
    let text = std::str::from_utf8(datagram).ok()?;
    let record = serde_json::from_str::<ControlRecord>(text).ok()?;
    Some(Datagram::Control(record))
}

/// Tagged union of every JSON control record exchanged over the
/// multicast group (sender-originated) and the unicast NACK port
/// (receiver-originated).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRecord {
    Metadata(Metadata),
    BlockEnd(BlockEnd),
    Eof(Eof),
    Cancel(Cancel),
    Nack(Nack),
}

/// Announces the file and transfer parameters for a session. Sent by
/// the sender at the start of transmission, repeated a few times to
/// cover multicast loss since there is no ack for this record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub session_id: Uuid,
    pub session_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_crc32: u32,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub block_size_packets: u32,
    pub nack_listen_timeout_ms: u32,
    pub repair_rounds: u32,
}

/// Marks the end of a block and opens its repair window. Carries the
/// repair round so receivers can tell a fresh NACK window from a
/// retransmission of the same one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockEnd {
    pub session_id: Uuid,
    pub block_index: u32,
    pub repair_round: u32,
}

/// Marks successful completion of the whole transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Eof {
    pub session_id: Uuid,
}

/// Aborts the transfer. Sent by the sender on operator cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cancel {
    pub session_id: Uuid,
}

/// A receiver's report of missing sequence numbers within a block,
/// sent unicast to the sender's NACK port during a block's repair
/// window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Nack {
    pub session_id: Uuid,
    pub block_index: u32,
    pub missing_seqs: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short for a data packet header: {0} bytes")]
    TooShort(usize),
    #[error("control record does not belong to session {0}")]
    ForeignSession(Uuid),
    #[error("failed to serialize control record: {0}")]
    Encode(#[from] serde_json::Error),
}
