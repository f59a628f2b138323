//! Library half of `pycastd`: the orchestration layer that wires
//! discovery, the handshake, and the transfer engines into one session
//! lifecycle. Split out of the binary so integration tests can drive a
//! full send/receive session the same way the CLI does, without
//! shelling out to the built binary.

pub mod orchestrate;
