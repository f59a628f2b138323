//! Receiver engine — joins the multicast group, reassembles blocks,
//! drives the NACK repair protocol, and verifies the finished file.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pycast_core::error::TransferError;
use pycast_core::wire::{self, ControlRecord, Datagram};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::net::UdpSocket;
use uuid::Uuid;

/// Suffix applied to the output file while a transfer is in progress.
/// The file is renamed to its real name only after CRC verification
/// succeeds.
const TEMP_SUFFIX: &str = "pycast-tmp";

/// Status pushed to the orchestration layer as the receive state
/// machine advances.
#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    WaitingForMetadata,
    Receiving { file_name: String, block_index: u32 },
    Completed(PathBuf),
    ChecksumFailed { expected: u32, actual: u32 },
    Cancelled,
}

/// Drives a single inbound transfer. Constructed once metadata for the
/// session of interest has joined the multicast group.
pub struct ReceiveEngine {
    session_id: Uuid,
    output_dir: PathBuf,
    data_socket: UdpSocket,
    sender_nack_addr: SocketAddr,
}

impl ReceiveEngine {
    pub async fn join(
        session_id: Uuid,
        output_dir: PathBuf,
        multicast_group: Ipv4Addr,
        multicast_port: u16,
        sender_addr: SocketAddr,
        nack_port: u16,
    ) -> Result<Self> {
        let data_socket = make_multicast_join_socket(multicast_group, multicast_port)?;
        let sender_nack_addr = SocketAddr::new(sender_addr.ip(), nack_port);
        Ok(Self {
            session_id,
            output_dir,
            data_socket,
            sender_nack_addr,
        })
    }

    /// Run the receive state machine to completion, cancellation, or
    /// checksum failure, emitting `ReceiveEvent`s along the way.
    pub async fn run(&self, events: tokio::sync::mpsc::Sender<ReceiveEvent>) -> Result<()> {
        let _ = events.send(ReceiveEvent::WaitingForMetadata).await;

        let metadata = self.await_metadata().await?;
        let temp_path = self
            .output_dir
            .join(format!(".{}.{}", metadata.file_name, TEMP_SUFFIX));
        let mut file = create_preallocated(&temp_path, metadata.file_size).await?;

        let mut state = BlockState::new(metadata.total_chunks, metadata.block_size_packets);
        let mut buf = vec![0u8; metadata.chunk_size as usize + wire::DATA_PACKET_HEADER_LEN + 64];

        loop {
            let (len, _peer) = self
                .data_socket
                .recv_from(&mut buf)
                .await
                .context("recv_from failed")?;
            let datagram = &buf[..len];

            match wire::classify(datagram, self.session_id) {
                Some(Datagram::Data(header, payload)) => {
                    if header.session_id() != self.session_id {
                        continue;
                    }
                    let seq = header.seq();
                    if seq >= metadata.total_chunks {
                        continue;
                    }
                    let offset = seq as u64 * metadata.chunk_size as u64;
                    file.seek(SeekFrom::Start(offset)).await?;
                    file.write_all(payload).await?;
                    state.mark_received(seq);
                }
                Some(Datagram::Control(ControlRecord::BlockEnd(block_end))) => {
                    if block_end.session_id != self.session_id {
                        continue;
                    }
                    if let Some(missing) = state.handle_block_end(&block_end) {
                        let _ = events
                            .send(ReceiveEvent::Receiving {
                                file_name: metadata.file_name.clone(),
                                block_index: block_end.block_index,
                            })
                            .await;
                        if !missing.is_empty() {
                            self.send_nack(block_end.block_index, missing).await;
                        }
                    }
                }
                Some(Datagram::Control(ControlRecord::Eof(eof))) => {
                    if eof.session_id != self.session_id {
                        continue;
                    }
                    break;
                }
                Some(Datagram::Control(ControlRecord::Cancel(cancel))) => {
                    if cancel.session_id != self.session_id {
                        continue;
                    }
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    let _ = events.send(ReceiveEvent::Cancelled).await;
                    return Ok(());
                }
                _ => continue,
            }
        }

        file.flush().await?;
        drop(file);

        let actual_crc32 =
            pycast_core::integrity::hash_file(&temp_path).context("failed to checksum received file")?;
        if actual_crc32 != metadata.file_crc32 {
            let _ = tokio::fs::remove_file(&temp_path).await;
            let _ = events
                .send(ReceiveEvent::ChecksumFailed {
                    expected: metadata.file_crc32,
                    actual: actual_crc32,
                })
                .await;
            return Err(TransferError::ChecksumMismatch {
                expected: metadata.file_crc32,
                actual: actual_crc32,
            }
            .into());
        }

        let final_path = self.output_dir.join(&metadata.file_name);
        tokio::fs::rename(&temp_path, &final_path).await?;
        let _ = events.send(ReceiveEvent::Completed(final_path)).await;
        Ok(())
    }

    async fn await_metadata(&self) -> Result<wire::Metadata> {
        let mut buf = vec![0u8; 4096];
        loop {
            let (len, _peer) = self
                .data_socket
                .recv_from(&mut buf)
                .await
                .context("recv_from failed while waiting for metadata")?;
            if let Some(Datagram::Control(ControlRecord::Metadata(metadata))) =
                wire::classify(&buf[..len], self.session_id)
            {
                if metadata.session_id == self.session_id {
                    return Ok(metadata);
                }
            }
        }
    }

    async fn send_nack(&self, block_index: u32, missing_seqs: Vec<u32>) {
        let nack = ControlRecord::Nack(wire::Nack {
            session_id: self.session_id,
            block_index,
            missing_seqs,
        });
        let bytes = match serde_json::to_vec(&nack) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize NACK");
                return;
            }
        };
        match UdpSocket::bind("0.0.0.0:0").await {
            Ok(sock) => {
                if let Err(e) = sock.send_to(&bytes, self.sender_nack_addr).await {
                    tracing::warn!(error = %e, "failed to send NACK");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to bind NACK send socket"),
        }
    }
}

/// Tracks per-block reception progress and enforces the monotonic
/// `last_processed_block` invariant: a block_end for an index we've
/// already finalized, or a repair round we've already handled for the
/// current block, is a duplicate and is ignored.
struct BlockState {
    received: Vec<bool>,
    block_size: u32,
    last_processed_block: Option<u32>,
    last_handled_round: Option<(u32, u32)>,
}

impl BlockState {
    fn new(total_chunks: u32, block_size: u32) -> Self {
        Self {
            received: vec![false; total_chunks as usize],
            block_size: block_size.max(1),
            last_processed_block: None,
            last_handled_round: None,
        }
    }

    fn mark_received(&mut self, seq: u32) {
        if let Some(slot) = self.received.get_mut(seq as usize) {
            *slot = true;
        }
    }

    /// Returns `Some(missing_seqs)` if this block_end should be acted
    /// on (a new block or a new repair round for the current block);
    /// `None` if it's a duplicate to ignore.
    fn handle_block_end(&mut self, block_end: &wire::BlockEnd) -> Option<Vec<u32>> {
        if let Some(last) = self.last_processed_block {
            if block_end.block_index < last {
                return None;
            }
        }
        if self.last_handled_round == Some((block_end.block_index, block_end.repair_round)) {
            return None;
        }

        // Only worth checking for a skipped block_end the first time we
        // see this block index — every later repair round for the same
        // block would otherwise re-trigger the warning.
        let is_new_block = self.last_handled_round.map(|(block, _)| block) != Some(block_end.block_index);
        if is_new_block {
            let expected = self.last_processed_block.map_or(0, |b| b + 1);
            if block_end.block_index > expected {
                tracing::warn!(
                    expected_block = expected,
                    got_block = block_end.block_index,
                    "block_end for an earlier block was lost; the skipped block cannot be recovered and will surface as a verification failure if it corrupted the file"
                );
            }
        }
        self.last_handled_round = Some((block_end.block_index, block_end.repair_round));

        let start = block_end.block_index * self.block_size;
        let end = (start + self.block_size).min(self.received.len() as u32);
        let missing: Vec<u32> = (start..end)
            .filter(|&seq| !self.received[seq as usize])
            .collect();

        if missing.is_empty() {
            self.last_processed_block = Some(block_end.block_index);
        }

        Some(missing)
    }
}

async fn create_preallocated(path: &Path, size: u64) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)
        .await
        .context("failed to create temp file")?;
    file.set_len(size).await.context("failed to preallocate temp file")?;
    Ok(file)
}

fn make_multicast_join_socket(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed to convert to tokio UdpSocket")
}
