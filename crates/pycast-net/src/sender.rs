//! Sender engine — multicasts a file in blocks, running bounded repair
//! rounds against receiver NACKs between blocks.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pycast_core::error::TransferError;
use pycast_core::session::{FileDescriptor, Session, TransferParams};
use pycast_core::wire::{self, ControlRecord};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::net::UdpSocket;
use tokio::time::sleep;
use uuid::Uuid;

/// Repeat count for records with no ack (metadata, block_end, eof,
/// cancel) — sent several times in quick succession because the only
/// defense against multicast loss of a control record is repetition.
const METADATA_REPEATS: usize = 3;
const METADATA_REPEAT_DELAY: Duration = Duration::from_millis(100);
const BLOCK_END_REPEATS: usize = 2;
const BLOCK_END_REPEAT_DELAY: Duration = Duration::from_millis(10);
const EOF_REPEATS: usize = 5;
const EOF_REPEAT_DELAY: Duration = Duration::from_millis(100);
const CANCEL_REPEATS: usize = 3;
const CANCEL_REPEAT_DELAY: Duration = Duration::from_millis(20);
/// Pacing between consecutive data packets; advisory only (see design
/// notes — the OS scheduler's sleep granularity can coalesce these).
const PACKET_PACING: Duration = Duration::from_micros(100);
const RETRANSMIT_PACING: Duration = Duration::from_micros(200);

/// Drives one outbound transfer to completion, cancellation, or
/// repair exhaustion.
pub struct SendEngine {
    session: Session,
    data_socket: UdpSocket,
    data_dest: SocketAddr,
    nack_socket: UdpSocket,
    active: Arc<AtomicBool>,
}

impl SendEngine {
    pub async fn bind(
        session: Session,
        multicast_group: Ipv4Addr,
        multicast_port: u16,
        nack_port: u16,
    ) -> Result<Self> {
        let data_socket = make_multicast_send_socket()?;
        let nack_socket = UdpSocket::bind(("0.0.0.0", nack_port))
            .await
            .context("failed to bind NACK socket")?;
        Ok(Self {
            session,
            data_socket,
            data_dest: (multicast_group, multicast_port).into(),
            nack_socket,
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    /// A handle that cooperative cancellation (e.g. an operator
    /// action) can use to stop the transfer between packets.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    /// Run the whole transfer: metadata, blocks with repair, then EOF
    /// (or cancel, if the active flag was cleared mid-transfer).
    pub async fn send_file(&self, path: &Path, params: TransferParams) -> Result<()> {
        let metadata = std::fs::metadata(path).context("failed to stat file")?;
        let hash_path = path.to_path_buf();
        let file_crc32 = tokio::task::spawn_blocking(move || pycast_core::integrity::hash_file(&hash_path))
            .await
            .context("checksum task panicked")?
            .context("failed to checksum file")?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let total_chunks = metadata.len().div_ceil(params.chunk_size as u64) as u32;

        let descriptor = FileDescriptor {
            file_name,
            file_size: metadata.len(),
            file_crc32,
            total_chunks,
        };

        let result = self.transmit(path, &descriptor, params).await;

        // EOF (success) or cancel (stop requested) is sent regardless
        // of how transmission ended, mirroring a finally block.
        if self.active.load(Ordering::SeqCst) && result.is_ok() {
            self.send_eof().await;
        } else {
            self.send_cancel().await;
        }

        result
    }

    async fn transmit(
        &self,
        path: &Path,
        descriptor: &FileDescriptor,
        params: TransferParams,
    ) -> Result<()> {
        self.send_metadata(descriptor, params).await?;

        let mut file = File::open(path).await.context("failed to open file")?;
        let block_size = params.block_size_packets;
        let total_blocks = descriptor.total_chunks.div_ceil(block_size.max(1));

        for block_index in 0..total_blocks {
            if !self.active.load(Ordering::SeqCst) {
                return Err(TransferError::Cancelled.into());
            }

            let start_seq = block_index * block_size;
            let end_seq = (start_seq + block_size).min(descriptor.total_chunks);

            self.send_block_data(&mut file, start_seq, end_seq, descriptor, params)
                .await?;

            let mut missing: HashSet<u32> = HashSet::new();
            for round in 0..params.repair_rounds {
                if !self.active.load(Ordering::SeqCst) {
                    return Err(TransferError::Cancelled.into());
                }

                self.send_block_end(block_index, round).await?;
                let round_missing = self
                    .collect_nacks(block_index, Duration::from_millis(params.nack_listen_timeout_ms as u64))
                    .await;

                if round_missing.is_empty() {
                    missing.clear();
                    break;
                }

                missing = round_missing;
                self.retransmit(&mut file, block_index, &missing, descriptor, params)
                    .await?;
            }

            if !missing.is_empty() {
                tracing::warn!(
                    block_index,
                    missing = missing.len(),
                    "repair rounds exhausted, proceeding with gaps"
                );
            }
        }

        Ok(())
    }

    async fn send_block_data(
        &self,
        file: &mut File,
        start_seq: u32,
        end_seq: u32,
        descriptor: &FileDescriptor,
        params: TransferParams,
    ) -> Result<()> {
        for seq in start_seq..end_seq {
            if !self.active.load(Ordering::SeqCst) {
                return Err(TransferError::Cancelled.into());
            }
            let chunk = self.read_chunk(file, seq, descriptor, params).await?;
            let packet = wire::encode_data_packet(self.session.id, seq, &chunk);
            self.data_socket
                .send_to(&packet, self.data_dest)
                .await
                .context("failed to send data packet")?;
            sleep(PACKET_PACING).await;
        }
        Ok(())
    }

    async fn retransmit(
        &self,
        file: &mut File,
        _block_index: u32,
        missing: &HashSet<u32>,
        descriptor: &FileDescriptor,
        params: TransferParams,
    ) -> Result<()> {
        let mut seqs: Vec<u32> = missing.iter().copied().collect();
        seqs.sort_unstable();
        for seq in seqs {
            if !self.active.load(Ordering::SeqCst) {
                return Err(TransferError::Cancelled.into());
            }
            let chunk = self.read_chunk(file, seq, descriptor, params).await?;
            let packet = wire::encode_data_packet(self.session.id, seq, &chunk);
            self.data_socket
                .send_to(&packet, self.data_dest)
                .await
                .context("failed to retransmit data packet")?;
            sleep(RETRANSMIT_PACING).await;
        }
        Ok(())
    }

    async fn read_chunk(
        &self,
        file: &mut File,
        seq: u32,
        descriptor: &FileDescriptor,
        params: TransferParams,
    ) -> Result<Vec<u8>> {
        let offset = seq as u64 * params.chunk_size as u64;
        let remaining = descriptor.file_size.saturating_sub(offset);
        let len = (params.chunk_size as u64).min(remaining) as usize;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn send_metadata(&self, descriptor: &FileDescriptor, params: TransferParams) -> Result<()> {
        let record = ControlRecord::Metadata(wire::Metadata {
            session_id: self.session.id,
            session_name: self.session.session_name.clone(),
            file_name: descriptor.file_name.clone(),
            file_size: descriptor.file_size,
            file_crc32: descriptor.file_crc32,
            total_chunks: descriptor.total_chunks,
            chunk_size: params.chunk_size,
            block_size_packets: params.block_size_packets,
            nack_listen_timeout_ms: params.nack_listen_timeout_ms,
            repair_rounds: params.repair_rounds,
        });
        self.send_control_repeated(&record, METADATA_REPEATS, METADATA_REPEAT_DELAY)
            .await
    }

    async fn send_block_end(&self, block_index: u32, repair_round: u32) -> Result<()> {
        let record = ControlRecord::BlockEnd(wire::BlockEnd {
            session_id: self.session.id,
            block_index,
            repair_round,
        });
        self.send_control_repeated(&record, BLOCK_END_REPEATS, BLOCK_END_REPEAT_DELAY)
            .await
    }

    async fn send_eof(&self) {
        let record = ControlRecord::Eof(wire::Eof {
            session_id: self.session.id,
        });
        if let Err(e) = self
            .send_control_repeated(&record, EOF_REPEATS, EOF_REPEAT_DELAY)
            .await
        {
            tracing::warn!(error = %e, "failed to send EOF");
        }
    }

    async fn send_cancel(&self) {
        let record = ControlRecord::Cancel(wire::Cancel {
            session_id: self.session.id,
        });
        if let Err(e) = self
            .send_control_repeated(&record, CANCEL_REPEATS, CANCEL_REPEAT_DELAY)
            .await
        {
            tracing::warn!(error = %e, "failed to send cancellation");
        }
    }

    async fn send_control_repeated(
        &self,
        record: &ControlRecord,
        repeats: usize,
        delay: Duration,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        for i in 0..repeats {
            self.data_socket
                .send_to(&bytes, self.data_dest)
                .await
                .context("failed to send control record")?;
            if i + 1 < repeats {
                sleep(delay).await;
            }
        }
        Ok(())
    }

    /// Listen on the NACK port for `window` and accumulate every
    /// missing sequence number reported for `block_index`. Reports for
    /// other blocks (stale, from a previous round) are ignored.
    async fn collect_nacks(&self, block_index: u32, window: Duration) -> HashSet<u32> {
        let mut missing = HashSet::new();
        let deadline = tokio::time::Instant::now() + window;
        let mut buf = vec![0u8; 4096];

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.nack_socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _peer))) => {
                    if let Ok(ControlRecord::Nack(nack)) =
                        serde_json::from_slice::<ControlRecord>(&buf[..len])
                    {
                        if nack.session_id == self.session.id && nack.block_index == block_index {
                            missing.extend(nack.missing_seqs);
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "nack socket recv failed");
                    break;
                }
                Err(_) => break,
            }
        }

        missing
    }
}

fn make_multicast_send_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket
        .set_multicast_ttl_v4(wire::DEFAULT_MULTICAST_TTL)
        .context("IP_MULTICAST_TTL")?;
    socket
        .bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())
        .context("bind()")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("failed to convert to tokio UdpSocket")
}
