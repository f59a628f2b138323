//! Corruption detection and operator cancellation. Both are terminal
//! outcomes distinct from ordinary repair: corruption slips past the
//! NACK protocol entirely (the packet was "received", just wrong) and
//! is caught only by the final CRC check; cancellation is triggered by
//! the sender's own operator rather than by anything on the wire.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pycast_core::session::TransferParams;
use pycast_core::wire::{self, Datagram};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::*;

/// Relays one session's datagrams verbatim, except it flips a single
/// bit in the payload of the first data packet matching `target_seq` it
/// sees. Everything else — including every later retransmission of
/// that same sequence — passes through untouched, so this models one
/// corrupted packet on the wire rather than a persistently bad link.
async fn spawn_single_bitflip_relay(
    session_id: Uuid,
    src_port: u16,
    dst_port: u16,
    target_seq: u32,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let src = UdpSocket::bind(("0.0.0.0", src_port)).await?;
    src.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
    let dst = UdpSocket::bind("0.0.0.0:0").await?;
    dst.set_multicast_ttl_v4(1)?;
    let dst_addr = (MULTICAST_GROUP, dst_port).into();

    Ok(tokio::spawn(async move {
        let mut flipped = false;
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, _peer) = match src.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(_) => return,
            };
            let mut datagram = buf[..len].to_vec();
            if !flipped {
                if let Some(Datagram::Data(header, payload)) =
                    wire::classify(&datagram, session_id)
                {
                    if header.seq() == target_seq && !payload.is_empty() {
                        let flip_at = wire::DATA_PACKET_HEADER_LEN;
                        datagram[flip_at] ^= 0xFF;
                        flipped = true;
                    }
                }
            }
            if dst.send_to(&datagram, dst_addr).await.is_err() {
                return;
            }
        }
    }))
}

/// A single bit flipped in flight leaves the NACK protocol with nothing
/// to repair — the receiver did get a packet for that sequence — but
/// the end-to-end CRC check catches the mismatch, and the temp file is
/// removed rather than left behind under its real name.
#[tokio::test]
async fn corrupted_packet_fails_verification_and_leaves_no_file() {
    let dir = unique_dir("corrupt");
    let chunk_size = 64u32;
    let data: Vec<u8> = (0..chunk_size as usize * 10).map(|i| (i % 256) as u8).collect();
    let source = write_source_file(&dir, "payload.bin", &data);

    let (wire_port, nack_port, handshake_port) = alloc_ports();
    let (relay_port, _, _) = alloc_ports();
    let session = handshake_single(handshake_port).await.unwrap();

    let relay = spawn_single_bitflip_relay(session.id, wire_port, relay_port, 4)
        .await
        .unwrap();
    let send_engine = bind_sender(session.clone(), wire_port, nack_port).await.unwrap();
    let (recv_engine, recv_dir) =
        join_receiver(session.id, session.handshake_addr, relay_port, nack_port)
            .await
            .unwrap();

    let (events_tx, events_rx) = mpsc::channel(64);
    let recv_task = tokio::spawn(async move { recv_engine.run(events_tx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let params = TransferParams {
        chunk_size,
        block_size_packets: 8,
        nack_listen_timeout_ms: 150,
        repair_rounds: 2,
    };
    let send_task = tokio::spawn(async move { send_engine.send_file(&source, params).await });

    let events = drain_events(events_rx).await;
    let _ = recv_task.await.unwrap();
    let _ = send_task.await.unwrap();
    relay.abort();

    assert!(
        events
            .iter()
            .any(|e| matches!(e, pycast_net::ReceiveEvent::ChecksumFailed { .. })),
        "corruption must surface as a checksum mismatch, got: {events:?}"
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, pycast_net::ReceiveEvent::Completed(_))));

    let leftovers: Vec<_> = std::fs::read_dir(&recv_dir).unwrap().collect();
    assert!(
        leftovers.is_empty(),
        "corrupted transfer must leave neither a temp nor a final file behind"
    );
}

/// Clearing the sender's cancel handle mid-transfer stops it from
/// completing the block loop and sends `CANCEL` instead of `EOF`; the
/// receiver reports `Cancelled` and removes its in-progress temp file.
#[tokio::test]
async fn cancelling_mid_transfer_is_reported_and_cleans_up() {
    let dir = unique_dir("cancel");
    let chunk_size = 32u32;
    // Large enough that cancellation has time to land before the
    // transfer would otherwise finish.
    let data = vec![0x3Cu8; chunk_size as usize * 400];
    let source = write_source_file(&dir, "payload.bin", &data);

    let (mcast_port, nack_port, handshake_port) = alloc_ports();
    let session = handshake_single(handshake_port).await.unwrap();
    let send_engine = bind_sender(session.clone(), mcast_port, nack_port).await.unwrap();
    let cancel_handle = send_engine.cancel_handle();
    let (recv_engine, recv_dir) =
        join_receiver(session.id, session.handshake_addr, mcast_port, nack_port)
            .await
            .unwrap();

    let (events_tx, events_rx) = mpsc::channel(64);
    let recv_task = tokio::spawn(async move { recv_engine.run(events_tx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let params = TransferParams {
        chunk_size,
        block_size_packets: 16,
        nack_listen_timeout_ms: 100,
        repair_rounds: 2,
    };
    let send_task = tokio::spawn(async move { send_engine.send_file(&source, params).await });

    tokio::time::sleep(Duration::from_millis(5)).await;
    cancel_handle.store(false, Ordering::SeqCst);

    let events = drain_events(events_rx).await;
    recv_task.await.unwrap().unwrap();
    assert!(
        send_task.await.unwrap().is_err(),
        "a cancelled send must report an error, not success"
    );

    assert!(
        events.iter().any(|e| matches!(e, pycast_net::ReceiveEvent::Cancelled)),
        "receiver must observe Cancelled, got: {events:?}"
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, pycast_net::ReceiveEvent::Completed(_))));

    let leftovers: Vec<_> = std::fs::read_dir(&recv_dir).unwrap().collect();
    assert!(
        leftovers.is_empty(),
        "a cancelled transfer must leave no file behind in the destination folder"
    );
}
