//! End-to-end file-transfer scenarios, driven through real
//! `pycast-net` engines over loopback multicast with no packet loss.
//! These correspond to the distilled spec's §8 concrete scenarios 1–3
//! plus the "exact reconstruction under no loss" property.

use crate::*;
use pycast_core::session::TransferParams;

fn completed_path(events: &[pycast_net::ReceiveEvent]) -> &std::path::Path {
    events
        .iter()
        .find_map(|e| match e {
            pycast_net::ReceiveEvent::Completed(path) => Some(path.as_path()),
            _ => None,
        })
        .expect("receiver never reported Completed")
}

/// Scenario 1: a 3-byte file over default-shaped parameters completes
/// with byte-identical output.
#[tokio::test]
async fn tiny_file_single_mode_completes() {
    let dir = unique_dir("tiny");
    let source = write_source_file(&dir, "greeting.txt", b"abc");
    let params = TransferParams {
        chunk_size: 1024,
        block_size_packets: 256,
        nack_listen_timeout_ms: 100,
        repair_rounds: 2,
    };

    let (events, recv_dir) = run_transfer(&source, params).await.unwrap();
    let final_path = completed_path(&events);
    assert_eq!(final_path, recv_dir.join("greeting.txt"));
    assert_eq!(std::fs::read(final_path).unwrap(), b"abc");
}

/// Scenario 2: a file exactly two chunks long needs exactly one block
/// and zero repair rounds to complete.
#[tokio::test]
async fn chunk_boundary_file_completes_in_one_block() {
    let dir = unique_dir("boundary");
    let chunk_size = 512u32;
    let data = vec![0x7Au8; chunk_size as usize * 2];
    let source = write_source_file(&dir, "boundary.bin", &data);
    let params = TransferParams {
        chunk_size,
        block_size_packets: 64, // both chunks fit in a single block
        nack_listen_timeout_ms: 100,
        repair_rounds: 2,
    };

    let (events, _recv_dir) = run_transfer(&source, params).await.unwrap();
    let final_path = completed_path(&events);
    assert_eq!(std::fs::read(final_path).unwrap(), data);

    let blocks_seen: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            pycast_net::ReceiveEvent::Receiving { block_index, .. } => Some(*block_index),
            _ => None,
        })
        .collect();
    assert_eq!(blocks_seen, vec![0], "expected exactly one confirmed block");
}

/// Scenario 3: a file whose length isn't a multiple of chunk_size
/// carries a short final chunk, and its four chunks span two blocks.
#[tokio::test]
async fn short_tail_file_spans_two_blocks() {
    let dir = unique_dir("shorttail");
    let chunk_size = 256u32;
    let data = vec![0x11u8; chunk_size as usize * 3 + 17];
    let source = write_source_file(&dir, "tail.bin", &data);
    let params = TransferParams {
        chunk_size,
        block_size_packets: 2, // 4 chunks / 2 per block = 2 blocks
        nack_listen_timeout_ms: 100,
        repair_rounds: 2,
    };

    let (events, _recv_dir) = run_transfer(&source, params).await.unwrap();
    let final_path = completed_path(&events);
    let received = std::fs::read(final_path).unwrap();
    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);

    let blocks_seen: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            pycast_net::ReceiveEvent::Receiving { block_index, .. } => Some(*block_index),
            _ => None,
        })
        .collect();
    assert_eq!(blocks_seen, vec![0, 1]);
}

/// Exact reconstruction under no loss, for a file whose size isn't
/// related to chunk_size or block_size_packets in any tidy way.
#[tokio::test]
async fn exact_reconstruction_under_no_loss() {
    let dir = unique_dir("exact");
    let data: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
    let source = write_source_file(&dir, "payload.bin", &data);

    let (events, _recv_dir) = run_transfer(&source, test_params()).await.unwrap();
    let final_path = completed_path(&events);
    assert_eq!(std::fs::read(final_path).unwrap(), data);
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, pycast_net::ReceiveEvent::ChecksumFailed { .. })),
        "no-loss transfer should never fail verification"
    );
}
