//! Handshake and lobby behavior: the admission gate that precedes
//! multicast transmission. Covers the "at-most-one admission in single
//! mode" and "lobby gating" properties plus the two-client lobby
//! scenario from the distilled spec's §8.

use std::sync::Arc;
use std::time::Duration;

use pycast_net::handshake::{self, LobbyEvent, LobbyListener};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::*;

/// After the first handshake completes in single-client mode, the
/// listener has been consumed — a second connect attempt finds nothing
/// listening.
#[tokio::test]
async fn single_mode_admits_at_most_one_client() {
    let (_mcast, _nack, handshake_port) = alloc_ports();
    let addr: std::net::SocketAddr = ([127, 0, 0, 1], handshake_port).into();
    let session_id = Uuid::new_v4();

    let listener = TcpListener::bind(addr).await.unwrap();
    let server = tokio::spawn(handshake::respond_single(listener, session_id));
    let first = tokio::spawn(handshake::join_single(addr, session_id, "alice".into()));

    server.await.unwrap().unwrap();
    first.await.unwrap().unwrap();

    // The listener was consumed by `respond_single`; nothing is bound
    // to `addr` anymore, so a second connect must fail outright rather
    // than being accepted and then left hanging.
    let second = TcpStream::connect(addr).await;
    assert!(
        second.is_err(),
        "expected connection refused after single-mode admission closed the listener"
    );
}

/// A lobby client's join future stays pending until the operator calls
/// `start_transmission` — it cannot observe `START` (or anything
/// file-related) before that point.
#[tokio::test]
async fn lobby_join_blocks_until_start_transmission() {
    let (_mcast, _nack, handshake_port) = alloc_ports();
    let addr: std::net::SocketAddr = ([127, 0, 0, 1], handshake_port).into();
    let session_id = Uuid::new_v4();

    let listener = TcpListener::bind(addr).await.unwrap();
    let (lobby, _events) = LobbyListener::new(listener, session_id);
    let lobby = Arc::new(lobby);
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let accept_lobby = lobby.clone();
    let accept_task = tokio::spawn(async move { accept_lobby.run(cancel_rx).await });

    let mut client = tokio::spawn(handshake::join_lobby(addr, session_id, "bob".into()));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(lobby.clients().len(), 1, "client should have registered");
    assert!(
        tokio::time::timeout(Duration::from_millis(50), &mut client)
            .await
            .is_err(),
        "join_lobby must not resolve before start_transmission is called"
    );

    lobby.start_transmission().await;
    client.await.unwrap().unwrap();
    accept_task.abort();
}

/// A lobby client that hangs up before the operator starts the
/// transfer is dropped from the registry and reported over the lobby
/// event stream, rather than lingering as a phantom admitted client.
#[tokio::test]
async fn lobby_client_disconnect_before_start_is_removed() {
    let (_mcast, _nack, handshake_port) = alloc_ports();
    let addr: std::net::SocketAddr = ([127, 0, 0, 1], handshake_port).into();
    let session_id = Uuid::new_v4();

    let listener = TcpListener::bind(addr).await.unwrap();
    let (lobby, mut events) = LobbyListener::new(listener, session_id);
    let lobby = Arc::new(lobby);
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let accept_lobby = lobby.clone();
    let accept_task = tokio::spawn(async move { accept_lobby.run(cancel_rx).await });

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = handshake::JoinRequest {
        session_id,
        username: "flaky".into(),
    };
    let bytes = serde_json::to_vec(&request).unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut stream, &bytes)
        .await
        .unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        LobbyEvent::ClientJoined(_, username, _) if username == "flaky"
    ));
    assert_eq!(lobby.clients().len(), 1);

    drop(stream);

    assert!(matches!(
        events.recv().await.unwrap(),
        LobbyEvent::ClientDisconnected(_, username, _) if username == "flaky"
    ));
    assert!(lobby.clients().is_empty());

    accept_task.abort();
}

/// Scenario 6: two receivers join a lobby; the operator starts the
/// transmission once; both receive `START`, both complete, and both
/// reconstruct a file whose checksum matches the sender's.
#[tokio::test]
async fn lobby_two_clients_both_complete() {
    let (mcast_port, nack_port, handshake_port) = alloc_ports();
    let handshake_addr: std::net::SocketAddr = ([127, 0, 0, 1], handshake_port).into();
    let session = pycast_core::session::Session::new(
        "lobby-demo".into(),
        "sender".into(),
        handshake_addr,
    );
    let session_id = session.id;

    let listener = TcpListener::bind(handshake_addr).await.unwrap();
    let (lobby, _events) = LobbyListener::new(listener, session_id);
    let lobby = Arc::new(lobby);
    let (_cancel_tx, cancel_rx) = broadcast::channel(1);
    let accept_lobby = lobby.clone();
    let accept_task = tokio::spawn(async move { accept_lobby.run(cancel_rx).await });

    let join_a = tokio::spawn(handshake::join_lobby(handshake_addr, session_id, "alice".into()));
    let join_b = tokio::spawn(handshake::join_lobby(handshake_addr, session_id, "bob".into()));

    // Wait for both to register before starting.
    loop {
        if lobby.clients().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let dir = unique_dir("lobby-src");
    let data: Vec<u8> = (0..3_000u32).map(|i| (i % 200) as u8).collect();
    let source = write_source_file(&dir, "shared.bin", &data);

    lobby.start_transmission().await;
    join_a.await.unwrap().unwrap();
    join_b.await.unwrap().unwrap();
    accept_task.abort();

    let (recv_a, dir_a) = join_receiver(session_id, handshake_addr, mcast_port, nack_port)
        .await
        .unwrap();
    let (recv_b, dir_b) = join_receiver(session_id, handshake_addr, mcast_port, nack_port)
        .await
        .unwrap();
    let (tx_a, rx_a) = tokio::sync::mpsc::channel(64);
    let (tx_b, rx_b) = tokio::sync::mpsc::channel(64);
    let task_a = tokio::spawn(async move { recv_a.run(tx_a).await });
    let task_b = tokio::spawn(async move { recv_b.run(tx_b).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let send_engine = bind_sender(session, mcast_port, nack_port).await.unwrap();
    send_engine.send_file(&source, test_params()).await.unwrap();

    let events_a = drain_events(rx_a).await;
    let events_b = drain_events(rx_b).await;
    task_a.await.unwrap().unwrap();
    task_b.await.unwrap().unwrap();

    let expected_crc = {
        let mut hasher = pycast_core::integrity::Hasher::new();
        hasher.update(&data);
        hasher.finalize()
    };

    for (events, dir) in [(events_a, &dir_a), (events_b, &dir_b)] {
        let final_path = events
            .iter()
            .find_map(|e| match e {
                pycast_net::ReceiveEvent::Completed(path) => Some(path.clone()),
                _ => None,
            })
            .expect("receiver should complete");
        assert_eq!(final_path, dir.join("shared.bin"));
        let received_crc = pycast_core::integrity::hash_file(&final_path).unwrap();
        assert_eq!(received_crc, expected_crc);
    }
}
