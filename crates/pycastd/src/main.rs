//! pycastd — command-line frontend for a pycast transfer session.
//!
//! Wires the core protocol (pycast-core / pycast-net) into two
//! subcommands, `send` and `receive`, each a thin layer over
//! `orchestrate::run_sender` / `run_receiver`. This is not a designed
//! CLI UX — argument parsing is hand-rolled, matching how this
//! implementation's own daemon does it elsewhere — just enough surface
//! to drive the core end to end.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use pycast_core::config::PycastConfig;
use pycast_net::discovery::{DiscoveryEvent, SessionDiscovery, UdpDiscovery};
use pycastd::orchestrate::{self, ReceiverConfig, SenderConfig, StatusEvent};

fn print_usage() {
    println!("Usage: pycastd <command> [options]");
    println!();
    println!("  send <file>                     Offer <file> for transfer");
    println!("    --lobby                       Wait for multiple receivers before starting");
    println!("    --name <name>                 Session display name (default: file name)");
    println!("    --username <user>             Display name advertised to receivers");
    println!("    --handshake-port <port>       TCP port to listen on (default: 5008)");
    println!();
    println!("  receive --session <uuid> --addr <host:port>");
    println!("                                  Join a session and receive its file");
    println!("    --username <user>             Display name sent to the sender");
    println!("    --output <dir>                Destination folder (default: config download folder)");
    println!();
    println!("  discover [--seconds <n>]        Browse advertised sessions for <n> seconds (default: 5)");
    println!();
    println!("Examples:");
    println!("  pycastd send movie.mp4 --lobby");
    println!("  pycastd discover");
    println!("  pycastd receive --session 3fa8...  --addr 192.168.1.10:5008");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = PycastConfig::load().context("failed to load configuration")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("send") => run_send(&args[1..], &config).await,
        Some("receive") => run_receive(&args[1..], &config).await,
        Some("discover") => run_discover(&args[1..], &config).await,
        _ => {
            print_usage();
            Ok(())
        }
    }
}

async fn run_send(args: &[String], config: &PycastConfig) -> Result<()> {
    let Some(path) = args.first() else {
        bail!("send requires a file path");
    };
    let path = PathBuf::from(path);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();

    let mut lobby = config.identity.multiclient_enabled_by_default;
    let mut session_name = file_name;
    let mut username = config.identity.username.clone();
    let mut handshake_port = config.network.handshake_port;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--lobby" => lobby = true,
            "--name" => {
                i += 1;
                session_name = args.get(i).context("--name requires a value")?.clone();
            }
            "--username" => {
                i += 1;
                username = args.get(i).context("--username requires a value")?.clone();
            }
            "--handshake-port" => {
                i += 1;
                handshake_port = args
                    .get(i)
                    .context("--handshake-port requires a value")?
                    .parse()
                    .context("--handshake-port must be a number")?;
            }
            other => bail!("unrecognized option: {other}"),
        }
        i += 1;
    }

    let sender_config = SenderConfig {
        session_name,
        username,
        handshake_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, handshake_port)),
        multicast_group: config.network.multicast_group,
        multicast_port: config.network.multicast_port,
        nack_port: config.network.nack_port,
        discovery_port: config.network.discovery_port,
        lobby,
        params: config.transfer,
    };

    let cancel = Arc::new(AtomicBool::new(true));
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, cancelling transfer");
            cancel_for_signal.store(false, Ordering::SeqCst);
        }
    });

    let (status_tx, status_rx) = tokio::sync::mpsc::channel(16);
    let printer = spawn_status_printer(status_rx);

    let result = orchestrate::run_sender(path, sender_config, cancel, status_tx).await;
    let _ = printer.await;
    result
}

async fn run_receive(args: &[String], config: &PycastConfig) -> Result<()> {
    let mut session_id = None;
    let mut addr: Option<SocketAddr> = None;
    let mut username = config.identity.username.clone();
    let mut output_dir = config.identity.download_folder.clone();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--session" => {
                i += 1;
                let raw = args.get(i).context("--session requires a value")?;
                session_id = Some(raw.parse().context("--session must be a UUID")?);
            }
            "--addr" => {
                i += 1;
                let raw = args.get(i).context("--addr requires a value")?;
                addr = Some(raw.parse().context("--addr must be host:port")?);
            }
            "--username" => {
                i += 1;
                username = args.get(i).context("--username requires a value")?.clone();
            }
            "--output" => {
                i += 1;
                output_dir = PathBuf::from(args.get(i).context("--output requires a value")?);
            }
            other => bail!("unrecognized option: {other}"),
        }
        i += 1;
    }

    let session_id = session_id.context("receive requires --session <uuid>")?;
    let addr = addr.context("receive requires --addr <host:port>")?;
    std::fs::create_dir_all(&output_dir).context("failed to create output directory")?;

    let receiver_config = ReceiverConfig {
        session_id,
        handshake_addr: addr,
        username,
        output_dir,
        multicast_group: config.network.multicast_group,
        multicast_port: config.network.multicast_port,
        nack_port: config.network.nack_port,
    };

    let (status_tx, status_rx) = tokio::sync::mpsc::channel(16);
    let printer = spawn_status_printer(status_rx);

    let result = orchestrate::run_receiver(receiver_config, status_tx).await;
    let _ = printer.await;
    result
}

async fn run_discover(args: &[String], config: &PycastConfig) -> Result<()> {
    let mut seconds = 5u64;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--seconds" => {
                i += 1;
                seconds = args
                    .get(i)
                    .context("--seconds requires a value")?
                    .parse()
                    .context("--seconds must be a number")?;
            }
            other => bail!("unrecognized option: {other}"),
        }
        i += 1;
    }

    let discovery = UdpDiscovery::new(config.network.discovery_port);
    let mut events = discovery.browse().await.context("failed to start browsing")?;

    println!("browsing for {seconds}s...");
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                match event {
                    Some(DiscoveryEvent::Added(session)) | Some(DiscoveryEvent::Updated(session)) => {
                        println!(
                            "{}  {:>8?}  {} ({}) @ {}",
                            session.id, session.status, session.session_name,
                            session.sender_username, session.handshake_addr
                        );
                    }
                    Some(DiscoveryEvent::Removed(id)) => println!("{id}  gone"),
                    None => break,
                }
            }
        }
    }
    Ok(())
}

/// Prints status transitions as they arrive, standing in for a UI
/// observer. Returns once the channel closes (the session ended).
fn spawn_status_printer(
    mut status_rx: tokio::sync::mpsc::Receiver<StatusEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = status_rx.recv().await {
            match event {
                StatusEvent::Waiting => tracing::info!("waiting"),
                StatusEvent::Connected => tracing::info!("connected"),
                StatusEvent::Transmitting => tracing::info!("transmitting"),
                StatusEvent::Completed => tracing::info!("completed"),
                StatusEvent::Cancelled => tracing::info!("cancelled"),
                StatusEvent::FailedVerification => tracing::warn!("failed_verification"),
                StatusEvent::Failed(reason) => tracing::error!(reason, "failed"),
            }
        }
    })
}
