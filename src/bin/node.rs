//! CLI entry point (C10): start a cluster node and drive it from stdin.
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use meetpoint::config::PeerTable;
use meetpoint::logging::{LogEvent, LogSink, ShippingSink};
use meetpoint::Node;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Symmetric cluster node: Ricart-Agrawala mutex + bully election over TCP.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// This node's id; must be a key in the peers file.
    #[arg(long)]
    id: u32,

    /// Path to the peers file mapping node id -> {ip, port}.
    #[arg(long, default_value = "peers.json")]
    peers: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    match try_main().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn try_main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let peer_table = PeerTable::load(&args.peers, args.id)
        .with_context(|| format!("loading peers file {}", args.peers.display()))?;
    let port = peer_table
        .get(args.id)
        .expect("PeerTable::load guarantees self_id is present")
        .port;

    let log: Arc<dyn LogSink> = Arc::new(ShippingSink::from_env(args.id).await);
    let node = Node::new(args.id, peer_table, log.clone());

    let listener_node = node.clone();
    let listener_task = tokio::spawn(async move {
        if let Err(err) = listener_node.run(port).await {
            eprintln!("fatal: {err}");
        }
    });

    tokio::select! {
        _ = repl(node.clone(), log) => {}
        _ = wait_for_termination() => {}
    }

    node.shutdown().await;
    listener_task.abort();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn repl(node: Arc<Node>, log: Arc<dyn LogSink>) {
    let resource = Arc::new(AtomicU64::new(0));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => return,
        };

        match line.trim() {
            "req" => {
                let node = node.clone();
                let log = log.clone();
                let resource = resource.clone();
                tokio::spawn(async move {
                    let workload_node = node.clone();
                    node.request(|| critical_section_workload(workload_node, log, resource)).await;
                });
            }
            "elect" => node.elect().await,
            "status" => {
                let status = node.status();
                println!(
                    "leader: {:?}, self: {}, mutex_state: {:?}, cs_entries: {}",
                    status.coordinator_id, status.self_id, status.mutex_state, status.cs_entries
                );
            }
            "help" => println!("commands: req | elect | status | kill/quit/exit | help"),
            "quit" | "kill" | "exit" => return,
            "" => {}
            other => println!("unknown command: {other}"),
        }
    }
}

/// Reference critical-section workload: bump a shared counter and hold the
/// section for a short, randomized interval.
async fn critical_section_workload(node: Arc<Node>, log: Arc<dyn LogSink>, resource: Arc<AtomicU64>) {
    let value = resource.fetch_add(1, Ordering::SeqCst) + 1;
    log.emit(
        LogEvent::new(node.status().self_id, node.clock_peek(), "CS_RESOURCE", "shared resource updated")
            .with_field("value", value),
    );

    let millis = rand::thread_rng().gen_range(500..=3000);
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
