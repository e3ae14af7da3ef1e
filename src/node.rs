//! Node wiring: dispatcher, inbound listener, and control surface (C7).
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::LamportClock;
use crate::config::PeerTable;
use crate::connection::Connection;
use crate::election::ElectionEngine;
use crate::error::Result;
use crate::heartbeat;
use crate::logging::{LogEvent, LogSink};
use crate::membership::DeadSet;
use crate::mutex::{MutexEngine, MutexState, RequestOutcome};
use crate::pool::Transport;
use crate::protocol::{Message, MessageType};
use crate::shutdown::Shutdown;

/// Upper bound on simultaneously accepted inbound peer connections. Cluster
/// sizes in this design are small, so this is generous headroom rather than
/// a meaningfully load-bearing limit.
const MAX_CONNECTIONS: usize = 64;

/// Ties C1-C6 together behind the dispatch table and control surface C7
/// describes: every inbound frame flows through [`Node::dispatch`], and
/// every externally triggered action (`request`, `elect`, `status`) is a
/// method here.
pub struct Node {
    self_id: u32,
    transport: Arc<Transport>,
    mutex: Arc<MutexEngine>,
    election: Arc<ElectionEngine>,
    log: Arc<dyn LogSink>,
    notify_shutdown: broadcast::Sender<()>,
}

/// Current status snapshot, as printed by the `status` REPL command.
pub struct Status {
    pub coordinator_id: Option<u32>,
    pub self_id: u32,
    pub mutex_state: MutexState,
    pub cs_entries: u64,
}

impl Node {
    pub fn new(self_id: u32, peers: PeerTable, log: Arc<dyn LogSink>) -> Arc<Self> {
        let clock = Arc::new(LamportClock::new());
        let dead = Arc::new(DeadSet::new());
        let transport = Transport::new(self_id, peers, clock, dead, log.clone());
        let mutex = MutexEngine::new(self_id, transport.clone(), log.clone());
        transport.register_mutex_engine(&mutex);
        let election = ElectionEngine::new(self_id, transport.clone(), log.clone());

        let (notify_shutdown, _) = broadcast::channel(1);

        Arc::new(Self {
            self_id,
            transport,
            mutex,
            election,
            log,
            notify_shutdown,
        })
    }

    fn shutdown_listener(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Run the inbound listener and heartbeat loop until `shutdown()` is
    /// called or the process receives SIGINT/SIGTERM.
    pub async fn run(self: &Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;

        let heartbeat_task = tokio::spawn(heartbeat::run(
            self.transport.clone(),
            self.election.clone(),
            self.self_id,
            self.shutdown_listener(),
        ));

        self.log.emit(LogEvent::new(self.self_id, self.transport.clock().tick(), "SYSTEM", format!("node {} started", self.self_id)));

        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            if node.election.coordinator_id().is_none() {
                node.election.start_election().await;
            }
        });

        self.accept_loop(listener).await;
        let _ = heartbeat_task.await;
        Ok(())
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let limit = Arc::new(Semaphore::new(MAX_CONNECTIONS));
        let mut shutdown = self.shutdown_listener();

        info!("accepting inbound connections");
        loop {
            let permit = limit.clone().acquire_owned().await.expect("semaphore never closed");

            let socket = tokio::select! {
                res = Self::accept(&listener) => match res {
                    Ok(socket) => socket,
                    Err(err) => {
                        error!(cause = %err, "failed to accept inbound connection");
                        self.log.emit(
                            LogEvent::new(self.self_id, self.transport.clock().peek(), "LISTENER_ERROR", "listener gave up accepting connections")
                                .with_field("error", err.to_string()),
                        );
                        break;
                    }
                },
                _ = shutdown.recv() => break,
            };

            let node = Arc::clone(self);
            let conn_shutdown = self.shutdown_listener();
            tokio::spawn(async move {
                node.handle_connection(socket, conn_shutdown).await;
                drop(permit);
            });
        }
    }

    async fn accept(listener: &TcpListener) -> std::io::Result<TcpStream> {
        let mut backoff = 1;
        loop {
            match listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err);
                    }
                    warn!(%err, "accept failed, retrying in {backoff}s");
                }
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, mut shutdown: Shutdown) {
        let mut conn = Connection::new(socket);

        while !shutdown.is_shutdown() {
            let msg = tokio::select! {
                res = conn.read_message() => match res {
                    Ok(m) => m,
                    Err(err) => {
                        debug!(error = %err, "connection error");
                        self.log.emit(
                            LogEvent::new(self.self_id, self.transport.clock().peek(), "CONNECTION_ERROR", "dropping connection after read error")
                                .with_field("error", err.to_string()),
                        );
                        return;
                    }
                },
                _ = shutdown.recv() => return,
            };

            match msg {
                Some(msg) => self.dispatch(msg).await,
                None => return,
            }
        }
    }

    /// Fixed dispatch table described by C7: validate, fold the timestamp
    /// into the clock, mark the sender alive, then route to the handler.
    async fn dispatch(self: &Arc<Self>, msg: Message) {
        self.transport.dead_nodes().discard(msg.sender);
        self.transport.clock().update(msg.timestamp);

        match msg.kind {
            MessageType::Request => self.mutex.handle_request(msg.sender, msg.timestamp).await,
            MessageType::Reply => self.mutex.handle_reply(msg.sender),
            MessageType::Election => self.election.handle_election(msg.sender).await,
            MessageType::Answer => self.election.handle_answer(msg.sender),
            MessageType::Coordinator => self.election.handle_coordinator(msg.sender),
            MessageType::Heartbeat => heartbeat::handle_heartbeat(&self.election, msg.sender),
        }
    }

    /// Begin a mutex episode, running `critical_section` once entry is
    /// granted. A no-op (`TimedOut`-shaped immediately) if already in the
    /// middle of another episode.
    pub async fn request<F, Fut>(self: &Arc<Self>, critical_section: F) -> RequestOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.mutex.request(critical_section).await
    }

    pub async fn elect(self: &Arc<Self>) {
        self.election.start_election().await;
    }

    /// Current Lamport clock value, for callers (e.g. the CLI's reference
    /// critical-section workload) that want to timestamp their own log events.
    pub fn clock_peek(&self) -> u64 {
        self.transport.clock().peek()
    }

    pub fn status(&self) -> Status {
        Status {
            coordinator_id: self.election.coordinator_id(),
            self_id: self.self_id,
            mutex_state: self.mutex.current_state(),
            cs_entries: self.mutex.cs_entry_count(),
        }
    }

    /// Signal the listener, heartbeat loop, and every in-flight connection
    /// task to stop, then close pooled outbound sockets. Matches the
    /// original node's fire-and-forget shutdown: callers don't block here
    /// waiting for spawned tasks to unwind.
    pub async fn shutdown(&self) {
        self.log.emit(LogEvent::new(self.self_id, self.transport.clock().peek(), "SYSTEM", "node shutdown initiated"));
        let _ = self.notify_shutdown.send(());
        self.transport.shutdown().await;
    }
}
