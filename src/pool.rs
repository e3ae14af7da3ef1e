//! Outbound connection pool and the retry/mark-dead send path (C1).
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use crate::clock::LamportClock;
use crate::config::PeerTable;
use crate::connection::Connection;
use crate::logging::{LogEvent, LogSink};
use crate::membership::DeadSet;
use crate::mutex::MutexEngine;
use crate::protocol::{Message, MessageType};

/// How long a lazy outbound connect is allowed to take before counting as a
/// failed attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lazily-opened, per-peer outbound connections plus the send-retry and
/// failure-detection behavior shared by every component that talks to peers.
///
/// Every engine (mutex, election, heartbeat) routes its sends through
/// [`Transport::send`] rather than touching a socket directly, so the
/// retry-then-mark-dead rule and the dead/alive bookkeeping live in exactly
/// one place.
pub struct Transport {
    self_id: u32,
    peers: PeerTable,
    clock: Arc<LamportClock>,
    dead: Arc<DeadSet>,
    log: Arc<dyn LogSink>,
    connections: Mutex<HashMap<u32, Connection<TcpStream>>>,
    mutex_hook: OnceLock<Weak<MutexEngine>>,
}

impl Transport {
    pub fn new(self_id: u32, peers: PeerTable, clock: Arc<LamportClock>, dead: Arc<DeadSet>, log: Arc<dyn LogSink>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            peers,
            clock,
            dead,
            log,
            connections: Mutex::new(HashMap::new()),
            mutex_hook: OnceLock::new(),
        })
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    pub fn dead_nodes(&self) -> &Arc<DeadSet> {
        &self.dead
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn self_id(&self) -> u32 {
        self.self_id
    }

    /// Wire the mutex engine in after both it and the transport exist, so a
    /// peer newly marked dead here can unblock a `request()` that no longer
    /// needs that peer's reply. Held as a [`Weak`] to avoid a reference cycle.
    pub fn register_mutex_engine(&self, engine: &Arc<MutexEngine>) {
        let _ = self.mutex_hook.set(Arc::downgrade(engine));
    }

    /// Send one frame to `target`, ticking or reusing `timestamp` as the
    /// caller specifies (callers pass a fresh `clock.tick()` for every
    /// message type except `REQUEST`, which reuses its captured
    /// `request_clock`).
    ///
    /// Unknown peers and heartbeats addressed to an already-dead peer are
    /// dropped silently. On failure the connection is retried once; if that
    /// also fails the peer is marked dead and a `NODE_DOWN` event is logged.
    pub async fn send(&self, target: u32, kind: MessageType, timestamp: u64) {
        if !self.peers.contains(target) {
            debug!(target, "send to unknown peer ignored");
            return;
        }
        if kind == MessageType::Heartbeat && self.dead.contains(target) {
            return;
        }

        let msg = Message::new(self.self_id, kind, timestamp);

        for _ in 0..2 {
            if self.try_send(target, &msg).await {
                return;
            }
        }

        if !self.dead.contains(target) {
            self.dead.add(target);
            self.log.emit(
                LogEvent::new(self.self_id, self.clock.peek(), "NODE_DOWN", "marking peer as dead after send failure")
                    .with_field("target", target),
            );
            if let Some(engine) = self.mutex_hook.get().and_then(Weak::upgrade) {
                engine.on_peer_marked_dead(target);
            }
        }
    }

    async fn try_send(&self, target: u32, msg: &Message) -> bool {
        let mut conns = self.connections.lock().await;

        if !conns.contains_key(&target) {
            match self.connect(target).await {
                Some(conn) => {
                    conns.insert(target, conn);
                }
                None => return false,
            }
        }

        let conn = conns.get_mut(&target).expect("just inserted or present");
        match conn.write_message(msg).await {
            Ok(()) => {
                self.dead.discard(target);
                true
            }
            Err(err) => {
                debug!(target, error = %err, "write failed, dropping connection");
                conns.remove(&target);
                false
            }
        }
    }

    async fn connect(&self, target: u32) -> Option<Connection<TcpStream>> {
        let addr = self.peers.get(target)?.to_socket_addr(target).ok()?;
        match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Some(Connection::new(stream)),
            Ok(Err(err)) => {
                debug!(target, error = %err, "connect failed");
                None
            }
            Err(_) => {
                let err = crate::error::Error::ConnectTimeout(target);
                debug!(target, %err, "connect timed out");
                None
            }
        }
    }

    /// Drop every pooled connection, closing the underlying sockets.
    pub async fn shutdown(&self) {
        self.connections.lock().await.clear();
    }
}
