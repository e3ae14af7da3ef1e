//! Bully leader election (C5).
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::logging::{LogEvent, LogSink};
use crate::pool::Transport;
use crate::protocol::MessageType;

/// Deadline for a round waiting on `ANSWER`, and again waiting on `COORDINATOR`.
const ELECTION_TIMEOUT: Duration = Duration::from_secs(5);

struct State {
    coordinator_id: Option<u32>,
    in_progress: bool,
    received_answer: bool,
    last_heartbeat: Instant,
}

/// Runs the bully algorithm: the live peer with the largest id is coordinator.
pub struct ElectionEngine {
    self_id: u32,
    transport: Arc<Transport>,
    log: Arc<dyn LogSink>,
    state: Mutex<State>,
}

impl ElectionEngine {
    pub fn new(self_id: u32, transport: Arc<Transport>, log: Arc<dyn LogSink>) -> Arc<Self> {
        Arc::new(Self {
            self_id,
            transport,
            log,
            state: Mutex::new(State {
                coordinator_id: None,
                in_progress: false,
                received_answer: false,
                last_heartbeat: Instant::now(),
            }),
        })
    }

    pub fn coordinator_id(&self) -> Option<u32> {
        self.state.lock().unwrap().coordinator_id
    }

    pub fn is_self_coordinator(&self) -> bool {
        self.state.lock().unwrap().coordinator_id == Some(self.self_id)
    }

    pub fn time_since_last_heartbeat(&self) -> Duration {
        self.state.lock().unwrap().last_heartbeat.elapsed()
    }

    /// A `HEARTBEAT` arrived from the peer already believed to be coordinator.
    pub fn refresh_last_heartbeat(&self) {
        self.state.lock().unwrap().last_heartbeat = Instant::now();
    }

    /// A `HEARTBEAT` arrived while no coordinator is known; accept the sender
    /// rather than forcing an election, so a transient partition heals
    /// without a thundering herd of election rounds.
    pub fn install_coordinator_via_heartbeat(&self, sender: u32) {
        let mut state = self.state.lock().unwrap();
        state.coordinator_id = Some(sender);
        state.last_heartbeat = Instant::now();
        drop(state);
        self.log.emit(
            LogEvent::new(self.self_id, self.transport.clock().peek(), "LEADER_RECOVER", "accepted leader via heartbeat")
                .with_field("sender", sender),
        );
    }

    /// The heartbeat watchdog decided the coordinator is gone.
    pub fn clear_coordinator_as_dead(&self, coordinator: u32) {
        self.transport.dead_nodes().add(coordinator);
        self.state.lock().unwrap().coordinator_id = None;
        self.log.emit(
            LogEvent::new(self.self_id, self.transport.clock().peek(), "LEADER_DEAD", "leader timed out")
                .with_field("coordinator", coordinator),
        );
    }

    /// Start (or restart) one election round. A no-op if a round is already
    /// in progress.
    pub async fn start_election(self: &Arc<Self>) {
        if self.state.lock().unwrap().in_progress {
            return;
        }

        let backoff_ms = rand::thread_rng().gen_range(100..=500);
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

        {
            let mut state = self.state.lock().unwrap();
            if state.in_progress {
                return;
            }
            state.in_progress = true;
            state.received_answer = false;
        }

        let ts = self.transport.clock().tick();
        self.log.emit(LogEvent::new(self.self_id, ts, "ELECTION_START", "starting election process"));

        let dead_snapshot = self.transport.dead_nodes().snapshot();
        let higher: Vec<u32> = self
            .transport
            .peers()
            .others(self.self_id)
            .filter(|id| *id > self.self_id && !dead_snapshot.contains(id))
            .collect();

        if higher.is_empty() {
            self.become_coordinator().await;
            return;
        }

        for pid in &higher {
            let ts = self.transport.clock().tick();
            self.transport.send(*pid, MessageType::Election, ts).await;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.wait_for_election_result().await;
        });
    }

    async fn wait_for_election_result(self: Arc<Self>) {
        tokio::time::sleep(ELECTION_TIMEOUT).await;
        if !self.state.lock().unwrap().in_progress {
            return;
        }

        let received_answer = self.state.lock().unwrap().received_answer;
        if !received_answer {
            self.become_coordinator().await;
            return;
        }

        tokio::time::sleep(ELECTION_TIMEOUT).await;
        let restart = {
            let mut state = self.state.lock().unwrap();
            if state.in_progress {
                state.in_progress = false;
                true
            } else {
                false
            }
        };
        if restart {
            self.log.emit(LogEvent::new(
                self.self_id,
                self.transport.clock().peek(),
                "ELECTION_RESTART",
                "timeout waiting for coordinator, restarting",
            ));
            self.start_election().await;
        }
    }

    async fn become_coordinator(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.coordinator_id = Some(self.self_id);
            state.in_progress = false;
            state.last_heartbeat = Instant::now();
        }

        let ts = self.transport.clock().tick();
        self.log.emit(LogEvent::new(self.self_id, ts, "LEADER_SELF", "!!! I am the coordinator !!!"));

        let others: Vec<u32> = self.transport.peers().others(self.self_id).collect();
        for pid in others {
            let ts = self.transport.clock().tick();
            self.transport.send(pid, MessageType::Coordinator, ts).await;
        }
    }

    /// Inbound `ELECTION`: always answer, forward our coordinator status if
    /// we already won, otherwise start our own round if one isn't running.
    pub async fn handle_election(self: &Arc<Self>, sender: u32) {
        let (is_coordinator, in_progress) = {
            let state = self.state.lock().unwrap();
            (state.coordinator_id == Some(self.self_id), state.in_progress)
        };

        let ts = self.transport.clock().tick();
        self.transport.send(sender, MessageType::Answer, ts).await;

        if is_coordinator {
            let ts = self.transport.clock().tick();
            self.transport.send(sender, MessageType::Coordinator, ts).await;
            return;
        }

        if !in_progress {
            self.start_election().await;
        }
    }

    pub fn handle_answer(&self, _sender: u32) {
        self.state.lock().unwrap().received_answer = true;
    }

    pub fn handle_coordinator(&self, sender: u32) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            state.in_progress = false;
            state.last_heartbeat = Instant::now();
            if state.coordinator_id == Some(sender) {
                false
            } else {
                state.coordinator_id = Some(sender);
                true
            }
        };

        if changed {
            self.log.emit(
                LogEvent::new(self.self_id, self.transport.clock().peek(), "LEADER_UPDATE", "new leader elected")
                    .with_field("sender", sender),
            );
        } else {
            debug!(sender, "duplicate coordinator announcement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::LamportClock;
    use crate::config::PeerTable;
    use crate::logging::ConsoleSink;
    use crate::membership::DeadSet;

    fn peers(self_id: u32) -> PeerTable {
        let path = std::env::temp_dir().join(format!("meetpoint-election-test-{}-{}.json", std::process::id(), self_id));
        std::fs::write(&path, r#"{"1":{"ip":"127.0.0.1","port":1},"2":{"ip":"127.0.0.1","port":2},"3":{"ip":"127.0.0.1","port":3}}"#).unwrap();
        let table = PeerTable::load(&path, self_id).unwrap();
        let _ = std::fs::remove_file(&path);
        table
    }

    fn engine(self_id: u32) -> Arc<ElectionEngine> {
        let transport = Transport::new(self_id, peers(self_id), Arc::new(LamportClock::new()), Arc::new(DeadSet::new()), Arc::new(ConsoleSink));
        ElectionEngine::new(self_id, transport, Arc::new(ConsoleSink))
    }

    #[tokio::test]
    async fn handle_coordinator_adopts_a_new_leader() {
        let engine = engine(1);
        engine.handle_coordinator(3);
        assert_eq!(engine.coordinator_id(), Some(3));
    }

    #[tokio::test]
    async fn duplicate_coordinator_announcement_does_not_change_identity() {
        let engine = engine(1);
        engine.handle_coordinator(3);
        engine.handle_coordinator(3);
        assert_eq!(engine.coordinator_id(), Some(3));
        assert!(!engine.is_self_coordinator());
    }

    #[tokio::test]
    async fn handle_coordinator_clears_in_progress_and_refreshes_heartbeat() {
        let engine = engine(1);
        {
            let mut state = engine.state.lock().unwrap();
            state.in_progress = true;
        }
        engine.handle_coordinator(3);
        assert!(!engine.state.lock().unwrap().in_progress);
        assert!(engine.time_since_last_heartbeat() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn handle_answer_records_that_a_higher_peer_responded() {
        let engine = engine(1);
        assert!(!engine.state.lock().unwrap().received_answer);
        engine.handle_answer(2);
        assert!(engine.state.lock().unwrap().received_answer);
    }

    #[tokio::test]
    async fn clear_coordinator_as_dead_marks_peer_dead_and_forgets_leader() {
        let engine = engine(1);
        engine.handle_coordinator(2);
        engine.clear_coordinator_as_dead(2);
        assert_eq!(engine.coordinator_id(), None);
        assert!(engine.transport.dead_nodes().contains(2));
    }

    #[tokio::test]
    async fn install_coordinator_via_heartbeat_sets_leader_without_an_election() {
        let engine = engine(1);
        assert_eq!(engine.coordinator_id(), None);
        engine.install_coordinator_via_heartbeat(3);
        assert_eq!(engine.coordinator_id(), Some(3));
    }

    #[tokio::test]
    async fn highest_id_node_becomes_coordinator_with_no_higher_peers() {
        // Node 3 is the largest id in the table, so its election round finds
        // no higher peer to challenge and becomes coordinator immediately.
        let engine = engine(3);
        engine.start_election().await;
        assert!(engine.is_self_coordinator());
    }

    struct RecordingSink {
        events: Arc<Mutex<Vec<LogEvent>>>,
    }

    impl LogSink for RecordingSink {
        fn emit(&self, event: LogEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_the_round_if_no_coordinator_follows_an_answer() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let log: Arc<dyn LogSink> = Arc::new(RecordingSink { events: events.clone() });
        let transport = Transport::new(1, peers(1), Arc::new(LamportClock::new()), Arc::new(DeadSet::new()), log.clone());
        let engine = ElectionEngine::new(1, transport, log);

        {
            let mut state = engine.state.lock().unwrap();
            state.in_progress = true;
            state.received_answer = true;
        }

        // Drives both ELECTION_TIMEOUT waits directly rather than through the
        // detached task start_election() spawns, so the whole two-phase
        // timeout plays out on this task under the paused clock.
        Arc::clone(&engine).wait_for_election_result().await;

        let recorded = events.lock().unwrap();
        assert!(recorded.iter().any(|e| e.event_type == "ELECTION_RESTART"));
    }
}
