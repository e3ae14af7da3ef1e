//! Heartbeat loop and coordinator liveness watchdog (C6).
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::election::ElectionEngine;
use crate::pool::Transport;
use crate::protocol::MessageType;
use crate::shutdown::Shutdown;

/// Non-coordinators declare the leader dead after this long without a frame.
const HEARTBEAT_WATCHDOG: Duration = Duration::from_secs(6);

/// Runs the periodic heartbeat tick until told to shut down.
///
/// Each tick either broadcasts `HEARTBEAT` (if this node is coordinator) or
/// checks how long it's been since the last one was seen from the believed
/// coordinator, triggering a new election past [`HEARTBEAT_WATCHDOG`].
pub async fn run(transport: Arc<Transport>, election: Arc<ElectionEngine>, self_id: u32, mut shutdown: Shutdown) {
    while !shutdown.is_shutdown() {
        let jitter_ms = rand::thread_rng().gen_range(0..=250);
        let tick = tokio::time::sleep(Duration::from_millis(1000 + jitter_ms));

        tokio::select! {
            _ = tick => {}
            _ = shutdown.recv() => break,
        }

        if election.is_self_coordinator() {
            let others: Vec<u32> = transport.peers().others(self_id).collect();
            for pid in others {
                let ts = transport.clock().tick();
                transport.send(pid, MessageType::Heartbeat, ts).await;
            }
        } else if let Some(coordinator) = election.coordinator_id() {
            if election.time_since_last_heartbeat() > HEARTBEAT_WATCHDOG {
                election.clear_coordinator_as_dead(coordinator);
                election.start_election().await;
            }
        }
    }
}

/// Inbound `HEARTBEAT` handling, shared by the dispatcher.
pub fn handle_heartbeat(election: &ElectionEngine, sender: u32) {
    if election.coordinator_id() == Some(sender) {
        election.refresh_last_heartbeat();
    } else if election.coordinator_id().is_none() {
        election.install_coordinator_via_heartbeat(sender);
    }
}
