//! Failure detector / membership view (C3).
use std::collections::HashSet;
use std::sync::Mutex;

/// Thread-safe set of peer ids currently believed dead.
///
/// A peer enters on a send failure (after one retry) or a heartbeat timeout;
/// it exits the moment any frame from it is successfully decoded, on the
/// theory that receipt implies liveness regardless of message type.
#[derive(Debug, Default)]
pub struct DeadSet {
    inner: Mutex<HashSet<u32>>,
}

impl DeadSet {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashSet::new()),
        }
    }

    pub fn add(&self, id: u32) {
        self.inner.lock().unwrap().insert(id);
    }

    pub fn discard(&self, id: u32) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.lock().unwrap().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Copy out the current membership so a caller can iterate without
    /// holding the lock (the only sanctioned way to iterate).
    pub fn snapshot(&self) -> HashSet<u32> {
        self.inner.lock().unwrap().clone()
    }
}
