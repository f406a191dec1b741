//! Reliable delivery over UDP: the outstanding-message table.
//!
//! Any message that expects an ack is registered here right after the first
//! send. The owner's retry task periodically drains [`AckTracker::get_retries`]
//! and puts the overdue ones back on the wire; an arriving ack deletes the
//! entry. Entries survive a master failover by being redirected wholesale to
//! the new master's address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use shared::GameMessage;

#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub message: GameMessage,
    pub target: SocketAddr,
    pub sent_at: Instant,
    pub attempts: u32,
}

pub struct AckTracker {
    pending: Mutex<HashMap<i64, PendingMessage>>,
    retry_interval: Duration,
}

impl AckTracker {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            retry_interval,
        }
    }

    pub fn track(&self, seq: i64, message: GameMessage, target: SocketAddr) {
        let mut pending = self.pending.lock().unwrap();
        pending.insert(
            seq,
            PendingMessage {
                message,
                target,
                sent_at: Instant::now(),
                attempts: 1,
            },
        );
    }

    /// Deletes the entry for `seq`. Returns whether it still existed, so a
    /// duplicate ack is visible to the caller but harmless.
    pub fn acknowledge(&self, seq: i64) -> bool {
        self.pending.lock().unwrap().remove(&seq).is_some()
    }

    /// Returns every entry whose last send is older than the retry interval,
    /// re-stamping and counting the attempt in the same step so a slow caller
    /// cannot double-send.
    pub fn get_retries(&self) -> Vec<(GameMessage, SocketAddr)> {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();

        let mut due = Vec::new();
        for entry in pending.values_mut() {
            if now.duration_since(entry.sent_at) >= self.retry_interval {
                entry.sent_at = now;
                entry.attempts += 1;
                due.push((entry.message.clone(), entry.target));
            }
        }
        due
    }

    /// Re-targets every pending entry, used when the master moves.
    pub fn redirect_to(&self, addr: SocketAddr) {
        let mut pending = self.pending.lock().unwrap();
        for entry in pending.values_mut() {
            entry.target = addr;
        }
    }

    /// Drops everything aimed at `addr`, used when a peer is evicted.
    pub fn remove_by_addr(&self, addr: SocketAddr) {
        self.pending
            .lock()
            .unwrap()
            .retain(|_, entry| entry.target != addr);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
