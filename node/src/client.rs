//! Base client shared by the deputy, normal and viewer roles.
//!
//! Everything a non-master role does towards its master lives here: pings,
//! acks, steering, the exit announcement, the monotone state parser and the
//! master/deputy address bookkeeping used during failover.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{mpsc, watch};

use shared::{Direction, GameConfig, GameError, GameMessage, GameState, MessageBody, NodeRole};

use crate::ack::AckTracker;
use crate::events::Event;
use crate::socket::GameSocket;

/// Pings sent back to back when a role starts, to punch through NAT and
/// prime the master's peer table.
pub const PING_BURST_COUNT: u32 = 5;
pub const PING_BURST_SPACING: Duration = Duration::from_millis(100);

/// How long a single receive call blocks before the loop re-checks shutdown.
pub const RECV_DEADLINE: Duration = Duration::from_millis(100);

pub struct BaseClient {
    pub socket: Arc<GameSocket>,
    pub acks: AckTracker,
    pub my_id: i32,
    pub config: GameConfig,
    pub events: mpsc::Sender<Event>,

    master_addr: Mutex<SocketAddr>,
    deputy_addr: Mutex<Option<SocketAddr>>,
    state: Mutex<Option<GameState>>,
    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,
}

impl BaseClient {
    pub fn new(
        socket: Arc<GameSocket>,
        master_addr: SocketAddr,
        config: GameConfig,
        my_id: i32,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let now = Instant::now();
        Self {
            socket,
            acks: AckTracker::new(config.retry_interval()),
            my_id,
            config,
            events,
            master_addr: Mutex::new(master_addr),
            deputy_addr: Mutex::new(None),
            state: Mutex::new(None),
            last_received: Mutex::new(now),
            last_sent: Mutex::new(now),
        }
    }

    pub fn master_addr(&self) -> SocketAddr {
        *self.master_addr.lock().unwrap()
    }

    pub fn deputy_addr(&self) -> Option<SocketAddr> {
        *self.deputy_addr.lock().unwrap()
    }

    pub fn touch_received(&self) {
        *self.last_received.lock().unwrap() = Instant::now();
    }

    pub fn touch_sent(&self) {
        *self.last_sent.lock().unwrap() = Instant::now();
    }

    pub fn since_last_received(&self) -> Duration {
        self.last_received.lock().unwrap().elapsed()
    }

    pub fn since_last_sent(&self) -> Duration {
        self.last_sent.lock().unwrap().elapsed()
    }

    pub fn state_snapshot(&self) -> Option<GameState> {
        self.state.lock().unwrap().clone()
    }

    pub fn set_state(&self, state: GameState) {
        *self.state.lock().unwrap() = Some(state);
    }

    pub async fn send_ack(&self, seq: i64, addr: SocketAddr) {
        let ack = GameMessage::ack(seq, self.my_id, 0);
        if let Err(err) = self.socket.send(&ack, addr).await {
            warn!("Failed to send ack to {}: {}", addr, err);
        }
        self.touch_sent();
    }

    pub async fn send_ping(&self) {
        let seq = self.socket.next_seq();
        let ping = GameMessage::ping(seq, self.my_id);
        let master = self.master_addr();
        if let Err(err) = self.socket.send(&ping, master).await {
            warn!("Failed to ping master at {}: {}", master, err);
        }
        self.acks.track(seq, ping, master);
        self.touch_sent();
    }

    pub async fn send_steer(&self, direction: Direction) -> Result<(), GameError> {
        let seq = self.socket.next_seq();
        let msg = GameMessage::steer(seq, self.my_id, direction);
        let master = self.master_addr();
        self.socket.send(&msg, master).await?;
        self.acks.track(seq, msg, master);
        self.touch_sent();
        Ok(())
    }

    /// Graceful exit: tell the master we are a viewer from now on. Tracked,
    /// so it survives one lost datagram even while we are shutting down.
    pub async fn announce_exit(&self) {
        let seq = self.socket.next_seq();
        let msg = GameMessage::role_change(seq, self.my_id, 0, Some(NodeRole::Viewer), None);
        let master = self.master_addr();
        if let Err(err) = self.socket.send(&msg, master).await {
            warn!("Failed to announce exit to {}: {}", master, err);
        }
        self.acks.track(seq, msg, master);
        self.touch_sent();
    }

    pub fn handle_ack(&self, msg: &GameMessage) {
        self.acks.acknowledge(msg.msg_seq);
    }

    pub async fn handle_ping(&self, msg: &GameMessage, from: SocketAddr) {
        self.send_ack(msg.msg_seq, from).await;
    }

    /// A new master announced itself from `from`: re-target everything.
    pub fn adopt_new_master(&self, from: SocketAddr) {
        info!("New master at {}", from);
        *self.master_addr.lock().unwrap() = from;
        *self.deputy_addr.lock().unwrap() = None;
        self.acks.redirect_to(from);
        self.touch_received();
    }

    /// On master silence, falls over to the known deputy. Returns false when
    /// no deputy is known, which means the game is lost from here.
    pub fn switch_to_deputy(&self) -> bool {
        let deputy = self.deputy_addr.lock().unwrap().take();
        match deputy {
            Some(addr) => {
                info!("Master silent, switching to deputy at {}", addr);
                *self.master_addr.lock().unwrap() = addr;
                self.acks.redirect_to(addr);
                self.touch_received();
                true
            }
            None => {
                info!("Master silent and no deputy known");
                false
            }
        }
    }

    /// Applies a `State` message if its order is fresher than what we hold.
    /// Returns a snapshot of the accepted state, or `None` for stale
    /// duplicates (which the caller still acks).
    pub fn apply_state(&self, msg: &GameMessage) -> Option<GameState> {
        let MessageBody::State { state: incoming } = &msg.body else {
            return None;
        };

        let mut held = self.state.lock().unwrap();
        if let Some(current) = held.as_ref() {
            if incoming.state_order <= current.state_order {
                return None;
            }
        }
        *held = Some(incoming.clone());
        Some(incoming.clone())
    }

    /// Remembers the deputy's address from a freshly accepted state.
    pub fn update_deputy_from_state(&self, state: &GameState) {
        let mut deputy = self.deputy_addr.lock().unwrap();
        *deputy = state.players.values().find_map(|player| {
            if player.role != NodeRole::Deputy || player.id == self.my_id {
                return None;
            }
            let ip = player.ip_address.as_ref()?.parse().ok()?;
            let port = player.port?;
            Some(SocketAddr::new(ip, port))
        });
    }

    /// Retransmits overdue tracked messages until shutdown.
    pub async fn retry_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.retry_interval());
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    for (msg, target) in self.acks.get_retries() {
                        if let Err(err) = self.socket.send(&msg, target).await {
                            warn!("Retransmit to {} failed: {}", target, err);
                        }
                    }
                }
            }
        }
    }

    /// Initial burst of pings to open the path to the master.
    pub async fn ping_burst(&self, mut shutdown: watch::Receiver<bool>) {
        for _ in 0..PING_BURST_COUNT {
            self.send_ping().await;
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(PING_BURST_SPACING) => {}
            }
        }
    }
}
