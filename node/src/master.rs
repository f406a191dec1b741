//! The authoritative role: runs the tick, owns the only mutable game state.
//!
//! A master runs five concurrent tasks: receive, tick, announce, maintenance
//! and retransmit. All communication towards the supervisor goes through the
//! event channel; the supervisor reacts by replacing this role when the
//! master hands off or the game ends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use shared::{
    Direction, GameError, GameMessage, GameState, MessageBody, NodeRole, Player, SnakeState,
};

use crate::ack::AckTracker;
use crate::client::RECV_DEADLINE;
use crate::events::{Event, RoleTransition};
use crate::peers::{Peer, PeerRegistry};
use crate::socket::GameSocket;

/// Fixed cadence of the multicast advertisement.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

pub struct MasterConfig {
    pub socket: Arc<GameSocket>,
    pub state: GameState,
    pub my_id: i32,
    pub game_name: String,
    pub events: mpsc::Sender<Event>,
    /// Carried over from a deputy on failover; empty for a fresh game.
    pub peers: PeerRegistry,
}

#[derive(Debug, Clone, Copy)]
struct PendingMove {
    direction: Direction,
    msg_seq: i64,
}

pub struct Master {
    inner: Arc<MasterInner>,
    shutdown: watch::Sender<bool>,
}

struct MasterInner {
    socket: Arc<GameSocket>,
    peers: PeerRegistry,
    acks: AckTracker,
    state: Mutex<GameState>,
    my_id: i32,
    game_name: String,
    events: mpsc::Sender<Event>,

    /// At most one queued direction per player, latest sequence wins.
    pending_moves: Mutex<HashMap<i32, PendingMove>>,
    deputy_id: Mutex<Option<i32>>,
    started_at: Mutex<Instant>,
    /// Set once the handoff to the deputy has begun, so a subsequent
    /// `stop()` cannot run the transfer a second time.
    transferring: AtomicBool,
}

impl Master {
    pub fn new(cfg: MasterConfig) -> Self {
        let retry_interval = cfg.state.config.retry_interval();
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(MasterInner {
                socket: cfg.socket,
                peers: cfg.peers,
                acks: AckTracker::new(retry_interval),
                state: Mutex::new(cfg.state),
                my_id: cfg.my_id,
                game_name: cfg.game_name,
                events: cfg.events,
                pending_moves: Mutex::new(HashMap::new()),
                deputy_id: Mutex::new(None),
                started_at: Mutex::new(Instant::now()),
                transferring: AtomicBool::new(false),
            }),
            shutdown,
        }
    }

    pub async fn start(&self) {
        *self.inner.started_at.lock().unwrap() = Instant::now();

        if self.inner.deputy_id.lock().unwrap().is_none() {
            self.inner.select_new_deputy().await;
        }

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.receive_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.tick_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.announce_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.maintenance_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.retry_loop(rx).await });

        let _ = self.inner.events.send(Event::StateUpdated).await;
        info!(
            "MASTER started for game '{}' on {}",
            self.inner.game_name,
            self.inner.socket.local_addr()
        );
    }

    /// Hands the game to the deputy (unless the handoff already ran) and
    /// cancels every task. Emits no events itself: what the local node does
    /// next is the caller's decision, not this role's.
    pub async fn stop(&self) {
        let _ = self.inner.graceful_transfer().await;
        let _ = self.shutdown.send(true);
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::Master
    }

    pub fn state_snapshot(&self) -> GameState {
        self.inner.state.lock().unwrap().clone()
    }

    /// The master steers its own snake without the network round trip; the
    /// socket sequence keeps later requests winning over earlier ones.
    pub async fn send_steer(&self, direction: Direction) -> Result<(), GameError> {
        let seq = self.inner.socket.next_seq();
        self.inner.queue_move(self.inner.my_id, direction, seq);
        Ok(())
    }

    /// Where the next master will live if this one walks away now.
    pub fn handoff_addr(&self) -> Option<SocketAddr> {
        let deputy_id = (*self.inner.deputy_id.lock().unwrap())?;
        self.inner.peers.get(deputy_id).map(|peer| peer.addr)
    }

    pub async fn handle_message(&self, msg: GameMessage, from: SocketAddr) {
        self.inner.handle_message(msg, from).await;
    }
}

impl MasterInner {
    async fn receive_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Some((msg, from)) = self.socket.recv(RECV_DEADLINE).await {
                self.handle_message(msg, from).await;
            }
        }
    }

    async fn handle_message(&self, msg: GameMessage, from: SocketAddr) {
        self.peers.touch_received(from);

        match &msg.body {
            MessageBody::Steer { .. } => self.handle_steer(&msg, from).await,
            MessageBody::Join { .. } => self.handle_join(&msg, from).await,
            MessageBody::Ping => self.handle_ping(&msg, from).await,
            MessageBody::Ack => {
                self.acks.acknowledge(msg.msg_seq);
            }
            MessageBody::RoleChange { .. } => self.handle_role_change(&msg, from).await,
            MessageBody::Discover => self.handle_discover(from).await,
            MessageBody::State { .. } | MessageBody::Announcement { .. } => {
                debug!("MASTER: ignoring {:?} from {}", msg.body, from);
            }
            MessageBody::Error { .. } => {}
        }
    }

    async fn handle_join(&self, msg: &GameMessage, from: SocketAddr) {
        let MessageBody::Join {
            player_name,
            requested_role,
            ..
        } = &msg.body
        else {
            return;
        };
        info!("MASTER: join request from {} ({})", from, player_name);

        let joining_as_viewer = *requested_role == NodeRole::Viewer;
        let role = if joining_as_viewer {
            NodeRole::Viewer
        } else {
            NodeRole::Normal
        };

        let registered = {
            let mut state = self.state.lock().unwrap();
            let new_id = state.generate_player_id();

            if !joining_as_viewer && !state.spawn_snake(new_id) {
                None
            } else {
                let mut player = Player::new(new_id, player_name.clone(), role);
                player.ip_address = Some(from.ip().to_string());
                player.port = Some(from.port());
                state.players.insert(new_id, player);
                Some(new_id)
            }
        };

        let Some(new_id) = registered else {
            // Rejected joiners are never registered anywhere.
            let seq = self.socket.next_seq();
            let err = GameMessage::error(seq, "No space to spawn snake");
            if let Err(send_err) = self.socket.send(&err, from).await {
                warn!("MASTER: failed to reject join from {}: {}", from, send_err);
            }
            return;
        };
        self.peers
            .add(Peer::new(new_id, player_name.clone(), from, role));

        let needs_deputy = self.deputy_id.lock().unwrap().is_none();
        if needs_deputy && role == NodeRole::Normal {
            self.promote_deputy(new_id).await;
        }

        let ack = GameMessage::ack(msg.msg_seq, self.my_id, new_id);
        if let Err(err) = self.socket.send(&ack, from).await {
            warn!("MASTER: failed to ack join from {}: {}", from, err);
        }
        self.peers.touch_sent(new_id);

        info!("MASTER: player '{}' joined with id {}", player_name, new_id);
        let _ = self.events.send(Event::PlayerJoined(new_id)).await;
    }

    async fn handle_steer(&self, msg: &GameMessage, from: SocketAddr) {
        let Some(peer) = self.peers.get_by_addr(from) else {
            debug!("MASTER: steer from unknown peer {}", from);
            return;
        };
        let MessageBody::Steer { direction } = &msg.body else {
            return;
        };
        let direction = *direction;

        let is_opposite = {
            let state = self.state.lock().unwrap();
            state
                .snakes
                .get(&peer.id)
                .map(|snake| direction.is_opposite(snake.head_direction))
                .unwrap_or(false)
        };

        // Opposites and reordered duplicates are dropped, but always acked:
        // the client only needs to know the request arrived.
        if !is_opposite {
            self.queue_move(peer.id, direction, msg.msg_seq);
        }
        self.send_ack(msg.msg_seq, peer.id, from).await;
    }

    fn queue_move(&self, player_id: i32, direction: Direction, msg_seq: i64) {
        let mut moves = self.pending_moves.lock().unwrap();
        match moves.get(&player_id) {
            Some(existing) if msg_seq <= existing.msg_seq => {}
            _ => {
                moves.insert(player_id, PendingMove { direction, msg_seq });
            }
        }
    }

    async fn handle_ping(&self, msg: &GameMessage, from: SocketAddr) {
        if let Some(peer) = self.peers.get_by_addr(from) {
            self.send_ack(msg.msg_seq, peer.id, from).await;
            return;
        }

        // Unregistered sender. With a sender id we can usually reconcile.
        let Some(sender_id) = msg.sender_id.filter(|id| *id > 0) else {
            debug!("MASTER: ping from completely unknown peer {}", from);
            let ack = GameMessage::ack(msg.msg_seq, self.my_id, 0);
            let _ = self.socket.send(&ack, from).await;
            return;
        };

        if self.peers.get(sender_id).is_some() {
            // Known peer behind a new address: NAT rebinding.
            info!("MASTER: peer {} re-addressed to {}", sender_id, from);
            self.peers.update_addr(sender_id, from);
            self.peers.touch_received_by_id(sender_id);
            self.send_ack(msg.msg_seq, sender_id, from).await;
            return;
        }

        let known_player = {
            let mut state = self.state.lock().unwrap();
            match state.players.get_mut(&sender_id) {
                Some(player) => {
                    player.ip_address = Some(from.ip().to_string());
                    player.port = Some(from.port());
                    Some((player.name.clone(), player.role))
                }
                None => None,
            }
        };

        if let Some((name, role)) = known_player {
            // In the state but not in the registry: typically a survivor of a
            // failover this master inherited. They already track this address,
            // so no identity announcement goes out.
            info!("MASTER: registering peer {} ({}) via ping", sender_id, from);
            self.peers.add(Peer::new(sender_id, name, from, role));
            self.send_ack(msg.msg_seq, sender_id, from).await;
            return;
        }

        // Complete stranger: register as viewer and tell them who is master.
        info!("MASTER: adding unknown sender {} as viewer", sender_id);
        let name = format!("Viewer{}", sender_id);
        self.peers
            .add(Peer::new(sender_id, name.clone(), from, NodeRole::Viewer));
        {
            let mut state = self.state.lock().unwrap();
            let mut player = Player::new(sender_id, name, NodeRole::Viewer);
            player.ip_address = Some(from.ip().to_string());
            player.port = Some(from.port());
            state.players.insert(sender_id, player);
        }
        self.send_master_identity(sender_id, from).await;
        self.send_ack(msg.msg_seq, sender_id, from).await;
    }

    /// Unsolicited `RoleChange(sender_role=Master)` so a confused peer
    /// reconciles against our address.
    async fn send_master_identity(&self, receiver_id: i32, addr: SocketAddr) {
        let seq = self.socket.next_seq();
        let msg = GameMessage::role_change(
            seq,
            self.my_id,
            receiver_id,
            Some(NodeRole::Master),
            None,
        );
        if let Err(err) = self.socket.send(&msg, addr).await {
            warn!("MASTER: failed to send identity to {}: {}", addr, err);
        }
        self.acks.track(seq, msg, addr);
    }

    async fn handle_role_change(&self, msg: &GameMessage, from: SocketAddr) {
        let Some(peer) = self.peers.get_by_addr(from) else {
            return;
        };
        let MessageBody::RoleChange { sender_role, .. } = &msg.body else {
            return;
        };

        if *sender_role == Some(NodeRole::Viewer) {
            self.handle_player_exit(&peer).await;
        }
        self.send_ack(msg.msg_seq, peer.id, from).await;
    }

    /// Graceful departure: the snake stays on the board as a zombie.
    async fn handle_player_exit(&self, peer: &Peer) {
        info!("MASTER: player {} left the game", peer.id);
        {
            let mut state = self.state.lock().unwrap();
            state.make_snake_zombie(peer.id);
            if let Some(player) = state.players.get_mut(&peer.id) {
                player.role = NodeRole::Viewer;
            }
        }

        if *self.deputy_id.lock().unwrap() == Some(peer.id) {
            *self.deputy_id.lock().unwrap() = None;
            self.select_new_deputy().await;
        }

        let _ = self.events.send(Event::PlayerLeft(peer.id)).await;
    }

    async fn handle_discover(&self, from: SocketAddr) {
        let msg = {
            let state = self.state.lock().unwrap();
            let can_join = state.find_spawn_place().is_some();
            GameMessage::announcement(self.socket.next_seq(), &self.game_name, &state, can_join)
        };
        if let Err(err) = self.socket.send(&msg, from).await {
            warn!("MASTER: failed to answer discover from {}: {}", from, err);
        }
    }

    async fn tick_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.state.lock().unwrap().config.tick_interval();
        // First tick one full period after start, not immediately.
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    if self.do_tick().await {
                        return;
                    }
                }
            }
        }
    }

    /// One authoritative step. Returns true when the master died and the
    /// game moved on without us.
    async fn do_tick(&self) -> bool {
        let moves: HashMap<i32, Direction> = {
            let mut pending = self.pending_moves.lock().unwrap();
            pending
                .drain()
                .map(|(id, pm)| (id, pm.direction))
                .collect()
        };

        let (result, state_copy) = {
            let mut state = self.state.lock().unwrap();
            let result = state.tick(&moves);
            (result, state.clone())
        };

        let master_died = result.killed_players.contains(&self.my_id);

        for &player_id in &result.killed_players {
            if player_id == self.my_id {
                continue;
            }

            if *self.deputy_id.lock().unwrap() == Some(player_id) {
                info!("MASTER: deputy {} died, electing a new one", player_id);
                *self.deputy_id.lock().unwrap() = None;
                self.select_new_deputy().await;
            }

            if let Some(peer) = self.peers.get(player_id) {
                let seq = self.socket.next_seq();
                let msg = GameMessage::role_change(
                    seq,
                    self.my_id,
                    peer.id,
                    None,
                    Some(NodeRole::Viewer),
                );
                if let Err(err) = self.socket.send(&msg, peer.addr).await {
                    warn!("MASTER: failed to demote {}: {}", peer.id, err);
                }
                self.acks.track(seq, msg, peer.addr);
            }

            let _ = self.events.send(Event::PlayerLeft(player_id)).await;
        }

        if master_died {
            info!("MASTER: own snake died, handing off");
            match self.graceful_transfer().await {
                Some(true) => {
                    let _ = self
                        .events
                        .send(Event::RoleChanged(RoleTransition::ToViewer))
                        .await;
                }
                Some(false) => {
                    let _ = self.events.send(Event::GameOver).await;
                }
                None => {}
            }
            return true;
        }

        self.broadcast_state(&state_copy).await;
        let _ = self.events.send(Event::StateUpdated).await;
        false
    }

    async fn broadcast_state(&self, state: &GameState) {
        for peer in self.peers.all() {
            let seq = self.socket.next_seq();
            let msg = GameMessage::state(seq, state.clone());
            if let Err(err) = self.socket.send(&msg, peer.addr).await {
                warn!("MASTER: failed to send state to {}: {}", peer.addr, err);
                continue;
            }
            self.acks.track(seq, msg, peer.addr);
            self.peers.touch_sent(peer.id);
        }
    }

    /// Hands the game to the deputy: final state first, then the reassignment
    /// order. With no deputy, every peer gets a game-over error instead.
    /// Returns whether a deputy took the game, or `None` when the transfer
    /// had already run.
    async fn graceful_transfer(&self) -> Option<bool> {
        if self.transferring.swap(true, Ordering::SeqCst) {
            return None;
        }

        let deputy = {
            let deputy_id = *self.deputy_id.lock().unwrap();
            deputy_id.and_then(|id| self.peers.get(id))
        };

        match deputy {
            Some(deputy) => {
                let state_copy = self.state.lock().unwrap().clone();
                self.broadcast_state(&state_copy).await;

                let seq = self.socket.next_seq();
                let msg = GameMessage::role_change(
                    seq,
                    self.my_id,
                    deputy.id,
                    Some(NodeRole::Viewer),
                    Some(NodeRole::Master),
                );
                if let Err(err) = self.socket.send(&msg, deputy.addr).await {
                    warn!("MASTER: failed to hand off to {}: {}", deputy.addr, err);
                }
                self.acks.track(seq, msg, deputy.addr);

                info!("MASTER: transferred control to deputy {}", deputy.id);
                Some(true)
            }
            None => {
                info!("MASTER: no deputy available, ending the game");
                for peer in self.peers.all() {
                    let seq = self.socket.next_seq();
                    let msg = GameMessage::error(seq, "Game Over - no players left");
                    if let Err(err) = self.socket.send(&msg, peer.addr).await {
                        warn!("MASTER: failed to notify {}: {}", peer.addr, err);
                    }
                }
                Some(false)
            }
        }
    }

    async fn announce_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + ANNOUNCE_INTERVAL,
            ANNOUNCE_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let msg = {
                        let state = self.state.lock().unwrap();
                        let can_join = state.find_spawn_place().is_some();
                        GameMessage::announcement(
                            self.socket.next_seq(),
                            &self.game_name,
                            &state,
                            can_join,
                        )
                    };
                    if let Err(err) = self.socket.send_multicast(&msg).await {
                        debug!("MASTER: announcement send failed: {}", err);
                    }
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let (interval, timeout, grace) = {
            let config = self.state.lock().unwrap().config;
            (
                config.ping_interval(),
                config.peer_timeout(),
                config.grace_period(),
            )
        };
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let in_grace =
                        self.started_at.lock().unwrap().elapsed() < grace;

                    if !in_grace {
                        for peer in self.peers.find_timed_out(timeout) {
                            self.handle_peer_timeout(&peer).await;
                        }
                    }

                    for peer in self.peers.find_need_ping(interval) {
                        self.send_ping(&peer).await;
                    }
                }
            }
        }
    }

    async fn handle_peer_timeout(&self, peer: &Peer) {
        info!("MASTER: peer {} timed out", peer.id);

        self.acks.remove_by_addr(peer.addr);
        {
            let mut state = self.state.lock().unwrap();
            state.make_snake_zombie(peer.id);
            if let Some(player) = state.players.get_mut(&peer.id) {
                player.role = NodeRole::Viewer;
            }
        }
        self.peers.remove(peer.id);

        if *self.deputy_id.lock().unwrap() == Some(peer.id) {
            *self.deputy_id.lock().unwrap() = None;
            self.select_new_deputy().await;
        }

        let _ = self.events.send(Event::PlayerLeft(peer.id)).await;
    }

    async fn retry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.state.lock().unwrap().config.retry_interval();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    for (msg, target) in self.acks.get_retries() {
                        if let Err(err) = self.socket.send(&msg, target).await {
                            warn!("MASTER: retransmit to {} failed: {}", target, err);
                        }
                    }
                }
            }
        }
    }

    /// Picks the first registered peer still playing as NORMAL and makes it
    /// the deputy, in both the registry and the state.
    async fn select_new_deputy(&self) {
        let candidate = self.peers.all().into_iter().find(|peer| {
            let state = self.state.lock().unwrap();
            state
                .players
                .get(&peer.id)
                .map(|player| player.role == NodeRole::Normal)
                .unwrap_or(false)
        });

        match candidate {
            Some(peer) => self.promote_deputy(peer.id).await,
            None => debug!("MASTER: no NORMAL peer available for deputy"),
        }
    }

    async fn promote_deputy(&self, peer_id: i32) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };

        *self.deputy_id.lock().unwrap() = Some(peer_id);
        self.peers.update_role(peer_id, NodeRole::Deputy);
        {
            let mut state = self.state.lock().unwrap();
            if let Some(player) = state.players.get_mut(&peer_id) {
                player.role = NodeRole::Deputy;
            }
        }

        let seq = self.socket.next_seq();
        let msg =
            GameMessage::role_change(seq, self.my_id, peer_id, None, Some(NodeRole::Deputy));
        if let Err(err) = self.socket.send(&msg, peer.addr).await {
            warn!("MASTER: failed to appoint deputy {}: {}", peer_id, err);
        }
        self.acks.track(seq, msg, peer.addr);

        info!("MASTER: {} ({}) is now DEPUTY", peer.name, peer_id);
    }

    async fn send_ack(&self, seq: i64, receiver_id: i32, addr: SocketAddr) {
        let ack = GameMessage::ack(seq, self.my_id, receiver_id);
        if let Err(err) = self.socket.send(&ack, addr).await {
            warn!("MASTER: failed to ack {}: {}", addr, err);
        }
        self.peers.touch_sent(receiver_id);
    }

    async fn send_ping(&self, peer: &Peer) {
        let seq = self.socket.next_seq();
        let ping = GameMessage::ping(seq, self.my_id);
        if let Err(err) = self.socket.send(&ping, peer.addr).await {
            warn!("MASTER: failed to ping {}: {}", peer.id, err);
        }
        self.acks.track(seq, ping, peer.addr);
        self.peers.touch_sent(peer.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::GameConfig;
    use std::net::Ipv4Addr;

    async fn master_with_state() -> (Master, mpsc::Receiver<Event>) {
        let socket = Arc::new(GameSocket::bind_to(Ipv4Addr::LOCALHOST).await.unwrap());
        let (tx, rx) = mpsc::channel(100);

        let config = GameConfig {
            width: 20,
            height: 15,
            food_static: 3,
            state_delay_ms: 200,
        };
        let mut state = GameState::new(config);
        let mut player = Player::new(1, "alice", NodeRole::Master);
        player.ip_address = None;
        state.players.insert(1, player);
        assert!(state.spawn_snake(1));
        state.ensure_food();

        let master = Master::new(MasterConfig {
            socket,
            state,
            my_id: 1,
            game_name: "den".to_string(),
            events: tx,
            peers: PeerRegistry::new(),
        });
        (master, rx)
    }

    #[tokio::test]
    async fn test_join_registers_player_and_acks_with_id() {
        let (master, mut events) = master_with_state().await;
        let from: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        let join = GameMessage::join(10, "bob", "den", NodeRole::Normal);
        master.handle_message(join, from).await;

        let state = master.state_snapshot();
        assert_eq!(state.players.len(), 2);
        // First joiner becomes deputy immediately.
        assert_eq!(state.players[&2].role, NodeRole::Deputy);
        assert_eq!(state.snakes[&2].len(&state.field), 2);

        match events.recv().await.unwrap() {
            Event::PlayerJoined(2) => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_joiner_stays_normal() {
        let (master, _events) = master_with_state().await;

        let join1 = GameMessage::join(10, "bob", "den", NodeRole::Normal);
        master
            .handle_message(join1, "127.0.0.1:9001".parse().unwrap())
            .await;
        let join2 = GameMessage::join(11, "carol", "den", NodeRole::Normal);
        master
            .handle_message(join2, "127.0.0.1:9002".parse().unwrap())
            .await;

        let state = master.state_snapshot();
        assert_eq!(state.players[&2].role, NodeRole::Deputy);
        assert_eq!(state.players[&3].role, NodeRole::Normal);
    }

    #[tokio::test]
    async fn test_viewer_join_gets_no_snake() {
        let (master, _events) = master_with_state().await;

        let join = GameMessage::join(10, "watcher", "den", NodeRole::Viewer);
        master
            .handle_message(join, "127.0.0.1:9001".parse().unwrap())
            .await;

        let state = master.state_snapshot();
        assert_eq!(state.players[&2].role, NodeRole::Viewer);
        assert!(!state.snakes.contains_key(&2));
        // A viewer is never drafted as deputy.
        assert!(master.handoff_addr().is_none());
    }

    #[tokio::test]
    async fn test_steer_dedup_keeps_highest_sequence() {
        let (master, _events) = master_with_state().await;
        let from: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        let join = GameMessage::join(10, "bob", "den", NodeRole::Normal);
        master.handle_message(join, from).await;

        let current = master.state_snapshot().snakes[&2].head_direction;
        let turn = if current == Direction::Up || current == Direction::Down {
            Direction::Left
        } else {
            Direction::Up
        };
        let other = turn.opposite();

        // Sequence 21 arrives first, then a stale 20: the stale one loses.
        master
            .handle_message(GameMessage::steer(21, 2, turn), from)
            .await;
        master
            .handle_message(GameMessage::steer(20, 2, other), from)
            .await;

        let moves = master.inner.pending_moves.lock().unwrap();
        assert_eq!(moves[&2].msg_seq, 21);
        assert_eq!(moves[&2].direction, turn);
    }

    #[tokio::test]
    async fn test_opposite_steer_is_not_queued() {
        let (master, _events) = master_with_state().await;
        let from: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        let join = GameMessage::join(10, "bob", "den", NodeRole::Normal);
        master.handle_message(join, from).await;

        let current = master.state_snapshot().snakes[&2].head_direction;
        master
            .handle_message(GameMessage::steer(20, 2, current.opposite()), from)
            .await;

        assert!(master.inner.pending_moves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_rolechange_zombifies_and_reelects() {
        let (master, _events) = master_with_state().await;
        let bob: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let carol: SocketAddr = "127.0.0.1:9002".parse().unwrap();

        master
            .handle_message(GameMessage::join(10, "bob", "den", NodeRole::Normal), bob)
            .await;
        master
            .handle_message(
                GameMessage::join(11, "carol", "den", NodeRole::Normal),
                carol,
            )
            .await;
        assert_eq!(master.state_snapshot().players[&2].role, NodeRole::Deputy);

        // Bob (the deputy) leaves gracefully.
        let exit = GameMessage::role_change(12, 2, 0, Some(NodeRole::Viewer), None);
        master.handle_message(exit, bob).await;

        let state = master.state_snapshot();
        assert_eq!(state.players[&2].role, NodeRole::Viewer);
        assert_eq!(state.snakes[&2].state, SnakeState::Zombie);
        // Carol inherits the deputy slot.
        assert_eq!(state.players[&3].role, NodeRole::Deputy);
    }

    #[tokio::test]
    async fn test_deputy_is_unique_across_events() {
        let (master, _events) = master_with_state().await;

        for (seq, port, name) in [(10, 9001, "bob"), (11, 9002, "carol"), (12, 9003, "dave")] {
            let from: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
            master
                .handle_message(GameMessage::join(seq, name, "den", NodeRole::Normal), from)
                .await;
        }

        let state = master.state_snapshot();
        let deputies = state
            .players
            .values()
            .filter(|p| p.role == NodeRole::Deputy)
            .count();
        assert_eq!(deputies, 1);
    }

    #[tokio::test]
    async fn test_ping_from_stranger_registers_viewer() {
        let (master, _events) = master_with_state().await;
        let from: SocketAddr = "127.0.0.1:9009".parse().unwrap();

        let ping = GameMessage::ping(33, 77);
        master.handle_message(ping, from).await;

        let state = master.state_snapshot();
        assert_eq!(state.players[&77].role, NodeRole::Viewer);
        assert!(master.inner.peers.get(77).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ping_from_state_only_player_reregisters_quietly() {
        let (master, _events) = master_with_state().await;

        let peer_socket = tokio::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let peer_addr = peer_socket.local_addr().unwrap();

        // A survivor this master inherited: in the state, not in the registry.
        {
            let mut state = master.inner.state.lock().unwrap();
            state
                .players
                .insert(7, Player::new(7, "eve", NodeRole::Normal));
        }

        master
            .handle_message(GameMessage::ping(40, 7), peer_addr)
            .await;

        assert!(master.inner.peers.get(7).is_some());
        let state = master.state_snapshot();
        assert_eq!(state.players[&7].port, Some(peer_addr.port()));

        // Only the ack comes back; a known player gets no unsolicited
        // RoleChange that would reset its failover bookkeeping.
        let mut saw_ack = false;
        let mut buf = vec![0u8; 64 * 1024];
        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        while tokio::time::Instant::now() < deadline {
            let received = tokio::time::timeout(
                Duration::from_millis(100),
                peer_socket.recv_from(&mut buf),
            )
            .await;
            let Ok(Ok((len, _))) = received else {
                continue;
            };
            let msg = GameMessage::decode(&buf[..len]).unwrap();
            match msg.body {
                MessageBody::Ack => {
                    assert_eq!(msg.msg_seq, 40);
                    saw_ack = true;
                }
                MessageBody::RoleChange { .. } => {
                    panic!("unsolicited RoleChange sent to a known player")
                }
                _ => {}
            }
        }
        assert!(saw_ack, "ping was never acked");
    }
}
