//! The standby role: shadows the full game state, ready to promote.
//!
//! A deputy is an ordinary client with one extra duty: it keeps its own copy
//! of every `State` broadcast and a registry of every playing peer, so that
//! when the master goes silent it can declare itself master without asking
//! anyone for help.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use shared::{
    Direction, GameConfig, GameError, GameMessage, GameState, MessageBody, NodeRole, SnakeState,
};

use crate::client::{BaseClient, RECV_DEADLINE};
use crate::events::{Event, RoleTransition};
use crate::peers::{Peer, PeerRegistry};
use crate::socket::GameSocket;

pub struct DeputyConfig {
    pub socket: Arc<GameSocket>,
    pub master_addr: SocketAddr,
    pub config: GameConfig,
    pub state: GameState,
    pub my_id: i32,
    pub events: mpsc::Sender<Event>,
}

pub struct Deputy {
    inner: Arc<DeputyInner>,
    shutdown: watch::Sender<bool>,
}

struct DeputyInner {
    base: BaseClient,
    peers: PeerRegistry,
    becoming_master: AtomicBool,
    /// Set once our snake died; a dead deputy never promotes.
    dead: AtomicBool,
}

impl Deputy {
    pub fn new(cfg: DeputyConfig) -> Self {
        let base = BaseClient::new(
            cfg.socket,
            cfg.master_addr,
            cfg.config,
            cfg.my_id,
            cfg.events,
        );
        base.set_state(cfg.state);

        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(DeputyInner {
                base,
                peers: PeerRegistry::new(),
                becoming_master: AtomicBool::new(false),
                dead: AtomicBool::new(false),
            }),
            shutdown,
        }
    }

    pub async fn start(&self) {
        self.inner.base.touch_received();
        self.inner.base.touch_sent();

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.receive_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.maintenance_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.base.retry_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.base.ping_burst(rx).await });

        info!(
            "DEPUTY started, id {}, master at {}",
            self.inner.base.my_id,
            self.inner.base.master_addr()
        );
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::Deputy
    }

    pub fn state_snapshot(&self) -> Option<GameState> {
        self.inner.base.state_snapshot()
    }

    pub async fn send_steer(&self, direction: Direction) -> Result<(), GameError> {
        self.inner.base.send_steer(direction).await
    }

    pub async fn announce_exit(&self) {
        self.inner.base.announce_exit().await;
    }

    pub fn master_addr(&self) -> SocketAddr {
        self.inner.base.master_addr()
    }

    /// Everyone this deputy tracks, for the supervisor to seed the next
    /// master's registry with.
    pub fn known_peers(&self) -> Vec<Peer> {
        self.inner.peers.all()
    }

    pub async fn handle_message(&self, msg: GameMessage, from: SocketAddr) {
        self.inner.handle_message(msg, from).await;
    }
}

impl DeputyInner {
    async fn receive_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Some((msg, from)) = self.base.socket.recv(RECV_DEADLINE).await {
                self.handle_message(msg, from).await;
            }
        }
    }

    async fn handle_message(&self, msg: GameMessage, from: SocketAddr) {
        self.base.touch_received();

        match &msg.body {
            MessageBody::State { .. } => self.handle_state(&msg, from).await,
            MessageBody::RoleChange { .. } => self.handle_role_change(&msg, from).await,
            MessageBody::Ack => self.base.handle_ack(&msg),
            MessageBody::Ping => self.base.handle_ping(&msg, from).await,
            _ => debug!("DEPUTY: ignoring {:?} from {}", msg.body, from),
        }
    }

    /// Stores a fresh state and mirrors its player list into the peer
    /// registry, so a takeover can notify everyone immediately.
    async fn handle_state(&self, msg: &GameMessage, from: SocketAddr) {
        let Some(state) = self.base.apply_state(msg) else {
            // Out-of-order duplicate: acked, never applied.
            self.base.send_ack(msg.msg_seq, from).await;
            return;
        };

        for player in state.players.values() {
            if player.role == NodeRole::Viewer {
                self.peers.remove(player.id);
                continue;
            }
            if player.id == self.base.my_id || player.role == NodeRole::Master {
                continue;
            }
            let Some(addr) = player_addr(player) else {
                continue;
            };

            if self.peers.get(player.id).is_none() {
                self.peers
                    .add(Peer::new(player.id, player.name.clone(), addr, player.role));
            } else {
                self.peers.update_addr(player.id, addr);
                self.peers.update_role(player.id, player.role);
            }
        }

        self.base.send_ack(msg.msg_seq, from).await;
        let _ = self.base.events.send(Event::StateUpdated).await;
    }

    async fn handle_role_change(&self, msg: &GameMessage, from: SocketAddr) {
        let MessageBody::RoleChange {
            sender_role,
            receiver_role,
        } = &msg.body
        else {
            return;
        };
        debug!(
            "DEPUTY: RoleChange from {}: sender={:?} receiver={:?}",
            from, sender_role, receiver_role
        );

        self.base.send_ack(msg.msg_seq, from).await;

        if *receiver_role == Some(NodeRole::Master) {
            if self.dead.load(Ordering::SeqCst) {
                info!("DEPUTY: ordered to become master, but already dead");
                return;
            }
            self.become_master().await;
            return;
        }

        if *receiver_role == Some(NodeRole::Viewer) {
            info!("DEPUTY: demoted to viewer, snake died");
            self.dead.store(true, Ordering::SeqCst);
            let _ = self
                .base
                .events
                .send(Event::RoleChanged(RoleTransition::ToViewer))
                .await;
            return;
        }

        if *sender_role == Some(NodeRole::Viewer) {
            // The master is leaving gracefully; we inherit the game.
            if self.dead.load(Ordering::SeqCst) {
                info!("DEPUTY: master left but this node is dead, staying put");
                return;
            }
            self.become_master().await;
            return;
        }

        if *sender_role == Some(NodeRole::Master) {
            if from != self.base.master_addr() {
                // Someone else won the takeover race. Follow them as NORMAL.
                info!("DEPUTY: node {} became master first, stepping back", from);
                let state = self.base.state_snapshot().map(Box::new);
                let _ = self
                    .base
                    .events
                    .send(Event::RoleChanged(RoleTransition::ToNormal {
                        state,
                        master_addr: from,
                    }))
                    .await;
                return;
            }
            // Same shape from the current master is just a confirmation.
            debug!("DEPUTY: master confirmed itself, nothing to do");
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.base.config.ping_interval();
        let timeout = self.base.config.peer_timeout();
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    if self.base.since_last_received() > timeout {
                        if !self.becoming_master.load(Ordering::SeqCst) {
                            info!(
                                "DEPUTY: master silent for {:?}, taking over",
                                self.base.since_last_received()
                            );
                            self.become_master().await;
                        }
                        return;
                    }

                    if self.base.since_last_sent() > interval {
                        self.base.send_ping().await;
                    }
                }
            }
        }
    }

    /// Rewrites the shadow state so this node is master, demotes the old
    /// master to a zombie viewer, and tells every surviving player where the
    /// game now lives. The supervisor finishes the job by starting a real
    /// MASTER role with this state and peer registry.
    async fn become_master(&self) {
        if self.becoming_master.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(mut state) = self.base.state_snapshot() else {
            warn!("DEPUTY: no state to take over with");
            let _ = self.base.events.send(Event::GameOver).await;
            return;
        };

        let master_addr = self.base.master_addr();
        let my_id = self.base.my_id;

        // The old master is found by address; role is the fallback when the
        // state never carried its address.
        let old_master_id = state
            .players
            .values()
            .find(|player| {
                player.id != my_id
                    && player_addr(player).map(|addr| addr == master_addr) == Some(true)
            })
            .map(|player| player.id);

        let demote_id = old_master_id.or_else(|| {
            state
                .players
                .values()
                .find(|player| player.id != my_id && player.role == NodeRole::Master)
                .map(|player| player.id)
        });

        if let Some(id) = demote_id {
            if let Some(player) = state.players.get_mut(&id) {
                player.role = NodeRole::Viewer;
                info!("DEPUTY: demoted old master {} to viewer", id);
            }
            if let Some(snake) = state.snakes.get_mut(&id) {
                snake.state = SnakeState::Zombie;
            }
        }

        if let Some(me) = state.players.get_mut(&my_id) {
            me.role = NodeRole::Master;
        }

        self.base.set_state(state.clone());

        for player in state.players.values() {
            if player.id == my_id || player.role == NodeRole::Viewer {
                continue;
            }
            let Some(addr) = player_addr(player) else {
                debug!("DEPUTY: player {} has no address, skipping", player.id);
                continue;
            };

            if self.peers.get(player.id).is_none() {
                self.peers
                    .add(Peer::new(player.id, player.name.clone(), addr, player.role));
            } else {
                self.peers.update_addr(player.id, addr);
            }
            self.peers.touch_received_by_id(player.id);
            self.peers.touch_sent(player.id);

            let seq = self.base.socket.next_seq();
            let msg =
                GameMessage::role_change(seq, my_id, player.id, Some(NodeRole::Master), None);
            if let Err(err) = self.base.socket.send(&msg, addr).await {
                warn!("DEPUTY: failed to notify {} of takeover: {}", addr, err);
            }
            self.base.acks.track(seq, msg, addr);
        }

        info!("DEPUTY: promoting to MASTER");
        let _ = self
            .base
            .events
            .send(Event::RoleChanged(RoleTransition::ToMaster))
            .await;
    }
}

fn player_addr(player: &shared::Player) -> Option<SocketAddr> {
    let ip = player.ip_address.as_ref()?.parse().ok()?;
    Some(SocketAddr::new(ip, player.port?))
}
