//! The plain playing role: steers its snake, follows the master, and keeps
//! enough bookkeeping to step up to deputy when appointed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, watch};

use shared::{Direction, GameConfig, GameError, GameMessage, GameState, MessageBody, NodeRole};

use crate::client::{BaseClient, RECV_DEADLINE};
use crate::events::{Event, RoleTransition};
use crate::socket::GameSocket;

pub struct NormalConfig {
    pub socket: Arc<GameSocket>,
    pub master_addr: SocketAddr,
    pub config: GameConfig,
    pub my_id: i32,
    pub events: mpsc::Sender<Event>,
    /// Present when this role is the landing spot of a failover.
    pub state: Option<GameState>,
}

pub struct Normal {
    inner: Arc<NormalInner>,
    shutdown: watch::Sender<bool>,
}

struct NormalInner {
    base: BaseClient,
    /// An appointment arrived before any state did; promote on next `State`.
    should_become_deputy: AtomicBool,
    transitioning: AtomicBool,
}

impl Normal {
    pub fn new(cfg: NormalConfig) -> Self {
        let base = BaseClient::new(
            cfg.socket,
            cfg.master_addr,
            cfg.config,
            cfg.my_id,
            cfg.events,
        );
        if let Some(state) = cfg.state {
            base.set_state(state);
        }

        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(NormalInner {
                base,
                should_become_deputy: AtomicBool::new(false),
                transitioning: AtomicBool::new(false),
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

        info!(
            "NORMAL started, id {}, master at {}",
            self.inner.base.my_id,
            self.inner.base.master_addr()
        );
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::Normal
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

    pub async fn handle_message(&self, msg: GameMessage, from: SocketAddr) {
        self.inner.handle_message(msg, from).await;
    }
}

impl NormalInner {
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
            MessageBody::Error { message } => {
                let _ = self.base.events.send(Event::Error(message.clone())).await;
            }
            _ => debug!("NORMAL: ignoring {:?} from {}", msg.body, from),
        }
    }

    async fn handle_state(&self, msg: &GameMessage, from: SocketAddr) {
        let state = self.base.apply_state(msg);
        self.base.send_ack(msg.msg_seq, from).await;
        let Some(state) = state else {
            return;
        };

        self.base.update_deputy_from_state(&state);

        let appointed_earlier = self.should_become_deputy.load(Ordering::SeqCst);
        let state_says_deputy = state
            .players
            .get(&self.base.my_id)
            .map(|player| player.role == NodeRole::Deputy)
            .unwrap_or(false);

        if (appointed_earlier || state_says_deputy) && self.try_transition() {
            info!("NORMAL: promoting to DEPUTY with fresh state");
            let _ = self
                .base
                .events
                .send(Event::RoleChanged(RoleTransition::ToDeputy {
                    state: Box::new(state),
                    master_addr: self.base.master_addr(),
                }))
                .await;
            return;
        }

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
        self.base.send_ack(msg.msg_seq, from).await;

        if *sender_role == Some(NodeRole::Master) {
            self.base.adopt_new_master(from);
        }

        if *receiver_role == Some(NodeRole::Deputy) {
            if !self.try_transition() {
                debug!("NORMAL: already transitioning, dropping duplicate appointment");
                return;
            }

            match self.base.state_snapshot() {
                Some(state) => {
                    info!("NORMAL: appointed DEPUTY, have state, promoting now");
                    let _ = self
                        .base
                        .events
                        .send(Event::RoleChanged(RoleTransition::ToDeputy {
                            state: Box::new(state),
                            master_addr: self.base.master_addr(),
                        }))
                        .await;
                }
                None => {
                    // Cannot shadow a game we have never seen; wait for the
                    // next State broadcast.
                    info!("NORMAL: appointed DEPUTY before any state, deferring");
                    self.should_become_deputy.store(true, Ordering::SeqCst);
                    self.transitioning.store(false, Ordering::SeqCst);
                }
            }
            return;
        }

        if *sender_role == Some(NodeRole::Master) {
            // New master introduced itself above; open the path right away.
            self.base.send_ping().await;
            return;
        }

        if *receiver_role == Some(NodeRole::Viewer) {
            info!("NORMAL: demoted to viewer, snake died");
            let _ = self
                .base
                .events
                .send(Event::RoleChanged(RoleTransition::ToViewer))
                .await;
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
                        info!("NORMAL: master timed out");
                        if self.base.switch_to_deputy() {
                            self.base.send_ping().await;
                        } else {
                            let _ = self.base.events.send(Event::GameOver).await;
                            return;
                        }
                    }

                    if self.base.since_last_sent() > interval {
                        self.base.send_ping().await;
                    }
                }
            }
        }
    }

    fn try_transition(&self) -> bool {
        !self.transitioning.swap(true, Ordering::SeqCst)
    }
}
