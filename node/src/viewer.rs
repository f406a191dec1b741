//! The observer role: receives states, steers nothing.
//!
//! A viewer is a normal client with the steering surface removed and a far
//! more patient master timeout. It follows failovers the same way players do,
//! falling back to the advertised deputy when the master goes quiet.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info};
use tokio::sync::{mpsc, watch};

use shared::{Direction, GameConfig, GameError, GameMessage, GameState, MessageBody, NodeRole};

use crate::client::{BaseClient, RECV_DEADLINE};
use crate::events::Event;
use crate::socket::GameSocket;

pub struct ViewerConfig {
    pub socket: Arc<GameSocket>,
    pub master_addr: SocketAddr,
    pub config: GameConfig,
    pub my_id: i32,
    pub events: mpsc::Sender<Event>,
    /// Carried over when a former player keeps watching.
    pub state: Option<GameState>,
}

pub struct Viewer {
    inner: Arc<ViewerInner>,
    shutdown: watch::Sender<bool>,
}

struct ViewerInner {
    base: BaseClient,
}

impl Viewer {
    pub fn new(cfg: ViewerConfig) -> Self {
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
            inner: Arc::new(ViewerInner { base }),
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
            "VIEWER started, watching master at {}",
            self.inner.base.master_addr()
        );
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::Viewer
    }

    pub fn state_snapshot(&self) -> Option<GameState> {
        self.inner.base.state_snapshot()
    }

    /// Viewers have no snake; steering is accepted and discarded.
    pub async fn send_steer(&self, _direction: Direction) -> Result<(), GameError> {
        Ok(())
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

impl ViewerInner {
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
                info!("VIEWER: session ended by master: {}", message);
                self.base.send_ack(msg.msg_seq, from).await;
                let _ = self.base.events.send(Event::GameOver).await;
            }
            _ => debug!("VIEWER: ignoring {:?} from {}", msg.body, from),
        }
    }

    async fn handle_state(&self, msg: &GameMessage, from: SocketAddr) {
        let state = self.base.apply_state(msg);
        self.base.send_ack(msg.msg_seq, from).await;
        let Some(state) = state else {
            return;
        };

        self.base.update_deputy_from_state(&state);
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
            self.base.send_ping().await;
            return;
        }

        if *receiver_role == Some(NodeRole::Viewer) {
            debug!("VIEWER: role confirmed");
        }
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.base.config.ping_interval();
        let timeout = self.base.config.viewer_master_timeout();
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    if self.base.since_last_received() > timeout {
                        if self.base.switch_to_deputy() {
                            self.base.send_ping().await;
                        } else {
                            info!("VIEWER: master gone and no deputy, game over");
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn viewer(master_addr: SocketAddr) -> (Viewer, mpsc::Receiver<Event>) {
        let socket = Arc::new(GameSocket::bind_to(Ipv4Addr::LOCALHOST).await.unwrap());
        let (tx, rx) = mpsc::channel(100);
        let role = Viewer::new(ViewerConfig {
            socket,
            master_addr,
            config: GameConfig::default(),
            my_id: 4,
            events: tx,
            state: None,
        });
        (role, rx)
    }

    #[tokio::test]
    async fn test_error_from_master_ends_the_session() {
        let master: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (role, mut events) = viewer(master).await;

        role.handle_message(GameMessage::error(20, "Game Over - no players left"), master)
            .await;

        match events.recv().await.unwrap() {
            Event::GameOver => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_state_updates_are_forwarded() {
        let master: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (role, mut events) = viewer(master).await;

        let mut state = GameState::new(GameConfig::default());
        state.state_order = 1;
        role.handle_message(GameMessage::state(21, state), master).await;

        match events.recv().await.unwrap() {
            Event::StateUpdated => {}
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(role.state_snapshot().unwrap().state_order, 1);
    }

    #[tokio::test]
    async fn test_steer_is_a_noop() {
        let master: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (role, _events) = viewer(master).await;
        assert!(role.send_steer(Direction::Up).await.is_ok());
    }
}
