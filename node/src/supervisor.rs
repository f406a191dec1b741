//! The role supervisor: the only holder of the active role.
//!
//! All role changes funnel through here. Roles announce what should happen by
//! emitting [`Event::RoleChanged`]; the forwarder task executes the
//! transition (atomically stopping the old role and starting the new one) and
//! passes every event on to the outside world.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{mpsc, watch};

use shared::{
    Direction, GameConfig, GameError, GameMessage, GameState, MessageBody, NodeRole, Player,
};

use crate::deputy::{Deputy, DeputyConfig};
use crate::events::{Event, RoleTransition};
use crate::master::{Master, MasterConfig};
use crate::normal::{Normal, NormalConfig};
use crate::peers::{Peer, PeerRegistry};
use crate::socket::GameSocket;
use crate::viewer::{Viewer, ViewerConfig};

/// Per-attempt wait and attempt count for the synchronous join handshake.
const JOIN_ATTEMPTS: u32 = 10;
const JOIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// The one role this node currently plays.
pub enum ActiveRole {
    Master(Master),
    Deputy(Deputy),
    Normal(Normal),
    Viewer(Viewer),
}

impl ActiveRole {
    pub fn role(&self) -> NodeRole {
        match self {
            ActiveRole::Master(_) => NodeRole::Master,
            ActiveRole::Deputy(_) => NodeRole::Deputy,
            ActiveRole::Normal(_) => NodeRole::Normal,
            ActiveRole::Viewer(_) => NodeRole::Viewer,
        }
    }

    pub async fn stop(&self) {
        match self {
            ActiveRole::Master(role) => role.stop().await,
            ActiveRole::Deputy(role) => role.stop().await,
            ActiveRole::Normal(role) => role.stop().await,
            ActiveRole::Viewer(role) => role.stop().await,
        }
    }

    pub fn state_snapshot(&self) -> Option<GameState> {
        match self {
            ActiveRole::Master(role) => Some(role.state_snapshot()),
            ActiveRole::Deputy(role) => role.state_snapshot(),
            ActiveRole::Normal(role) => role.state_snapshot(),
            ActiveRole::Viewer(role) => role.state_snapshot(),
        }
    }

    pub async fn send_steer(&self, direction: Direction) -> Result<(), GameError> {
        match self {
            ActiveRole::Master(role) => role.send_steer(direction).await,
            ActiveRole::Deputy(role) => role.send_steer(direction).await,
            ActiveRole::Normal(role) => role.send_steer(direction).await,
            ActiveRole::Viewer(role) => role.send_steer(direction).await,
        }
    }
}

#[derive(Default)]
struct Profile {
    my_id: i32,
    player_name: String,
    game_name: String,
    config: Option<GameConfig>,
    master_addr: Option<SocketAddr>,
}

pub struct Supervisor {
    inner: Arc<SupervisorInner>,
    shutdown: watch::Sender<bool>,
}

struct SupervisorInner {
    socket: Arc<GameSocket>,
    current: tokio::sync::Mutex<Option<ActiveRole>>,
    role_events_tx: mpsc::Sender<Event>,
    role_events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Event>>>,
    forward_tx: mpsc::Sender<Event>,
    profile: Mutex<Profile>,
}

impl Supervisor {
    /// `forward_tx` receives a copy of every role event after the supervisor
    /// has reacted to it.
    pub fn new(socket: Arc<GameSocket>, forward_tx: mpsc::Sender<Event>) -> Self {
        let (role_events_tx, role_events_rx) = mpsc::channel(100);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(SupervisorInner {
                socket,
                current: tokio::sync::Mutex::new(None),
                role_events_tx,
                role_events_rx: tokio::sync::Mutex::new(Some(role_events_rx)),
                forward_tx,
                profile: Mutex::new(Profile::default()),
            }),
            shutdown,
        }
    }

    /// Starts the event forwarder. Must run before any role is started.
    pub async fn start(&self) {
        let Some(rx) = self.inner.role_events_rx.lock().await.take() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { inner.forwarder(rx, shutdown).await });
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut current = self.inner.current.lock().await;
        if let Some(role) = current.take() {
            role.stop().await;
        }
    }

    /// Starts a brand-new game with this node as id 1 and MASTER.
    pub async fn create_game(
        &self,
        player_name: &str,
        game_name: &str,
        config: GameConfig,
    ) -> Result<(), GameError> {
        config.validate()?;

        let mut current = self.inner.current.lock().await;
        if let Some(role) = current.take() {
            role.stop().await;
        }

        let my_id = 1;
        let mut state = GameState::new(config);
        state
            .players
            .insert(my_id, Player::new(my_id, player_name, NodeRole::Master));
        if !state.spawn_snake(my_id) {
            return Err(GameError::NoSpawnSpace);
        }
        state.ensure_food();

        {
            let mut profile = self.inner.profile.lock().unwrap();
            profile.my_id = my_id;
            profile.player_name = player_name.to_string();
            profile.game_name = game_name.to_string();
            profile.config = Some(config);
            profile.master_addr = None;
        }

        info!("Creating game '{}' as '{}'", game_name, player_name);

        let master = Master::new(MasterConfig {
            socket: Arc::clone(&self.inner.socket),
            state,
            my_id,
            game_name: game_name.to_string(),
            events: self.inner.role_events_tx.clone(),
            peers: PeerRegistry::new(),
        });
        master.start().await;
        *current = Some(ActiveRole::Master(master));

        Ok(())
    }

    /// Joins a discovered game: sends `Join` and synchronously waits for the
    /// matching ack carrying our assigned player id. Announcements, states
    /// and role changes arriving in this window are ignored.
    pub async fn join_game(
        &self,
        master_addr: SocketAddr,
        player_name: &str,
        game_name: &str,
        config: GameConfig,
        as_viewer: bool,
    ) -> Result<i32, GameError> {
        config.validate()?;

        let mut current = self.inner.current.lock().await;
        if let Some(role) = current.take() {
            role.stop().await;
        }

        {
            let mut profile = self.inner.profile.lock().unwrap();
            profile.player_name = player_name.to_string();
            profile.game_name = game_name.to_string();
            profile.config = Some(config);
            profile.master_addr = Some(master_addr);
        }

        let requested_role = if as_viewer {
            NodeRole::Viewer
        } else {
            NodeRole::Normal
        };
        let seq = self.inner.socket.next_seq();
        let join = GameMessage::join(seq, player_name, game_name, requested_role);

        info!(
            "Joining game '{}' at {} (seq {})",
            game_name, master_addr, seq
        );
        self.inner.socket.send(&join, master_addr).await?;

        for attempt in 0..JOIN_ATTEMPTS {
            let Some((msg, from)) = self.inner.socket.recv(JOIN_ATTEMPT_TIMEOUT).await else {
                info!("Join attempt {} timed out, resending", attempt + 1);
                let _ = self.inner.socket.send(&join, master_addr).await;
                continue;
            };

            match &msg.body {
                MessageBody::Ack if msg.msg_seq == seq => {
                    let my_id = msg.receiver_id.unwrap_or(0);
                    {
                        let mut profile = self.inner.profile.lock().unwrap();
                        profile.my_id = my_id;
                        profile.master_addr = Some(from);
                    }
                    info!("Joined game '{}', assigned id {}", game_name, my_id);

                    let role = if as_viewer {
                        let viewer = Viewer::new(ViewerConfig {
                            socket: Arc::clone(&self.inner.socket),
                            master_addr,
                            config,
                            my_id,
                            events: self.inner.role_events_tx.clone(),
                            state: None,
                        });
                        viewer.start().await;
                        ActiveRole::Viewer(viewer)
                    } else {
                        let normal = Normal::new(NormalConfig {
                            socket: Arc::clone(&self.inner.socket),
                            master_addr,
                            config,
                            my_id,
                            events: self.inner.role_events_tx.clone(),
                            state: None,
                        });
                        normal.start().await;
                        ActiveRole::Normal(normal)
                    };
                    *current = Some(role);

                    let _ = self
                        .inner
                        .forward_tx
                        .try_send(Event::JoinSuccess { player_id: my_id });
                    return Ok(my_id);
                }
                MessageBody::Error { message } => {
                    let _ = self
                        .inner
                        .forward_tx
                        .try_send(Event::JoinFailed(message.clone()));
                    return Err(GameError::JoinRejected(message.clone()));
                }
                _ => {}
            }
        }

        let _ = self
            .inner
            .forward_tx
            .try_send(Event::JoinFailed("join timed out".to_string()));
        Err(GameError::JoinTimeout)
    }

    pub async fn send_steer(&self, direction: Direction) -> Result<(), GameError> {
        let current = self.inner.current.lock().await;
        match current.as_ref() {
            Some(role) => role.send_steer(direction).await,
            None => Ok(()),
        }
    }

    /// Leaves the current game. A master hands the game to its deputy (and
    /// keeps watching as a viewer); everyone else announces the exit and
    /// drops out.
    pub async fn exit_game(&self) {
        let mut current = self.inner.current.lock().await;
        let mut follow_up = None;

        match current.as_ref() {
            Some(ActiveRole::Master(master)) => {
                let had_deputy = master.handoff_addr().is_some();
                master.stop().await;
                follow_up = Some(if had_deputy {
                    Event::RoleChanged(RoleTransition::ToViewer)
                } else {
                    Event::GameOver
                });
            }
            Some(ActiveRole::Deputy(_)) | Some(ActiveRole::Normal(_))
            | Some(ActiveRole::Viewer(_)) => {
                if let Some(role) = current.take() {
                    match &role {
                        ActiveRole::Deputy(deputy) => deputy.announce_exit().await,
                        ActiveRole::Normal(normal) => normal.announce_exit().await,
                        ActiveRole::Viewer(viewer) => viewer.announce_exit().await,
                        ActiveRole::Master(_) => {}
                    }
                    role.stop().await;
                }
            }
            None => {}
        }
        drop(current);

        // Handled by the forwarder, which needs the lock we just released.
        if let Some(event) = follow_up {
            let _ = self.inner.role_events_tx.send(event).await;
        }
    }

    pub async fn state_snapshot(&self) -> Option<GameState> {
        let current = self.inner.current.lock().await;
        current.as_ref().and_then(|role| role.state_snapshot())
    }

    pub async fn current_role(&self) -> Option<NodeRole> {
        let current = self.inner.current.lock().await;
        current.as_ref().map(|role| role.role())
    }

    pub fn my_id(&self) -> i32 {
        self.inner.profile.lock().unwrap().my_id
    }
}

impl SupervisorInner {
    async fn forwarder(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Event>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                event = rx.recv() => {
                    let Some(event) = event else { return };

                    match &event {
                        Event::RoleChanged(transition) => {
                            self.execute_transition(transition.clone()).await;
                        }
                        Event::GameOver => {
                            let mut current = self.current.lock().await;
                            if let Some(role) = current.take() {
                                role.stop().await;
                            }
                            info!("Supervisor: game over, role discarded");
                        }
                        _ => {}
                    }

                    // Outward mirror is best effort; a stalled UI must not
                    // stall the role machinery.
                    if self.forward_tx.try_send(event).is_err() {
                        warn!("External event channel full, dropping event");
                    }
                }
            }
        }
    }

    async fn execute_transition(&self, transition: RoleTransition) {
        match transition {
            RoleTransition::ToMaster => self.transition_to_master().await,
            RoleTransition::ToDeputy { state, master_addr } => {
                self.transition_to_deputy(*state, master_addr).await;
            }
            RoleTransition::ToNormal { state, master_addr } => {
                self.transition_to_normal(state.map(|b| *b), master_addr).await;
            }
            RoleTransition::ToViewer => self.transition_to_viewer().await,
        }
    }

    /// Deputy takeover: the shadow state and peer registry carry over,
    /// skipping viewers and the late master.
    async fn transition_to_master(&self) {
        let mut current = self.current.lock().await;

        let (state, known_peers) = match current.as_ref() {
            Some(ActiveRole::Deputy(deputy)) => (deputy.state_snapshot(), deputy.known_peers()),
            other => {
                warn!(
                    "Supervisor: ToMaster from {:?} role, ignoring",
                    other.as_ref().map(|r| r.role())
                );
                return;
            }
        };
        let Some(mut state) = state else {
            warn!("Supervisor: no state for master transition");
            return;
        };

        if let Some(role) = current.take() {
            role.stop().await;
        }

        let (my_id, game_name) = {
            let profile = self.profile.lock().unwrap();
            (profile.my_id, profile.game_name.clone())
        };

        if let Some(me) = state.players.get_mut(&my_id) {
            me.role = NodeRole::Master;
        }

        let peers = PeerRegistry::new();
        for peer in known_peers {
            match state.players.get(&peer.id) {
                None => info!("Supervisor: dropping peer {} not in state", peer.id),
                Some(player) if player.role == NodeRole::Viewer => {}
                Some(player) if player.role == NodeRole::Master && player.id != my_id => {}
                Some(player) => {
                    // Fresh liveness stamps: the grace period covers re-entry.
                    peers.add(Peer::new(peer.id, peer.name, peer.addr, player.role));
                }
            }
        }

        info!("Supervisor: transitioning to MASTER");
        let master = Master::new(MasterConfig {
            socket: Arc::clone(&self.socket),
            state,
            my_id,
            game_name,
            events: self.role_events_tx.clone(),
            peers,
        });
        master.start().await;
        *current = Some(ActiveRole::Master(master));
    }

    async fn transition_to_deputy(&self, state: GameState, master_addr: SocketAddr) {
        let mut current = self.current.lock().await;
        if let Some(role) = current.take() {
            role.stop().await;
        }

        let my_id = {
            let mut profile = self.profile.lock().unwrap();
            profile.master_addr = Some(master_addr);
            profile.my_id
        };

        info!("Supervisor: transitioning to DEPUTY, master at {}", master_addr);
        let config = state.config;
        let deputy = Deputy::new(DeputyConfig {
            socket: Arc::clone(&self.socket),
            master_addr,
            config,
            state,
            my_id,
            events: self.role_events_tx.clone(),
        });
        deputy.start().await;
        *current = Some(ActiveRole::Deputy(deputy));
    }

    async fn transition_to_normal(&self, state: Option<GameState>, master_addr: SocketAddr) {
        let mut current = self.current.lock().await;
        if let Some(role) = current.take() {
            role.stop().await;
        }

        let (my_id, config) = {
            let mut profile = self.profile.lock().unwrap();
            profile.master_addr = Some(master_addr);
            let config = state
                .as_ref()
                .map(|s| s.config)
                .or(profile.config)
                .unwrap_or_default();
            (profile.my_id, config)
        };

        info!("Supervisor: transitioning to NORMAL, master at {}", master_addr);
        let normal = Normal::new(NormalConfig {
            socket: Arc::clone(&self.socket),
            master_addr,
            config,
            my_id,
            events: self.role_events_tx.clone(),
            state,
        });
        normal.start().await;
        *current = Some(ActiveRole::Normal(normal));
    }

    /// Stepping down: the master follows its deputy, clients keep following
    /// whoever they already track.
    async fn transition_to_viewer(&self) {
        let mut current = self.current.lock().await;

        let (master_addr, state) = match current.as_ref() {
            Some(ActiveRole::Master(master)) => {
                (master.handoff_addr(), Some(master.state_snapshot()))
            }
            Some(ActiveRole::Deputy(deputy)) => {
                (Some(deputy.master_addr()), deputy.state_snapshot())
            }
            Some(ActiveRole::Normal(normal)) => {
                (Some(normal.master_addr()), normal.state_snapshot())
            }
            Some(ActiveRole::Viewer(viewer)) => {
                (Some(viewer.master_addr()), viewer.state_snapshot())
            }
            None => (None, None),
        };

        if let Some(role) = current.take() {
            role.stop().await;
        }

        let Some(master_addr) = master_addr else {
            info!("Supervisor: no master to watch, back to the menu");
            let _ = self.forward_tx.try_send(Event::GameOver);
            return;
        };

        let (my_id, config) = {
            let mut profile = self.profile.lock().unwrap();
            profile.master_addr = Some(master_addr);
            let config = state
                .as_ref()
                .map(|s| s.config)
                .or(profile.config)
                .unwrap_or_default();
            (profile.my_id, config)
        };

        info!("Supervisor: transitioning to VIEWER, master at {}", master_addr);
        let viewer = Viewer::new(ViewerConfig {
            socket: Arc::clone(&self.socket),
            master_addr,
            config,
            my_id,
            events: self.role_events_tx.clone(),
            state,
        });
        viewer.start().await;
        *current = Some(ActiveRole::Viewer(viewer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn supervisor() -> (Supervisor, mpsc::Receiver<Event>) {
        let socket = Arc::new(GameSocket::bind_to(Ipv4Addr::LOCALHOST).await.unwrap());
        let (tx, rx) = mpsc::channel(100);
        let supervisor = Supervisor::new(socket, tx);
        supervisor.start().await;
        (supervisor, rx)
    }

    fn config() -> GameConfig {
        GameConfig {
            width: 20,
            height: 15,
            food_static: 3,
            state_delay_ms: 200,
        }
    }

    #[tokio::test]
    async fn test_create_game_initialises_master_state() {
        let (supervisor, _rx) = supervisor().await;
        supervisor
            .create_game("alice", "den", config())
            .await
            .unwrap();

        assert_eq!(supervisor.current_role().await, Some(NodeRole::Master));
        assert_eq!(supervisor.my_id(), 1);

        let state = supervisor.state_snapshot().await.unwrap();
        assert_eq!(state.state_order, 0);
        assert_eq!(state.players.len(), 1);
        assert_eq!(state.players[&1].role, NodeRole::Master);
        assert_eq!(state.players[&1].score, 0);
        assert_eq!(state.snakes[&1].len(&state.field), 2);
        // One static food per config plus one for the living snake.
        assert_eq!(state.foods.len(), state.config.food_static as usize + 1);

        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_create_game_rejects_invalid_config() {
        let (supervisor, _rx) = supervisor().await;
        let mut bad = config();
        bad.width = 5;

        let result = supervisor.create_game("alice", "den", bad).await;
        assert!(matches!(result, Err(GameError::InvalidConfig(_))));
        assert_eq!(supervisor.current_role().await, None);
    }

    #[tokio::test]
    async fn test_steer_without_role_is_quietly_accepted() {
        let (supervisor, _rx) = supervisor().await;
        assert!(supervisor.send_steer(Direction::Up).await.is_ok());
    }
}
