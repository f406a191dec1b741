//! The facade the UI talks to.
//!
//! The UI pushes [`UiCommand`]s in and drains [`AppEvent`]s out; nothing else
//! crosses the boundary. Internally the app owns the two sockets, the role
//! supervisor and the discovery service, and merges their event streams.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, watch};

use shared::{Direction, GameConfig, GameError, GameState, NodeRole};

use crate::discovery::{DiscoveryEvent, DiscoveryService, GameInfo};
use crate::events::Event;
use crate::socket::{GameSocket, MulticastListener};
use crate::supervisor::Supervisor;

#[derive(Debug, Clone)]
pub enum UiCommand {
    CreateGame {
        player_name: String,
        game_name: String,
        config: GameConfig,
    },
    JoinGame {
        game_index: usize,
        player_name: String,
        as_viewer: bool,
    },
    Steer(Direction),
    ExitGame,
    Quit,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    StateUpdated,
    GamesUpdated,
    JoinSuccess { player_id: i32 },
    JoinFailed(String),
    GameOver,
    Error(String),
}

pub struct App {
    supervisor: Arc<Supervisor>,
    discovery: Arc<DiscoveryService>,
    input_tx: mpsc::Sender<UiCommand>,
    shutdown: watch::Sender<bool>,

    input_rx: tokio::sync::Mutex<Option<mpsc::Receiver<UiCommand>>>,
    node_events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Event>>>,
    discovery_events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<DiscoveryEvent>>>,
    app_events_tx: mpsc::Sender<AppEvent>,
}

impl App {
    /// Binds both sockets and wires the components together. The returned
    /// receiver is the UI's event stream.
    pub async fn new() -> Result<(Arc<Self>, mpsc::Receiver<AppEvent>), GameError> {
        let socket = Arc::new(GameSocket::bind().await?);
        Self::with_socket(socket)
    }

    /// Same, but on an explicit address. Used by tests to stay on loopback.
    pub async fn new_on(ip: Ipv4Addr) -> Result<(Arc<Self>, mpsc::Receiver<AppEvent>), GameError> {
        let socket = Arc::new(GameSocket::bind_to(ip).await?);
        Self::with_socket(socket)
    }

    fn with_socket(
        socket: Arc<GameSocket>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<AppEvent>), GameError> {
        let listener = MulticastListener::bind()?;

        let (node_events_tx, node_events_rx) = mpsc::channel(100);
        let supervisor = Arc::new(Supervisor::new(socket, node_events_tx));

        let (discovery, discovery_events_rx) = DiscoveryService::new(listener);

        let (input_tx, input_rx) = mpsc::channel(100);
        let (app_events_tx, app_events_rx) = mpsc::channel(100);
        let (shutdown, _) = watch::channel(false);

        let app = Arc::new(Self {
            supervisor,
            discovery: Arc::new(discovery),
            input_tx,
            shutdown,
            input_rx: tokio::sync::Mutex::new(Some(input_rx)),
            node_events_rx: tokio::sync::Mutex::new(Some(node_events_rx)),
            discovery_events_rx: tokio::sync::Mutex::new(Some(discovery_events_rx)),
            app_events_tx,
        });

        Ok((app, app_events_rx))
    }

    pub async fn start(self: &Arc<Self>) {
        self.supervisor.start().await;
        self.discovery.start();

        if let Some(rx) = self.input_rx.lock().await.take() {
            let app = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { app.input_loop(rx, shutdown).await });
        }

        let node_rx = self.node_events_rx.lock().await.take();
        let discovery_rx = self.discovery_events_rx.lock().await.take();
        if let (Some(node_rx), Some(discovery_rx)) = (node_rx, discovery_rx) {
            let app = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move { app.event_loop(node_rx, discovery_rx, shutdown).await });
        }

        info!("App started");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.supervisor.stop().await;
        self.discovery.stop();
    }

    /// The UI's command entry point.
    pub fn input(&self) -> mpsc::Sender<UiCommand> {
        self.input_tx.clone()
    }

    pub async fn state(&self) -> Option<GameState> {
        self.supervisor.state_snapshot().await
    }

    pub fn games(&self) -> Vec<GameInfo> {
        self.discovery.games()
    }

    pub async fn current_role(&self) -> Option<NodeRole> {
        self.supervisor.current_role().await
    }

    pub fn my_id(&self) -> i32 {
        self.supervisor.my_id()
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    async fn input_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<UiCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                command = rx.recv() => {
                    let Some(command) = command else { return };
                    self.handle_command(command).await;
                }
            }
        }
    }

    async fn handle_command(&self, command: UiCommand) {
        match command {
            UiCommand::CreateGame {
                player_name,
                game_name,
                config,
            } => {
                if let Err(err) = self
                    .supervisor
                    .create_game(&player_name, &game_name, config)
                    .await
                {
                    warn!("Failed to create game: {}", err);
                    let _ = self.app_events_tx.try_send(AppEvent::Error(err.to_string()));
                } else {
                    let _ = self.app_events_tx.try_send(AppEvent::StateUpdated);
                }
            }

            UiCommand::JoinGame {
                game_index,
                player_name,
                as_viewer,
            } => {
                let games = self.discovery.games();
                let Some(game) = games.get(game_index) else {
                    let _ = self
                        .app_events_tx
                        .try_send(AppEvent::JoinFailed("invalid game selection".to_string()));
                    return;
                };

                if let Err(err) = self
                    .supervisor
                    .join_game(
                        game.master_addr,
                        &player_name,
                        &game.name,
                        game.config,
                        as_viewer,
                    )
                    .await
                {
                    warn!("Failed to join game: {}", err);
                }
                // JoinSuccess / JoinFailed arrive through the event stream.
            }

            UiCommand::Steer(direction) => {
                if let Err(err) = self.supervisor.send_steer(direction).await {
                    warn!("Failed to send steer: {}", err);
                }
            }

            UiCommand::ExitGame => self.supervisor.exit_game().await,

            UiCommand::Quit => self.stop().await,
        }
    }

    /// Merges role events and discovery events into the UI stream.
    async fn event_loop(
        self: Arc<Self>,
        mut node_rx: mpsc::Receiver<Event>,
        mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                event = node_rx.recv() => {
                    let Some(event) = event else { return };
                    self.forward_node_event(event);
                }
                event = discovery_rx.recv() => {
                    let Some(event) = event else { return };
                    match event {
                        DiscoveryEvent::GamesUpdated => {
                            let _ = self.app_events_tx.try_send(AppEvent::GamesUpdated);
                        }
                    }
                }
            }
        }
    }

    fn forward_node_event(&self, event: Event) {
        let forwarded = match event {
            Event::StateUpdated => Some(AppEvent::StateUpdated),
            Event::PlayerJoined(id) => {
                info!("Player {} joined", id);
                None
            }
            Event::PlayerLeft(id) => {
                info!("Player {} left", id);
                None
            }
            Event::RoleChanged(_) => None,
            Event::JoinSuccess { player_id } => Some(AppEvent::JoinSuccess { player_id }),
            Event::JoinFailed(message) => Some(AppEvent::JoinFailed(message)),
            Event::GameOver => Some(AppEvent::GameOver),
            Event::Error(message) => Some(AppEvent::Error(message)),
        };

        if let Some(event) = forwarded {
            let _ = self.app_events_tx.try_send(event);
        }
    }
}
