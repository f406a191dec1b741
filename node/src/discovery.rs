//! Discovery of running games via the multicast announcement channel.
//!
//! Completely independent of the role machinery: it only ingests
//! `Announcement` messages and keeps a TTL-bounded directory for the UI's
//! lobby screen. The directory logic is a plain struct so it can be driven
//! without sockets; the service wraps it with the multicast listener and the
//! periodic eviction task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::sync::{mpsc, watch};

use shared::{AnnouncedGame, GameConfig, MessageBody};

use crate::socket::MulticastListener;

/// A directory entry is dropped after this much silence from its master.
pub const ANNOUNCEMENT_TTL: Duration = Duration::from_secs(3);
/// How often the eviction sweep runs.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct GameInfo {
    pub name: String,
    pub player_count: usize,
    pub config: GameConfig,
    pub can_join: bool,
    pub master_addr: SocketAddr,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    GamesUpdated,
}

/// The directory itself, free of any I/O.
#[derive(Default)]
pub struct GameDirectory {
    games: HashMap<String, GameInfo>,
}

impl GameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes entries from one announcement. Returns whether
    /// anything the UI shows actually changed.
    pub fn upsert(&mut self, games: &[AnnouncedGame], from: SocketAddr, now: Instant) -> bool {
        let mut updated = false;

        for game in games {
            let info = GameInfo {
                name: game.game_name.clone(),
                player_count: game.players.len(),
                config: game.config,
                can_join: game.can_join,
                master_addr: from,
                last_seen: now,
            };

            match self.games.get(&game.game_name) {
                Some(existing) => {
                    if existing.player_count != info.player_count
                        || existing.can_join != info.can_join
                        || existing.master_addr != info.master_addr
                    {
                        updated = true;
                    }
                }
                None => {
                    info!("Discovered game '{}' at {}", game.game_name, from);
                    updated = true;
                }
            }

            self.games.insert(game.game_name.clone(), info);
        }

        updated
    }

    /// Drops every entry not refreshed within the TTL. Returns whether
    /// anything was evicted.
    pub fn evict_stale(&mut self, now: Instant) -> bool {
        let before = self.games.len();
        self.games.retain(|name, game| {
            let keep = now.duration_since(game.last_seen) <= ANNOUNCEMENT_TTL;
            if !keep {
                info!("Game '{}' disappeared", name);
            }
            keep
        });
        before != self.games.len()
    }

    /// Stable listing for the lobby: the UI joins by index, so the order
    /// must not shuffle between calls.
    pub fn list(&self) -> Vec<GameInfo> {
        let mut games: Vec<GameInfo> = self.games.values().cloned().collect();
        games.sort_by(|a, b| a.name.cmp(&b.name));
        games
    }

    pub fn get(&self, name: &str) -> Option<GameInfo> {
        self.games.get(name).cloned()
    }
}

pub struct DiscoveryService {
    inner: Arc<DiscoveryInner>,
    shutdown: watch::Sender<bool>,
}

struct DiscoveryInner {
    listener: MulticastListener,
    directory: Mutex<GameDirectory>,
    events: mpsc::Sender<DiscoveryEvent>,
}

impl DiscoveryService {
    pub fn new(listener: MulticastListener) -> (Self, mpsc::Receiver<DiscoveryEvent>) {
        let (events, events_rx) = mpsc::channel(10);
        let (shutdown, _) = watch::channel(false);

        (
            Self {
                inner: Arc::new(DiscoveryInner {
                    listener,
                    directory: Mutex::new(GameDirectory::new()),
                    events,
                }),
                shutdown,
            },
            events_rx,
        )
    }

    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.receive_loop(rx).await });

        let inner = Arc::clone(&self.inner);
        let rx = self.shutdown.subscribe();
        tokio::spawn(async move { inner.cleanup_loop(rx).await });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn games(&self) -> Vec<GameInfo> {
        self.inner.directory.lock().unwrap().list()
    }

    pub fn get(&self, name: &str) -> Option<GameInfo> {
        self.inner.directory.lock().unwrap().get(name)
    }
}

impl DiscoveryInner {
    async fn receive_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        debug!("Discovery receive loop started");
        loop {
            if *shutdown.borrow() {
                return;
            }
            let Some((msg, from)) = self.listener.recv(Duration::from_millis(500)).await else {
                continue;
            };

            if let MessageBody::Announcement { games } = &msg.body {
                let updated = self
                    .directory
                    .lock()
                    .unwrap()
                    .upsert(games, from, Instant::now());
                if updated {
                    let _ = self.events.try_send(DiscoveryEvent::GamesUpdated);
                }
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {
                    let evicted = self
                        .directory
                        .lock()
                        .unwrap()
                        .evict_stale(Instant::now());
                    if evicted {
                        let _ = self.events.try_send(DiscoveryEvent::GamesUpdated);
                    }
                }
            }
        }
    }
}
