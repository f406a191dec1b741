//! Events flowing from the active role to the supervisor.
//!
//! Roles never call back into the supervisor; they push an [`Event`] into a
//! channel and the supervisor's forwarder reacts. This keeps the role and the
//! supervisor free of reference cycles and makes transitions serialisable.

use std::net::SocketAddr;

use shared::GameState;

#[derive(Debug, Clone)]
pub enum Event {
    /// The observable game state changed; readers should re-fetch a snapshot.
    StateUpdated,
    PlayerJoined(i32),
    PlayerLeft(i32),
    /// The local node must change role; the supervisor executes it.
    RoleChanged(RoleTransition),
    JoinSuccess { player_id: i32 },
    JoinFailed(String),
    GameOver,
    Error(String),
}

/// What to become, plus whatever the next role cannot recover on its own.
#[derive(Debug, Clone)]
pub enum RoleTransition {
    /// Deputy promotes itself; state and peers carry over from the deputy.
    ToMaster,
    /// A normal player was appointed deputy. It already holds the state.
    ToDeputy {
        state: Box<GameState>,
        master_addr: SocketAddr,
    },
    /// A different node won the master race; re-target as a plain player.
    ToNormal {
        state: Option<Box<GameState>>,
        master_addr: SocketAddr,
    },
    /// The local snake died or the master handed off; keep watching.
    ToViewer,
}
