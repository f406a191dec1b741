//! # Shared Game Library
//!
//! This crate contains everything every node in the distributed Snake game
//! must agree on, whatever role it currently plays. It serves the
//! same purpose for the peer-to-peer swarm that a shared crate serves in a
//! client/server split: one definition of the world, one definition of the
//! wire format.
//!
//! ## Core Components
//!
//! ### Game Domain
//! - **Field**: toroidal board with wrap-around coordinate arithmetic
//! - **Snake**: compact offset-encoded body with movement and growth rules
//! - **GameState**: players, snakes, foods and the authoritative tick engine
//!
//! ### Network Protocol
//! The [`protocol::GameMessage`] envelope defines the complete communication
//! protocol between peers: keepalives, steering, state broadcasts, game
//! announcements, join handshakes and role reassignment.
//!
//! ## Design Philosophy
//!
//! ### Deterministic Simulation
//! Only the current master runs the tick, but any deputy must be able to pick
//! the simulation up mid-game from a `State` message alone. All game logic is
//! therefore pure integer arithmetic over plain data: no floats, no hidden
//! clock.
//!
//! ### Serialization
//! All wire-visible structures implement `Serialize` and `Deserialize` for
//! binary encoding via the `bincode` crate. bincode produces identical bytes
//! for identical values on every platform, which the swarm relies on: every
//! peer parses the same stream.

pub mod error;
pub mod field;
pub mod protocol;
pub mod snake;
pub mod state;

pub use error::GameError;
pub use field::{Coord, Direction, Field};
pub use protocol::{AnnouncedGame, GameMessage, MessageBody};
pub use snake::{Snake, SnakeState};
pub use state::{GameConfig, GameState, NodeRole, Player, PlayerType, TickResult};
