//! Network protocol for peer-to-peer communication.
//!
//! Every UDP datagram carries exactly one [`GameMessage`] envelope, encoded
//! with `bincode`. The envelope's `msg_seq` is monotone per sending socket;
//! any message that expects an [`MessageBody::Ack`] is retransmitted until
//! one arrives carrying the same sequence number.
//!
//! ## Message Catalogue
//!
//! | body | direction | purpose |
//! |------|-----------|---------|
//! | `Ping` | any -> any | keepalive, must be acked |
//! | `Ack` | any -> any | acknowledges `msg_seq`; `receiver_id` carries the assigned id when answering a `Join` |
//! | `Steer` | client -> master | request to turn the sender's snake |
//! | `State` | master -> peers | full authoritative state, every tick |
//! | `Announcement` | master -> multicast | running-game advertisement, every second |
//! | `Join` | new node -> master | request to enter a game |
//! | `Error` | master -> peer | rejection or session end |
//! | `RoleChange` | any -> any | reassigns the sender's or receiver's role |
//! | `Discover` | any -> multicast | solicits an immediate unicast `Announcement` |

use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::field::Direction;
use crate::state::{GameConfig, GameState, NodeRole, Player, PlayerType};

/// One game as described in an [`MessageBody::Announcement`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncedGame {
    pub game_name: String,
    /// Non-viewer players only.
    pub players: Vec<Player>,
    pub config: GameConfig,
    pub can_join: bool,
}

/// Envelope shared by every message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMessage {
    pub msg_seq: i64,
    pub sender_id: Option<i32>,
    pub receiver_id: Option<i32>,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Ping,
    Ack,
    Steer {
        direction: Direction,
    },
    State {
        state: GameState,
    },
    Announcement {
        games: Vec<AnnouncedGame>,
    },
    Join {
        player_type: PlayerType,
        player_name: String,
        game_name: String,
        requested_role: NodeRole,
    },
    Error {
        message: String,
    },
    RoleChange {
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    },
    Discover,
}

impl GameMessage {
    pub fn ping(msg_seq: i64, sender_id: i32) -> Self {
        Self {
            msg_seq,
            sender_id: Some(sender_id),
            receiver_id: None,
            body: MessageBody::Ping,
        }
    }

    pub fn ack(msg_seq: i64, sender_id: i32, receiver_id: i32) -> Self {
        Self {
            msg_seq,
            sender_id: Some(sender_id),
            receiver_id: Some(receiver_id),
            body: MessageBody::Ack,
        }
    }

    pub fn steer(msg_seq: i64, sender_id: i32, direction: Direction) -> Self {
        Self {
            msg_seq,
            sender_id: Some(sender_id),
            receiver_id: None,
            body: MessageBody::Steer { direction },
        }
    }

    pub fn state(msg_seq: i64, state: GameState) -> Self {
        Self {
            msg_seq,
            sender_id: None,
            receiver_id: None,
            body: MessageBody::State { state },
        }
    }

    /// Builds the advertisement for a single running game. Viewers are not
    /// listed; `can_join` reflects whether a spawn search currently succeeds.
    pub fn announcement(msg_seq: i64, game_name: &str, state: &GameState, can_join: bool) -> Self {
        let players = state
            .players
            .values()
            .filter(|p| p.role != NodeRole::Viewer)
            .cloned()
            .collect();

        Self {
            msg_seq,
            sender_id: None,
            receiver_id: None,
            body: MessageBody::Announcement {
                games: vec![AnnouncedGame {
                    game_name: game_name.to_string(),
                    players,
                    config: state.config,
                    can_join,
                }],
            },
        }
    }

    pub fn join(msg_seq: i64, player_name: &str, game_name: &str, requested_role: NodeRole) -> Self {
        Self {
            msg_seq,
            sender_id: None,
            receiver_id: None,
            body: MessageBody::Join {
                player_type: PlayerType::Human,
                player_name: player_name.to_string(),
                game_name: game_name.to_string(),
                requested_role,
            },
        }
    }

    pub fn error(msg_seq: i64, message: &str) -> Self {
        Self {
            msg_seq,
            sender_id: None,
            receiver_id: None,
            body: MessageBody::Error {
                message: message.to_string(),
            },
        }
    }

    pub fn role_change(
        msg_seq: i64,
        sender_id: i32,
        receiver_id: i32,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
    ) -> Self {
        Self {
            msg_seq,
            sender_id: Some(sender_id),
            receiver_id: Some(receiver_id),
            body: MessageBody::RoleChange {
                sender_role,
                receiver_role,
            },
        }
    }

    pub fn discover(msg_seq: i64) -> Self {
        Self {
            msg_seq,
            sender_id: None,
            receiver_id: None,
            body: MessageBody::Discover,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, GameError> {
        bincode::serialize(self).map_err(GameError::Encode)
    }

    pub fn decode(data: &[u8]) -> Result<Self, GameError> {
        bincode::deserialize(data).map_err(GameError::Decode)
    }
}
