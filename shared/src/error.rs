//! Error kinds shared across the node.

use thiserror::Error;

/// Everything that can go wrong between the UI pressing a button and a
/// datagram leaving the socket.
///
/// Decode failures never surface to users: a datagram that does not parse is
/// dropped where it was received. Socket failures on sends are logged and the
/// ack tracker retransmits. The rest map onto the UI-visible `JoinFailed`,
/// `Error` and `GameOver` events.
#[derive(Debug, Error)]
pub enum GameError {
    #[error("invalid game config: {0}")]
    InvalidConfig(String),

    #[error("no space to spawn snake")]
    NoSpawnSpace,

    #[error("join timed out")]
    JoinTimeout,

    #[error("join rejected: {0}")]
    JoinRejected(String),

    #[error("master unreachable and no deputy known")]
    MasterUnreachable,

    #[error("game over")]
    GameOver,

    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}
