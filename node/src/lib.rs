//! # Distributed Snake Node
//!
//! This crate implements one node of the peer-to-peer multiplayer Snake game.
//! Every participant runs the same executable; at any moment exactly one node
//! holds the authoritative `MASTER` role and advances the simulation, while a
//! `DEPUTY` shadows the full state so the game survives the master's death.
//!
//! ## Module Organization
//!
//! - [`socket`]: the single shared UDP endpoint plus the multicast listener
//! - [`ack`]: outstanding-message table with timed retransmission
//! - [`peers`]: liveness bookkeeping for every known peer
//! - [`master`], [`deputy`], [`normal`], [`viewer`]: the four roles
//! - [`client`]: the base client the three non-master roles share
//! - [`supervisor`]: owns the single active role and executes transitions
//! - [`discovery`]: TTL-bounded directory of announced games
//! - [`app`]: command/event facade the UI talks to

pub mod ack;
pub mod app;
pub mod client;
pub mod deputy;
pub mod discovery;
pub mod events;
pub mod master;
pub mod normal;
pub mod peers;
pub mod socket;
pub mod supervisor;
pub mod viewer;
