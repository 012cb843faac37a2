//! `RentWire` — real-time conversation sync engine for a peer-to-peer rental
//! marketplace.
//!
//! The [`client::SyncClient`] composes the pieces: a [`connection::ConnectionManager`]
//! owning the backend link, an [`queue::OutboundQueue`] that holds operations
//! while offline, and the room, typing, presence, and message state that react
//! to events published on the [`bus::EventBus`].

pub mod bus;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod presence;
pub mod queue;
pub mod reconcile;
pub mod rooms;
pub mod timer;
pub mod transport;
pub mod typing;
