//! `RentWire` development backend library.
//!
//! Exposes the backend server for use in tests and embedding. The server
//! accepts WebSocket connections, authenticates them, and fans conversation
//! events out to the members of each room.

pub mod config;
pub mod server;
