//! Shared protocol definitions for the `RentWire` wire format.

pub mod codec;
pub mod event;
pub mod message;
pub mod op;
