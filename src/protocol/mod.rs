//! # Protocol Layer
//!
//! The control envelope every transport carries, and the reachability
//! handshake that precedes heavier protocols.

pub mod handshake;
pub mod message;

pub use message::Envelope;
