//! # peerlink
//!
//! Reliable, transport-agnostic messaging and shared-state mirroring.
//!
//! Two or more processes exchange discrete messages — request/response or
//! fire-and-forget — or keep a shared, mirrored data structure synchronized
//! over TCP or UDP, optionally encrypted, with a pluggable binary wire
//! encoding. Configuration goes in through [`CommunicationConfig`]; a
//! [`Session`] owns the sockets, queues and background loops; the
//! [`mirror`] layer adds periodic delta synchronization on top.
//!
//! ## Layers
//! - **core**: the marshalling engine (presence-flagged, length-prefixed
//!   field layout) and the transport frame codec
//! - **security**: passphrase-derived symmetric encryption or
//!   certificate-based TLS, between codec and transport
//! - **transport**: length-prefixed bulk transfer, UDP acknowledgement
//!   protocol, reachability handshake
//! - **session**: cardinality-validated socket/box topology with
//!   cancellable send/receive loops
//! - **mirror**: dirty-field diffing over a session, uni- or bidirectional
//!
//! ## Quick Start
//! ```ignore
//! use peerlink::{Cardinality, CommunicationConfig, Endpoint, Session, TransportSpec};
//!
//! // Receiver
//! let mut config = CommunicationConfig::new(
//!     TransportSpec::tcp_receive(),
//!     Cardinality::Equal,
//!     Vec::new(),
//! );
//! config.local_bind = Some(Endpoint::new("127.0.0.1", 9400));
//! let mut server = Session::new(config);
//! server.start().await?;
//!
//! // Sender
//! let mut client = Session::new(CommunicationConfig::new(
//!     TransportSpec::tcp_send(),
//!     Cardinality::Equal,
//!     vec![Endpoint::new("127.0.0.1", 9400)],
//! ));
//! client.start().await?;
//! client.enqueue(b"hello".to_vec());
//! ```
//!
//! Delivery is at-least-once with caller-visible retry signals: `enqueue`
//! returns `false` when a box is full, UDP ack timeouts are logged and
//! counted, and a mirror batch the session refuses stays dirty for the next
//! tick.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod core;
pub mod error;
pub mod mirror;
pub mod protocol;
pub mod security;
pub mod session;
pub mod transport;
pub mod utils;

pub use crate::config::{
    Cardinality, CommunicationConfig, Direction, Endpoint, TimeoutsConfig, TransportKind,
    TransportSpec,
};
pub use crate::core::marshal::MarshalSpec;
pub use crate::core::wire::{FieldDescriptor, Wire, WireType, WireValue};
pub use crate::error::{CommError, Result};
pub use crate::mirror::{Mirror, MirrorChannel};
pub use crate::security::{CertificateSource, DerivationEffort, KeyBits, SecuritySpec};
pub use crate::session::handler::{ConnectionHandler, HandlerSlot};
pub use crate::session::Session;
