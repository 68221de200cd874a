//! # Configuration Management
//!
//! Centralized configuration for communication sessions.
//!
//! This module provides structured configuration for sessions: transport
//! selection, socket/box topology, timeouts, security and marshalling
//! settings. A config is immutable once a session has been started from it.
//!
//! ## Validation
//! - `validate()` returns a list of findings; an empty list means the config
//!   is usable.
//! - `validate_strict()` folds the findings into a single `Config` error and
//!   is what `Session::start()` runs before touching any socket.
//!
//! The central invariant is topological: the number of declared message-box
//! lengths must equal the box count the chosen cardinality requires, or
//! `start()` refuses to run.

use crate::core::marshal::MarshalSpec;
use crate::error::{CommError, Result};
use crate::mirror::MirrorSlot;
use crate::security::SecuritySpec;
use crate::session::handler::HandlerSlot;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version, carried in every frame envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Max allowed frame payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Default mirror tick period
pub const DEFAULT_MIRROR_INTERVAL_MS: u64 = 50;

/// Transport protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// Which way this session moves messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Direction {
    /// Connects out (TCP) or transmits datagrams (UDP)
    Send,
    /// Listens/binds and consumes inbound messages
    Receive,
}

/// Full transport selection: protocol, direction and reliability add-ons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransportSpec {
    pub kind: TransportKind,
    pub direction: Direction,
    /// UDP only: require a per-datagram acknowledgement from the peer
    #[serde(default)]
    pub with_ack: bool,
    /// TCP only: the receive side computes and returns an answer over the
    /// same framed channel before accepting the next request
    #[serde(default)]
    pub with_answer: bool,
}

impl TransportSpec {
    pub fn tcp_send() -> Self {
        Self {
            kind: TransportKind::Tcp,
            direction: Direction::Send,
            with_ack: false,
            with_answer: false,
        }
    }

    pub fn tcp_receive() -> Self {
        Self {
            direction: Direction::Receive,
            ..Self::tcp_send()
        }
    }

    pub fn tcp_send_with_answer() -> Self {
        Self {
            with_answer: true,
            ..Self::tcp_send()
        }
    }

    pub fn tcp_receive_with_answer() -> Self {
        Self {
            with_answer: true,
            ..Self::tcp_receive()
        }
    }

    pub fn udp_send() -> Self {
        Self {
            kind: TransportKind::Udp,
            direction: Direction::Send,
            with_ack: false,
            with_answer: false,
        }
    }

    pub fn udp_receive() -> Self {
        Self {
            direction: Direction::Receive,
            ..Self::udp_send()
        }
    }

    pub fn udp_send_with_ack() -> Self {
        Self {
            with_ack: true,
            ..Self::udp_send()
        }
    }

    pub fn udp_receive_with_ack() -> Self {
        Self {
            with_ack: true,
            ..Self::udp_receive()
        }
    }
}

/// Topology mapping between physical sockets and logical message boxes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Cardinality {
    /// One socket paired with exactly one message box
    Equal,
    /// Symmetric dual channel: one outbound and one inbound, each with its own box
    EqualBidirectional,
    /// Several logical producer/consumer boxes multiplexed over one socket
    ManyMessageBoxesToOneSocket,
}

impl Cardinality {
    /// Number of message boxes this topology requires for the given socket count.
    ///
    /// `ManyMessageBoxesToOneSocket` accepts any box count >= 1 (the declared
    /// list itself defines the count), so it returns `declared` unchanged.
    pub fn required_box_count(&self, socket_count: usize, declared: usize) -> usize {
        match self {
            Cardinality::Equal => socket_count,
            Cardinality::EqualBidirectional => 2,
            Cardinality::ManyMessageBoxesToOneSocket => declared.max(1),
        }
    }
}

/// A remote peer address
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Render as a `host:port` connect/bind string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The five-plus-one timeout knobs governing loop pacing and deadlines,
/// all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeoutsConfig {
    /// Deadline for one outbound write
    pub sender_timeout_ms: u64,
    /// Read deadline for one inbound frame; expiry with no data is transient
    pub receiver_timeout_ms: u64,
    /// Pacing delay between send-loop passes
    pub sender_interval_ms: u64,
    /// Default wait budget for `dequeue_wait`
    pub queue_timeout_ms: u64,
    /// UDP receiver's inbound read deadline
    pub udp_receive_ack_timeout_ms: u64,
    /// How long a UDP sender waits for the peer's acknowledgement
    pub udp_send_ack_timeout_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            sender_timeout_ms: 5_000,
            receiver_timeout_ms: 5_000,
            sender_interval_ms: 10,
            queue_timeout_ms: 5_000,
            udp_receive_ack_timeout_ms: 1_000,
            udp_send_ack_timeout_ms: 1_000,
        }
    }
}

impl TimeoutsConfig {
    pub fn sender_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_timeout_ms)
    }

    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_millis(self.receiver_timeout_ms)
    }

    pub fn sender_interval(&self) -> Duration {
        Duration::from_millis(self.sender_interval_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn udp_receive_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_receive_ack_timeout_ms)
    }

    pub fn udp_send_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_send_ack_timeout_ms)
    }

    /// Validate timeout configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sender_timeout_ms < 10 {
            errors.push("Sender timeout too short (minimum: 10ms)".to_string());
        }

        if self.receiver_timeout_ms < 10 {
            errors.push("Receiver timeout too short (minimum: 10ms)".to_string());
        }

        if self.sender_interval_ms > 60_000 {
            errors.push("Sender interval too long (maximum: 60s)".to_string());
        }

        if self.udp_send_ack_timeout_ms == 0 {
            errors.push("UDP send ack timeout must be greater than 0".to_string());
        }

        if self.udp_receive_ack_timeout_ms == 0 {
            errors.push("UDP receive ack timeout must be greater than 0".to_string());
        }

        errors
    }
}

/// Immutable-after-start description of one communication session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommunicationConfig {
    /// Transport protocol, direction and reliability add-ons
    pub transport: TransportSpec,

    /// Socket/box topology
    pub cardinality: Cardinality,

    /// Remote peers. Send-direction sessions connect/transmit to these.
    pub endpoints: Vec<Endpoint>,

    /// Local bind address for receive/listen sockets
    #[serde(default)]
    pub local_bind: Option<Endpoint>,

    /// Number of physical sockets
    pub socket_count: usize,

    /// Capacity (message count) of each message box, one entry per box
    pub box_lengths: Vec<usize>,

    /// Per-message byte ceiling enforced by every box
    pub max_message_bytes: usize,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Security settings
    #[serde(default)]
    pub security: SecuritySpec,

    /// Marshalling settings
    #[serde(default)]
    pub marshalling: MarshalSpec,

    /// Tick period when a mirror is bound
    #[serde(default = "default_mirror_interval")]
    pub mirror_interval_ms: u64,

    /// Per-connection handler factory for answer-mode transports
    #[serde(skip, default)]
    pub handler: Option<HandlerSlot>,

    /// Bound mirror sink; inbound `MirrorBatch` envelopes are applied to it
    #[serde(skip, default)]
    pub mirror: Option<MirrorSlot>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_mirror_interval() -> u64 {
    DEFAULT_MIRROR_INTERVAL_MS
}

impl CommunicationConfig {
    /// Minimal working config for the given transport, topology and peers.
    pub fn new(transport: TransportSpec, cardinality: Cardinality, endpoints: Vec<Endpoint>) -> Self {
        let socket_count = match cardinality {
            Cardinality::EqualBidirectional => 2,
            _ => 1,
        };
        let box_count = cardinality.required_box_count(socket_count, 1);
        Self {
            transport,
            cardinality,
            endpoints,
            local_bind: None,
            socket_count,
            box_lengths: vec![64; box_count],
            max_message_bytes: 64 * 1024,
            timeouts: TimeoutsConfig::default(),
            security: SecuritySpec::default(),
            marshalling: MarshalSpec::default(),
            mirror_interval_ms: DEFAULT_MIRROR_INTERVAL_MS,
            handler: None,
            mirror: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Apply overrides to a freshly built configuration
    pub fn with_overrides<F>(mut self, mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        mutator(&mut self);
        self
    }

    /// Number of boxes the chosen cardinality requires
    pub fn required_box_count(&self) -> usize {
        self.cardinality
            .required_box_count(self.socket_count, self.box_lengths.len())
    }

    /// Validate the configuration for common issues and misconfigurations.
    ///
    /// Returns a list of validation errors. Empty list means the configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        // The topology invariant: declared boxes must match what the
        // cardinality requires.
        let required = self.required_box_count();
        if self.box_lengths.len() != required {
            errors.push(format!(
                "Cardinality {:?} with {} socket(s) requires {} message box(es), {} declared",
                self.cardinality,
                self.socket_count,
                required,
                self.box_lengths.len()
            ));
        }

        if self.socket_count == 0 {
            errors.push("Socket count must be greater than 0".to_string());
        }

        match self.cardinality {
            Cardinality::Equal => {}
            Cardinality::EqualBidirectional => {
                if self.socket_count != 2 {
                    errors.push(format!(
                        "EqualBidirectional requires exactly 2 sockets, {} configured",
                        self.socket_count
                    ));
                }
            }
            Cardinality::ManyMessageBoxesToOneSocket => {
                if self.socket_count != 1 {
                    errors.push(format!(
                        "ManyMessageBoxesToOneSocket requires exactly 1 socket, {} configured",
                        self.socket_count
                    ));
                }
            }
        }

        if let Some(zero) = self.box_lengths.iter().position(|&len| len == 0) {
            errors.push(format!("Message box {zero} has zero capacity"));
        }

        if self.max_message_bytes == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_bytes > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum: {} bytes)",
                self.max_message_bytes, MAX_PAYLOAD_SIZE
            ));
        }

        match self.transport.direction {
            Direction::Send => {
                if self.endpoints.is_empty() {
                    errors.push("Send-direction session requires at least one endpoint".to_string());
                }
            }
            Direction::Receive => {
                if self.local_bind.is_none() {
                    errors.push("Receive-direction session requires a local bind address".to_string());
                }
            }
        }

        if self.cardinality == Cardinality::EqualBidirectional
            && (self.endpoints.is_empty() || self.local_bind.is_none())
        {
            errors.push(
                "EqualBidirectional requires both an endpoint (outbound) and a local bind (inbound)"
                    .to_string(),
            );
        }

        for ep in &self.endpoints {
            if ep.host.is_empty() {
                errors.push("Endpoint host cannot be empty".to_string());
            }
        }

        if self.transport.with_answer && self.transport.kind != TransportKind::Tcp {
            errors.push("Answer mode is only available on TCP transports".to_string());
        }

        if self.transport.with_ack && self.transport.kind != TransportKind::Udp {
            errors.push("Acknowledgement mode is only available on UDP transports".to_string());
        }

        if self.transport.kind == TransportKind::Udp && self.security.is_asymmetric() {
            errors.push("Asymmetric (TLS) security is not available over UDP".to_string());
        }

        if self.mirror_interval_ms == 0 {
            errors.push("Mirror interval must be greater than 0".to_string());
        }

        errors.extend(self.timeouts.validate());
        errors.extend(self.security.validate());
        errors.extend(self.marshalling.validate());
        errors.extend(self.logging.validate());

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CommError::Config(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("peerlink"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
