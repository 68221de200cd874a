//! # Transport Primitives
//!
//! Frame-level protocols under the session layer:
//! - **tcp**: length-prefixed bulk transfer, whole-file send/receive, and
//!   framed envelope messaging over plain or TLS streams
//! - **udp**: datagram envelope exchange with the optional
//!   acknowledgement protocol
//!
//! Each socket loop moves through the states below; transient errors keep a
//! loop in `Running`, fatal ones park it in `Error`.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod tcp;
pub mod udp;

/// Per-socket loop state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum LoopState {
    Idle,
    Connecting,
    Running,
    Error,
    Stopping,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "IDLE",
            LoopState::Connecting => "CONNECTING",
            LoopState::Running => "RUNNING",
            LoopState::Error => "ERROR",
            LoopState::Stopping => "STOPPING",
            LoopState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names() {
        assert_eq!(LoopState::Running.to_string(), "RUNNING");
        assert_eq!(LoopState::Stopped.to_string(), "STOPPED");
    }
}
