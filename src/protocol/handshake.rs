//! Reachability handshake.
//!
//! A minimal one-shot probe used to confirm the peer is reachable and its
//! loops are servicing traffic before a heavier protocol starts: the caller
//! sends a random token with a timestamp, the peer echoes the token back.
//! Receive loops answer probes automatically; a failed probe is fatal to the
//! probing call only, never to the session that issued it.

use crate::core::codec::{Frame, FrameCodec};
use crate::error::{constants, CommError, Result};
use crate::protocol::message::Envelope;
use crate::security::SymmetricCipher;
use crate::utils::time::epoch_millis;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn};

/// Maximum age of a probe timestamp before the responder ignores it
const MAX_PROBE_AGE_MS: u64 = 30_000;

/// Tolerated clock skew into the future
const FUTURE_TOLERANCE_MS: u64 = 2_000;

/// Build a fresh probe envelope with a random token.
pub fn new_probe() -> Result<(u64, Envelope)> {
    let token: u64 = rand::thread_rng().gen();
    let timestamp_ms = epoch_millis()?;
    Ok((
        token,
        Envelope::Probe {
            token,
            timestamp_ms,
        },
    ))
}

/// Whether a probe timestamp is recent enough to answer.
pub fn verify_timestamp(timestamp_ms: u64) -> bool {
    let Ok(current) = epoch_millis() else {
        return false;
    };

    if timestamp_ms > current + FUTURE_TOLERANCE_MS {
        return false;
    }

    !(current > timestamp_ms && current - timestamp_ms > MAX_PROBE_AGE_MS)
}

/// Responder half: the reply owed for an inbound probe, if any.
///
/// Stale probes are dropped with a log line rather than answered, so a
/// replayed datagram cannot masquerade as current reachability.
pub fn answer_probe(envelope: &Envelope) -> Option<Envelope> {
    match envelope {
        Envelope::Probe {
            token,
            timestamp_ms,
        } => {
            if verify_timestamp(*timestamp_ms) {
                Some(Envelope::ProbeReply { token: *token })
            } else {
                warn!(token, timestamp_ms, "Ignoring stale probe");
                None
            }
        }
        _ => None,
    }
}

/// Probe a framed stream peer. Returns the round-trip time.
#[instrument(skip(framed, cipher), level = "debug")]
pub async fn probe_framed<S>(
    framed: &mut Framed<S, FrameCodec>,
    cipher: Option<&SymmetricCipher>,
    timeout: Duration,
) -> Result<Duration>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (token, probe) = new_probe()?;
    let started = Instant::now();

    let mut bytes = probe.to_bytes()?;
    if let Some(cipher) = cipher {
        bytes = cipher.seal(&bytes)?;
    }
    framed.send(Frame::new(bytes)).await?;

    let reply = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| CommError::Timeout)?
        .ok_or(CommError::ConnectionClosed)??;

    let mut payload = reply.payload;
    if let Some(cipher) = cipher {
        payload = cipher.open(&payload)?;
    }

    match Envelope::from_bytes(&payload)? {
        Envelope::ProbeReply { token: reply_token } if reply_token == token => {
            let rtt = started.elapsed();
            debug!(?rtt, "Probe answered");
            Ok(rtt)
        }
        Envelope::ProbeReply { .. } => Err(CommError::Handshake(
            constants::ERR_PROBE_TOKEN_MISMATCH.into(),
        )),
        other => Err(CommError::Handshake(format!(
            "Expected probe reply, got {}",
            other.opcode()
        ))),
    }
}

/// Probe a UDP peer. Returns the round-trip time.
#[instrument(skip(socket, cipher), level = "debug")]
pub async fn probe_udp(
    socket: &UdpSocket,
    peer: &str,
    cipher: Option<&SymmetricCipher>,
    timeout: Duration,
) -> Result<Duration> {
    let (token, probe) = new_probe()?;
    let started = Instant::now();

    let mut bytes = probe.to_bytes()?;
    if let Some(cipher) = cipher {
        bytes = cipher.seal(&bytes)?;
    }
    socket.send_to(&bytes, peer).await?;

    let mut buf = vec![0u8; 2048];
    loop {
        let remaining = timeout
            .checked_sub(started.elapsed())
            .ok_or(CommError::Timeout)?;
        let (len, _) = tokio::time::timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| CommError::Timeout)??;

        let mut payload = buf[..len].to_vec();
        if let Some(cipher) = cipher {
            payload = cipher.open(&payload)?;
        }

        match Envelope::from_bytes(&payload) {
            Ok(Envelope::ProbeReply { token: reply_token }) if reply_token == token => {
                let rtt = started.elapsed();
                debug!(?rtt, "Probe answered");
                return Ok(rtt);
            }
            Ok(other) => {
                // Unrelated datagram racing the reply; keep waiting
                debug!(opcode = other.opcode(), "Skipping non-reply datagram");
            }
            Err(e) => {
                debug!(error = %e, "Skipping undecodable datagram");
            }
        }
    }
}
