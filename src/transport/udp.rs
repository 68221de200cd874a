//! UDP transport: datagram envelope exchange with optional acknowledgement.
//!
//! The ack protocol is deliberately caller-visible: `send_with_ack` reports
//! a missed acknowledgement as an error instead of retrying on its own — the
//! caller decides whether the message is worth another attempt. The receive
//! side replies with the fixed ack datagram only after the inbound envelope
//! decoded successfully, so an ack always means the peer actually has the
//! message.

use crate::error::{CommError, Result};
use crate::protocol::message::Envelope;
use crate::security::SymmetricCipher;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, instrument, warn};

/// Largest datagram this transport will send or accept
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Encode (and optionally seal) an envelope into datagram bytes
fn datagram_bytes(envelope: &Envelope, cipher: Option<&SymmetricCipher>) -> Result<Vec<u8>> {
    let mut bytes = envelope.to_bytes()?;
    if let Some(cipher) = cipher {
        bytes = cipher.seal(&bytes)?;
    }
    if bytes.len() > MAX_DATAGRAM {
        return Err(CommError::Format(format!(
            "Datagram of {} bytes exceeds {MAX_DATAGRAM}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Decode (and optionally open) datagram bytes into an envelope
fn datagram_envelope(bytes: &[u8], cipher: Option<&SymmetricCipher>) -> Result<Envelope> {
    let payload = match cipher {
        Some(cipher) => cipher.open(bytes)?,
        None => bytes.to_vec(),
    };
    Envelope::from_bytes(&payload)
}

/// Seal (when a cipher is set) and size-check pre-encoded envelope bytes
pub(crate) fn seal_raw(bytes: &[u8], cipher: Option<&SymmetricCipher>) -> Result<Vec<u8>> {
    let sealed = match cipher {
        Some(cipher) => cipher.seal(bytes)?,
        None => bytes.to_vec(),
    };
    if sealed.len() > MAX_DATAGRAM {
        return Err(CommError::Format(format!(
            "Datagram of {} bytes exceeds {MAX_DATAGRAM}",
            sealed.len()
        )));
    }
    Ok(sealed)
}

/// Fire one envelope at the peer, no delivery confirmation.
#[instrument(skip(socket, envelope, cipher), fields(peer = %peer))]
pub async fn send_envelope(
    socket: &UdpSocket,
    peer: &str,
    envelope: &Envelope,
    cipher: Option<&SymmetricCipher>,
) -> Result<()> {
    let bytes = datagram_bytes(envelope, cipher)?;
    socket.send_to(&bytes, peer).await?;
    Ok(())
}

/// Fire pre-encoded envelope bytes at the peer.
pub(crate) async fn send_raw(
    socket: &UdpSocket,
    peer: &str,
    bytes: &[u8],
    cipher: Option<&SymmetricCipher>,
) -> Result<()> {
    let sealed = seal_raw(bytes, cipher)?;
    socket.send_to(&sealed, peer).await?;
    Ok(())
}

/// Send pre-encoded envelope bytes and wait for the acknowledgement.
pub(crate) async fn send_raw_with_ack(
    socket: &UdpSocket,
    peer: &str,
    bytes: &[u8],
    cipher: Option<&SymmetricCipher>,
    ack_timeout: Duration,
) -> Result<()> {
    let sealed = seal_raw(bytes, cipher)?;
    socket.send_to(&sealed, peer).await?;
    await_ack(socket, cipher, ack_timeout).await
}

/// Send one envelope and block up to `ack_timeout` for the peer's
/// acknowledgement. A missed ack is `CommError::AckTimeout`; nothing is
/// retried here.
#[instrument(skip(socket, envelope, cipher), fields(peer = %peer))]
pub async fn send_with_ack(
    socket: &UdpSocket,
    peer: &str,
    envelope: &Envelope,
    cipher: Option<&SymmetricCipher>,
    ack_timeout: Duration,
) -> Result<()> {
    let bytes = datagram_bytes(envelope, cipher)?;
    socket.send_to(&bytes, peer).await?;
    await_ack(socket, cipher, ack_timeout).await
}

/// Wait for the fixed ack datagram, skipping unrelated traffic.
async fn await_ack(
    socket: &UdpSocket,
    cipher: Option<&SymmetricCipher>,
    ack_timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let remaining = ack_timeout
            .checked_sub(started.elapsed())
            .ok_or(CommError::AckTimeout)?;

        let (len, from) = tokio::time::timeout(remaining, socket.recv_from(&mut buf))
            .await
            .map_err(|_| CommError::AckTimeout)??;

        match datagram_envelope(&buf[..len], cipher) {
            Ok(Envelope::Ack) => {
                debug!(%from, "Acknowledgement received");
                return Ok(());
            }
            Ok(other) => {
                // Data racing the ack; not ours to consume here
                debug!(opcode = other.opcode(), %from, "Skipping non-ack datagram");
            }
            Err(e) => {
                debug!(error = %e, %from, "Skipping undecodable datagram");
            }
        }
    }
}

/// Receive one envelope within the read deadline.
///
/// Expiry with no data is `CommError::Timeout` (transient); a malformed
/// datagram is a `Format` error — both leave the socket usable.
#[instrument(skip(socket, cipher))]
pub async fn recv_envelope(
    socket: &UdpSocket,
    cipher: Option<&SymmetricCipher>,
    deadline: Duration,
) -> Result<(Envelope, SocketAddr)> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (len, from) = tokio::time::timeout(deadline, socket.recv_from(&mut buf))
        .await
        .map_err(|_| CommError::Timeout)??;

    let envelope = datagram_envelope(&buf[..len], cipher)?;
    Ok((envelope, from))
}

/// Receive one envelope and acknowledge it to the sender.
///
/// The ack goes out only after the envelope decoded; a datagram that fails
/// to decode is dropped unacknowledged so the sender sees the failure.
#[instrument(skip(socket, cipher))]
pub async fn recv_with_ack(
    socket: &UdpSocket,
    cipher: Option<&SymmetricCipher>,
    deadline: Duration,
) -> Result<(Envelope, SocketAddr)> {
    let (envelope, from) = recv_envelope(socket, cipher, deadline).await?;

    let ack = datagram_bytes(&Envelope::Ack, cipher)?;
    if let Err(e) = socket.send_to(&ack, from).await {
        warn!(error = %e, %from, "Failed to send acknowledgement");
    }

    Ok((envelope, from))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn socket_pair() -> (UdpSocket, UdpSocket, String, String) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap().to_string();
        let b_addr = b.local_addr().unwrap().to_string();
        (a, b, a_addr, b_addr)
    }

    #[tokio::test]
    async fn plain_send_receive() {
        let (a, b, _, b_addr) = socket_pair().await;
        let env = Envelope::Payload {
            channel: 0,
            bytes: vec![5, 6, 7],
        };

        send_envelope(&a, &b_addr, &env, None).await.unwrap();
        let (received, _) = recv_envelope(&b, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received, env);
    }

    #[tokio::test]
    async fn ack_roundtrip() {
        let (a, b, _, b_addr) = socket_pair().await;
        let env = Envelope::Payload {
            channel: 1,
            bytes: vec![1; 128],
        };

        let receiver = tokio::spawn(async move {
            recv_with_ack(&b, None, Duration::from_secs(2)).await
        });

        send_with_ack(&a, &b_addr, &env, None, Duration::from_secs(2))
            .await
            .unwrap();

        let (received, _) = receiver.await.unwrap().unwrap();
        assert_eq!(received, env);
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let (a, _b, _, b_addr) = socket_pair().await;
        let env = Envelope::Ack;

        // Peer never reads, so no ack ever comes back
        let result = send_with_ack(&a, &b_addr, &env, None, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(CommError::AckTimeout)));
    }

    #[tokio::test]
    async fn read_deadline_is_transient_timeout() {
        let (_a, b, _, _) = socket_pair().await;
        let result = recv_envelope(&b, None, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(CommError::Timeout)));
    }

    #[tokio::test]
    async fn sealed_datagrams_roundtrip() {
        use crate::security::{DerivationEffort, KeyBits};
        let cipher = SymmetricCipher::from_passphrase(
            "shared",
            KeyBits::K256,
            DerivationEffort::Low,
        );
        let peer_cipher = SymmetricCipher::from_passphrase(
            "shared",
            KeyBits::K256,
            DerivationEffort::Low,
        );

        let (a, b, _, b_addr) = socket_pair().await;
        let env = Envelope::MirrorBatch(vec![9; 32]);

        send_envelope(&a, &b_addr, &env, Some(&cipher)).await.unwrap();
        let (received, _) = recv_envelope(&b, Some(&peer_cipher), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received, env);
    }
}
