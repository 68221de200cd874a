//! TCP transport: bulk transfer and framed envelope messaging.
//!
//! The bulk ("amount-bytes") protocol writes a 4-byte declared total length
//! and then streams the payload in chunks; the receiver reads the length and
//! keeps reading until exactly that many bytes have arrived — a single
//! `read` is never trusted to be complete. It carries large binary payloads
//! (whole files) outside the marshalling engine and is the base framing
//! discipline under marshalled messages.

use crate::core::codec::{Frame, FrameCodec};
use crate::error::{CommError, Result};
use crate::protocol::message::Envelope;
use crate::security::{self, SecureStream, SecuritySpec, SymmetricCipher};
use crate::utils::timeout::with_timeout_error;
use futures::{SinkExt, StreamExt};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument};

/// Chunk size for bulk streaming
pub const BULK_CHUNK_SIZE: usize = 64 * 1024;

/// Send one length-prefixed bulk payload.
#[instrument(skip(writer, data), fields(bytes = data.len()))]
pub async fn send_bulk<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total = u32::try_from(data.len())
        .map_err(|_| CommError::Format("Bulk payload exceeds 4-byte length field".into()))?;

    writer.write_all(&total.to_be_bytes()).await?;
    for chunk in data.chunks(BULK_CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await?;

    debug!("Bulk payload sent");
    Ok(())
}

/// Receive one length-prefixed bulk payload, up to `max_len` bytes.
#[instrument(skip(reader))]
pub async fn receive_bulk<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let total = u32::from_be_bytes(len_bytes) as usize;

    if total > max_len {
        return Err(CommError::Format(format!(
            "Declared bulk length {total} exceeds limit {max_len}"
        )));
    }

    let mut out = vec![0u8; total];
    let mut received = 0usize;
    while received < total {
        let n = reader.read(&mut out[received..]).await?;
        if n == 0 {
            return Err(CommError::ConnectionClosed);
        }
        received += n;
    }

    debug!(bytes = total, "Bulk payload received");
    Ok(out)
}

/// Stream a whole file through the bulk protocol. Returns bytes sent.
#[instrument(skip(writer, path), fields(path = %path.as_ref().display()))]
pub async fn send_file<W, P>(writer: &mut W, path: P) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    P: AsRef<Path>,
{
    let mut file = tokio::fs::File::open(&path).await?;
    let total = file.metadata().await?.len();
    let declared = u32::try_from(total)
        .map_err(|_| CommError::Format("File exceeds 4-byte length field".into()))?;

    writer.write_all(&declared.to_be_bytes()).await?;

    let mut buf = vec![0u8; BULK_CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    writer.flush().await?;

    if sent != total {
        return Err(CommError::FatalIo(format!(
            "File changed during send: declared {total}, streamed {sent}"
        )));
    }

    info!(bytes = sent, "File sent");
    Ok(sent)
}

/// Receive a bulk payload into a file. Returns the independently counted
/// byte total so callers can cross-check it against the sender's report.
#[instrument(skip(reader, path), fields(path = %path.as_ref().display()))]
pub async fn receive_file<R, P>(reader: &mut R, path: P) -> Result<u64>
where
    R: AsyncRead + Unpin,
    P: AsRef<Path>,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let total = u32::from_be_bytes(len_bytes) as u64;

    let mut file = tokio::fs::File::create(&path).await?;
    let mut buf = vec![0u8; BULK_CHUNK_SIZE];
    let mut received = 0u64;

    while received < total {
        let want = ((total - received) as usize).min(BULK_CHUNK_SIZE);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(CommError::ConnectionClosed);
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    file.flush().await?;

    info!(bytes = received, "File received");
    Ok(received)
}

/// Connect to a peer and wrap the stream per the security spec.
#[instrument(skip(security), fields(address = %addr))]
pub async fn connect_secure(
    addr: &str,
    host: &str,
    security: &SecuritySpec,
    timeout: Duration,
) -> Result<Framed<SecureStream, FrameCodec>> {
    let stream = with_timeout_error(TcpStream::connect(addr), timeout).await??;
    stream.set_nodelay(true)?;
    let secure = security::tls::wrap_outbound(stream, security, host).await?;
    Ok(Framed::new(secure, FrameCodec))
}

/// Bind a listener for inbound connections.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %addr, "Listening");
    Ok(listener)
}

/// Send one envelope over a framed stream, sealing it when a cipher is set.
pub async fn send_envelope<S>(
    framed: &mut Framed<S, FrameCodec>,
    envelope: &Envelope,
    cipher: Option<&SymmetricCipher>,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut bytes = envelope.to_bytes()?;
    if let Some(cipher) = cipher {
        bytes = cipher.seal(&bytes)?;
    }

    with_timeout_error(framed.send(Frame::new(bytes)), timeout).await??;
    Ok(())
}

/// Receive one envelope from a framed stream.
///
/// A timeout with no data maps to `CommError::Timeout` (transient); a closed
/// stream maps to `ConnectionClosed`.
pub async fn recv_envelope<S>(
    framed: &mut Framed<S, FrameCodec>,
    cipher: Option<&SymmetricCipher>,
    timeout: Duration,
) -> Result<Envelope>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = with_timeout_error(framed.next(), timeout)
        .await?
        .ok_or(CommError::ConnectionClosed)??;

    let mut payload = frame.payload;
    if let Some(cipher) = cipher {
        payload = cipher.open(&payload)?;
    }

    Envelope::from_bytes(&payload)
}

/// One request/response exchange in answer mode: send the payload, wait for
/// the peer's computed answer on the same framed channel.
#[instrument(skip(framed, payload, cipher), fields(bytes = payload.len()))]
pub async fn request_answer<S>(
    framed: &mut Framed<S, FrameCodec>,
    channel: u8,
    payload: Vec<u8>,
    cipher: Option<&SymmetricCipher>,
    timeout: Duration,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_envelope(
        framed,
        &Envelope::Payload {
            channel,
            bytes: payload,
        },
        cipher,
        timeout,
    )
    .await?;

    match recv_envelope(framed, cipher, timeout).await? {
        Envelope::Answer(bytes) => Ok(bytes),
        other => Err(CommError::Format(format!(
            "Expected answer, got {}",
            other.opcode()
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bulk_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(8 * 1024);
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let sender = tokio::spawn(async move { send_bulk(&mut a, &payload).await });
        let received = receive_bulk(&mut b, 1024 * 1024).await.unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn bulk_rejects_oversized_declaration() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = a.write_all(&u32::MAX.to_be_bytes()).await;
        });

        assert!(matches!(
            receive_bulk(&mut b, 1024).await,
            Err(CommError::Format(_))
        ));
    }

    #[tokio::test]
    async fn bulk_detects_early_close() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = a.write_all(&100u32.to_be_bytes()).await;
            let _ = a.write_all(&[0u8; 10]).await;
            // Drop closes the stream with 90 bytes owed
        });

        assert!(matches!(
            receive_bulk(&mut b, 1024).await,
            Err(CommError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn file_roundtrip_reports_matching_totals() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");

        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&src, &data).await.unwrap();

        let (mut a, mut b) = tokio::io::duplex(8 * 1024);
        let src_clone = src.clone();
        let sender = tokio::spawn(async move { send_file(&mut a, src_clone).await });
        let received = receive_file(&mut b, &dst).await.unwrap();
        let sent = sender.await.unwrap().unwrap();

        assert_eq!(sent, data.len() as u64);
        assert_eq!(received, sent);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), data);
    }
}
