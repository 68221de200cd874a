//! # Communication Session
//!
//! Owns the sockets and message boxes a `CommunicationConfig` describes,
//! runs the background send/receive loops, and exposes the queue-facing API:
//! `enqueue` / `dequeue` / `dequeue_wait`, plus a reachability `probe`.
//!
//! ## Lifecycle
//! A session is single-use: `new` → `start()` (validates the config, binds
//! or connects, spawns loops) → `stop()` (cancels every loop, closes the
//! sockets, drops whatever was still queued). `stop()` is idempotent and may
//! be called from any task or thread.
//!
//! ## Topologies
//! - `Equal`: socket *i* pairs with box *i*
//! - `EqualBidirectional`: an outbound connect channel and an inbound listen
//!   channel share the session, one box each; no cross-channel ordering
//! - `ManyMessageBoxesToOneSocket`: every box drains into/out of one socket,
//!   distinguished by the envelope's channel byte; mirror batches ride the
//!   same socket, which is how field updates interleave with user traffic
//!
//! Answer-mode send sessions keep a second, same-capacity box per socket
//! where the peers' answers land; `dequeue` reads from it.

pub mod handler;
pub mod loops;
pub mod message_box;

use crate::config::{Cardinality, CommunicationConfig, Direction, TransportKind};
use crate::core::marshal;
use crate::core::wire::Wire;
use crate::error::{CommError, Result};
use crate::protocol::handshake;
use crate::protocol::message::Envelope;
use crate::security::{self, SymmetricCipher};
use crate::transport::{tcp, LoopState};
use crate::utils::metrics::Metrics;
use crate::utils::timeout::{with_timeout_error, SHUTDOWN_TIMEOUT};
use self::loops::LoopContext;
use self::message_box::MessageBox;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Slack added to each box's byte limit for the envelope around a payload
const ENVELOPE_OVERHEAD: usize = 16;

/// Runtime instance bound to one config.
pub struct Session {
    config: Arc<CommunicationConfig>,
    outbound: Vec<Arc<MessageBox>>,
    inbound: Vec<Arc<MessageBox>>,
    cipher: Option<Arc<SymmetricCipher>>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    loop_states: StdMutex<Vec<Arc<StdMutex<LoopState>>>>,
    bound_addr: StdMutex<Option<SocketAddr>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Session {
    /// Build a session from its config. No sockets are touched until `start()`.
    pub fn new(config: CommunicationConfig) -> Self {
        let box_max = config.max_message_bytes + ENVELOPE_OVERHEAD;

        let (outbound, inbound): (Vec<_>, Vec<_>) = match config.cardinality {
            Cardinality::EqualBidirectional => {
                let out = config.box_lengths.first().copied().unwrap_or(64);
                let inb = config.box_lengths.get(1).copied().unwrap_or(64);
                (
                    vec![Arc::new(MessageBox::new(out, box_max))],
                    vec![Arc::new(MessageBox::new(inb, box_max))],
                )
            }
            _ => match config.transport.direction {
                Direction::Send => {
                    let out: Vec<_> = config
                        .box_lengths
                        .iter()
                        .map(|&len| Arc::new(MessageBox::new(len, box_max)))
                        .collect();
                    let answers = if config.transport.with_answer {
                        config
                            .box_lengths
                            .iter()
                            .map(|&len| Arc::new(MessageBox::new(len, box_max)))
                            .collect()
                    } else {
                        Vec::new()
                    };
                    (out, answers)
                }
                Direction::Receive => (
                    Vec::new(),
                    config
                        .box_lengths
                        .iter()
                        .map(|&len| Arc::new(MessageBox::new(len, box_max)))
                        .collect(),
                ),
            },
        };

        Self {
            config: Arc::new(config),
            outbound,
            inbound,
            cipher: None,
            metrics: Arc::new(Metrics::new()),
            cancel: CancellationToken::new(),
            workers: StdMutex::new(Vec::new()),
            loop_states: StdMutex::new(Vec::new()),
            bound_addr: StdMutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CommunicationConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The address a receive-side socket actually bound, once started.
    /// Useful when the config asked for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.lock().ok().and_then(|a| *a)
    }

    /// Snapshot of every worker's state machine, in spawn order.
    pub fn loop_states(&self) -> Vec<LoopState> {
        match self.loop_states.lock() {
            Ok(states) => states
                .iter()
                .map(|s| s.lock().map(|v| *v).unwrap_or(LoopState::Error))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn new_loop_context(&self) -> LoopContext {
        let state = Arc::new(StdMutex::new(LoopState::Idle));
        if let Ok(mut states) = self.loop_states.lock() {
            states.push(state.clone());
        }
        LoopContext {
            config: self.config.clone(),
            cipher: self.cipher.clone(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
            state,
        }
    }

    fn record_worker(&self, handle: JoinHandle<()>) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.push(handle);
        }
    }

    /// Validate the config, open sockets and launch the background loops.
    ///
    /// Topology mismatches surface synchronously as `Config` errors; a
    /// receive-side bind failure surfaces as the underlying I/O error.
    #[instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CommError::Custom(
                "Session is single-use and was already started".into(),
            ));
        }

        self.config.validate_strict()?;
        self.cipher = self.config.security.message_cipher()?.map(Arc::new);

        match self.config.cardinality {
            Cardinality::EqualBidirectional => self.start_bidirectional().await?,
            _ => match self.config.transport.direction {
                Direction::Send => self.start_send_loops().await?,
                Direction::Receive => self.start_receive_loops().await?,
            },
        }

        info!(
            transport = ?self.config.transport,
            cardinality = ?self.config.cardinality,
            "Session started"
        );
        Ok(())
    }

    async fn start_send_loops(&self) -> Result<()> {
        let endpoints = &self.config.endpoints;

        for socket_index in 0..self.config.socket_count {
            let endpoint = endpoints[socket_index % endpoints.len()].clone();
            let boxes = match self.config.cardinality {
                // Every producer box shares the single socket
                Cardinality::ManyMessageBoxesToOneSocket => self.outbound.clone(),
                _ => vec![self.outbound[socket_index].clone()],
            };
            let answers = self.inbound.get(socket_index).cloned();
            let ctx = self.new_loop_context();

            let handle = match self.config.transport.kind {
                TransportKind::Tcp => tokio::spawn(loops::tcp_send_loop(
                    ctx,
                    boxes,
                    answers,
                    endpoint.addr(),
                    endpoint.host.clone(),
                )),
                TransportKind::Udp => {
                    let bind = self.config.local_bind.as_ref().map(|ep| ep.addr());
                    tokio::spawn(loops::udp_send_loop(ctx, boxes, endpoint.addr(), bind))
                }
            };
            self.record_worker(handle);
        }

        Ok(())
    }

    async fn start_receive_loops(&self) -> Result<()> {
        let bind = self
            .config
            .local_bind
            .as_ref()
            .ok_or_else(|| CommError::Config("Receive session requires local_bind".into()))?
            .addr();

        match self.config.transport.kind {
            TransportKind::Tcp => {
                let listener = tcp::bind(&bind).await?;
                if let Ok(mut addr) = self.bound_addr.lock() {
                    *addr = listener.local_addr().ok();
                }
                let acceptor = security::tls::acceptor_for(&self.config.security)?;
                let ctx = self.new_loop_context();
                self.record_worker(tokio::spawn(loops::tcp_receive_loop(
                    ctx,
                    listener,
                    self.inbound.clone(),
                    acceptor,
                )));
            }
            TransportKind::Udp => {
                let socket = UdpSocket::bind(&bind).await?;
                if let Ok(mut addr) = self.bound_addr.lock() {
                    *addr = socket.local_addr().ok();
                }
                let ctx = self.new_loop_context();
                self.record_worker(tokio::spawn(loops::udp_receive_loop(
                    ctx,
                    socket,
                    self.inbound.clone(),
                )));
            }
        }

        Ok(())
    }

    async fn start_bidirectional(&self) -> Result<()> {
        let endpoint = self
            .config
            .endpoints
            .first()
            .ok_or_else(|| CommError::Config("EqualBidirectional requires an endpoint".into()))?
            .clone();
        let bind = self
            .config
            .local_bind
            .as_ref()
            .ok_or_else(|| CommError::Config("EqualBidirectional requires local_bind".into()))?
            .addr();

        match self.config.transport.kind {
            TransportKind::Tcp => {
                let send_ctx = self.new_loop_context();
                self.record_worker(tokio::spawn(loops::tcp_send_loop(
                    send_ctx,
                    vec![self.outbound[0].clone()],
                    None,
                    endpoint.addr(),
                    endpoint.host.clone(),
                )));

                let listener = tcp::bind(&bind).await?;
                if let Ok(mut addr) = self.bound_addr.lock() {
                    *addr = listener.local_addr().ok();
                }
                let acceptor = security::tls::acceptor_for(&self.config.security)?;
                let recv_ctx = self.new_loop_context();
                self.record_worker(tokio::spawn(loops::tcp_receive_loop(
                    recv_ctx,
                    listener,
                    vec![self.inbound[0].clone()],
                    acceptor,
                )));
            }
            TransportKind::Udp => {
                let send_ctx = self.new_loop_context();
                self.record_worker(tokio::spawn(loops::udp_send_loop(
                    send_ctx,
                    vec![self.outbound[0].clone()],
                    endpoint.addr(),
                    None,
                )));

                let socket = UdpSocket::bind(&bind).await?;
                if let Ok(mut addr) = self.bound_addr.lock() {
                    *addr = socket.local_addr().ok();
                }
                let recv_ctx = self.new_loop_context();
                self.record_worker(tokio::spawn(loops::udp_receive_loop(
                    recv_ctx,
                    socket,
                    vec![self.inbound[0].clone()],
                )));
            }
        }

        Ok(())
    }

    /// Cancel every loop and release the sockets. In-flight messages are
    /// dropped, not drained. Safe to call repeatedly, from any thread.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Stopping session");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if with_timeout_error(handle, SHUTDOWN_TIMEOUT).await.is_err() {
                warn!("Worker did not stop within the shutdown timeout");
            }
        }

        for outbox in &self.outbound {
            outbox.clear();
        }
        for inbox in &self.inbound {
            inbox.clear();
        }

        self.metrics.log_summary();
    }

    /// Queue one payload on the first channel. `false` means the box is
    /// full or the payload exceeds the configured byte limit — retry later.
    pub fn enqueue(&self, payload: Vec<u8>) -> bool {
        self.enqueue_on(0, payload)
    }

    /// Queue one payload on a specific channel.
    pub fn enqueue_on(&self, channel: u8, payload: Vec<u8>) -> bool {
        if payload.len() > self.config.max_message_bytes {
            warn!(
                bytes = payload.len(),
                limit = self.config.max_message_bytes,
                "Rejecting oversized message"
            );
            self.metrics.enqueue_rejection();
            return false;
        }

        let Some(outbox) = self.outbound.get(channel as usize) else {
            warn!(channel, "No outbound box for channel");
            return false;
        };

        let envelope = Envelope::Payload {
            channel,
            bytes: payload,
        };
        let Ok(bytes) = envelope.to_bytes() else {
            return false;
        };

        let accepted = outbox.enqueue(bytes);
        if !accepted {
            self.metrics.enqueue_rejection();
        }
        accepted
    }

    /// Marshal a typed value with the session's `MarshalSpec`, then enqueue it.
    pub fn enqueue_wire<T: Wire>(&self, value: &T) -> Result<bool> {
        let bytes = marshal::encode(value, &self.config.marshalling)?;
        Ok(self.enqueue(bytes))
    }

    /// Queue one mirror batch on the mirror's socket (the last outbound box,
    /// so many-boxes topologies can dedicate one to the mirror).
    pub(crate) fn enqueue_mirror_batch(&self, batch: Vec<u8>) -> bool {
        let Some(outbox) = self.outbound.last() else {
            return false;
        };
        let Ok(bytes) = Envelope::MirrorBatch(batch).to_bytes() else {
            return false;
        };
        let accepted = outbox.enqueue(bytes);
        if accepted {
            self.metrics.mirror_batch_sent();
        } else {
            self.metrics.enqueue_rejection();
        }
        accepted
    }

    /// Non-blocking read from the first inbound channel.
    pub fn dequeue(&self) -> Option<Vec<u8>> {
        self.dequeue_from(0)
    }

    /// Non-blocking read from a specific inbound channel.
    pub fn dequeue_from(&self, channel: u8) -> Option<Vec<u8>> {
        self.inbound.get(channel as usize)?.dequeue()
    }

    /// Poll the first inbound channel until a message arrives or the
    /// timeout elapses.
    pub async fn dequeue_wait(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.inbound.first()?.dequeue_wait(timeout).await
    }

    /// Dequeue and unmarshal a typed value; `None` when the box is empty.
    pub fn dequeue_wire<T: Wire>(&self) -> Option<Result<T>> {
        self.dequeue()
            .map(|bytes| marshal::decode(&bytes, &self.config.marshalling))
    }

    /// One-shot reachability probe against the first endpoint, on a fresh
    /// socket so it never interferes with the session's own loops. Failure
    /// is fatal to this call only.
    pub async fn probe(&self, timeout: Duration) -> Result<Duration> {
        let endpoint = self
            .config
            .endpoints
            .first()
            .ok_or_else(|| CommError::Config("Probe requires a configured endpoint".into()))?;
        let cipher = self.config.security.message_cipher()?;

        match self.config.transport.kind {
            TransportKind::Tcp => {
                let mut framed = tcp::connect_secure(
                    &endpoint.addr(),
                    &endpoint.host,
                    &self.config.security,
                    self.config.timeouts.sender_timeout(),
                )
                .await?;
                handshake::probe_framed(&mut framed, cipher.as_ref(), timeout).await
            }
            TransportKind::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                handshake::probe_udp(&socket, &endpoint.addr(), cipher.as_ref(), timeout).await
            }
        }
    }
}
