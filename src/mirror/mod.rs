//! # Shared Memory Mirror
//!
//! Keeps a typed value's fields synchronized across a session. The mirrored
//! type's compile-time descriptor table (`Wire::fields()`) is the schema;
//! there is no runtime reflection.
//!
//! ## Snapshots
//! A mirror tracks three things: the committed local value, the last value
//! sent per field (for dirt detection), and the last value applied from the
//! peer (for diagnostics). On each tick the owning channel diffs current
//! values against last-sent, pushes the dirty fields as one batch message,
//! and advances last-sent only when the batch was actually queued — a failed
//! push leaves the fields dirty, so the next tick retries.
//!
//! Appliers set fields by name and ignore names they do not know, which
//! keeps old peers compatible with newer schemas.
//!
//! ## Direction
//! A unidirectional mirror pushes from its source side only. A bidirectional
//! channel binds a second, reverse (host, port) with its own security
//! settings so each side is symmetric; conflicts resolve last-write-wins at
//! the applier, with no ordering across the two directions.

use crate::config::CommunicationConfig;
use crate::core::marshal::{MarshalSpec, Reader, Writer};
use crate::core::wire::{Wire, WireValue};
use crate::error::{CommError, Result};
use crate::session::Session;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Applies inbound field batches; receive loops call this through the
/// config's bound `MirrorSlot`.
pub trait MirrorSink: Send + Sync {
    /// Apply one batch, returning how many fields were set.
    fn apply_batch(&self, bytes: &[u8]) -> Result<usize>;
}

/// Cloneable handle binding a mirror into a session config.
#[derive(Clone)]
pub struct MirrorSlot(Arc<dyn MirrorSink>);

impl MirrorSlot {
    pub fn new(sink: Arc<dyn MirrorSink>) -> Self {
        Self(sink)
    }

    pub fn apply_batch(&self, bytes: &[u8]) -> Result<usize> {
        self.0.apply_batch(bytes)
    }
}

impl fmt::Debug for MirrorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MirrorSlot(..)")
    }
}

struct MirrorInner<T> {
    object: T,
    last_sent: HashMap<&'static str, Option<WireValue>>,
    last_applied: HashMap<&'static str, Option<WireValue>>,
    initiated: bool,
}

/// A typed value whose fields are the synchronization unit.
pub struct Mirror<T: Wire> {
    inner: Arc<StdMutex<MirrorInner<T>>>,
    spec: MarshalSpec,
}

impl<T: Wire> Clone for Mirror<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            spec: self.spec.clone(),
        }
    }
}

impl<T: Wire> Mirror<T> {
    pub fn new(initial: T) -> Self {
        Self::with_spec(initial, MarshalSpec::default())
    }

    /// Both sides of a link must use the same spec for batch encoding.
    pub fn with_spec(initial: T, spec: MarshalSpec) -> Self {
        Self {
            inner: Arc::new(StdMutex::new(MirrorInner {
                object: initial,
                last_sent: HashMap::new(),
                last_applied: HashMap::new(),
                initiated: false,
            })),
            spec,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MirrorInner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Capture the field schema and seed the snapshots from the current
    /// values, so only post-initiation mutations travel. Idempotent.
    pub fn initiate_mirrors(&self) {
        let mut inner = self.lock();
        if inner.initiated {
            return;
        }
        let seed: Vec<(&'static str, Option<WireValue>)> = T::fields()
            .iter()
            .map(|d| (d.name, (d.get)(&inner.object)))
            .collect();
        for (name, value) in seed {
            inner.last_sent.insert(name, value);
        }
        inner.initiated = true;
        debug!(fields = T::fields().len(), "Mirror initiated");
    }

    /// Set one field by name. Synchronized against concurrent ticks; the
    /// value travels with the next tick's batch.
    pub fn set_field(&self, name: &str, value: Option<WireValue>) -> Result<()> {
        let descriptor = T::field(name)
            .ok_or_else(|| CommError::Custom(format!("Unknown mirror field '{name}'")))?;
        if let Some(ref v) = value {
            if !v.matches(&descriptor.wire_type) {
                return Err(CommError::Format(format!(
                    "Field '{name}' expects {:?}",
                    descriptor.wire_type
                )));
            }
        }

        let mut inner = self.lock();
        (descriptor.set)(&mut inner.object, value)
    }

    /// Read one field's current value by name.
    pub fn get_field(&self, name: &str) -> Result<Option<WireValue>> {
        let descriptor = T::field(name)
            .ok_or_else(|| CommError::Custom(format!("Unknown mirror field '{name}'")))?;
        let inner = self.lock();
        Ok((descriptor.get)(&inner.object))
    }

    /// Run a closure against the committed local value.
    pub fn with_object<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let inner = self.lock();
        f(&inner.object)
    }

    /// Mutate the committed local value under the mirror lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut inner = self.lock();
        f(&mut inner.object)
    }

    /// Diagnostic dump in declared field order:
    /// `"Field = value|Field2 = value2|"`, `NULL` for unset, `[]` for empty
    /// collections.
    pub fn fields_string(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        for descriptor in T::fields() {
            let rendered = match (descriptor.get)(&inner.object) {
                Some(value) => value.render(),
                None => "NULL".to_string(),
            };
            out.push_str(descriptor.name);
            out.push_str(" = ");
            out.push_str(&rendered);
            out.push('|');
        }
        out
    }

    /// Collect fields whose current value differs from last-sent and encode
    /// them as one batch. Returns `None` when nothing is dirty. Last-sent is
    /// NOT advanced here — call `commit_sent` once the batch is queued.
    pub(crate) fn take_dirty_batch(
        &self,
    ) -> Result<Option<(Vec<u8>, Vec<(&'static str, Option<WireValue>)>)>> {
        let inner = self.lock();
        if !inner.initiated {
            warn!("Mirror tick before initiate_mirrors");
            return Ok(None);
        }

        let mut dirty: Vec<(&'static str, Option<WireValue>)> = Vec::new();
        for descriptor in T::fields() {
            let current = (descriptor.get)(&inner.object);
            if inner.last_sent.get(descriptor.name) != Some(&current) {
                dirty.push((descriptor.name, current));
            }
        }

        if dirty.is_empty() {
            return Ok(None);
        }

        let bytes = encode_batch(&dirty, &self.spec)?;
        Ok(Some((bytes, dirty)))
    }

    /// Advance last-sent after a batch was accepted by the session.
    pub(crate) fn commit_sent(&self, entries: Vec<(&'static str, Option<WireValue>)>) {
        let mut inner = self.lock();
        for (name, value) in entries {
            inner.last_sent.insert(name, value);
        }
    }

    /// Last value applied from the peer for a field, if any.
    pub fn last_applied(&self, name: &str) -> Option<Option<WireValue>> {
        let inner = self.lock();
        inner.last_applied.get(name).cloned()
    }
}

impl<T: Wire> MirrorSink for Mirror<T> {
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    fn apply_batch(&self, bytes: &[u8]) -> Result<usize> {
        let entries = decode_batch(bytes, &self.spec)?;
        let mut inner = self.lock();
        let mut applied = 0usize;

        for (name, blob) in entries {
            let Some(descriptor) = T::fields().iter().find(|d| d.name == name) else {
                // Unknown fields are a newer peer's schema, not an error
                debug!(field = %name, "Ignoring unknown mirror field");
                continue;
            };

            let mut reader = Reader::new(&blob, &self.spec);
            let value = match reader.read_u8()? {
                0 => None,
                1 => Some(reader.read_value(&descriptor.wire_type)?),
                other => {
                    return Err(CommError::Format(format!(
                        "Invalid presence flag {other} in mirror batch"
                    )))
                }
            };

            (descriptor.set)(&mut inner.object, value.clone())?;
            inner.last_applied.insert(descriptor.name, value);
            applied += 1;
        }

        Ok(applied)
    }
}

/// Batch layout: `[count][entry…]`, each entry `[name: Str][blob: Bytes]`
/// where the blob holds `[presence][value?]`. Wrapping values as opaque
/// blobs is what lets an applier skip fields it does not know.
fn encode_batch(
    entries: &[(&'static str, Option<WireValue>)],
    spec: &MarshalSpec,
) -> Result<Vec<u8>> {
    let mut writer = Writer::new(spec);
    writer.write_count(entries.len())?;

    for (name, value) in entries {
        writer.write_value(&WireValue::Str((*name).to_string()))?;

        let mut blob = Writer::new(spec);
        match value {
            Some(v) => {
                blob.write_u8(1);
                blob.write_value(v)?;
            }
            None => blob.write_u8(0),
        }
        writer.write_value(&WireValue::Bytes(blob.finish()))?;
    }

    Ok(writer.finish())
}

fn decode_batch(bytes: &[u8], spec: &MarshalSpec) -> Result<Vec<(String, Vec<u8>)>> {
    let mut reader = Reader::new(bytes, spec);
    let count = reader.read_count()?;

    let mut entries = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let WireValue::Str(name) = reader.read_value(&crate::core::wire::WireType::Str)? else {
            return Err(CommError::Format("Mirror batch entry missing name".into()));
        };
        let WireValue::Bytes(blob) = reader.read_value(&crate::core::wire::WireType::Bytes)?
        else {
            return Err(CommError::Format("Mirror batch entry missing value".into()));
        };
        entries.push((name, blob));
    }

    if reader.remaining() != 0 {
        return Err(CommError::Format(
            "Mirror batch has trailing bytes".into(),
        ));
    }

    Ok(entries)
}

/// A mirror bound to its session(s), with the tick task that pushes deltas.
pub struct MirrorChannel<T: Wire> {
    mirror: Mirror<T>,
    session: Arc<Session>,
    reverse: Option<Arc<Session>>,
    cancel: CancellationToken,
    tick_worker: StdMutex<Option<JoinHandle<()>>>,
}

impl<T: Wire> MirrorChannel<T> {
    /// Source side of a unidirectional mirror: pushes deltas, applies nothing.
    pub async fn start_source(mirror: Mirror<T>, config: CommunicationConfig) -> Result<Self> {
        mirror.initiate_mirrors();
        let interval = Duration::from_millis(config.mirror_interval_ms);

        let mut session = Session::new(config);
        session.start().await?;
        let session = Arc::new(session);

        let cancel = CancellationToken::new();
        let tick_worker = tokio::spawn(tick_loop(
            mirror.clone(),
            session.clone(),
            interval,
            cancel.clone(),
        ));

        info!("Mirror source started");
        Ok(Self {
            mirror,
            session,
            reverse: None,
            cancel,
            tick_worker: StdMutex::new(Some(tick_worker)),
        })
    }

    /// Sink side of a unidirectional mirror: applies inbound batches.
    pub async fn start_sink(mirror: Mirror<T>, mut config: CommunicationConfig) -> Result<Self> {
        mirror.initiate_mirrors();
        config.mirror = Some(MirrorSlot::new(Arc::new(mirror.clone())));

        let mut session = Session::new(config);
        session.start().await?;

        info!("Mirror sink started");
        Ok(Self {
            mirror,
            session: Arc::new(session),
            reverse: None,
            cancel: CancellationToken::new(),
            tick_worker: StdMutex::new(None),
        })
    }

    /// Bidirectional mirror: pushes on `send_config`, applies on
    /// `recv_config` — the reverse channel binds its own (host, port) and
    /// may carry different security settings.
    pub async fn start_bidirectional(
        mirror: Mirror<T>,
        send_config: CommunicationConfig,
        mut recv_config: CommunicationConfig,
    ) -> Result<Self> {
        mirror.initiate_mirrors();
        let interval = Duration::from_millis(send_config.mirror_interval_ms);

        let mut send_session = Session::new(send_config);
        send_session.start().await?;
        let send_session = Arc::new(send_session);

        recv_config.mirror = Some(MirrorSlot::new(Arc::new(mirror.clone())));
        let mut recv_session = Session::new(recv_config);
        recv_session.start().await?;

        let cancel = CancellationToken::new();
        let tick_worker = tokio::spawn(tick_loop(
            mirror.clone(),
            send_session.clone(),
            interval,
            cancel.clone(),
        ));

        info!("Bidirectional mirror started");
        Ok(Self {
            mirror,
            session: send_session,
            reverse: Some(Arc::new(recv_session)),
            cancel,
            tick_worker: StdMutex::new(Some(tick_worker)),
        })
    }

    pub fn mirror(&self) -> &Mirror<T> {
        &self.mirror
    }

    /// The sending session (for probes and metrics).
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The reverse-direction session of a bidirectional mirror.
    pub fn reverse_session(&self) -> Option<&Session> {
        self.reverse.as_deref()
    }

    /// Stop the tick task and every owned session.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let worker = match self.tick_worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        self.session.stop().await;
        if let Some(reverse) = &self.reverse {
            reverse.stop().await;
        }
    }
}

/// Fixed-interval diff-and-push cycle. At most one batch per tick; a batch
/// the session refuses stays dirty and is retried next tick.
async fn tick_loop<T: Wire>(
    mirror: Mirror<T>,
    session: Arc<Session>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match mirror.take_dirty_batch() {
            Ok(Some((bytes, entries))) => {
                if session.enqueue_mirror_batch(bytes) {
                    debug!(fields = entries.len(), "Mirror batch queued");
                    mirror.commit_sent(entries);
                } else {
                    warn!("Mirror batch rejected by session, will retry");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Mirror diff failed"),
        }
    }
}
