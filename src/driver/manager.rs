//! Socket lifecycle across pools.
//!
//! A socket is placed in `created`, dials after a jittered delay, and is
//! promoted to its target pool once its handlers say so. From there the
//! caller moves it between pools until it ends and is removed.
//!
//! Threading model: one tokio task per socket does the I/O and reports
//! `IoEvent`s over an unbounded channel. Only `SocketPoolManager`, through
//! `&mut self`, touches pool membership.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::factory::{BoxedStream, SocketErrorClass, SocketFactory, TransportOptions, classify};
use super::jitter::{JitterPolicy, UniformJitter};
use super::pool_list::{Pool, PoolLists, SlotId};
use super::telemetry::{Activity, BucketFn, SocketEvent, Telemetry, TelemetrySnapshot, log2_millis};
use super::{InternalConsistencyError, PoolError, SocketId};

// Dial gate. Cancel and dial race on a single compare-exchange.
const SCHEDULED: u8 = 0;
const DIALING: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub jitter_min: Duration,
    pub jitter_max: Duration,
    /// Inactivity timeout applied when the factory does not set one.
    pub socket_timeout: Option<Duration>,
    /// Outbound chunks queued per socket before `send` reports backpressure.
    pub write_queue_depth: usize,
    pub read_buffer_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            jitter_min: Duration::ZERO,
            jitter_max: Duration::from_secs(1),
            socket_timeout: None,
            write_queue_depth: 16,
            read_buffer_size: 8 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Ok,
    /// Refused: the previous burst has not drained yet.
    Backpressure,
    Closed,
    /// Write side already shut down; reads may still arrive.
    OnlyRead,
    /// Queued, and the queue is now full. Wait for drain.
    OkWithBackpressure,
}

/// What a handler wants done after a hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    /// Move from `created` to the pool the socket was requested for.
    Promote,
    /// Flush queued output, then shut the socket down.
    Close,
}

/// Handed to every hook. Bytes queued with `send` are written after the
/// hook returns, before its verdict is applied.
pub struct SocketContext<'a> {
    socket: SocketId,
    pool: Pool,
    target: Pool,
    outbox: &'a mut Vec<Bytes>,
}

impl SocketContext<'_> {
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn target(&self) -> Pool {
        self.target
    }

    pub fn send(&mut self, data: impl Into<Bytes>) {
        self.outbox.push(data.into());
    }
}

/// Per-socket event hooks.
pub trait SocketHandlers: Send {
    fn on_lookup(&mut self, _ctx: &mut SocketContext<'_>, _addrs: &[SocketAddr]) {}

    fn on_connect(&mut self, _ctx: &mut SocketContext<'_>) -> Verdict {
        Verdict::Continue
    }

    fn on_ready(&mut self, _ctx: &mut SocketContext<'_>) -> Verdict {
        Verdict::Continue
    }

    fn on_data(&mut self, ctx: &mut SocketContext<'_>, data: &[u8]) -> Verdict;

    fn on_drain(&mut self, _ctx: &mut SocketContext<'_>) {}

    /// Inactivity timeout outside the idle pool.
    fn on_timeout(&mut self, _ctx: &mut SocketContext<'_>) -> Verdict {
        Verdict::Continue
    }

    fn on_error(&mut self, _ctx: &mut SocketContext<'_>, _error: &SocketErrorClass) -> Verdict {
        Verdict::Continue
    }

    fn on_end(&mut self, _ctx: &mut SocketContext<'_>) {}

    fn on_finish(&mut self, _ctx: &mut SocketContext<'_>) {}

    fn on_close(&mut self, _ctx: &mut SocketContext<'_>, _had_error: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lookup,
    Connect,
    Ready,
    Data,
    Drain,
    Timeout,
    Error,
    End,
    Finish,
    Close,
}

/// Event reported by a socket task.
#[derive(Debug)]
pub struct IoEvent {
    socket: SocketId,
    payload: Payload,
}

impl IoEvent {
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[derive(Debug)]
enum Payload {
    Lookup(Vec<SocketAddr>),
    Connected {
        writer: mpsc::Sender<WriteCommand>,
        secured_in: Option<Duration>,
    },
    Ready,
    Data(Bytes),
    Drain,
    Timeout,
    Error(io::Error),
    End,
    Finish,
    Close { had_error: bool },
}

impl Payload {
    fn kind(&self) -> EventKind {
        match self {
            Payload::Lookup(_) => EventKind::Lookup,
            Payload::Connected { .. } => EventKind::Connect,
            Payload::Ready => EventKind::Ready,
            Payload::Data(_) => EventKind::Data,
            Payload::Drain => EventKind::Drain,
            Payload::Timeout => EventKind::Timeout,
            Payload::Error(_) => EventKind::Error,
            Payload::End => EventKind::End,
            Payload::Finish => EventKind::Finish,
            Payload::Close { .. } => EventKind::Close,
        }
    }
}

/// Outcome of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReport {
    pub socket: SocketId,
    pub kind: EventKind,
    /// The socket was cancelled or destroyed; the event was dropped.
    pub stale: bool,
    pub fault: Option<InternalConsistencyError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketInfo {
    pub id: SocketId,
    pub pool: Pool,
    pub target: Pool,
    pub jitter_ms: u64,
    pub connected: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub idle_counts: u32,
}

#[derive(Debug)]
enum WriteCommand {
    Data(Bytes),
    Shutdown,
}

#[derive(Debug, Default)]
struct SharedCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    need_drain: AtomicBool,
}

struct SocketAttributes {
    id: SocketId,
    target: Pool,
    jitter: Duration,
    placed_at: Instant,
    pool_since: Instant,
    last_activity: Instant,
    /// Backpressure onset, cleared on drain.
    last_write: Option<Instant>,
    gate: Arc<AtomicU8>,
    task: JoinHandle<()>,
    writer: Option<mpsc::Sender<WriteCommand>>,
    shared: Arc<SharedCounters>,
    seen_read: u64,
    seen_written: u64,
    idle_counts: u32,
    write_ended: bool,
}

#[derive(Default)]
pub struct SocketPoolManagerBuilder {
    factory: Option<Arc<dyn SocketFactory>>,
    jitter: Option<Box<dyn JitterPolicy>>,
    config: ManagerConfig,
    activity_bucket: Option<BucketFn>,
    pool_bucket: Option<BucketFn>,
}

impl SocketPoolManagerBuilder {
    pub fn factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Defaults to `UniformJitter` over the configured bounds.
    pub fn jitter(mut self, jitter: impl JitterPolicy + 'static) -> Self {
        self.jitter = Some(Box::new(jitter));
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn activity_buckets(mut self, bucket: BucketFn) -> Self {
        self.activity_bucket = Some(bucket);
        self
    }

    pub fn pool_buckets(mut self, bucket: BucketFn) -> Self {
        self.pool_bucket = Some(bucket);
        self
    }

    pub fn build(self) -> Result<SocketPoolManager, PoolError> {
        let factory = self.factory.ok_or(PoolError::MissingFactory)?;
        let config = self.config;
        let jitter = self.jitter.unwrap_or_else(|| {
            Box::new(UniformJitter::new(config.jitter_min, config.jitter_max))
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(SocketPoolManager {
            factory,
            jitter,
            config,
            lists: PoolLists::new(),
            index: HashMap::new(),
            handlers: HashMap::new(),
            telemetry: Telemetry::new(
                self.activity_bucket.unwrap_or(log2_millis),
                self.pool_bucket.unwrap_or(log2_millis),
            ),
            events_tx,
            events_rx,
            next_id: 0,
        })
    }
}

pub struct SocketPoolManager {
    factory: Arc<dyn SocketFactory>,
    jitter: Box<dyn JitterPolicy>,
    config: ManagerConfig,
    lists: PoolLists<SocketAttributes>,
    index: HashMap<SocketId, SlotId>,
    handlers: HashMap<SocketId, Box<dyn SocketHandlers>>,
    telemetry: Telemetry,
    events_tx: mpsc::UnboundedSender<IoEvent>,
    events_rx: mpsc::UnboundedReceiver<IoEvent>,
    next_id: u64,
}

impl SocketPoolManager {
    pub fn builder() -> SocketPoolManagerBuilder {
        SocketPoolManagerBuilder::default()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Schedule a new socket for `target`. It sits in `created` until its
    /// handlers promote it. Must be called inside a tokio runtime.
    pub fn create_socket_for_pool<H: SocketHandlers + 'static>(
        &mut self,
        target: Pool,
        handlers: H,
    ) -> Result<SocketId, PoolError> {
        if matches!(target, Pool::Created | Pool::Terminal) {
            return Err(PoolError::InvalidTarget(target));
        }
        let mut options = self
            .factory
            .connect_options(target)
            .ok_or(PoolError::MissingConnectOptions(target))?;
        if !options.connect.has_port_or_path() {
            return Err(PoolError::NoPortOrPath(target));
        }
        if options.timeout.is_none() {
            options.timeout = self.config.socket_timeout;
        }

        let id = SocketId(self.next_id);
        self.next_id += 1;
        let jitter = self.jitter.delay();
        let gate = Arc::new(AtomicU8::new(SCHEDULED));
        let shared = Arc::new(SharedCounters::default());

        let task = tokio::spawn(run_socket(SocketTask {
            id,
            jitter,
            options,
            gate: gate.clone(),
            shared: shared.clone(),
            factory: self.factory.clone(),
            events: self.events_tx.clone(),
            write_queue_depth: self.config.write_queue_depth.max(1),
            read_buffer_size: self.config.read_buffer_size.max(64),
        }));

        let now = Instant::now();
        let slot = self.lists.insert(
            Pool::Created,
            SocketAttributes {
                id,
                target,
                jitter,
                placed_at: now,
                pool_since: now,
                last_activity: now,
                last_write: None,
                gate,
                task,
                writer: None,
                shared,
                seen_read: 0,
                seen_written: 0,
                idle_counts: 0,
                write_ended: false,
            },
        );
        self.index.insert(id, slot);
        self.handlers.insert(id, Box::new(handlers));
        tracing::debug!(
            socket = %id,
            pool = %target,
            jitter_ms = jitter.as_millis() as u64,
            "socket scheduled"
        );
        Ok(id)
    }

    /// Cancel a connect whose timer has not fired. Returns false once
    /// dialing has started (use `close` then) or for unknown sockets.
    pub fn cancel(&mut self, id: SocketId) -> bool {
        let Some(attr) = self.attr(id) else {
            return false;
        };
        if attr
            .gate
            .compare_exchange(SCHEDULED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        attr.task.abort();
        self.retire(id);
        tracing::debug!(socket = %id, "pending connect cancelled");
        true
    }

    /// Graceful close: queued output is flushed, then the write side shuts
    /// down. A socket that never connected is destroyed instead.
    pub fn close(&mut self, id: SocketId) -> Result<(), PoolError> {
        let slot = self.slot(id)?;
        let connected = self.lists.get(slot).is_some_and(|a| a.writer.is_some());
        if !connected {
            return self.destroy(id);
        }
        if let Some(attr) = self.lists.get_mut(slot) {
            if !attr.write_ended {
                attr.write_ended = true;
                if let Some(writer) = &attr.writer {
                    request_shutdown(writer);
                }
            }
        }
        if self.lists.pool_of(slot) != Some(Pool::Terminal) {
            self.migrate_slot(slot, Pool::Terminal);
        }
        tracing::debug!(socket = %id, "socket closing");
        Ok(())
    }

    /// Abort all I/O and forget the socket immediately.
    pub fn destroy(&mut self, id: SocketId) -> Result<(), PoolError> {
        let slot = self.slot(id)?;
        if let Some(attr) = self.lists.get(slot) {
            attr.task.abort();
        }
        self.migrate_slot(slot, Pool::Terminal);
        self.telemetry.count(SocketEvent::Close);
        self.retire(id);
        tracing::debug!(socket = %id, "socket destroyed");
        Ok(())
    }

    /// Queue bytes for writing.
    pub fn send(&mut self, id: SocketId, data: impl Into<Bytes>) -> Result<SendStatus, PoolError> {
        let slot = self.slot(id)?;
        let Some(attr) = self.lists.get_mut(slot) else {
            return Err(PoolError::UnknownSocket(id));
        };
        let Some(writer) = &attr.writer else {
            return Ok(SendStatus::Closed);
        };
        if writer.is_closed() {
            return Ok(SendStatus::Closed);
        }
        if attr.write_ended {
            return Ok(SendStatus::OnlyRead);
        }
        if attr.shared.need_drain.load(Ordering::Acquire) {
            return Ok(SendStatus::Backpressure);
        }

        // Arm the drain flag before the last free slot is taken so the
        // writer cannot empty the queue unseen.
        let filling = writer.capacity() <= 1;
        if filling {
            attr.shared.need_drain.store(true, Ordering::Release);
        }
        let status = match writer.try_send(WriteCommand::Data(data.into())) {
            Ok(()) if filling => SendStatus::OkWithBackpressure,
            Ok(()) => SendStatus::Ok,
            Err(TrySendError::Full(_)) => {
                attr.shared.need_drain.store(true, Ordering::Release);
                SendStatus::Backpressure
            }
            Err(TrySendError::Closed(_)) => SendStatus::Closed,
        };
        if matches!(status, SendStatus::OkWithBackpressure | SendStatus::Backpressure) {
            attr.last_write.get_or_insert_with(Instant::now);
        }
        Ok(status)
    }

    /// Move a socket to `to`. Returns the pool it left. Sockets in
    /// `terminal` never leave it.
    pub fn migrate(&mut self, id: SocketId, to: Pool) -> Result<Pool, PoolError> {
        if to == Pool::Created {
            return Err(PoolError::InvalidTarget(to));
        }
        let slot = self.live_slot(id)?;
        self.migrate_slot(slot, to)
            .ok_or(PoolError::UnknownSocket(id))
    }

    /// Take the longest-idle socket into `dst`.
    pub fn checkout(&mut self, dst: Pool) -> Result<Option<SocketId>, PoolError> {
        if matches!(dst, Pool::Created | Pool::Idle | Pool::Terminal) {
            return Err(PoolError::InvalidTarget(dst));
        }
        let Some(slot) = self.lists.oldest(Pool::Idle) else {
            return Ok(None);
        };
        let id = self.lists.get(slot).map(|a| a.id);
        self.migrate_slot(slot, dst);
        Ok(id)
    }

    /// Return a socket to `idle`.
    pub fn release(&mut self, id: SocketId) -> Result<(), PoolError> {
        let slot = self.live_slot(id)?;
        self.migrate_slot(slot, Pool::Idle);
        if let Some(attr) = self.lists.get_mut(slot) {
            attr.idle_counts = 0;
        }
        Ok(())
    }

    /// Close idle sockets that have sat in `idle` for at least `older_than`.
    pub fn evict_idle(&mut self, older_than: Duration) -> Vec<SocketId> {
        let now = Instant::now();
        let stale: Vec<SocketId> = self
            .lists
            .iter(Pool::Idle)
            .take_while(|(_, a)| now.saturating_duration_since(a.pool_since) >= older_than)
            .map(|(_, a)| a.id)
            .collect();
        for id in &stale {
            if let Err(e) = self.close(*id) {
                tracing::error!(socket = %id, error = %e, "evicting idle socket failed");
            }
        }
        stale
    }

    pub fn unregister_handlers(&mut self, id: SocketId) -> Option<Box<dyn SocketHandlers>> {
        self.handlers.remove(&id)
    }

    pub fn pool_counts(&self) -> BTreeMap<Pool, usize> {
        Pool::ALL
            .iter()
            .map(|pool| (*pool, self.lists.len(*pool)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lists.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn socket(&self, id: SocketId) -> Option<SocketInfo> {
        let slot = *self.index.get(&id)?;
        let attr = self.lists.get(slot)?;
        Some(SocketInfo {
            id,
            pool: self.lists.pool_of(slot)?,
            target: attr.target,
            jitter_ms: attr.jitter.as_millis() as u64,
            connected: attr.writer.is_some(),
            bytes_read: attr.shared.bytes_read.load(Ordering::Relaxed),
            bytes_written: attr.shared.bytes_written.load(Ordering::Relaxed),
            idle_counts: attr.idle_counts,
        })
    }

    /// Verify list structure and the id index against each other.
    pub fn check_invariants(&self) -> Result<(), InternalConsistencyError> {
        self.lists
            .check_invariants()
            .map_err(|detail| InternalConsistencyError::new(None, detail))?;
        if self.index.len() != self.lists.total_len() {
            return Err(InternalConsistencyError::new(
                None,
                format!(
                    "index holds {} sockets, lists hold {}",
                    self.index.len(),
                    self.lists.total_len()
                ),
            ));
        }
        for (id, slot) in &self.index {
            match self.lists.get(*slot) {
                Some(attr) if attr.id == *id => {}
                _ => {
                    return Err(InternalConsistencyError::new(
                        Some(*id),
                        "index points at a slot holding another socket",
                    ));
                }
            }
            if id.0 >= self.next_id {
                return Err(InternalConsistencyError::new(Some(*id), "live socket was never issued"));
            }
        }
        Ok(())
    }

    /// Wait for the next event from any socket task.
    pub async fn next_event(&mut self) -> Option<IoEvent> {
        self.events_rx.recv().await
    }

    pub async fn run_once(&mut self) -> Option<EventReport> {
        let event = self.next_event().await?;
        Some(self.handle_event(event))
    }

    /// Apply one event: update telemetry, run the socket's hook and act on
    /// its verdict.
    pub fn handle_event(&mut self, event: IoEvent) -> EventReport {
        let IoEvent { socket: id, payload } = event;
        let kind = payload.kind();
        let mut report = EventReport {
            socket: id,
            kind,
            stale: false,
            fault: None,
        };

        // Ids are issued in order and never reused, so an issued id with no
        // slot belongs to a cancelled, destroyed or closed socket.
        let Some(&slot) = self.index.get(&id) else {
            if id.0 < self.next_id {
                tracing::trace!(socket = %id, event = ?kind, "stale event dropped");
                report.stale = true;
                return report;
            }
            let fault = InternalConsistencyError::new(
                Some(id),
                format!("event for a socket that was never issued ({kind:?})"),
            );
            tracing::error!(socket = %id, event = ?kind, "{}", fault);
            report.fault = Some(fault);
            return report;
        };

        match payload {
            Payload::Lookup(addrs) => {
                tracing::debug!(socket = %id, addrs = ?addrs, "lookup");
                self.dispatch(slot, id, false, |h, ctx| {
                    h.on_lookup(ctx, &addrs);
                    Verdict::Continue
                });
            }
            Payload::Connected { writer, secured_in } => {
                let now = Instant::now();
                if let Some(elapsed) = secured_in {
                    self.telemetry.record_activity(Activity::SslConnect, elapsed);
                }
                if let Some(attr) = self.lists.get_mut(slot) {
                    self.telemetry.record_activity(
                        Activity::Connect,
                        now.saturating_duration_since(attr.placed_at),
                    );
                    attr.last_activity = now;
                    attr.writer = Some(writer);
                }
                tracing::debug!(socket = %id, "connected");
                self.dispatch(slot, id, true, |h, ctx| h.on_connect(ctx));
            }
            Payload::Ready => {
                self.dispatch(slot, id, true, |h, ctx| h.on_ready(ctx));
            }
            Payload::Data(data) => {
                self.network_sample(slot, Activity::Network);
                self.dispatch(slot, id, true, |h, ctx| h.on_data(ctx, &data));
            }
            Payload::Drain => {
                let now = Instant::now();
                if let Some(since) = self.lists.get_mut(slot).and_then(|a| a.last_write.take()) {
                    self.telemetry
                        .record_activity(Activity::Drained, now.saturating_duration_since(since));
                }
                self.dispatch(slot, id, false, |h, ctx| {
                    h.on_drain(ctx);
                    Verdict::Continue
                });
            }
            Payload::Timeout => {
                let idle = self.lists.pool_of(slot) == Some(Pool::Idle);
                if let Some(attr) = self.lists.get_mut(slot) {
                    if idle {
                        attr.idle_counts = 0;
                    } else {
                        attr.idle_counts += 1;
                    }
                }
                if !idle {
                    self.telemetry.count(SocketEvent::Idle);
                    self.dispatch(slot, id, true, |h, ctx| h.on_timeout(ctx));
                }
            }
            Payload::Error(err) => {
                let class = classify(&err);
                self.telemetry.count(SocketEvent::Error);
                tracing::warn!(
                    socket = %id,
                    pool = ?self.lists.pool_of(slot),
                    error = %err,
                    class = ?class,
                    "socket error"
                );
                self.dispatch(slot, id, true, |h, ctx| h.on_error(ctx, &class));
            }
            Payload::End => {
                self.network_sample(slot, Activity::End);
                self.telemetry.count(SocketEvent::End);
                self.dispatch(slot, id, false, |h, ctx| {
                    h.on_end(ctx);
                    Verdict::Continue
                });
                self.migrate_slot(slot, Pool::Terminal);
            }
            Payload::Finish => {
                self.network_sample(slot, Activity::Finish);
                if let Some(attr) = self.lists.get_mut(slot) {
                    attr.write_ended = true;
                }
                self.dispatch(slot, id, false, |h, ctx| {
                    h.on_finish(ctx);
                    Verdict::Continue
                });
            }
            Payload::Close { had_error } => {
                self.network_sample(slot, Activity::Close);
                self.telemetry.count(SocketEvent::Close);
                self.dispatch(slot, id, false, |h, ctx| {
                    h.on_close(ctx, had_error);
                    Verdict::Continue
                });
                self.migrate_slot(slot, Pool::Terminal);
                self.lists.remove(slot);
                self.index.remove(&id);
                self.handlers.remove(&id);
                tracing::debug!(socket = %id, had_error, "socket closed");
            }
        }
        report
    }

    fn attr(&self, id: SocketId) -> Option<&SocketAttributes> {
        self.lists.get(*self.index.get(&id)?)
    }

    fn slot(&self, id: SocketId) -> Result<SlotId, PoolError> {
        self.index
            .get(&id)
            .copied()
            .ok_or(PoolError::UnknownSocket(id))
    }

    /// Like `slot`, refusing sockets that are closing in `terminal`.
    fn live_slot(&self, id: SocketId) -> Result<SlotId, PoolError> {
        let slot = self.slot(id)?;
        if self.lists.pool_of(slot) == Some(Pool::Terminal) {
            return Err(PoolError::Closing(id));
        }
        Ok(slot)
    }

    fn migrate_slot(&mut self, slot: SlotId, to: Pool) -> Option<Pool> {
        let current = self.lists.pool_of(slot)?;
        if current == to {
            return Some(current);
        }
        let now = Instant::now();
        let attr = self.lists.get_mut(slot)?;
        let since = std::mem::replace(&mut attr.pool_since, now);
        let id = attr.id;
        let from = self.lists.migrate(slot, to)?;
        self.telemetry
            .record_residence(from, now.saturating_duration_since(since));
        tracing::debug!(socket = %id, from = %from, to = %to, "socket migrated");
        Some(from)
    }

    fn retire(&mut self, id: SocketId) {
        if let Some(slot) = self.index.remove(&id) {
            self.lists.remove(slot);
        }
        self.handlers.remove(&id);
    }

    fn network_sample(&mut self, slot: SlotId, activity: Activity) {
        let now = Instant::now();
        let Some(attr) = self.lists.get_mut(slot) else {
            return;
        };
        let elapsed = now.saturating_duration_since(attr.last_activity);
        attr.last_activity = now;
        let read = attr.shared.bytes_read.load(Ordering::Relaxed);
        let written = attr.shared.bytes_written.load(Ordering::Relaxed);
        let delta = (
            read.saturating_sub(attr.seen_read),
            written.saturating_sub(attr.seen_written),
        );
        attr.seen_read = read;
        attr.seen_written = written;
        self.telemetry.record_activity(activity, elapsed);
        self.telemetry.add_bytes(delta.0, delta.1);
    }

    fn dispatch<F>(&mut self, slot: SlotId, id: SocketId, timed: bool, hook: F)
    where
        F: FnOnce(&mut dyn SocketHandlers, &mut SocketContext<'_>) -> Verdict,
    {
        let Some(pool) = self.lists.pool_of(slot) else {
            return;
        };
        let target = self.lists.get(slot).map_or(pool, |a| a.target);
        let Some(handlers) = self.handlers.get_mut(&id) else {
            return;
        };

        let mut outbox = Vec::new();
        let started = Instant::now();
        let verdict = {
            let mut ctx = SocketContext {
                socket: id,
                pool,
                target,
                outbox: &mut outbox,
            };
            hook(&mut **handlers, &mut ctx)
        };
        if timed {
            self.telemetry
                .record_activity(Activity::IomCode, started.elapsed());
        }

        for data in outbox {
            match self.send(id, data) {
                Ok(SendStatus::Ok | SendStatus::OkWithBackpressure) => {}
                status => tracing::debug!(socket = %id, ?status, "handler output not queued"),
            }
        }

        match verdict {
            Verdict::Continue => {}
            Verdict::Promote => {
                if pool == Pool::Created {
                    self.migrate_slot(slot, target);
                }
            }
            Verdict::Close => {
                if let Err(e) = self.close(id) {
                    tracing::error!(socket = %id, error = %e, "close requested by handler failed");
                }
            }
        }
    }
}

fn request_shutdown(writer: &mpsc::Sender<WriteCommand>) {
    match writer.try_send(WriteCommand::Shutdown) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(command)) => {
            let writer = writer.clone();
            tokio::spawn(async move {
                let _ = writer.send(command).await;
            });
        }
    }
}

struct SocketTask {
    id: SocketId,
    jitter: Duration,
    options: TransportOptions,
    gate: Arc<AtomicU8>,
    shared: Arc<SharedCounters>,
    factory: Arc<dyn SocketFactory>,
    events: mpsc::UnboundedSender<IoEvent>,
    write_queue_depth: usize,
    read_buffer_size: usize,
}

impl SocketTask {
    fn emit(&self, payload: Payload) {
        // The manager being gone just means nobody is listening.
        let _ = self.events.send(IoEvent {
            socket: self.id,
            payload,
        });
    }

    fn fail(&self, err: io::Error) {
        self.emit(Payload::Error(err));
        self.emit(Payload::Close { had_error: true });
    }
}

async fn run_socket(task: SocketTask) {
    tokio::time::sleep(task.jitter).await;
    if task
        .gate
        .compare_exchange(SCHEDULED, DIALING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    tracing::debug!(socket = %task.id, target = %task.options.connect, "dialing");

    let addrs = match task.factory.lookup(&task.options).await {
        Ok(addrs) => addrs,
        Err(e) => return task.fail(e),
    };
    if !addrs.is_empty() {
        task.emit(Payload::Lookup(addrs.clone()));
    }
    let mut stream = match task.factory.connect(&task.options, &addrs).await {
        Ok(stream) => stream,
        Err(e) => return task.fail(e),
    };
    let mut secured_in = None;
    if task.options.secure {
        let started = Instant::now();
        stream = match task.factory.secure(&task.options, stream).await {
            Ok(stream) => stream,
            Err(e) => return task.fail(e),
        };
        secured_in = Some(started.elapsed());
    }

    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(task.write_queue_depth);
    let writer_task = tokio::spawn(write_loop(
        task.id,
        writer,
        rx,
        task.shared.clone(),
        task.events.clone(),
    ));
    task.emit(Payload::Connected {
        writer: tx.clone(),
        secured_in,
    });
    task.emit(Payload::Ready);

    let mut had_error = read_loop(&task, reader).await;

    // Reading is over; let the writer flush and shut down.
    let _ = tx.send(WriteCommand::Shutdown).await;
    drop(tx);
    had_error |= writer_task.await.unwrap_or(true);
    task.emit(Payload::Close { had_error });
}

/// Returns true when reading stopped on an error.
async fn read_loop(task: &SocketTask, mut reader: ReadHalf<BoxedStream>) -> bool {
    let mut buf = BytesMut::with_capacity(task.read_buffer_size);
    loop {
        buf.reserve(task.read_buffer_size);
        let read = match task.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read_buf(&mut buf)).await {
                Ok(read) => read,
                Err(_) => {
                    task.emit(Payload::Timeout);
                    continue;
                }
            },
            None => reader.read_buf(&mut buf).await,
        };
        match read {
            Ok(0) => {
                task.emit(Payload::End);
                return false;
            }
            Ok(n) => {
                task.shared.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                task.emit(Payload::Data(buf.split().freeze()));
            }
            Err(e) => {
                task.emit(Payload::Error(e));
                return true;
            }
        }
    }
}

/// Returns true when writing stopped on an error.
async fn write_loop(
    id: SocketId,
    mut writer: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<WriteCommand>,
    shared: Arc<SharedCounters>,
    events: mpsc::UnboundedSender<IoEvent>,
) -> bool {
    let emit = |payload| {
        let _ = events.send(IoEvent {
            socket: id,
            payload,
        });
    };
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Data(data) => {
                if let Err(e) = writer.write_all(&data).await {
                    emit(Payload::Error(e));
                    return true;
                }
                shared
                    .bytes_written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                if rx.is_empty() && shared.need_drain.swap(false, Ordering::AcqRel) {
                    emit(Payload::Drain);
                }
            }
            WriteCommand::Shutdown => {
                return match writer.shutdown().await {
                    Ok(()) => {
                        emit(Payload::Finish);
                        false
                    }
                    Err(e) => {
                        emit(Payload::Error(e));
                        true
                    }
                };
            }
        }
    }
    false
}
