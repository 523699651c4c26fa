//! Socket pool scheduling.
//!
//! `SocketPoolManager` owns every socket's bookkeeping. I/O runs in tokio
//! tasks that only report events over a channel; the manager applies them
//! one at a time through `&mut self`.

pub mod factory;
pub mod jitter;
pub mod manager;
pub mod pool_list;
pub mod telemetry;

pub use factory::{
    AggregateError, AsyncStream, BoxedStream, ConnectOptions, SocketErrorClass, SocketFactory,
    TcpSocketFactory, TransportOptions, classify,
};
pub use jitter::{ExponentialJitter, JitterPolicy, NoJitter, UniformJitter};
pub use manager::{
    EventKind, EventReport, IoEvent, ManagerConfig, SendStatus, SocketContext, SocketHandlers,
    SocketInfo, SocketPoolManager, SocketPoolManagerBuilder, Verdict,
};
pub use pool_list::{Pool, PoolLists, SlotId};
pub use telemetry::{Activity, BucketFn, EventCounters, Histogram, TelemetrySnapshot, log2_millis};

use thiserror::Error;

/// Manager-assigned socket identity. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct SocketId(pub u64);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no socket factory configured")]
    MissingFactory,

    #[error("socket factory has no connect options for pool {0}")]
    MissingConnectOptions(Pool),

    #[error("connect options for pool {0} have neither a port nor a path")]
    NoPortOrPath(Pool),

    #[error("pool {0} cannot be a placement target")]
    InvalidTarget(Pool),

    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),

    #[error("socket {0} is closing and cannot leave terminal")]
    Closing(SocketId),
}

/// Bookkeeping disagreed with itself. Reported, never panicked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("internal consistency error{}: {detail}", .socket.map(|s| format!(" on socket {s}")).unwrap_or_default())]
pub struct InternalConsistencyError {
    pub socket: Option<SocketId>,
    pub detail: String,
}

impl InternalConsistencyError {
    pub(crate) fn new(socket: Option<SocketId>, detail: impl Into<String>) -> Self {
        Self {
            socket,
            detail: detail.into(),
        }
    }
}
