//! Socket construction.
//!
//! The manager never opens sockets itself: a `SocketFactory` supplies the
//! transport options for a pool and performs lookup and connect.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::pool_list::Pool;

/// Any bidirectional byte stream the manager can drive.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOptions {
    Tcp {
        host: String,
        port: u16,
        no_delay: bool,
    },
    Unix {
        path: PathBuf,
    },
}

impl ConnectOptions {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ConnectOptions::Tcp {
            host: host.into(),
            port,
            no_delay: true,
        }
    }

    /// A TCP target needs a port, a Unix target a path.
    pub fn has_port_or_path(&self) -> bool {
        match self {
            ConnectOptions::Tcp { port, .. } => *port != 0,
            ConnectOptions::Unix { path } => !path.as_os_str().is_empty(),
        }
    }
}

impl std::fmt::Display for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectOptions::Tcp { host, port, .. } => write!(f, "{}:{}", host, port),
            ConnectOptions::Unix { path } => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect: ConnectOptions,
    /// Inactivity timeout; each expiry is reported as a timeout event.
    pub timeout: Option<Duration>,
    /// Pass the connected stream through `SocketFactory::secure`.
    pub secure: bool,
}

impl TransportOptions {
    pub fn new(connect: ConnectOptions) -> Self {
        Self {
            connect,
            timeout: None,
            secure: false,
        }
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Options for a socket destined for `target`. `None` means this
    /// factory cannot serve that pool.
    fn connect_options(&self, target: Pool) -> Option<TransportOptions>;

    /// Resolve the target. An empty list is fine for transports that do not
    /// resolve (Unix sockets, in-memory streams).
    async fn lookup(&self, _options: &TransportOptions) -> io::Result<Vec<SocketAddr>> {
        Ok(Vec::new())
    }

    async fn connect(
        &self,
        options: &TransportOptions,
        addrs: &[SocketAddr],
    ) -> io::Result<BoxedStream>;

    /// Wrap a connected stream, typically in TLS, before any handler sees
    /// it. Only called when `options.secure` is set.
    async fn secure(
        &self,
        _options: &TransportOptions,
        stream: BoxedStream,
    ) -> io::Result<BoxedStream> {
        Ok(stream)
    }
}

/// Every address of a multi-address connect failed.
#[derive(Debug, Error)]
#[error("all {} connection attempts failed", .0.len())]
pub struct AggregateError(pub Vec<io::Error>);

/// Production factory: TCP with `TCP_NODELAY`, or a Unix socket.
#[derive(Debug, Clone)]
pub struct TcpSocketFactory {
    options: TransportOptions,
}

impl TcpSocketFactory {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    fn connect_options(&self, _target: Pool) -> Option<TransportOptions> {
        Some(self.options.clone())
    }

    async fn lookup(&self, options: &TransportOptions) -> io::Result<Vec<SocketAddr>> {
        match &options.connect {
            ConnectOptions::Tcp { host, port, .. } => {
                Ok(tokio::net::lookup_host((host.as_str(), *port)).await?.collect())
            }
            ConnectOptions::Unix { .. } => Ok(Vec::new()),
        }
    }

    async fn connect(
        &self,
        options: &TransportOptions,
        addrs: &[SocketAddr],
    ) -> io::Result<BoxedStream> {
        match &options.connect {
            ConnectOptions::Tcp { no_delay, .. } => {
                let stream = connect_any(addrs).await?;
                stream.set_nodelay(*no_delay)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            ConnectOptions::Unix { path } => {
                Ok(Box::new(tokio::net::UnixStream::connect(path).await?))
            }
            #[cfg(not(unix))]
            ConnectOptions::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }
}

/// Try each address in order; the first success wins.
async fn connect_any(addrs: &[SocketAddr]) -> io::Result<TcpStream> {
    let mut errors = Vec::new();
    for addr in addrs {
        match TcpStream::connect(*addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect attempt failed");
                errors.push(e);
            }
        }
    }
    match errors.len() {
        0 => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "lookup returned no addresses",
        )),
        1 => Err(errors.remove(0)),
        _ => Err(io::Error::other(AggregateError(errors))),
    }
}

/// How a socket error is reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketErrorClass {
    /// Failure reported by the OS.
    Syscall {
        kind: String,
        code: i32,
        message: String,
    },
    /// Several connect attempts failed.
    Aggregate(Vec<String>),
    Other(String),
}

pub fn classify(err: &io::Error) -> SocketErrorClass {
    if let Some(aggregate) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<AggregateError>())
    {
        return SocketErrorClass::Aggregate(aggregate.0.iter().map(|e| e.to_string()).collect());
    }
    match err.raw_os_error() {
        Some(code) => SocketErrorClass::Syscall {
            kind: format!("{:?}", err.kind()),
            code,
            message: err.to_string(),
        },
        None => SocketErrorClass::Other(err.to_string()),
    }
}
