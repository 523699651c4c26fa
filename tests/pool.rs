//! Socket pool against real loopback sockets.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use pgwire_core::driver::{
    ConnectOptions, EventKind, Pool, SocketContext, SocketErrorClass, SocketHandlers, SocketId,
    SocketPoolManager, TcpSocketFactory, TransportOptions, UniformJitter, Verdict,
};
use pgwire_core::protocol::FrontendMessage;
use pgwire_core::protocol::frontend::SSL_REQUEST_CODE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Outcomes(Arc<Mutex<Vec<(SocketId, String)>>>);

impl Outcomes {
    fn push(&self, socket: SocketId, outcome: impl Into<String>) {
        self.0.lock().unwrap().push((socket, outcome.into()));
    }

    fn for_kind(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, o)| o.starts_with(prefix))
            .count()
    }
}

struct SslRequester {
    request: Bytes,
    outcomes: Outcomes,
}

impl SocketHandlers for SslRequester {
    fn on_connect(&mut self, ctx: &mut SocketContext<'_>) -> Verdict {
        ctx.send(self.request.clone());
        Verdict::Promote
    }

    fn on_data(&mut self, ctx: &mut SocketContext<'_>, data: &[u8]) -> Verdict {
        self.outcomes
            .push(ctx.socket(), format!("answer:{}", String::from_utf8_lossy(data)));
        Verdict::Close
    }

    fn on_error(&mut self, ctx: &mut SocketContext<'_>, error: &SocketErrorClass) -> Verdict {
        let class = match error {
            SocketErrorClass::Syscall { .. } => "syscall",
            SocketErrorClass::Aggregate(_) => "aggregate",
            SocketErrorClass::Other(_) => "other",
        };
        self.outcomes.push(ctx.socket(), format!("error:{class}"));
        Verdict::Continue
    }

    fn on_close(&mut self, ctx: &mut SocketContext<'_>, had_error: bool) {
        self.outcomes.push(ctx.socket(), format!("close:{had_error}"));
    }
}

fn manager_for(port: u16) -> SocketPoolManager {
    let factory = TcpSocketFactory::new(TransportOptions::new(ConnectOptions::tcp("127.0.0.1", port)));
    SocketPoolManager::builder()
        .factory(Arc::new(factory))
        .jitter(UniformJitter::seeded(Duration::ZERO, Duration::from_millis(20), 9))
        .build()
        .unwrap()
}

async fn drive_until_empty(manager: &mut SocketPoolManager) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while !manager.is_empty() {
        let report = tokio::time::timeout(Duration::from_secs(10), manager.run_once())
            .await
            .expect("pool stalled")
            .expect("event channel closed");
        assert!(report.fault.is_none(), "{report:?}");
        manager.check_invariants().unwrap();
        kinds.push(report.kind);
    }
    kinds
}

/// Answers every SSLRequest with `N`, then waits for the client to hang up.
async fn fake_server(listener: TcpListener, connections: usize) {
    for _ in 0..connections {
        let (mut stream, _) = listener.accept().await.unwrap();
        tokio::spawn(async move {
            let mut request = [0u8; 8];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(
                i32::from_be_bytes([request[4], request[5], request[6], request[7]]),
                SSL_REQUEST_CODE
            );
            stream.write_all(b"N").await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });
    }
}

#[tokio::test]
async fn test_ssl_request_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(fake_server(listener, 3));

    let mut manager = manager_for(port);
    let request = FrontendMessage::SslRequest.to_bytes().unwrap();
    let outcomes = Outcomes::default();
    for _ in 0..3 {
        manager
            .create_socket_for_pool(
                Pool::Visiting,
                SslRequester {
                    request: request.clone(),
                    outcomes: outcomes.clone(),
                },
            )
            .unwrap();
    }
    assert_eq!(manager.pool_counts()[&Pool::Created], 3);

    let kinds = drive_until_empty(&mut manager).await;
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::Connect).count(), 3);
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::Finish).count(), 3);
    assert_eq!(outcomes.for_kind("answer:N"), 3);
    assert_eq!(outcomes.for_kind("close:false"), 3);

    let telemetry = manager.telemetry();
    assert_eq!(telemetry.events.close, 3);
    assert_eq!(telemetry.events.error, 0);
    assert_eq!(telemetry.bytes_written, 24);
    assert_eq!(telemetry.bytes_read, 3);
    assert_eq!(telemetry.pool_residence[&Pool::Created].samples, 3);
    assert!(telemetry.pool_residence.contains_key(&Pool::Visiting));
}

#[tokio::test]
async fn test_refused_connect_stays_per_socket() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut manager = manager_for(port);
    let outcomes = Outcomes::default();
    manager
        .create_socket_for_pool(
            Pool::Idle,
            SslRequester {
                request: Bytes::new(),
                outcomes: outcomes.clone(),
            },
        )
        .unwrap();

    drive_until_empty(&mut manager).await;
    assert_eq!(outcomes.for_kind("error:syscall"), 1);
    assert_eq!(outcomes.for_kind("close:true"), 1);
    assert_eq!(manager.telemetry().events.error, 1);
}
