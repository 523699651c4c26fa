//! Socket manager telemetry.
//!
//! Durations are reduced to bucket keys by a caller-supplied function and
//! counted per key. Every sample is also emitted through `metrics`, so an
//! installed exporter sees the same data.

use std::collections::BTreeMap;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::Serialize;

use super::pool_list::Pool;

/// Maps a duration to a histogram bucket.
pub type BucketFn = fn(Duration) -> u32;

/// Bucket `k` holds durations in `[2^(k-1), 2^k)` milliseconds; bucket 0
/// holds anything under a millisecond.
pub fn log2_millis(elapsed: Duration) -> u32 {
    let ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
    64 - ms.leading_zeros()
}

/// What a timed sample measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    /// Time between two network events on one socket.
    Network,
    /// Time spent inside handler code.
    IomCode,
    /// Placement to established connection, jitter included.
    Connect,
    /// Time spent in `SocketFactory::secure`.
    SslConnect,
    Finish,
    End,
    Close,
    /// Backpressure onset to drain.
    Drained,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Network => "network",
            Activity::IomCode => "iom_code",
            Activity::Connect => "connect",
            Activity::SslConnect => "ssl_connect",
            Activity::Finish => "finish",
            Activity::End => "end",
            Activity::Close => "close",
            Activity::Drained => "drained",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Error,
    Idle,
    End,
    Close,
}

impl SocketEvent {
    fn as_str(self) -> &'static str {
        match self {
            SocketEvent::Error => "error",
            SocketEvent::Idle => "idle",
            SocketEvent::End => "end",
            SocketEvent::Close => "close",
        }
    }
}

/// Bucket key to sample count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Histogram {
    pub buckets: BTreeMap<u32, u64>,
    pub samples: u64,
}

impl Histogram {
    fn record(&mut self, bucket: u32) {
        *self.buckets.entry(bucket).or_insert(0) += 1;
        self.samples += 1;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounters {
    pub error: u64,
    pub idle: u64,
    pub end: u64,
    pub close: u64,
}

/// Point-in-time copy of all telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub activities: BTreeMap<Activity, Histogram>,
    pub pool_residence: BTreeMap<Pool, Histogram>,
    pub events: EventCounters,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug)]
pub struct Telemetry {
    activity_bucket: BucketFn,
    pool_bucket: BucketFn,
    data: TelemetrySnapshot,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(log2_millis, log2_millis)
    }
}

impl Telemetry {
    pub fn new(activity_bucket: BucketFn, pool_bucket: BucketFn) -> Self {
        Self {
            activity_bucket,
            pool_bucket,
            data: TelemetrySnapshot::default(),
        }
    }

    pub fn record_activity(&mut self, activity: Activity, elapsed: Duration) {
        let bucket = (self.activity_bucket)(elapsed);
        self.data.activities.entry(activity).or_default().record(bucket);
        histogram!("pgwire_activity_ms", "activity" => activity.as_str())
            .record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Time spent in `pool` before leaving it.
    pub fn record_residence(&mut self, pool: Pool, elapsed: Duration) {
        let bucket = (self.pool_bucket)(elapsed);
        self.data.pool_residence.entry(pool).or_default().record(bucket);
        histogram!("pgwire_pool_residence_ms", "pool" => pool.as_str())
            .record(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn count(&mut self, event: SocketEvent) {
        let slot = match event {
            SocketEvent::Error => &mut self.data.events.error,
            SocketEvent::Idle => &mut self.data.events.idle,
            SocketEvent::End => &mut self.data.events.end,
            SocketEvent::Close => &mut self.data.events.close,
        };
        *slot += 1;
        counter!("pgwire_socket_events_total", "event" => event.as_str()).increment(1);
    }

    pub fn add_bytes(&mut self, read: u64, written: u64) {
        self.data.bytes_read += read;
        self.data.bytes_written += written;
        if read > 0 {
            counter!("pgwire_bytes_read_total").increment(read);
        }
        if written > 0 {
            counter!("pgwire_bytes_written_total").increment(written);
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.data.clone()
    }
}
