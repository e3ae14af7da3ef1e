//! Structured event logging (C9).
//!
//! Every state transition in the node funnels through [`LogSink::emit`]. The
//! console sink (plain [`tracing`] events) is always active; a CloudWatch
//! Logs sink can be layered on top when `USE_CLOUDWATCH=1`, mirroring the
//! always-local/optionally-remote split of the original node's logger.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use aws_sdk_cloudwatchlogs::types::InputLogEvent;
use aws_sdk_cloudwatchlogs::Client as CloudWatchClient;
use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{info, warn};

/// A single structured event, shaped after the node's JSON log lines.
///
/// `extra` carries the same role as the original node's `log_event(event_type,
/// message, **kwargs)` — arbitrary additional fields are flattened into the
/// serialized JSON object alongside the fixed ones.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub node_id: u32,
    pub timestamp_iso: String,
    pub lamport_clock: u64,
    pub event_type: &'static str,
    pub message: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LogEvent {
    pub fn new(node_id: u32, lamport_clock: u64, event_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            node_id,
            timestamp_iso: iso_now(),
            lamport_clock,
            event_type,
            message: message.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// Attach one extra structured field, mirroring the original node's
    /// `log_event(..., **kwargs)` call sites (e.g. `req_clock=`, `error=`).
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// UTC timestamp as `YYYY-MM-DDTHH:MM:SS`, matching the original node's
/// `time.strftime("%Y-%m-%dT%H:%M:%S", time.gmtime())`.
fn iso_now() -> String {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    let (year, month, day) = civil_from_days(days);
    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}")
}

/// Days-since-epoch to a proleptic-Gregorian `(year, month, day)`, per Howard
/// Hinnant's `civil_from_days`. Avoids pulling in a date/time crate for a
/// single UTC-only conversion.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Destination for [`LogEvent`]s. Implementors must not block the caller.
pub trait LogSink: Send + Sync {
    fn emit(&self, event: LogEvent);
}

/// Always-on sink: one `tracing` event per log line, at `info` level.
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn emit(&self, event: LogEvent) {
        info!(
            node_id = event.node_id,
            lamport_clock = event.lamport_clock,
            event_type = event.event_type,
            extra = ?event.extra,
            "{}",
            event.message
        );
    }
}

/// Wraps an inner sink with an optional, best-effort CloudWatch Logs shipper.
///
/// Every event still reaches the inner sink synchronously; the CloudWatch
/// push happens on a background task fed by an unbounded channel, so a slow
/// or unreachable AWS endpoint never adds latency to the caller.
pub struct ShippingSink {
    inner: Box<dyn LogSink>,
    cloudwatch_tx: Option<UnboundedSender<LogEvent>>,
}

impl ShippingSink {
    pub fn console_only() -> Self {
        Self {
            inner: Box::new(ConsoleSink),
            cloudwatch_tx: None,
        }
    }

    /// Build a sink that also forwards to CloudWatch Logs, started only when
    /// `USE_CLOUDWATCH` is truthy. `AWS_REGION` (default `us-east-1`) selects
    /// the region; group/stream follow the node's id.
    pub async fn from_env(node_id: u32) -> Self {
        let use_cloudwatch = std::env::var("USE_CLOUDWATCH")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        if !use_cloudwatch {
            return Self::console_only();
        }

        let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
        let shared_config = aws_config::from_env()
            .region(aws_config::Region::new(region.clone()))
            .load()
            .await;
        let client = CloudWatchClient::new(&shared_config);

        let log_group = "Distributed_System_Logs".to_string();
        let log_stream = format!("Node_{node_id}");

        if let Err(err) = client
            .create_log_group()
            .log_group_name(&log_group)
            .send()
            .await
        {
            warn!(error = %err, "create_log_group failed (likely already exists)");
        }
        if let Err(err) = client
            .create_log_stream()
            .log_group_name(&log_group)
            .log_stream_name(&log_stream)
            .send()
            .await
        {
            warn!(error = %err, "create_log_stream failed (likely already exists)");
        }

        let (tx, mut rx) = unbounded_channel::<LogEvent>();

        tokio::spawn(async move {
            let shipper = CloudWatchShipper::new(client, log_group, log_stream);
            while let Some(event) = rx.recv().await {
                shipper.send(&event).await;
            }
        });

        info!(node_id, region = %region, "CloudWatch logging enabled");

        Self {
            inner: Box::new(ConsoleSink),
            cloudwatch_tx: Some(tx),
        }
    }
}

impl LogSink for ShippingSink {
    fn emit(&self, event: LogEvent) {
        self.inner.emit(event.clone());
        if let Some(tx) = &self.cloudwatch_tx {
            // An unbounded send only fails if the receiver task has ended,
            // which happens only once the whole process is shutting down.
            let _ = tx.send(event);
        }
    }
}

/// Holds the CloudWatch sequence token across pushes; one per log stream.
struct CloudWatchShipper {
    client: CloudWatchClient,
    log_group: String,
    log_stream: String,
    sequence_token: std::sync::Mutex<Option<String>>,
    failures: AtomicU64,
}

impl CloudWatchShipper {
    fn new(client: CloudWatchClient, log_group: String, log_stream: String) -> Self {
        Self {
            client,
            log_group,
            log_stream,
            sequence_token: std::sync::Mutex::new(None),
            failures: AtomicU64::new(0),
        }
    }

    async fn send(&self, event: &LogEvent) {
        let body = match serde_json::to_string(event) {
            Ok(body) => body,
            Err(_) => return,
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        let input_event = match InputLogEvent::builder()
            .timestamp(timestamp)
            .message(body)
            .build()
        {
            Ok(e) => e,
            Err(_) => return,
        };

        let token = self.sequence_token.lock().unwrap().clone();
        let mut request = self
            .client
            .put_log_events()
            .log_group_name(&self.log_group)
            .log_stream_name(&self.log_stream)
            .log_events(input_event.clone());
        if let Some(token) = token {
            request = request.sequence_token(token);
        }

        match request.send().await {
            Ok(resp) => {
                *self.sequence_token.lock().unwrap() = resp.next_sequence_token().map(str::to_owned);
            }
            Err(err) => {
                // One retry with no sequence token: a fresh stream or a
                // token we never learned will often accept this.
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "cloudwatch push failed, retrying once without sequence token");
                let retry = self
                    .client
                    .put_log_events()
                    .log_group_name(&self.log_group)
                    .log_stream_name(&self.log_stream)
                    .log_events(input_event)
                    .send()
                    .await;
                if let Ok(resp) = retry {
                    *self.sequence_token.lock().unwrap() = resp.next_sequence_token().map(str::to_owned);
                } else if let Err(err) = retry {
                    warn!(error = %err, "cloudwatch retry failed, dropping event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        events: Arc<Mutex<Vec<LogEvent>>>,
    }

    impl LogSink for RecordingSink {
        fn emit(&self, event: LogEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn civil_from_days_matches_known_epoch_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(19_716), (2023, 12, 25));
    }

    #[test]
    fn with_field_flattens_into_extra() {
        let event = LogEvent::new(1, 4, "MUTEX", "requesting critical section").with_field("req_clock", 4);
        assert_eq!(event.extra.get("req_clock").and_then(|v| v.as_u64()), Some(4));
    }

    #[test]
    #[tracing_test::traced_test]
    fn console_sink_does_not_panic() {
        let sink = ConsoleSink;
        sink.emit(LogEvent::new(1, 4, "REQUEST_CS", "entering critical section"));
    }

    #[test]
    fn recording_sink_collects_events_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = RecordingSink {
            events: events.clone(),
        };
        sink.emit(LogEvent::new(1, 1, "NODE_DOWN", "peer 2 unreachable"));
        sink.emit(LogEvent::new(1, 2, "LEADER_ELECTED", "node 3 is coordinator"));
        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].event_type, "NODE_DOWN");
        assert_eq!(recorded[1].event_type, "LEADER_ELECTED");
    }
}
