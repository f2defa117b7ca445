//! Per-tenant status fan-out.
//!
//! Each tenant gets a bounded broadcast channel. Publishing never waits on
//! subscribers: one that falls behind loses the oldest events and is told
//! how many it missed. New subscribers first see a snapshot of the latest
//! known status (and preview URL) so a reconnecting observer always starts
//! with context.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::registry::{RuntimeRecord, RuntimeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StatusChange,
    LogsUpdate,
    UrlChange,
    Error,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub tenant_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(kind: EventKind, tenant_id: &str, payload: Value) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn status_change(record: &RuntimeRecord, url: &str) -> Self {
        Self::new(
            EventKind::StatusChange,
            &record.tenant_id,
            json!({
                "status": record.status,
                "exists": true,
                "runtimeId": record.runtime_id,
                "port": record.port,
                "url": url,
            }),
        )
    }

    /// Status of a tenant that has no runtime.
    pub fn absent(tenant_id: &str) -> Self {
        Self::new(
            EventKind::StatusChange,
            tenant_id,
            json!({ "status": RuntimeStatus::Stopped, "exists": false }),
        )
    }

    pub fn error(tenant_id: &str, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::Error,
            tenant_id,
            json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn url_change(tenant_id: &str, url: &str) -> Self {
        Self::new(EventKind::UrlChange, tenant_id, json!({ "url": url }))
    }

    pub fn ping(tenant_id: &str) -> Self {
        Self::new(EventKind::Ping, tenant_id, Value::Null)
    }

    /// The `status` field of a status-change payload.
    pub fn status(&self) -> Option<RuntimeStatus> {
        if self.kind != EventKind::StatusChange {
            return None;
        }
        serde_json::from_value(self.payload.get("status")?.clone()).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTail {
    pub lines: Vec<String>,
    pub next_cursor: u64,
}

/// Bounded line history. `lines[i]` carries sequence number `first_seq + i`,
/// so a cursor maps straight to an index.
#[derive(Debug)]
struct LogRing {
    first_seq: u64,
    capacity: usize,
    lines: VecDeque<String>,
}

impl LogRing {
    fn new(capacity: usize) -> Self {
        Self {
            first_seq: 1,
            capacity,
            lines: VecDeque::new(),
        }
    }

    /// Append a line and return its sequence number.
    fn push(&mut self, line: String) -> u64 {
        let seq = self.first_seq + self.lines.len() as u64;
        self.lines.push_back(line);
        if self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.first_seq += 1;
        }
        seq
    }

    /// Up to `limit` lines after `cursor`. Cursor 0 reads the newest lines;
    /// a cursor older than the ring resumes at the oldest retained line.
    fn read(&self, cursor: u64, limit: usize) -> LogTail {
        let start = if cursor == 0 {
            self.lines.len().saturating_sub(limit)
        } else {
            let offset = cursor.saturating_add(1).saturating_sub(self.first_seq);
            usize::try_from(offset).map_or(self.lines.len(), |o| o.min(self.lines.len()))
        };
        let lines: Vec<String> = self.lines.range(start..).take(limit).cloned().collect();
        let next_cursor = match lines.len() {
            0 => cursor,
            n => self.first_seq + (start + n) as u64 - 1,
        };
        LogTail { lines, next_cursor }
    }
}

#[derive(Debug)]
struct TenantChannel {
    tx: broadcast::Sender<StatusEvent>,
    last_status: Option<StatusEvent>,
    last_url: Option<StatusEvent>,
    logs: LogRing,
}

impl TenantChannel {
    fn is_live(&self) -> bool {
        self.last_status
            .as_ref()
            .and_then(StatusEvent::status)
            .is_some_and(RuntimeStatus::is_live)
    }
}

/// A subscriber's view of one tenant: snapshot first, then live events.
pub struct Subscription {
    inner: BoxStream<'static, StatusEvent>,
}

impl Stream for Subscription {
    type Item = StatusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[derive(Debug)]
pub struct StatusBroadcaster {
    channels: Mutex<HashMap<String, TenantChannel>>,
    capacity: usize,
    log_lines: usize,
}

impl StatusBroadcaster {
    pub fn new(capacity: usize, log_lines: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            log_lines: log_lines.max(1),
        }
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<String, TenantChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_channel(&self) -> TenantChannel {
        let (tx, _) = broadcast::channel(self.capacity);
        TenantChannel {
            tx,
            last_status: None,
            last_url: None,
            logs: LogRing::new(self.log_lines),
        }
    }

    /// Publish an event to every current subscriber of its tenant.
    pub fn publish(&self, event: StatusEvent) {
        let mut channels = self.channels();
        let channel = channels
            .entry(event.tenant_id.clone())
            .or_insert_with(|| self.new_channel());
        match event.kind {
            EventKind::StatusChange => {
                if event.status() == Some(RuntimeStatus::Stopped) {
                    channel.last_url = None;
                }
                channel.last_status = Some(event.clone());
            }
            EventKind::UrlChange => channel.last_url = Some(event.clone()),
            _ => {}
        }
        // Sending under the map lock keeps per-tenant order identical to
        // publish order. An error only means nobody is listening.
        let _ = channel.tx.send(event);
    }

    /// Append a log line to the tenant's buffer and publish it as `logs-update`.
    pub fn publish_log(&self, tenant_id: &str, stream: LogStream, line: impl Into<String>) {
        let line = line.into();
        let mut channels = self.channels();
        let channel = channels
            .entry(tenant_id.to_string())
            .or_insert_with(|| self.new_channel());
        let seq = channel.logs.push(line.clone());
        let event = StatusEvent::new(
            EventKind::LogsUpdate,
            tenant_id,
            json!({ "stream": stream, "line": line, "seq": seq }),
        );
        let _ = channel.tx.send(event);
    }

    pub fn subscribe(&self, tenant_id: &str) -> Subscription {
        let (rx, initial) = {
            let mut channels = self.channels();
            let channel = channels
                .entry(tenant_id.to_string())
                .or_insert_with(|| self.new_channel());
            let rx = channel.tx.subscribe();

            let mut snapshot = channel
                .last_status
                .clone()
                .unwrap_or_else(|| StatusEvent::absent(tenant_id));
            snapshot.timestamp = Utc::now();
            if let Value::Object(map) = &mut snapshot.payload {
                map.insert("snapshot".to_string(), Value::Bool(true));
            }
            let mut initial = vec![snapshot];
            initial.extend(channel.last_url.clone());
            (rx, initial)
        };

        let tenant = tenant_id.to_string();
        let live = BroadcastStream::new(rx).map(move |item| match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                debug!(tenant = %tenant, missed, "subscriber lagged");
                StatusEvent::new(
                    EventKind::Error,
                    &tenant,
                    json!({
                        "code": "lagged",
                        "message": format!("{missed} events were dropped for a slow subscriber"),
                        "lagged": missed,
                    }),
                )
            }
        });

        Subscription {
            inner: stream::iter(initial).chain(live).boxed(),
        }
    }

    pub fn subscriber_count(&self, tenant_id: &str) -> usize {
        self.channels()
            .get(tenant_id)
            .map_or(0, |c| c.tx.receiver_count())
    }

    /// Latest log lines for a tenant.
    pub fn tail(&self, tenant_id: &str, cursor: u64, limit: usize) -> LogTail {
        self.channels()
            .get(tenant_id)
            .map(|c| c.logs.read(cursor, limit.max(1)))
            .unwrap_or(LogTail {
                lines: Vec::new(),
                next_cursor: cursor,
            })
    }

    /// Drop the tenant's channel if nobody is subscribed.
    pub fn prune(&self, tenant_id: &str) {
        let mut channels = self.channels();
        if channels
            .get(tenant_id)
            .is_some_and(|c| c.tx.receiver_count() == 0)
        {
            channels.remove(tenant_id);
        }
    }

    /// Send a `ping` to every tenant with subscribers. Channels with neither
    /// subscribers nor a live runtime are dropped.
    pub fn ping_all(&self) -> usize {
        let mut channels = self.channels();
        channels.retain(|_, c| c.tx.receiver_count() > 0 || c.is_live());
        let mut pinged = 0;
        for (tenant, channel) in channels.iter() {
            if channel.tx.receiver_count() > 0 && channel.tx.send(StatusEvent::ping(tenant)).is_ok()
            {
                pinged += 1;
            }
        }
        pinged
    }

    /// Heartbeat loop; returns when `cancel` fires.
    pub async fn run_heartbeat(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pinged = self.ping_all();
                    debug!(pinged, "heartbeat");
                }
            }
        }
    }
}
