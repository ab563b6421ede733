//! Best-effort usage telemetry.
//!
//! [`Dispatcher::track`] never blocks: events go into a bounded queue drained
//! by a single background thread, started on first use. When the queue is full
//! the new event is dropped. Delivery failures are counted and logged, never
//! retried and never reported to the code that produced the event.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::events::TelemetryEvent;

pub const QUEUE_CAPACITY: usize = 200;
pub const INGEST_PATH: &str = "functions/v1/quicksend-analytics-ingest";

/// Raw HTTP reply from the ingestion endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

/// Posts one event. `Err` means the request never got an HTTP reply.
pub trait Transport: Send + Sync {
    fn post(
        &self,
        url: &str,
        api_key: &str,
        event: &TelemetryEvent,
        timeout: Duration,
    ) -> Result<Response>;
}

/// Blocking HTTPS transport.
///
/// A client is built per call so it is created and dropped on the calling
/// thread, which is never an async runtime worker.
#[derive(Debug, Default)]
pub struct HttpTransport;

impl Transport for HttpTransport {
    fn post(
        &self,
        url: &str,
        api_key: &str,
        event: &TelemetryEvent,
        timeout: Duration,
    ) -> Result<Response> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::DeliveryFailed(e.to_string()))?;
        let response = client
            .post(url)
            .header("apikey", api_key)
            .bearer_auth(api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(event)
            .send()
            .map_err(|e| Error::DeliveryFailed(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        Ok(Response { status, body })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackOutcome {
    Disabled,
    Enqueued,
    Dropped,
}

/// Result of a synchronous diagnostic post.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PostResult {
    pub ok: bool,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Cheap to clone; clones share the queue and worker.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: TelemetryConfig,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    sender: OnceLock<Option<SyncSender<TelemetryEvent>>>,
}

impl Dispatcher {
    pub fn new(config: TelemetryConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport))
    }

    pub fn with_transport(config: TelemetryConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                counters: Arc::new(Counters::default()),
                sender: OnceLock::new(),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self::new(TelemetryConfig::default())
    }

    pub fn enabled(&self) -> bool {
        self.inner.config.enabled()
    }

    /// Queue `event` for delivery without waiting.
    pub fn track(&self, event: TelemetryEvent) -> TrackOutcome {
        if !self.enabled() {
            return TrackOutcome::Disabled;
        }
        let counters = &self.inner.counters;
        let Some(sender) = self.sender() else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            return TrackOutcome::Dropped;
        };
        match sender.try_send(event) {
            Ok(()) => {
                counters.enqueued.fetch_add(1, Ordering::Relaxed);
                TrackOutcome::Enqueued
            }
            Err(TrySendError::Full(event)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event = ?event.event_name, "telemetry queue full, dropping event");
                TrackOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                TrackOutcome::Dropped
            }
        }
    }

    /// Post `event` on the calling thread, bypassing the queue.
    pub fn post_now(&self, event: &TelemetryEvent) -> PostResult {
        if !self.enabled() {
            return PostResult {
                error: Some("telemetry is disabled or not configured".into()),
                ..PostResult::default()
            };
        }
        deliver(&self.inner.config, self.inner.transport.as_ref(), event)
    }

    pub fn stats(&self) -> TelemetryStats {
        let c = &self.inner.counters;
        TelemetryStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn worker_started(&self) -> bool {
        self.inner.sender.get().is_some()
    }

    fn sender(&self) -> Option<&SyncSender<TelemetryEvent>> {
        self.inner
            .sender
            .get_or_init(|| {
                let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
                let config = self.inner.config.clone();
                let transport = self.inner.transport.clone();
                let counters = self.inner.counters.clone();
                match thread::Builder::new()
                    .name("telemetry".into())
                    .spawn(move || drain(rx, config, transport, counters))
                {
                    Ok(_) => Some(tx),
                    Err(e) => {
                        warn!(error = %e, "cannot start telemetry worker");
                        None
                    }
                }
            })
            .as_ref()
    }
}

// Runs until every sender is gone.
fn drain(
    rx: Receiver<TelemetryEvent>,
    config: TelemetryConfig,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
) {
    while let Ok(event) = rx.recv() {
        let result = deliver(&config, transport.as_ref(), &event);
        if result.ok {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            debug!(
                event = ?event.event_name,
                status = ?result.status,
                error = ?result.error,
                "telemetry delivery failed"
            );
        }
    }
    debug!("telemetry worker stopped");
}

fn deliver(config: &TelemetryConfig, transport: &dyn Transport, event: &TelemetryEvent) -> PostResult {
    let url = format!("{}/{}", config.base_url, INGEST_PATH);
    match transport.post(&url, &config.anon_key, event, config.timeout) {
        Ok(response) => PostResult {
            ok: (200..300).contains(&response.status),
            status: Some(response.status),
            body: Some(response.body),
            error: None,
        },
        Err(e) => PostResult {
            error: Some(e.to_string()),
            ..PostResult::default()
        },
    }
}
