use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// tokio's Instant honours paused test clocks, which the throttle tests rely
// on.
use tokio::time::Instant;

use chrono::{DateTime, Utc};
use orion_error::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use eg_config::HumanDuration;

use crate::bus::{Bus, alert_subject};
use crate::error::{CoreError, CoreReason, CoreResult};
use crate::reading::Reading;
use crate::template;

// ---------------------------------------------------------------------------
// AlertParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertParams {
    pub level: AlertLevel,
    /// Message template (`{{.Field}}` substitution).
    pub message: String,
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    /// Same-fingerprint alerts inside this window are suppressed; zero (or
    /// absent) disables throttling.
    #[serde(default)]
    pub throttle: Option<HumanDuration>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Override the default `(rule, level, device, key)` fingerprint with
    /// reading field paths.
    #[serde(default)]
    pub fingerprint_fields: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub retry_enabled: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_send_timeout")]
    pub timeout: HumanDuration,
}

fn default_true() -> bool {
    true
}
fn default_retry_count() -> u32 {
    2
}
fn default_send_timeout() -> HumanDuration {
    Duration::from_secs(5).into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Console,
    Webhook,
    Nats,
    Email,
    Sms,
}

// ---------------------------------------------------------------------------
// AlertEvent — the dispatched record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule_id: String,
    pub level: AlertLevel,
    pub device_id: String,
    pub key: String,
    pub message: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub fired_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AlertDispatcher — throttle + multi-channel fan-out
// ---------------------------------------------------------------------------

struct ThrottleEntry {
    last_emit: Instant,
    last_seen: Instant,
    suppressed: u64,
}

/// Fingerprint-keyed throttle and channel fan-out. At most one alert per
/// fingerprint is dispatched per throttle window; a dispatch succeeds when
/// at least one channel delivered.
pub struct AlertDispatcher {
    bus: Bus,
    http: reqwest::Client,
    throttle: Mutex<HashMap<[u8; 32], ThrottleEntry>>,
    pub dispatched: AtomicU64,
    pub suppressed: AtomicU64,
    pub channel_failures: AtomicU64,
}

impl AlertDispatcher {
    pub fn new(bus: Bus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            http: reqwest::Client::new(),
            throttle: Mutex::new(HashMap::new()),
            dispatched: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            channel_failures: AtomicU64::new(0),
        })
    }

    /// Evaluate throttling and, if the alert passes, dispatch it.
    ///
    /// Returns `Ok(true)` when dispatched, `Ok(false)` when suppressed, and
    /// an action error when every channel failed.
    pub async fn fire(
        &self,
        rule_id: &str,
        params: &AlertParams,
        reading: &Reading,
    ) -> CoreResult<bool> {
        let window = params
            .throttle
            .map(|t| t.as_duration())
            .unwrap_or(Duration::ZERO);
        if !window.is_zero() && self.is_suppressed(rule_id, params, reading, window) {
            return Ok(false);
        }

        let event = self.build_event(rule_id, params, reading);
        self.dispatch(params, &event).await?;
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Suppression counters reset once a fingerprint has been idle longer
    /// than its throttle window.
    fn is_suppressed(
        &self,
        rule_id: &str,
        params: &AlertParams,
        reading: &Reading,
        window: Duration,
    ) -> bool {
        let fp = fingerprint(rule_id, params, reading);
        let now = Instant::now();
        let mut entries = self.throttle.lock().expect("throttle lock poisoned");
        match entries.get_mut(&fp) {
            Some(entry) => {
                if now.duration_since(entry.last_seen) > window {
                    entry.suppressed = 0;
                }
                entry.last_seen = now;
                if now.duration_since(entry.last_emit) < window {
                    entry.suppressed += 1;
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    true
                } else {
                    entry.last_emit = now;
                    false
                }
            }
            None => {
                entries.insert(
                    fp,
                    ThrottleEntry {
                        last_emit: now,
                        last_seen: now,
                        suppressed: 0,
                    },
                );
                false
            }
        }
    }

    /// Drop throttle entries idle longer than `ttl`.
    pub fn sweep(&self, ttl: Duration) {
        let now = Instant::now();
        self.throttle
            .lock()
            .expect("throttle lock poisoned")
            .retain(|_, e| now.duration_since(e.last_seen) < ttl);
    }

    fn build_event(&self, rule_id: &str, params: &AlertParams, reading: &Reading) -> AlertEvent {
        let extras = HashMap::from([("Level", params.level.as_str().to_string())]);
        let message = template::expand(&params.message, reading, &extras);
        let mut tags = reading.tags.clone();
        for (k, v) in &params.tags {
            tags.insert(k.clone(), template::expand(v, reading, &extras));
        }
        AlertEvent {
            rule_id: rule_id.to_string(),
            level: params.level,
            device_id: reading.device_id.clone(),
            key: reading.key.clone(),
            message,
            value: serde_json::to_value(&reading.value).unwrap_or(serde_json::Value::Null),
            tags,
            fired_at: Utc::now(),
        }
    }

    /// Fan out to the configured channels. The alert event is always
    /// published on the bus (`alerts.<level>.<device>`) for the data plane;
    /// partial channel failure is non-fatal.
    async fn dispatch(&self, params: &AlertParams, event: &AlertEvent) -> CoreResult<()> {
        let body = serde_json::to_vec(event)
            .map_err(|e| alert_err(format!("encode alert: {e}")))?;
        let _ = self
            .bus
            .publish(&alert_subject(event.level.as_str(), &event.device_id), body.clone());

        if params.channels.is_empty() {
            return Ok(());
        }

        let mut delivered = 0usize;
        for channel in &params.channels {
            match self.send_channel(params, channel, event, &body).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.channel_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "alert channel {:?} failed for rule {}: {e}",
                        channel.kind,
                        event.rule_id
                    );
                }
            }
        }

        if delivered == 0 {
            return Err(alert_err(format!(
                "all {} alert channels failed for rule {}",
                params.channels.len(),
                event.rule_id
            )));
        }
        Ok(())
    }

    async fn send_channel(
        &self,
        params: &AlertParams,
        channel: &ChannelSpec,
        event: &AlertEvent,
        body: &[u8],
    ) -> CoreResult<()> {
        let attempts = if params.retry_enabled {
            params.retry_count + 1
        } else {
            1
        };
        let mut backoff = Duration::from_millis(100);
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(2));
            }
            match self.send_once(params, channel, event, body).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| alert_err("channel send failed")))
    }

    async fn send_once(
        &self,
        params: &AlertParams,
        channel: &ChannelSpec,
        event: &AlertEvent,
        body: &[u8],
    ) -> CoreResult<()> {
        match channel.kind {
            ChannelKind::Console => {
                log::info!(
                    "[alert:{}] rule={} device={} key={} {}",
                    event.level.as_str(),
                    event.rule_id,
                    event.device_id,
                    event.key,
                    event.message
                );
                Ok(())
            }
            ChannelKind::Webhook => {
                let url = channel
                    .config
                    .get("url")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| alert_err("webhook channel without url"))?;
                let method = channel
                    .config
                    .get("method")
                    .and_then(|v| v.as_str())
                    .unwrap_or("POST");
                let method = reqwest::Method::from_bytes(method.as_bytes())
                    .map_err(|_| alert_err(format!("bad webhook method {method:?}")))?;
                let mut req = self
                    .http
                    .request(method, url)
                    .timeout(params.timeout.as_duration())
                    .header("content-type", "application/json")
                    .body(body.to_vec());
                if let Some(headers) = channel.config.get("headers").and_then(|v| v.as_object()) {
                    for (name, value) in headers {
                        if let Some(value) = value.as_str() {
                            req = req.header(name, value);
                        }
                    }
                }
                if let Some(token) = channel.config.get("bearer_token").and_then(|v| v.as_str())
                {
                    req = req.bearer_auth(token);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| alert_err(format!("webhook send: {e}")))?;
                if !resp.status().is_success() {
                    return Err(alert_err(format!("webhook status {}", resp.status())));
                }
                Ok(())
            }
            ChannelKind::Nats => {
                // Only publishes to an explicitly configured subject — the
                // standard alerts.* publish already happened.
                let subject = channel
                    .config
                    .get("subject")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| alert_err("nats channel without subject"))?;
                self.bus.publish(subject, body.to_vec())
            }
            ChannelKind::Email => Err(alert_err("email channel is not implemented")),
            ChannelKind::Sms => Err(alert_err("sms channel is not implemented")),
        }
    }
}

/// `(rule_id, level, device_id, key)` unless overridden by
/// `fingerprint_fields`.
fn fingerprint(rule_id: &str, params: &AlertParams, reading: &Reading) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    hasher.update([0]);
    match &params.fingerprint_fields {
        Some(fields) => {
            for field in fields {
                let v = reading
                    .field(field)
                    .map(|s| s.display_string())
                    .unwrap_or_default();
                hasher.update(v.as_bytes());
                hasher.update([0]);
            }
        }
        None => {
            hasher.update(params.level.as_str().as_bytes());
            hasher.update([0]);
            hasher.update(reading.device_id.as_bytes());
            hasher.update([0]);
            hasher.update(reading.key.as_bytes());
        }
    }
    hasher.finalize().into()
}

fn alert_err(detail: impl Into<String>) -> CoreError {
    StructError::from(CoreReason::Action).with_detail(detail.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
