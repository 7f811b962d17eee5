//! Operational telemetry: an atomics-based counter registry and a
//! read-only TCP endpoint serving a line-oriented text form or JSON,
//! selected by `?format=`.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use eg_core::action::ActionContext;
use eg_core::bus::Bus;

use crate::supervisor::Supervisor;

// ---------------------------------------------------------------------------
// GatewayMetrics
// ---------------------------------------------------------------------------

struct RuleCounters {
    matches: AtomicU64,
    executes: AtomicU64,
}

/// Hot-path counters are lock-free atomics; the per-rule label set is
/// rebuilt on each snapshot install so updates stay allocation-free.
pub struct GatewayMetrics {
    started: Instant,
    pub readings_in: AtomicU64,
    pub pipelines_ok: AtomicU64,
    pub pipelines_dropped: AtomicU64,
    pub condition_errors: AtomicU64,
    pub action_errors: AtomicU64,
    pub exec_timeouts: AtomicU64,
    pub reloads_ok: AtomicU64,
    pub reloads_failed: AtomicU64,
    rules: RwLock<BTreeMap<String, RuleCounters>>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            readings_in: AtomicU64::new(0),
            pipelines_ok: AtomicU64::new(0),
            pipelines_dropped: AtomicU64::new(0),
            condition_errors: AtomicU64::new(0),
            action_errors: AtomicU64::new(0),
            exec_timeouts: AtomicU64::new(0),
            reloads_ok: AtomicU64::new(0),
            reloads_failed: AtomicU64::new(0),
            rules: RwLock::new(BTreeMap::new()),
        }
    }

    /// Rebuild the per-rule counter set after a snapshot install. Counts
    /// for surviving rules carry over.
    pub fn set_rules(&self, ids: &[String]) {
        let mut rules = self.rules.write().expect("metrics lock poisoned");
        let mut next = BTreeMap::new();
        for id in ids {
            let counters = rules.remove(id).unwrap_or(RuleCounters {
                matches: AtomicU64::new(0),
                executes: AtomicU64::new(0),
            });
            next.insert(id.clone(), counters);
        }
        *rules = next;
    }

    pub fn rule_matched(&self, id: &str) {
        if let Some(c) = self.rules.read().expect("metrics lock poisoned").get(id) {
            c.matches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn rule_executed(&self, id: &str) {
        if let Some(c) = self.rules.read().expect("metrics lock poisoned").get(id) {
            c.executes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn rule_matches(&self, id: &str) -> u64 {
        self.rules
            .read()
            .expect("metrics lock poisoned")
            .get(id)
            .map(|c| c.matches.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

// ---------------------------------------------------------------------------
// TelemetryReport
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct TelemetryReport {
    pub uptime_secs: u64,
    pub adapters_running: usize,
    pub sinks_running: usize,
    pub readings_in_total: u64,
    pub readings_out_total: u64,
    pub readings_in_per_sec: f64,
    pub pipelines_ok: u64,
    pub pipelines_dropped: u64,
    pub condition_errors: u64,
    pub action_errors: u64,
    pub exec_timeouts: u64,
    pub reloads_ok: u64,
    pub reloads_failed: u64,
    pub rules: BTreeMap<String, RuleReport>,
    pub subscriptions: Vec<SubscriptionReport>,
    pub aggregate_states: usize,
    pub aggregate_bytes: usize,
    pub alerts_dispatched: u64,
    pub alerts_suppressed: u64,
    pub alert_channel_failures: u64,
    pub forward_success: u64,
    pub forward_failed: BTreeMap<String, u64>,
    pub filter_passed: u64,
    pub filter_dropped: u64,
    pub adapter_restarts: u64,
}

#[derive(Debug, Serialize)]
pub struct RuleReport {
    pub matches: u64,
    pub executes: u64,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionReport {
    pub pattern: String,
    pub group: Option<String>,
    pub queued: usize,
    pub dropped: u64,
}

/// Everything the read-only surface draws on. The management API and CLI
/// consume this composition; they never touch the data plane.
pub struct TelemetrySources {
    pub metrics: Arc<GatewayMetrics>,
    pub bus: Bus,
    pub actions: Arc<ActionContext>,
    pub supervisor: Arc<Supervisor>,
}

impl TelemetrySources {
    pub async fn report(&self) -> TelemetryReport {
        let (adapters_running, sinks_running) = self.supervisor.running_counts().await;
        let uptime = self.metrics.uptime_secs().max(1);
        let readings_in = self.metrics.readings_in.load(Ordering::Relaxed);
        let readings_out = self.supervisor.readings_published.load(Ordering::Relaxed);

        let rules = {
            let map = self.metrics.rules.read().expect("metrics lock poisoned");
            map.iter()
                .map(|(id, c)| {
                    (
                        id.clone(),
                        RuleReport {
                            matches: c.matches.load(Ordering::Relaxed),
                            executes: c.executes.load(Ordering::Relaxed),
                        },
                    )
                })
                .collect()
        };

        let subscriptions = self
            .bus
            .subscription_stats()
            .into_iter()
            .map(|s| SubscriptionReport {
                pattern: s.pattern,
                group: s.group,
                queued: s.queued,
                dropped: s.dropped,
            })
            .collect();

        let counters = &self.actions.forwarder.counters;
        let forward_failed = BTreeMap::from([
            ("http".to_string(), counters.http_failed.load(Ordering::Relaxed)),
            ("file".to_string(), counters.file_failed.load(Ordering::Relaxed)),
            ("mqtt".to_string(), counters.mqtt_failed.load(Ordering::Relaxed)),
            ("nats".to_string(), counters.nats_failed.load(Ordering::Relaxed)),
        ]);

        TelemetryReport {
            uptime_secs: self.metrics.uptime_secs(),
            adapters_running,
            sinks_running,
            readings_in_total: readings_in,
            readings_out_total: readings_out,
            readings_in_per_sec: readings_in as f64 / uptime as f64,
            pipelines_ok: self.metrics.pipelines_ok.load(Ordering::Relaxed),
            pipelines_dropped: self.metrics.pipelines_dropped.load(Ordering::Relaxed),
            condition_errors: self.metrics.condition_errors.load(Ordering::Relaxed),
            action_errors: self.metrics.action_errors.load(Ordering::Relaxed),
            exec_timeouts: self.metrics.exec_timeouts.load(Ordering::Relaxed),
            reloads_ok: self.metrics.reloads_ok.load(Ordering::Relaxed),
            reloads_failed: self.metrics.reloads_failed.load(Ordering::Relaxed),
            rules,
            subscriptions,
            aggregate_states: self.actions.aggregates.state_count(),
            aggregate_bytes: self.actions.aggregates.approx_bytes(),
            alerts_dispatched: self.actions.alerts.dispatched.load(Ordering::Relaxed),
            alerts_suppressed: self.actions.alerts.suppressed.load(Ordering::Relaxed),
            alert_channel_failures: self
                .actions
                .alerts
                .channel_failures
                .load(Ordering::Relaxed),
            forward_success: counters.success.load(Ordering::Relaxed),
            forward_failed,
            filter_passed: self.actions.filters.passed(),
            filter_dropped: self.actions.filters.dropped(),
            adapter_restarts: self.supervisor.restarts_total.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Serve `GET /stats` over plain TCP until cancelled. `?format=json` gives
/// the structured form; anything else the line-oriented text form.
pub async fn run_telemetry(
    listen: &str,
    sources: Arc<TelemetrySources>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    eg_info!(conn, listen = %listen, "telemetry endpoint up");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((mut sock, _)) = accepted else { continue };
                let sources = Arc::clone(&sources);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let Ok(n) = sock.read(&mut buf).await else { return };
                    let request = String::from_utf8_lossy(&buf[..n]);
                    let json = request
                        .lines()
                        .next()
                        .is_some_and(|line| line.contains("format=json"));

                    let report = sources.report().await;
                    let (content_type, body) = if json {
                        (
                            "application/json",
                            serde_json::to_string_pretty(&report)
                                .unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")),
                        )
                    } else {
                        ("text/plain", render_text(&report))
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(response.as_bytes()).await;
                });
            }
            _ = cancel.cancelled() => break,
        }
    }
    Ok(())
}

fn render_text(report: &TelemetryReport) -> String {
    let mut out = String::new();
    let mut line = |k: &str, v: String| {
        let _ = writeln!(out, "{k} {v}");
    };
    line("uptime_secs", report.uptime_secs.to_string());
    line("adapters_running", report.adapters_running.to_string());
    line("sinks_running", report.sinks_running.to_string());
    line("readings_in_total", report.readings_in_total.to_string());
    line("readings_out_total", report.readings_out_total.to_string());
    line(
        "readings_in_per_sec",
        format!("{:.2}", report.readings_in_per_sec),
    );
    line("pipelines_ok", report.pipelines_ok.to_string());
    line("pipelines_dropped", report.pipelines_dropped.to_string());
    line("condition_errors", report.condition_errors.to_string());
    line("action_errors", report.action_errors.to_string());
    line("exec_timeouts", report.exec_timeouts.to_string());
    line("reloads_ok", report.reloads_ok.to_string());
    line("reloads_failed", report.reloads_failed.to_string());
    line("aggregate_states", report.aggregate_states.to_string());
    line("aggregate_bytes", report.aggregate_bytes.to_string());
    line("alerts_dispatched", report.alerts_dispatched.to_string());
    line("alerts_suppressed", report.alerts_suppressed.to_string());
    line(
        "alert_channel_failures",
        report.alert_channel_failures.to_string(),
    );
    line("forward_success", report.forward_success.to_string());
    for (kind, count) in &report.forward_failed {
        line(&format!("forward_failed{{target=\"{kind}\"}}"), count.to_string());
    }
    line("filter_passed", report.filter_passed.to_string());
    line("filter_dropped", report.filter_dropped.to_string());
    line("adapter_restarts", report.adapter_restarts.to_string());
    for (id, rule) in &report.rules {
        line(
            &format!("rule_matches{{rule=\"{id}\"}}"),
            rule.matches.to_string(),
        );
        line(
            &format!("rule_executes{{rule=\"{id}\"}}"),
            rule.executes.to_string(),
        );
    }
    for sub in &report.subscriptions {
        line(
            &format!("subscription_dropped{{pattern=\"{}\"}}", sub.pattern),
            sub.dropped.to_string(),
        );
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
