use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use orion_error::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use eg_config::HumanDuration;

use crate::bus::Bus;
use crate::error::{CoreError, CoreReason, CoreResult};
use crate::reading::Reading;
use crate::template;

// ---------------------------------------------------------------------------
// ForwardParams
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardParams {
    pub targets: Vec<ForwardTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardTarget {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// Asynchronous targets dispatch on the bounded worker pool; their
    /// failures are counted, not propagated.
    #[serde(default, rename = "async")]
    pub is_async: bool,
    #[serde(default = "default_timeout")]
    pub timeout: HumanDuration,
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub retry: u32,

    // http
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthSpec>,

    // file
    #[serde(default)]
    pub path: Option<String>,

    // mqtt (accepted by the parser; dispatch is an external contract)
    #[serde(default)]
    pub broker: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,

    // nats
    #[serde(default)]
    pub subject: Option<String>,

    #[serde(default)]
    pub data_transform: Option<DataTransform>,
    #[serde(default)]
    pub template: Option<PayloadTemplate>,
}

fn default_timeout() -> HumanDuration {
    Duration::from_secs(5).into()
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Http,
    File,
    Mqtt,
    Nats,
}

impl TargetKind {
    fn name(self) -> &'static str {
        match self {
            TargetKind::Http => "http",
            TargetKind::File => "file",
            TargetKind::Mqtt => "mqtt",
            TargetKind::Nats => "nats",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum AuthSpec {
    Bearer { token: String },
    Basic { username: String, password: String },
}

/// Field projection applied before serialization: keep `include` (all when
/// empty), drop `exclude`, rename, then add constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataTransform {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub rename: HashMap<String, String>,
    #[serde(default)]
    pub constants: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadTemplate {
    pub format: PayloadFormat,
    /// Field-substitution template, used by `text`.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    Json,
    Csv,
    Text,
}

// ---------------------------------------------------------------------------
// ForwardExecutor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ForwardCounters {
    pub success: AtomicU64,
    pub http_failed: AtomicU64,
    pub file_failed: AtomicU64,
    pub mqtt_failed: AtomicU64,
    pub nats_failed: AtomicU64,
}

impl ForwardCounters {
    fn failed_for(&self, kind: TargetKind) -> &AtomicU64 {
        match kind {
            TargetKind::Http => &self.http_failed,
            TargetKind::File => &self.file_failed,
            TargetKind::Mqtt => &self.mqtt_failed,
            TargetKind::Nats => &self.nats_failed,
        }
    }
}

/// Dispatches forward targets. Synchronous targets block the pipeline until
/// delivery or timeout; asynchronous ones run on a semaphore-bounded pool.
/// A target that exhausts its retries is dropped and counted; the pipeline
/// always continues.
pub struct ForwardExecutor {
    http: reqwest::Client,
    bus: Bus,
    pool: Arc<Semaphore>,
    pub counters: Arc<ForwardCounters>,
}

impl ForwardExecutor {
    pub fn new(bus: Bus, async_workers: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            bus,
            pool: Arc::new(Semaphore::new(async_workers.max(1))),
            counters: Arc::new(ForwardCounters::default()),
        }
    }

    pub async fn execute(&self, params: &ForwardParams, reading: &Reading) -> CoreResult<()> {
        for target in &params.targets {
            let payload = build_payload(target, reading)?;
            if target.is_async {
                self.dispatch_async(target.clone(), payload);
            } else {
                let kind = target.kind;
                if let Err(e) =
                    send_with_retry(&self.http, &self.bus, target, payload).await
                {
                    self.counters.failed_for(kind).fetch_add(1, Ordering::Relaxed);
                    log::warn!("forward {} target failed: {e}", kind.name());
                } else {
                    self.counters.success.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    fn dispatch_async(&self, target: ForwardTarget, payload: Vec<u8>) {
        let http = self.http.clone();
        let bus = self.bus.clone();
        let pool = Arc::clone(&self.pool);
        let counters = Arc::clone(&self.counters);
        tokio::spawn(async move {
            let _permit = match pool.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let kind = target.kind;
            match send_with_retry(&http, &bus, &target, payload).await {
                Ok(()) => {
                    counters.success.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    counters.failed_for(kind).fetch_add(1, Ordering::Relaxed);
                    log::warn!("async forward {} target failed: {e}", kind.name());
                }
            }
        });
    }
}

/// One initial attempt plus `retry` retries under exponential backoff, each
/// attempt bounded by the target timeout.
async fn send_with_retry(
    http: &reqwest::Client,
    bus: &Bus,
    target: &ForwardTarget,
    payload: Vec<u8>,
) -> CoreResult<()> {
    let attempts = target.retry + 1;
    let mut backoff = Duration::from_millis(100);
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
        match send_once(http, bus, target, &payload).await {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| action_err("forward failed with no attempts")))
}

async fn send_once(
    http: &reqwest::Client,
    bus: &Bus,
    target: &ForwardTarget,
    payload: &[u8],
) -> CoreResult<()> {
    let timeout = target.timeout.as_duration();
    match target.kind {
        TargetKind::Http => {
            let url = target
                .url
                .as_deref()
                .ok_or_else(|| action_err("http target without url"))?;
            let method = reqwest::Method::from_bytes(target.method.as_bytes())
                .map_err(|_| action_err(format!("bad http method {:?}", target.method)))?;
            let mut req = http
                .request(method, url)
                .timeout(timeout)
                .body(payload.to_vec());
            for (name, value) in &target.headers {
                req = req.header(name, value);
            }
            match &target.auth {
                Some(AuthSpec::Bearer { token }) => req = req.bearer_auth(token),
                Some(AuthSpec::Basic { username, password }) => {
                    req = req.basic_auth(username, Some(password));
                }
                None => {}
            }
            let resp = req
                .send()
                .await
                .map_err(|e| action_err(format!("http send: {e}")))?;
            if !resp.status().is_success() {
                return Err(action_err(format!("http status {}", resp.status())));
            }
            Ok(())
        }
        TargetKind::File => {
            let path = target
                .path
                .as_deref()
                .ok_or_else(|| action_err("file target without path"))?;
            let write = async {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(payload).await?;
                file.write_all(b"\n").await?;
                file.flush().await
            };
            tokio::time::timeout(timeout, write)
                .await
                .map_err(|_| action_err(format!("file write to {path:?} timed out")))?
                .map_err(|e| action_err(format!("file write to {path:?}: {e}")))
        }
        TargetKind::Nats => {
            let subject = target
                .subject
                .as_deref()
                .ok_or_else(|| action_err("nats target without subject"))?;
            bus.publish(subject, payload.to_vec())
        }
        // Broker client internals are an external contract; the descriptor
        // parses so configs round-trip, but dispatch is explicit about it.
        TargetKind::Mqtt => Err(action_err("mqtt forward target is not implemented")),
    }
}

// ---------------------------------------------------------------------------
// payload construction
// ---------------------------------------------------------------------------

fn build_payload(target: &ForwardTarget, reading: &Reading) -> CoreResult<Vec<u8>> {
    let projected = project(target.data_transform.as_ref(), reading)?;
    match &target.template {
        None | Some(PayloadTemplate { format: PayloadFormat::Json, .. }) => {
            serde_json::to_vec(&projected).map_err(|e| action_err(format!("encode json: {e}")))
        }
        Some(PayloadTemplate { format: PayloadFormat::Csv, .. }) => {
            let obj = projected
                .as_object()
                .ok_or_else(|| action_err("csv payload requires an object"))?;
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let line = keys
                .iter()
                .map(|k| csv_cell(&obj[k.as_str()]))
                .collect::<Vec<_>>()
                .join(",");
            Ok(line.into_bytes())
        }
        Some(PayloadTemplate { format: PayloadFormat::Text, template }) => {
            let tpl = template
                .as_deref()
                .ok_or_else(|| action_err("text format requires a template"))?;
            Ok(template::expand(tpl, reading, &HashMap::new()).into_bytes())
        }
    }
}

fn project(
    transform: Option<&DataTransform>,
    reading: &Reading,
) -> CoreResult<serde_json::Value> {
    let mut value = serde_json::to_value(reading)
        .map_err(|e| action_err(format!("encode reading: {e}")))?;
    let Some(t) = transform else {
        return Ok(value);
    };
    let obj = value
        .as_object_mut()
        .ok_or_else(|| action_err("reading did not encode to an object"))?;

    if !t.include.is_empty() {
        obj.retain(|k, _| t.include.iter().any(|want| want == k));
    }
    for gone in &t.exclude {
        obj.remove(gone);
    }
    for (from, to) in &t.rename {
        if let Some(v) = obj.remove(from) {
            obj.insert(to.clone(), v);
        }
    }
    for (k, v) in &t.constants {
        obj.insert(k.clone(), v.clone());
    }
    Ok(value)
}

fn csv_cell(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => {
            if s.contains(',') || s.contains('"') {
                format!("\"{}\"", s.replace('"', "\"\""))
            } else {
                s.clone()
            }
        }
        other => other.to_string(),
    }
}

fn action_err(detail: impl Into<String>) -> CoreError {
    StructError::from(CoreReason::Action).with_detail(detail.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Value;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt as _, BufReader};
    use tokio::net::TcpListener;

    fn reading() -> Reading {
        let mut r = Reading::new("d1", "temperature", Value::Float(35.0));
        r.tags.insert("site".into(), "north".into());
        r
    }

    fn target(v: serde_json::Value) -> ForwardTarget {
        serde_json::from_value(v).unwrap()
    }

    /// Minimal HTTP server answering every request with the given status.
    async fn one_shot_http(status: u16, hits: Arc<AtomicU64>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                hits.fetch_add(1, Ordering::Relaxed);
                let mut reader = BufReader::new(&mut sock);
                let mut line = String::new();
                // read headers until the blank line
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0
                        || line == "\r\n"
                    {
                        break;
                    }
                }
                let resp = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{addr}/ingest")
    }

    #[tokio::test]
    async fn http_500_retries_then_counts_failure() {
        let hits = Arc::new(AtomicU64::new(0));
        let url = one_shot_http(500, Arc::clone(&hits)).await;

        let bus = Bus::new(16);
        let exec = ForwardExecutor::new(bus, 2);
        let params = ForwardParams {
            targets: vec![target(json!({
                "type": "http", "url": url, "timeout": "1s", "retry": 2
            }))],
        };

        // Pipeline continues: execute returns Ok even though the target failed.
        exec.execute(&params, &reading()).await.unwrap();

        // Three attempts total (1 + 2 retries), one failure counted.
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert_eq!(exec.counters.http_failed.load(Ordering::Relaxed), 1);
        assert_eq!(exec.counters.success.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn http_success_counts() {
        let hits = Arc::new(AtomicU64::new(0));
        let url = one_shot_http(200, Arc::clone(&hits)).await;

        let bus = Bus::new(16);
        let exec = ForwardExecutor::new(bus, 2);
        let params = ForwardParams {
            targets: vec![target(json!({"type": "http", "url": url, "timeout": "1s"}))],
        };
        exec.execute(&params, &reading()).await.unwrap();
        assert_eq!(exec.counters.success.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn nats_target_publishes_to_bus() {
        let bus = Bus::new(16);
        let sub = bus.subscribe("out.>", None, None).unwrap();
        let exec = ForwardExecutor::new(bus, 2);
        let params = ForwardParams {
            targets: vec![target(json!({"type": "nats", "subject": "out.readings"}))],
        };
        exec.execute(&params, &reading()).await.unwrap();

        let msg = sub.recv().await.unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(decoded["device_id"], "d1");
    }

    #[tokio::test]
    async fn file_target_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let bus = Bus::new(16);
        let exec = ForwardExecutor::new(bus, 2);
        let params = ForwardParams {
            targets: vec![target(json!({
                "type": "file", "path": path.to_str().unwrap()
            }))],
        };
        exec.execute(&params, &reading()).await.unwrap();
        exec.execute(&params, &reading()).await.unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 2);
    }

    #[tokio::test]
    async fn mqtt_target_is_a_typed_failure() {
        let bus = Bus::new(16);
        let exec = ForwardExecutor::new(bus, 2);
        let params = ForwardParams {
            targets: vec![target(json!({
                "type": "mqtt", "broker": "tcp://host:1883", "topic": "t"
            }))],
        };
        exec.execute(&params, &reading()).await.unwrap();
        assert_eq!(exec.counters.mqtt_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn data_transform_projects_fields() {
        let t = DataTransform {
            include: vec!["device_id".into(), "value".into()],
            exclude: vec![],
            rename: HashMap::from([("device_id".to_string(), "device".to_string())]),
            constants: HashMap::from([("source".to_string(), json!("edgegate"))]),
        };
        let out = project(Some(&t), &reading()).unwrap();
        let obj = out.as_object().unwrap();
        assert!(obj.contains_key("device"));
        assert!(obj.contains_key("value"));
        assert_eq!(obj["source"], "edgegate");
        assert!(!obj.contains_key("key"));
    }

    #[test]
    fn text_template_payload() {
        let t = target(json!({
            "type": "file", "path": "/dev/null",
            "template": {"format": "text", "template": "{{.DeviceID}}:{{.Value}}"}
        }));
        let payload = build_payload(&t, &reading()).unwrap();
        assert_eq!(payload, b"d1:35");
    }
}
