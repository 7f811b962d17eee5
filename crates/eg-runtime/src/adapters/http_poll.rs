use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use eg_config::HumanDuration;
use eg_core::reading::{Reading, Value};

use super::{Adapter, Health, adapter_err};
use crate::error::RuntimeResult;

/// Consecutive poll failures before the adapter reports `Degraded` /
/// `Failed`.
const DEGRADED_AFTER: u32 = 3;
const FAILED_AFTER: u32 = 10;

// ---------------------------------------------------------------------------
// HttpPollAdapter — periodic request + response-field extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HttpPollParams {
    device_id: String,
    url: String,
    #[serde(default = "default_interval")]
    interval: HumanDuration,
    #[serde(default = "default_timeout")]
    timeout: HumanDuration,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// reading key → dotted path into the response JSON
    /// (`"temperature": "data.ambient.temp"`).
    fields: HashMap<String, String>,
}

fn default_interval() -> HumanDuration {
    Duration::from_secs(10).into()
}

fn default_timeout() -> HumanDuration {
    Duration::from_secs(5).into()
}

pub struct HttpPollAdapter {
    name: String,
    params: HttpPollParams,
    client: reqwest::Client,
    consecutive_failures: Arc<AtomicU32>,
}

impl HttpPollAdapter {
    pub fn from_params(name: &str, params: &serde_json::Value) -> RuntimeResult<Self> {
        let params: HttpPollParams = serde_json::from_value(params.clone())
            .map_err(|e| adapter_err(format!("http_poll adapter params: {e}")))?;
        if params.fields.is_empty() {
            return Err(adapter_err("http_poll adapter needs at least one field"));
        }
        Ok(Self {
            name: name.to_string(),
            params,
            client: reqwest::Client::new(),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
        })
    }

    async fn poll_once(&self) -> RuntimeResult<Vec<Reading>> {
        let mut req = self
            .client
            .get(&self.params.url)
            .timeout(self.params.timeout.as_duration());
        for (name, value) in &self.params.headers {
            req = req.header(name, value);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| adapter_err(format!("poll {}: {e}", self.params.url)))?;
        if !resp.status().is_success() {
            return Err(adapter_err(format!(
                "poll {}: status {}",
                self.params.url,
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| adapter_err(format!("poll {}: body: {e}", self.params.url)))?;

        let mut readings = Vec::with_capacity(self.params.fields.len());
        for (key, path) in &self.params.fields {
            let Some(value) = extract(&body, path) else {
                eg_debug!(pipe, adapter = %self.name, field = %path, "field missing in response");
                continue;
            };
            readings.push(Reading::new(
                self.params.device_id.clone(),
                key.clone(),
                value,
            ));
        }
        Ok(readings)
    }
}

#[async_trait]
impl Adapter for HttpPollAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(
        &mut self,
        ctx: CancellationToken,
        out: mpsc::Sender<Reading>,
    ) -> RuntimeResult<()> {
        let mut tick = tokio::time::interval(self.params.interval.as_duration());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = ctx.cancelled() => return Ok(()),
            }
            match self.poll_once().await {
                Ok(readings) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    for reading in readings {
                        if out.send(reading).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    let failures =
                        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    eg_warn!(pipe, adapter = %self.name, failures, error = %e, "poll failed");
                    if failures >= FAILED_AFTER {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn stop(&mut self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn health(&self) -> Health {
        match self.consecutive_failures.load(Ordering::Relaxed) {
            0..DEGRADED_AFTER => Health::Ok,
            DEGRADED_AFTER..FAILED_AFTER => Health::Degraded,
            _ => Health::Failed,
        }
    }
}

/// Walk a dotted path into a JSON document and coerce the leaf to a reading
/// value.
fn extract(body: &serde_json::Value, path: &str) -> Option<Value> {
    let mut node = body;
    for segment in path.split('.') {
        node = match node {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match node {
        serde_json::Value::Number(n) => {
            if n.is_i64() {
                Some(Value::Int(n.as_i64()?))
            } else {
                Some(Value::Float(n.as_f64()?))
            }
        }
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::String(s) => Some(Value::String(s.clone())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn fake_endpoint(body: serde_json::Value) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                let body = body.to_string();
                tokio::spawn(async move {
                    let mut reader = BufReader::new(&mut sock);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0
                            || line == "\r\n"
                        {
                            break;
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}/metrics")
    }

    #[tokio::test]
    async fn extracts_configured_fields() {
        let url = fake_endpoint(json!({
            "data": {"ambient": {"temp": 21.5}, "fan": 900},
            "status": "ok"
        }))
        .await;

        let mut adapter = HttpPollAdapter::from_params(
            "poller",
            &json!({
                "device_id": "station-1",
                "url": url,
                "interval": "10ms",
                "fields": {
                    "temperature": "data.ambient.temp",
                    "fan_rpm": "data.fan",
                    "status": "status"
                }
            }),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let runner = {
            let ctx = ctx.clone();
            tokio::spawn(async move { adapter.start(ctx, tx).await })
        };

        let mut by_key = HashMap::new();
        for _ in 0..3 {
            let r = rx.recv().await.unwrap();
            assert_eq!(r.device_id, "station-1");
            by_key.insert(r.key.clone(), r.value.clone());
        }
        ctx.cancel();
        runner.await.unwrap().unwrap();

        assert_eq!(by_key["temperature"], Value::Float(21.5));
        assert_eq!(by_key["fan_rpm"], Value::Int(900));
        assert_eq!(by_key["status"], Value::String("ok".into()));
    }

    #[test]
    fn dotted_path_extraction() {
        let body = json!({"a": {"b": [1, 2, 3]}});
        assert_eq!(extract(&body, "a.b.1"), Some(Value::Int(2)));
        assert_eq!(extract(&body, "a.missing"), None);
    }
}
