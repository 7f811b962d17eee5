//! Line-delimited JSON protocol between the gateway and out-of-process
//! plugins: one JSON object per LF-terminated line, each direction a frame
//! stream. The gateway opens the connection, configures the plugin, and
//! watches frame arrival for liveness.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use orion_error::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use eg_core::reading::{Reading, Value};

use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Correlation identifier for request/response pairs.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameKind {
    Config,
    Data,
    Status,
    Heartbeat,
    Response,
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// One reading inside a `DATA` frame. Narrow integer variants widen to
/// int64 and float32 to float64 on ingest.
#[derive(Debug, Deserialize)]
struct WireReading {
    device_id: String,
    key: String,
    #[serde(rename = "type")]
    data_type: String,
    value: serde_json::Value,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    quality: Option<i32>,
}

fn widen(wire: WireReading) -> Option<Reading> {
    let value = match wire.data_type.as_str() {
        "bool" => Value::Bool(wire.value.as_bool()?),
        "int16" | "uint16" | "int32" | "uint32" => Value::Int(wire.value.as_i64()?),
        "float32" | "float64" => Value::Float(wire.value.as_f64()?),
        "string" => Value::String(wire.value.as_str()?.to_string()),
        _ => return None,
    };
    let mut reading = Reading::new(wire.device_id, wire.key, value);
    if let Some(ts) = wire.timestamp {
        reading.timestamp = ts;
    }
    reading.tags = wire.tags;
    reading.quality = wire.quality.or(Some(0));
    reading.validate().ok()?;
    Some(reading)
}

// ---------------------------------------------------------------------------
// Link health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Ok,
    /// No frame from the peer within the heartbeat timeout.
    Degraded,
    /// Degraded past the grace period, or the connection is gone.
    Failed,
}

// ---------------------------------------------------------------------------
// SidecarClient
// ---------------------------------------------------------------------------

/// Gateway side of one sidecar connection: a reader task decoding frames,
/// a writer task draining the outbound queue and emitting heartbeats, and a
/// correlation map from frame id to pending response waiters.
#[derive(Debug)]
pub struct SidecarClient {
    outbound: mpsc::Sender<Frame>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>,
    last_frame: Arc<Mutex<Instant>>,
    heartbeat_timeout: Duration,
    heartbeat_grace: Duration,
    link: CancellationToken,
    next_id: AtomicU64,
}

impl SidecarClient {
    /// Connect, send `CONFIG`, and require a success `RESPONSE`. A refusal
    /// or timeout fails the plugin start.
    pub async fn connect(
        addr: &str,
        config_payload: serde_json::Value,
        readings_tx: mpsc::Sender<Reading>,
        heartbeat_timeout: Duration,
        heartbeat_grace: Duration,
        parent: &CancellationToken,
    ) -> RuntimeResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| plugin_err(format!("connect {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();

        let link = parent.child_token();
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let last_frame = Arc::new(Mutex::new(Instant::now()));
        let (outbound, outbound_rx) = mpsc::channel::<Frame>(256);

        tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&last_frame),
            readings_tx,
            link.clone(),
        ));
        tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            heartbeat_timeout,
            link.clone(),
        ));

        let client = Self {
            outbound,
            pending,
            last_frame,
            heartbeat_timeout,
            heartbeat_grace,
            link,
            next_id: AtomicU64::new(1),
        };

        let reply = client
            .request(FrameKind::Config, config_payload, Duration::from_secs(10))
            .await?;
        let body: ResponseBody = serde_json::from_value(reply.payload)
            .map_err(|e| plugin_err(format!("malformed CONFIG response: {e}")))?;
        if body.status != "success" {
            client.close();
            return Err(plugin_err(format!(
                "plugin rejected CONFIG: {}",
                body.message
            )));
        }
        Ok(client)
    }

    /// Send a request frame and await its correlated `RESPONSE`.
    pub async fn request(
        &self,
        kind: FrameKind,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> RuntimeResult<Frame> {
        let id = format!("gw-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), reply_tx);

        let frame = Frame {
            kind,
            id: id.clone(),
            timestamp: Utc::now(),
            payload,
        };
        if self.outbound.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(plugin_err("sidecar link closed"));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(plugin_err("sidecar link dropped the response")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(plugin_err(format!("request {id} timed out after {timeout:?}")))
            }
        }
    }

    /// `STATUS` round trip carrying the plugin's diagnostic fields.
    pub async fn request_status(&self, timeout: Duration) -> RuntimeResult<serde_json::Value> {
        let reply = self
            .request(FrameKind::Status, serde_json::Value::Null, timeout)
            .await?;
        let body: ResponseBody = serde_json::from_value(reply.payload)
            .map_err(|e| plugin_err(format!("malformed STATUS response: {e}")))?;
        Ok(body.data)
    }

    /// Liveness judged by frame arrival: any frame counts, heartbeats
    /// included.
    pub async fn health(&self) -> LinkHealth {
        if self.link.is_cancelled() {
            return LinkHealth::Failed;
        }
        let idle = self.last_frame.lock().await.elapsed();
        if idle <= self.heartbeat_timeout {
            LinkHealth::Ok
        } else if idle <= self.heartbeat_timeout + self.heartbeat_grace {
            LinkHealth::Degraded
        } else {
            LinkHealth::Failed
        }
    }

    /// Fires when either connection task exits (EOF, I/O error, malformed
    /// frame).
    pub fn link_token(&self) -> CancellationToken {
        self.link.clone()
    }

    pub fn close(&self) {
        self.link.cancel();
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn read_loop(
    read_half: OwnedReadHalf,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Frame>>>>,
    last_frame: Arc<Mutex<Instant>>,
    readings_tx: mpsc::Sender<Reading>,
    link: CancellationToken,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = link.cancelled() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                eg_debug!(conn, "sidecar closed the connection");
                break;
            }
            Err(e) => {
                eg_warn!(conn, error = %e, "sidecar read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed JSON closes the connection.
                eg_error!(conn, error = %e, "malformed sidecar frame, closing link");
                break;
            }
        };
        *last_frame.lock().await = Instant::now();

        match frame.kind {
            FrameKind::Data => {
                let batch = frame
                    .payload
                    .get("readings")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let wires: Vec<WireReading> = match serde_json::from_value(batch) {
                    Ok(wires) => wires,
                    Err(e) => {
                        eg_warn!(conn, error = %e, "undecodable DATA payload");
                        continue;
                    }
                };
                for wire in wires {
                    match widen(wire) {
                        Some(reading) => {
                            if readings_tx.send(reading).await.is_err() {
                                eg_warn!(conn, "reading channel closed, dropping link");
                                link.cancel();
                                return;
                            }
                        }
                        None => eg_warn!(conn, "dropped DATA reading with bad type/value"),
                    }
                }
            }
            FrameKind::Response => {
                if let Some(waiter) = pending.lock().await.remove(&frame.id) {
                    let _ = waiter.send(frame);
                } else {
                    eg_debug!(conn, id = %frame.id, "response with no waiter");
                }
            }
            FrameKind::Heartbeat => {}
            FrameKind::Config | FrameKind::Status => {
                eg_warn!(conn, kind = ?frame.kind, "unexpected request frame from plugin");
            }
        }
    }
    link.cancel();
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    heartbeat_timeout: Duration,
    link: CancellationToken,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_timeout / 2);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut seq = 0u64;
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = heartbeat.tick() => {
                seq += 1;
                Frame {
                    kind: FrameKind::Heartbeat,
                    id: format!("hb-{seq}"),
                    timestamp: Utc::now(),
                    payload: serde_json::Value::Null,
                }
            }
            _ = link.cancelled() => break,
        };
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                eg_warn!(conn, error = %e, "frame encode error");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = write_half.write_all(&line).await {
            eg_warn!(conn, error = %e, "sidecar write error");
            break;
        }
    }
    link.cancel();
}

fn plugin_err(detail: impl Into<String>) -> RuntimeError {
    StructError::from(RuntimeReason::Core(eg_core::error::CoreReason::Plugin))
        .with_detail(detail.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Minimal scripted sidecar: answers CONFIG/STATUS, then emits the given
    /// extra lines verbatim.
    async fn fake_sidecar(accept_config: bool, extra_lines: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(f) => f,
                    Err(_) => break,
                };
                match frame.kind {
                    FrameKind::Config => {
                        let status = if accept_config { "success" } else { "error" };
                        let reply = Frame {
                            kind: FrameKind::Response,
                            id: frame.id,
                            timestamp: Utc::now(),
                            payload: json!({"status": status, "message": "cfg"}),
                        };
                        let mut body = serde_json::to_vec(&reply).unwrap();
                        body.push(b'\n');
                        write_half.write_all(&body).await.unwrap();
                        for extra in &extra_lines {
                            write_half
                                .write_all(format!("{extra}\n").as_bytes())
                                .await
                                .unwrap();
                        }
                    }
                    FrameKind::Status => {
                        let reply = Frame {
                            kind: FrameKind::Response,
                            id: frame.id,
                            timestamp: Utc::now(),
                            payload: json!({
                                "status": "success",
                                "data": {"uptime_s": 12, "queue": 0}
                            }),
                        };
                        let mut body = serde_json::to_vec(&reply).unwrap();
                        body.push(b'\n');
                        write_half.write_all(&body).await.unwrap();
                    }
                    _ => {}
                }
            }
        });
        addr
    }

    fn data_line() -> String {
        serde_json::to_string(&json!({
            "type": "DATA",
            "id": "sc-1",
            "timestamp": Utc::now(),
            "payload": {"readings": [
                {"device_id": "plc-1", "key": "rpm", "type": "int16", "value": 1480},
                {"device_id": "plc-1", "key": "temp", "type": "float32", "value": 36.5}
            ]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn config_handshake_and_data_widening() {
        let addr = fake_sidecar(true, vec![data_line()]).await;
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let client = SidecarClient::connect(
            &addr,
            json!({"poll_ms": 100}),
            tx,
            Duration::from_secs(5),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.value, Value::Int(1480));
        assert_eq!(first.quality, Some(0));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.value, Value::Float(36.5));
        client.close();
    }

    #[tokio::test]
    async fn config_rejection_fails_connect() {
        let addr = fake_sidecar(false, vec![]).await;
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let err = SidecarClient::connect(
            &addr,
            json!({}),
            tx,
            Duration::from_secs(5),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("rejected"));
    }

    #[tokio::test]
    async fn status_round_trip() {
        let addr = fake_sidecar(true, vec![]).await;
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let client = SidecarClient::connect(
            &addr,
            json!({}),
            tx,
            Duration::from_secs(5),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap();

        let status = client.request_status(Duration::from_secs(2)).await.unwrap();
        assert_eq!(status["uptime_s"], 12);
        client.close();
    }

    #[tokio::test]
    async fn malformed_frame_fails_the_link() {
        let addr = fake_sidecar(true, vec!["this is not json".to_string()]).await;
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let client = SidecarClient::connect(
            &addr,
            json!({}),
            tx,
            Duration::from_secs(5),
            Duration::from_secs(5),
            &cancel,
        )
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), client.link_token().cancelled())
            .await
            .expect("link should fail on malformed input");
        assert_eq!(client.health().await, LinkHealth::Failed);
    }
}
