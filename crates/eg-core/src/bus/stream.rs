use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use bytes::Bytes;
use orion_error::prelude::*;
use serde::{Deserialize, Serialize};

use super::subject_matches;
use crate::error::{CoreReason, CoreResult};

// ---------------------------------------------------------------------------
// PersistentStream — file-backed durable subject capture
// ---------------------------------------------------------------------------

/// One durable record as stored on disk (JSON Lines, one per append).
#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    seq: u64,
    subject: String,
    /// base64 payload
    payload: String,
    ts: i64,
}

/// One durable record as handed to consumers.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub seq: u64,
    pub subject: String,
    pub payload: Bytes,
    pub ts_millis: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ConsumerPos {
    acked: u64,
}

struct SegmentMeta {
    path: PathBuf,
    first_seq: u64,
    bytes: usize,
    created: Instant,
}

struct StreamState {
    entries: VecDeque<StreamEntry>,
    next_seq: u64,
    writer: BufWriter<File>,
    segment: SegmentMeta,
    sealed: Vec<SegmentMeta>,
    consumers: HashMap<String, ConsumerPos>,
    /// In-flight deliveries per consumer: seq → redelivery deadline.
    outstanding: HashMap<String, HashMap<u64, Instant>>,
    /// Highest seq ever handed to each consumer (first-delivery floor).
    delivered: HashMap<String, u64>,
}

/// Durable subject set with file-backed retention and pull consumers.
///
/// Records append to JSONL segment files; retention drops whole sealed
/// segments by age and total size. Consumer acks are cumulative and persist
/// to `consumers.json`, so a restart resumes delivery at the first
/// unacknowledged sequence.
pub struct PersistentStream {
    dir: PathBuf,
    patterns: Vec<String>,
    max_age: Duration,
    max_bytes: usize,
    ack_deadline: Duration,
    segment_bytes: usize,
    state: Mutex<StreamState>,
}

impl PersistentStream {
    pub fn open(
        dir: impl AsRef<Path>,
        patterns: Vec<String>,
        max_age: Duration,
        max_bytes: usize,
        ack_deadline: Duration,
    ) -> CoreResult<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| storage_err(format!("create {}: {e}", dir.display())))?;

        let mut entries = VecDeque::new();
        let mut sealed = Vec::new();
        let mut next_seq = 1u64;

        let mut segment_paths: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| storage_err(format!("read {}: {e}", dir.display())))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
            .collect();
        segment_paths.sort();

        for path in segment_paths {
            let (first, count, bytes) = load_segment(&path, &mut entries)?;
            if let Some(first_seq) = first {
                next_seq = next_seq.max(first_seq + count);
                sealed.push(SegmentMeta {
                    path,
                    first_seq,
                    bytes,
                    created: Instant::now(),
                });
            }
        }

        let consumers = load_consumers(&dir)?;

        let segment = new_segment(&dir, next_seq)?;
        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&segment.path)
                .map_err(|e| storage_err(format!("open {}: {e}", segment.path.display())))?,
        );

        Ok(Arc::new(Self {
            dir,
            patterns,
            max_age,
            max_bytes,
            ack_deadline,
            segment_bytes: (max_bytes / 8).clamp(4096, 8 * 1024 * 1024),
            state: Mutex::new(StreamState {
                entries,
                next_seq,
                writer,
                segment,
                sealed,
                consumers,
                outstanding: HashMap::new(),
                delivered: HashMap::new(),
            }),
        }))
    }

    /// True when `subject` falls inside this stream's durable subject set.
    pub fn accepts(&self, subject: &str) -> bool {
        self.patterns.iter().any(|p| subject_matches(p, subject))
    }

    /// Append one record, returning its sequence number.
    pub fn append(&self, subject: &str, payload: &[u8]) -> CoreResult<u64> {
        let mut state = self.state.lock().expect("stream lock poisoned");
        let seq = state.next_seq;
        let ts = chrono::Utc::now().timestamp_millis();

        let record = DiskRecord {
            seq,
            subject: subject.to_string(),
            payload: B64.encode(payload),
            ts,
        };
        let line =
            serde_json::to_string(&record).map_err(|e| storage_err(format!("encode: {e}")))?;
        let written = (|| {
            state.writer.write_all(line.as_bytes())?;
            state.writer.write_all(b"\n")?;
            state.writer.flush()
        })();
        written.map_err(|e| storage_err(format!("append: {e}")))?;

        state.next_seq += 1;
        state.segment.bytes += line.len() + 1;
        state.entries.push_back(StreamEntry {
            seq,
            subject: subject.to_string(),
            payload: Bytes::copy_from_slice(payload),
            ts_millis: ts,
        });

        if state.segment.bytes >= self.segment_bytes {
            self.roll_segment(&mut state)?;
        }
        self.enforce_retention(&mut state);

        Ok(seq)
    }

    /// A named pull consumer; position persists across restarts.
    pub fn consumer(self: &Arc<Self>, name: &str) -> PullConsumer {
        PullConsumer {
            stream: Arc::clone(self),
            name: name.to_string(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().expect("stream lock poisoned").entries.len()
    }

    pub fn stored_bytes(&self) -> usize {
        let state = self.state.lock().expect("stream lock poisoned");
        state.segment.bytes + state.sealed.iter().map(|s| s.bytes).sum::<usize>()
    }

    // -- internals ----------------------------------------------------------

    fn roll_segment(&self, state: &mut StreamState) -> CoreResult<()> {
        let next = new_segment(&self.dir, state.next_seq)?;
        let writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&next.path)
                .map_err(|e| storage_err(format!("open {}: {e}", next.path.display())))?,
        );
        let old = std::mem::replace(&mut state.segment, next);
        state.writer = writer;
        state.sealed.push(old);
        Ok(())
    }

    /// Drop whole sealed segments that fall outside the age or size bounds.
    fn enforce_retention(&self, state: &mut StreamState) {
        loop {
            let total: usize =
                state.segment.bytes + state.sealed.iter().map(|s| s.bytes).sum::<usize>();
            let Some(oldest) = state.sealed.first() else { break };
            let expired = oldest.created.elapsed() > self.max_age;
            if total <= self.max_bytes && !expired {
                break;
            }
            let oldest = state.sealed.remove(0);
            let _ = fs::remove_file(&oldest.path);
            let cutoff = state
                .sealed
                .first()
                .map(|s| s.first_seq)
                .unwrap_or(state.segment.first_seq);
            while state.entries.front().is_some_and(|e| e.seq < cutoff) {
                state.entries.pop_front();
            }
        }
    }

    fn persist_consumers(&self, consumers: &HashMap<String, ConsumerPos>) -> CoreResult<()> {
        let path = self.dir.join("consumers.json");
        let tmp = self.dir.join("consumers.json.tmp");
        let body = serde_json::to_vec_pretty(consumers)
            .map_err(|e| storage_err(format!("encode consumers: {e}")))?;
        fs::write(&tmp, body)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| storage_err(format!("persist consumers: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PullConsumer
// ---------------------------------------------------------------------------

/// Pull-style consumer with explicit acknowledgement and deadline
/// redelivery. Acks are cumulative: `ack(n)` acknowledges every seq ≤ n.
pub struct PullConsumer {
    stream: Arc<PersistentStream>,
    name: String,
}

impl PullConsumer {
    /// Fetch up to `max` entries: expired unacked deliveries first
    /// (redelivery), then the next unseen records.
    pub fn fetch(&self, max: usize) -> Vec<StreamEntry> {
        let mut state = self.stream.state.lock().expect("stream lock poisoned");
        let now = Instant::now();
        let deadline = now + self.stream.ack_deadline;
        let acked = state
            .consumers
            .get(&self.name)
            .map(|c| c.acked)
            .unwrap_or(0);
        let floor = state.delivered.get(&self.name).copied().unwrap_or(acked);

        let mut picked: Vec<u64> = Vec::new();
        {
            let outstanding = state.outstanding.entry(self.name.clone()).or_default();
            let mut expired: Vec<u64> = outstanding
                .iter()
                .filter(|(seq, dl)| **dl <= now && **seq > acked)
                .map(|(seq, _)| *seq)
                .collect();
            expired.sort_unstable();
            picked.extend(expired.into_iter().take(max));
        }

        if picked.len() < max {
            let budget = max - picked.len();
            let fresh: Vec<u64> = state
                .entries
                .iter()
                .filter(|e| e.seq > floor && e.seq > acked)
                .take(budget)
                .map(|e| e.seq)
                .collect();
            picked.extend(fresh);
        }

        let mut out = Vec::with_capacity(picked.len());
        let mut pruned: Vec<u64> = Vec::new();
        for seq in &picked {
            match state.entries.iter().find(|e| e.seq == *seq) {
                Some(entry) => out.push(entry.clone()),
                // Retention removed the record while it was outstanding.
                None => pruned.push(*seq),
            }
        }

        let new_floor = picked.iter().copied().max().unwrap_or(floor).max(floor);
        state.delivered.insert(self.name.clone(), new_floor);
        let outstanding = state.outstanding.entry(self.name.clone()).or_default();
        for seq in picked {
            outstanding.insert(seq, deadline);
        }
        for seq in pruned {
            outstanding.remove(&seq);
        }

        out
    }

    /// Acknowledge every sequence up to and including `seq`; the position
    /// persists so a restart resumes after it.
    pub fn ack(&self, seq: u64) -> CoreResult<()> {
        let mut state = self.stream.state.lock().expect("stream lock poisoned");
        let pos = state
            .consumers
            .entry(self.name.clone())
            .or_insert(ConsumerPos { acked: 0 });
        pos.acked = pos.acked.max(seq);
        if let Some(outstanding) = state.outstanding.get_mut(&self.name) {
            outstanding.retain(|s, _| *s > seq);
        }
        let snapshot = state.consumers.clone();
        drop(state);
        self.stream.persist_consumers(&snapshot)
    }

    pub fn acked(&self) -> u64 {
        let state = self.stream.state.lock().expect("stream lock poisoned");
        state
            .consumers
            .get(&self.name)
            .map(|c| c.acked)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn storage_err(detail: String) -> crate::error::CoreError {
    StructError::from(CoreReason::Storage).with_detail(detail)
}

fn new_segment(dir: &Path, first_seq: u64) -> CoreResult<SegmentMeta> {
    Ok(SegmentMeta {
        path: dir.join(format!("{first_seq:012}.log")),
        first_seq,
        bytes: 0,
        created: Instant::now(),
    })
}

/// Load one segment file into `entries`; returns (first_seq, count, bytes).
fn load_segment(
    path: &Path,
    entries: &mut VecDeque<StreamEntry>,
) -> CoreResult<(Option<u64>, u64, usize)> {
    let file =
        File::open(path).map_err(|e| storage_err(format!("open {}: {e}", path.display())))?;
    let reader = BufReader::new(file);
    let mut first = None;
    let mut count = 0u64;
    let mut bytes = 0usize;

    for line in reader.lines() {
        let line = line.map_err(|e| storage_err(format!("read {}: {e}", path.display())))?;
        if line.trim().is_empty() {
            continue;
        }
        bytes += line.len() + 1;
        // A torn trailing record (crash mid-write) ends the segment.
        let Ok(record) = serde_json::from_str::<DiskRecord>(&line) else {
            break;
        };
        let Ok(payload) = B64.decode(&record.payload) else {
            break;
        };
        if first.is_none() {
            first = Some(record.seq);
        }
        count += 1;
        entries.push_back(StreamEntry {
            seq: record.seq,
            subject: record.subject,
            payload: Bytes::from(payload),
            ts_millis: record.ts,
        });
    }

    Ok((first, count, bytes))
}

fn load_consumers(dir: &Path) -> CoreResult<HashMap<String, ConsumerPos>> {
    let path = dir.join("consumers.json");
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let body =
        fs::read(&path).map_err(|e| storage_err(format!("read {}: {e}", path.display())))?;
    serde_json::from_slice(&body).map_err(|e| storage_err(format!("decode consumers: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn open_stream(dir: &Path, max_bytes: usize, ack_deadline: Duration) -> Arc<PersistentStream> {
        PersistentStream::open(
            dir,
            vec!["raw.>".to_string()],
            Duration::from_secs(3600),
            max_bytes,
            ack_deadline,
        )
        .unwrap()
    }

    #[test]
    fn append_fetch_ack() {
        let dir = tempfile::tempdir().unwrap();
        let stream = open_stream(dir.path(), 1 << 20, Duration::from_secs(30));

        for i in 0..5u8 {
            stream.append("raw.d1.t", &[i]).unwrap();
        }

        let consumer = stream.consumer("engine");
        let batch = consumer.fetch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].seq, 1);
        assert_eq!(batch[2].payload[0], 2);

        consumer.ack(3).unwrap();
        let batch = consumer.fetch(10);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].seq, 4);
    }

    #[test]
    fn unacked_fetch_is_redelivered_after_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let stream = open_stream(dir.path(), 1 << 20, Duration::from_millis(10));

        stream.append("raw.d1.t", b"a").unwrap();
        let consumer = stream.consumer("engine");

        assert_eq!(consumer.fetch(10).len(), 1);
        // Within the deadline nothing is redelivered.
        assert_eq!(consumer.fetch(10).len(), 0);

        std::thread::sleep(Duration::from_millis(20));
        let redelivered = consumer.fetch(10);
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].seq, 1);
    }

    #[test]
    fn restart_resumes_after_last_ack() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stream = open_stream(dir.path(), 1 << 20, Duration::from_secs(30));
            for i in 0..4u8 {
                stream.append("raw.d1.t", &[i]).unwrap();
            }
            let consumer = stream.consumer("engine");
            consumer.fetch(2);
            consumer.ack(2).unwrap();
        }

        // Reopen: the next delivery is the first unacknowledged record.
        let stream = open_stream(dir.path(), 1 << 20, Duration::from_secs(30));
        assert_eq!(stream.entry_count(), 4);
        let consumer = stream.consumer("engine");
        assert_eq!(consumer.acked(), 2);
        let batch = consumer.fetch(10);
        assert_eq!(batch[0].seq, 3);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn size_retention_prunes_oldest_segments() {
        let dir = tempfile::tempdir().unwrap();
        let stream = open_stream(dir.path(), 16 * 1024, Duration::from_secs(30));

        let blob = vec![0u8; 256];
        for _ in 0..400 {
            stream.append("raw.d1.blob", &blob).unwrap();
        }

        assert!(stream.stored_bytes() <= 20 * 1024, "retention did not prune");
        // Early records are gone; recent ones survive.
        let consumer = stream.consumer("c");
        let batch = consumer.fetch(1);
        assert!(batch[0].seq > 1);
    }

    #[test]
    fn accepts_follows_subject_set() {
        let dir = tempfile::tempdir().unwrap();
        let stream = open_stream(dir.path(), 1 << 20, Duration::from_secs(30));
        assert!(stream.accepts("raw.d1.temp"));
        assert!(!stream.accepts("alerts.warning.d1"));
    }
}
