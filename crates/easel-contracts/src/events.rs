use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Milliseconds since the Unix epoch; `0` if the clock is before it.
pub fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

/// Append-only JSONL log for one batch: one compact object per line,
/// with `event`, `batch_id`, and `ts` filled in before the caller's
/// payload is merged (payload keys win). The sink is opened on the
/// first append and held for the life of the batch.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: PathBuf,
    batch_id: String,
    sink: Mutex<Option<BufWriter<File>>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, batch_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path: path.into(),
                batch_id: batch_id.into(),
                sink: Mutex::new(None),
            }),
        }
    }

    pub fn append(&self, event: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut record = Map::new();
        record.insert("event".to_string(), Value::String(event.to_string()));
        record.insert(
            "batch_id".to_string(),
            Value::String(self.inner.batch_id.clone()),
        );
        record.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        for (key, value) in payload {
            record.insert(key, value);
        }
        let line = serde_json::to_string(&record)?;

        let mut sink = self
            .inner
            .sink
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if sink.is_none() {
            if let Some(parent) = self.inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.inner.path)?;
            *sink = Some(BufWriter::new(file));
        }
        let Some(writer) = sink.as_mut() else {
            anyhow::bail!("event log sink unavailable");
        };
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        // Flushed per record so the log stays tailable mid-batch.
        writer.flush()?;

        Ok(Value::Object(record))
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn append_writes_one_object_per_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let log = EventLog::new(&path, "batch-7");

        let mut payload = EventPayload::new();
        payload.insert("total".to_string(), json!(5));
        log.append("batch_started", payload)?;
        log.append("batch_finished", EventPayload::new())?;

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["event"], json!("batch_started"));
        assert_eq!(first["batch_id"], json!("batch-7"));
        assert_eq!(first["total"], json!(5));
        DateTime::parse_from_rfc3339(first["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn records_are_readable_while_the_sink_is_held() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let log = EventLog::new(&path, "batch-9");

        log.append("batch_started", EventPayload::new())?;
        assert_eq!(std::fs::read_to_string(&path)?.lines().count(), 1);
        log.append("batch_finished", EventPayload::new())?;
        assert_eq!(std::fs::read_to_string(&path)?.lines().count(), 2);
        Ok(())
    }

    #[test]
    fn timestamp_is_epoch_millis() {
        assert!(timestamp_millis() > 1_600_000_000_000);
    }

    #[test]
    fn payload_overrides_default_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let log = EventLog::new(temp.path().join("events.jsonl"), "batch-7");

        let mut payload = EventPayload::new();
        payload.insert("batch_id".to_string(), json!("other"));
        let record = log.append("task_completed", payload)?;
        assert_eq!(record["batch_id"], json!("other"));
        Ok(())
    }
}
