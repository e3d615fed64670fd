//! Emit protocol handed to the downstream sink: ordered SCHEMA, RECORD and
//! STATE messages.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::error::SyncError;
use crate::state::SyncState;

/// Sink for the connector's output messages.
pub trait Emitter: Send + Sync {
    /// Announces a stream's schema and key fields. Must precede its records.
    fn schema(&self, stream: &str, schema: &Value, key_fields: &[&str]) -> Result<(), SyncError>;

    /// Emits one record for a stream.
    fn record(
        &self,
        stream: &str,
        record: &Value,
        extracted_at: DateTime<Utc>,
    ) -> Result<(), SyncError>;

    /// Emits a full state snapshot. The sink persists the latest one.
    fn state(&self, state: &SyncState) -> Result<(), SyncError>;
}

/// Emitter writing one JSON message per line.
pub struct JsonLinesEmitter<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesEmitter<std::io::Stdout> {
    /// Emitter on standard output, the normal pipeline arrangement.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    fn write(&self, message: &Value) -> Result<(), SyncError> {
        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, message)
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write + Send> Emitter for JsonLinesEmitter<W> {
    fn schema(&self, stream: &str, schema: &Value, key_fields: &[&str]) -> Result<(), SyncError> {
        self.write(&json!({
            "type": "SCHEMA",
            "stream": stream,
            "schema": schema,
            "key_properties": key_fields,
        }))
    }

    fn record(
        &self,
        stream: &str,
        record: &Value,
        extracted_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.write(&json!({
            "type": "RECORD",
            "stream": stream,
            "record": record,
            "time_extracted": extracted_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        }))
    }

    fn state(&self, state: &SyncState) -> Result<(), SyncError> {
        let value = serde_json::to_value(state)
            .map_err(|e| SyncError::state(format!("unserializable state: {e}")))?;
        self.write(&json!({"type": "STATE", "value": value}))
    }
}

/// Emitter collecting messages in memory. Used by tests across the workspace.
#[derive(Default)]
pub struct MemoryEmitter {
    messages: Mutex<Vec<Value>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages emitted so far.
    pub fn messages(&self) -> Vec<Value> {
        self.messages.lock().clone()
    }

    /// Records emitted for one stream.
    pub fn records_for(&self, stream: &str) -> Vec<Value> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m["type"] == "RECORD" && m["stream"] == stream)
            .map(|m| m["record"].clone())
            .collect()
    }
}

impl Emitter for MemoryEmitter {
    fn schema(&self, stream: &str, schema: &Value, key_fields: &[&str]) -> Result<(), SyncError> {
        self.messages.lock().push(json!({
            "type": "SCHEMA",
            "stream": stream,
            "schema": schema,
            "key_properties": key_fields,
        }));
        Ok(())
    }

    fn record(
        &self,
        stream: &str,
        record: &Value,
        extracted_at: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.messages.lock().push(json!({
            "type": "RECORD",
            "stream": stream,
            "record": record,
            "time_extracted": extracted_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        }));
        Ok(())
    }

    fn state(&self, state: &SyncState) -> Result<(), SyncError> {
        let value = serde_json::to_value(state)
            .map_err(|e| SyncError::state(format!("unserializable state: {e}")))?;
        self.messages.lock().push(json!({"type": "STATE", "value": value}));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_shapes() {
        let emitter = JsonLinesEmitter::new(Vec::new());
        emitter
            .schema("commits", &json!({"type": "object"}), &["sha"])
            .unwrap();
        emitter
            .record("commits", &json!({"sha": "abc"}), Utc::now())
            .unwrap();
        emitter.state(&SyncState::default()).unwrap();

        let buf = emitter.out.into_inner();
        let lines: Vec<Value> = String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["type"], "SCHEMA");
        assert_eq!(lines[0]["key_properties"][0], "sha");
        assert_eq!(lines[1]["type"], "RECORD");
        assert_eq!(lines[1]["record"]["sha"], "abc");
        assert_eq!(lines[2]["type"], "STATE");
    }

    #[test]
    fn test_memory_emitter_filters_by_stream() {
        let emitter = MemoryEmitter::new();
        emitter
            .record("commits", &json!({"sha": "a"}), Utc::now())
            .unwrap();
        emitter
            .record("issues", &json!({"id": 1}), Utc::now())
            .unwrap();

        assert_eq!(emitter.records_for("commits").len(), 1);
        assert_eq!(emitter.records_for("issues").len(), 1);
        assert_eq!(emitter.records_for("releases").len(), 0);
    }
}
