//! One JSONL log record.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single log entry, written as one line of a JSONL file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Peer instance name (usually the short form of its identity)
    pub instance: String,

    /// Module path of the event
    pub target: String,

    /// Human-readable message
    pub msg: String,

    /// Structured event fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, outermost first, joined with `" > "`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            instance: instance.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    /// Attach structured fields.
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Attach the span path.
    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from a JSON line.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Read every entry of a JSONL file, skipping blank and unparsable lines.
pub fn read_entries(path: impl AsRef<Path>) -> std::io::Result<Vec<JsonLogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = JsonLogEntry::from_json_line(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_serialization() {
        let entry = JsonLogEntry::new("info", "alice", "autodoc_core::peer", "Peer connected");

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"instance\":\"alice\""));
        assert!(!json.contains("\"fields\""));

        let parsed = JsonLogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed.msg, "Peer connected");
    }

    #[test]
    fn test_read_entries_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let good = JsonLogEntry::new("warn", "bob", "t", "retrying")
            .with_fields(serde_json::json!({ "attempt": 2 }))
            .to_json_line()
            .unwrap();
        std::fs::write(&path, format!("{good}\n\nnot json\n{good}\n")).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].fields.as_ref().unwrap()["attempt"], 2);
    }
}
