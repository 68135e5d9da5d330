//! Append-only audit sink: one JSON object per line, single writer.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use tracing::warn;

pub struct AuditSink {
    file: Mutex<std::fs::File>,
}

impl AuditSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating audit log directory {}", parent.display()))?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Append one event. Failures are logged, never propagated into the
    /// request path.
    pub fn record(&self, ip: &str, action: &str, fields: Value) {
        let mut event = json!({
            "ts": chrono::Utc::now().timestamp_millis(),
            "ip": ip,
            "action": action,
        });
        if let (Some(obj), Some(extra)) = (event.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{event}") {
            warn!("audit append failed: {err}");
        }
    }

    pub fn flush(&self) {
        if let Err(err) = self.file.lock().flush() {
            warn!("audit flush failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.log");
        let sink = AuditSink::open(&path).unwrap();
        sink.record("10.0.0.1", "login", json!({"user": "alice"}));
        sink.record("10.0.0.2", "login_failed", json!({"reason": "bad_password"}));
        sink.flush();

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "login");
        assert_eq!(first["user"], "alice");
        assert_eq!(first["ip"], "10.0.0.1");
        assert!(first["ts"].as_i64().unwrap() > 0);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["reason"], "bad_password");
    }
}
