use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Append-only JSON-lines event log. Writes are best effort: an unwritable
/// path never fails a turn.
#[derive(Debug, Default)]
pub struct EventLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&self, event: &str, message: &str, fields: Value) {
        self.append(LogLevel::Info, event, message, fields);
    }

    pub fn warn(&self, event: &str, message: &str, fields: Value) {
        self.append(LogLevel::Warn, event, message, fields);
    }

    pub fn error(&self, event: &str, message: &str, fields: Value) {
        self.append(LogLevel::Error, event, message, fields);
    }

    pub fn append(&self, level: LogLevel, event: &str, message: &str, fields: Value) {
        let Some(path) = self.path.as_ref() else {
            return;
        };

        let mut payload = Map::new();
        payload.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        payload.insert("level".to_string(), Value::String(level.as_str().to_string()));
        payload.insert("event".to_string(), Value::String(event.to_string()));
        payload.insert("message".to_string(), Value::String(message.to_string()));
        if let Value::Object(extra) = fields {
            for (key, value) in extra {
                payload.entry(key).or_insert(value);
            }
        }

        let Ok(line) = serde_json::to_string(&Value::Object(payload)) else {
            return;
        };

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_lines_carry_level_event_and_extra_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs/turns.log");
        let log = EventLog::to_file(&path);

        log.info("task.completed", "task finished", json!({"task_id": 3, "event": "ignored"}));
        log.warn("task.retry", "retrying", json!({}));

        let raw = fs::read_to_string(&path).expect("read log");
        let lines = raw
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).expect("json line"))
            .collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "task.completed");
        assert_eq!(lines[0]["level"], "info");
        assert_eq!(lines[0]["task_id"], 3);
        assert_eq!(lines[1]["level"], "warn");
        assert!(lines[0]["timestamp"].as_str().is_some());
    }

    #[test]
    fn disabled_log_is_silent() {
        let log = EventLog::disabled();
        log.error("turn.failed", "nothing written", json!({}));
        assert!(log.path().is_none());
    }
}
