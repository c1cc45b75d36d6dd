//! Structured console capture.

use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::boundary::{make_transferable, render, BoundaryValue, HostFunction, HostObject, HostValue};

/// Console method that produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 3] = [LogLevel::Log, LogLevel::Warn, LogLevel::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "log" => Some(Self::Log),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One console call. Serializes as `[level, timestampMs, ...args]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp_ms: i64,
    /// Arguments as copied at call time.
    pub args: Vec<Value>,
}

impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.args.len() + 2))?;
        seq.serialize_element(&self.level)?;
        seq.serialize_element(&self.timestamp_ms)?;
        for arg in &self.args {
            seq.serialize_element(arg)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for LogEntry {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let mut items: Vec<Value> = Vec::deserialize(deserializer)?;
        if items.len() < 2 {
            return Err(D::Error::custom("log entry needs a level and a timestamp"));
        }
        let args = items.split_off(2);
        let level = LogLevel::parse(items[0].as_str().unwrap_or_default())
            .ok_or_else(|| D::Error::custom("unknown log level"))?;
        let timestamp_ms = items[1]
            .as_i64()
            .ok_or_else(|| D::Error::custom("timestamp must be an integer"))?;
        Ok(Self {
            level,
            timestamp_ms,
            args,
        })
    }
}

#[derive(Default)]
struct Book {
    entries: Vec<LogEntry>,
    last_ms: i64,
}

/// Append-only log of one run, shared by every console handle of that run.
#[derive(Clone, Default)]
pub struct LogBook {
    inner: Arc<Mutex<Book>>,
}

impl LogBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Arguments are rendered immediately, so later
    /// mutation of the originals cannot change what was recorded.
    pub fn record(&self, level: LogLevel, args: &[BoundaryValue]) {
        let args = args.iter().map(render).collect();
        let now = chrono::Utc::now().timestamp_millis();
        let mut book = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        // Wall clock may step backwards; entry order must not.
        let timestamp_ms = now.max(book.last_ms);
        book.last_ms = timestamp_ms;
        book.entries.push(LogEntry {
            level,
            timestamp_ms,
            args,
        });
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries recorded so far, in emission order.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .clone()
    }

    /// Build the sandbox-facing console: a copied object whose `log`,
    /// `warn` and `error` members are synchronous host functions.
    pub fn console(&self) -> HostObject {
        LogLevel::ALL.iter().fold(HostObject::new(), |console, &level| {
            let book = self.clone();
            console.with(
                level.as_str(),
                HostFunction::sync(move |args: Vec<HostValue>| {
                    let copied: Vec<BoundaryValue> =
                        args.into_iter().map(make_transferable).collect();
                    book.record(level, &copied);
                    Ok(HostValue::Undefined)
                }),
            )
        })
    }
}
