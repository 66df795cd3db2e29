//! # Relay Logger
//!
//! Structured logging for the relay runtime.
//!
//! ## Philosophy
//!
//! Log records are explicit and structured, not printf-style: a level, an
//! origin label (which session or component produced it), a message, and
//! key/value fields. Sinks are pluggable so tests can capture records
//! instead of scraping stderr.

use std::sync::{Arc, Mutex, PoisonError};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational messages
    Info,
    /// Warnings
    Warn,
    /// Errors
    Error,
}

impl LogLevel {
    fn label(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// A structured log record
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level
    pub level: LogLevel,
    /// Component or session that produced the record
    pub origin: String,
    /// Log message
    pub message: String,
    /// Structured fields
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Creates a new log record
    pub fn new(level: LogLevel, origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            origin: origin.into(),
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a field to the record
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }
}

/// Destination for log records
pub trait LogSink: Send + Sync {
    fn record(&self, entry: &LogEntry);
}

/// Sink that writes one line per record to stderr
pub struct StderrSink;

impl LogSink for StderrSink {
    fn record(&self, entry: &LogEntry) {
        let mut line = format!(
            "[{}] {}: {}",
            entry.level.label(),
            entry.origin,
            entry.message
        );
        for (key, value) in &entry.fields {
            line.push_str(&format!(" {key}={value}"));
        }
        eprintln!("{line}");
    }
}

/// Sink that retains records in memory, for tests
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every record seen so far
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSink for MemorySink {
    fn record(&self, entry: &LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
    }
}

/// Cheap cloneable handle that stamps records with an origin and filters
/// by minimum level before handing them to the sink
#[derive(Clone)]
pub struct Logger {
    origin: String,
    min_level: LogLevel,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    /// Creates a logger over an explicit sink
    pub fn new(origin: impl Into<String>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            origin: origin.into(),
            min_level: LogLevel::Info,
            sink,
        }
    }

    /// Creates a logger that writes to stderr
    pub fn stderr(origin: impl Into<String>) -> Self {
        Self::new(origin, Arc::new(StderrSink))
    }

    /// Lowers or raises the minimum level that reaches the sink
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Derives a logger for a sub-component, extending the origin label
    pub fn scoped(&self, suffix: impl AsRef<str>) -> Self {
        Self {
            origin: format!("{}/{}", self.origin, suffix.as_ref()),
            min_level: self.min_level,
            sink: Arc::clone(&self.sink),
        }
    }

    /// Records an already-built entry, applying the level filter
    pub fn log(&self, entry: LogEntry) {
        if entry.level >= self.min_level {
            self.sink.record(&entry);
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, self.origin.clone(), message));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, self.origin.clone(), message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, self.origin.clone(), message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, self.origin.clone(), message));
    }

    /// Starts an entry at the given level for callers that attach fields
    pub fn entry(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        LogEntry::new(level, self.origin.clone(), message)
    }
}
