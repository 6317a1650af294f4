use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Log level enum for type-safe logging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// Log entry with optional structured context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    /// Module that emitted the entry, e.g. "registration::slice_warp"
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, serde_json::Value>>,
}

/// Bounded log history; the oldest entry is evicted once full
struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn matching(&self, source_prefix: &str) -> Vec<LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.source.starts_with(source_prefix))
            .cloned()
            .collect()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Commands for the logger thread
enum LogCommand {
    Log(LogEntry),
    /// Entries whose source starts with the prefix ("" for all)
    Query(String, Sender<Vec<LogEntry>>),
    Clear,
}

pub struct Logger {
    sender: Sender<LogCommand>,
    min_level: Arc<AtomicU8>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub fn new() -> Self {
        let (sender, receiver) = bounded(4096);
        let min_level = Arc::new(AtomicU8::new(LogLevel::Debug as u8));

        std::thread::spawn(move || {
            Self::logger_thread(receiver);
        });

        Self { sender, min_level }
    }

    /// Background thread that owns the log buffer
    fn logger_thread(receiver: Receiver<LogCommand>) {
        let mut buffer = LogBuffer::new(2000);

        for cmd in receiver {
            match cmd {
                LogCommand::Log(entry) => buffer.push(entry),
                LogCommand::Query(prefix, response_tx) => {
                    let _ = response_tx.send(buffer.matching(&prefix));
                }
                LogCommand::Clear => buffer.clear(),
            }
        }
    }

    fn enabled(&self, level: LogLevel) -> bool {
        (level as u8) >= self.min_level.load(Ordering::Relaxed)
    }

    /// Log with enum level (non-blocking)
    pub fn log(&self, level: LogLevel, message: &str, source: &str) {
        if !self.enabled(level) {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            source: source.to_string(),
            context: None,
        };

        // Drops the entry if the channel is full
        let _ = self.sender.try_send(LogCommand::Log(entry));
    }

    /// Log with context (structured logging)
    pub fn log_with_context(
        &self,
        level: LogLevel,
        message: &str,
        source: &str,
        context: HashMap<String, serde_json::Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.to_string(),
            source: source.to_string(),
            context: Some(context),
        };

        let _ = self.sender.try_send(LogCommand::Log(entry));
    }

    /// Set minimum log level (runtime filtering)
    pub fn set_min_level(&self, level: LogLevel) {
        self.min_level.store(level as u8, Ordering::Relaxed);
    }

    pub fn get_min_level(&self) -> LogLevel {
        match self.min_level.load(Ordering::Relaxed) {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.logs_from("")
    }

    /// Entries emitted by `source_prefix` and its submodules, oldest first.
    ///
    /// `logs_from("registration")` returns entries from every registration
    /// component.
    pub fn logs_from(&self, source_prefix: &str) -> Vec<LogEntry> {
        let (response_tx, response_rx) = bounded(1);
        let query = LogCommand::Query(source_prefix.to_string(), response_tx);
        if self.sender.send(query).is_ok() {
            response_rx.recv().unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    pub fn clear_logs(&self) {
        let _ = self.sender.try_send(LogCommand::Clear);
    }
}

// Global logger instance
lazy_static::lazy_static! {
    pub static ref LOGGER: Logger = Logger::new();
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
        }
    }
}

/// Record `message` in [`LOGGER`] and forward it to the `log` facade
pub fn emit(level: LogLevel, source: &str, message: &str) {
    LOGGER.log(level, message, source);
    log::log!(target: source, level.into(), "{}", message);
}

/// Log to the in-process buffer and to the `log` facade.
///
/// The level is a [`LogLevel`] resolved at the call site.
#[macro_export]
macro_rules! app_log {
    ($level:expr, $source:expr, $($arg:tt)*) => {
        $crate::logger::emit($level, $source, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: message.to_string(),
            source: "test".to_string(),
            context: None,
        }
    }

    #[test]
    fn test_level_round_trip() {
        for level in [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(LogLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(entry(&format!("m{}", i)));
        }
        let messages: Vec<String> = buffer.matching("").into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["m2", "m3", "m4"]);

        buffer.clear();
        assert!(buffer.matching("").is_empty());
    }

    #[test]
    fn test_logs_from_filters_by_source() {
        let logger = Logger::new();
        logger.log(LogLevel::Info, "warped", "registration::warp");
        logger.log(LogLevel::Info, "running 3dWarp", "tools");
        logger.log(LogLevel::Debug, "slice 0", "registration::slice_warp");

        let registration = logger.logs_from("registration");
        assert_eq!(registration.len(), 2);
        assert_eq!(registration[1].message, "slice 0");
        assert_eq!(logger.logs_from("tools").len(), 1);
        assert!(logger.logs_from("pipeline").is_empty());
    }

    #[test]
    fn test_logger_records_entries() {
        let logger = Logger::new();
        logger.log(LogLevel::Info, "slice 3 skipped", "registration::slice_warp");
        let logs = logger.get_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].source, "registration::slice_warp");
    }

    #[test]
    fn test_min_level_filters() {
        let logger = Logger::new();
        logger.set_min_level(LogLevel::Warn);
        assert_eq!(logger.get_min_level(), LogLevel::Warn);

        logger.log(LogLevel::Info, "dropped", "test");
        logger.log(LogLevel::Error, "kept", "test");
        let logs = logger.get_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "kept");
    }

    #[test]
    fn test_app_log_reaches_global_buffer() {
        crate::app_log!(LogLevel::Warn, "logger::emit_check", "slice {} skipped", 4);
        let logs = LOGGER.logs_from("logger::emit_check");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Warn);
        assert_eq!(logs[0].message, "slice 4 skipped");
    }
}
