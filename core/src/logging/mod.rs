// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Diagnostic logging sink.
//!
//! A [`LogSink`] is constructed once and handed to every component that logs. Each
//! [`LogRecord`] is broadcast to all destinations; every destination serializes its own writes
//! and a failing destination never affects the others.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

use crate::config::LogSettings;
use crate::errors::LogDestinationError;

pub mod destinations;

pub use destinations::{DebugOutputDestination, EventLogDestination, FileDestination};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    level: Level,
    message: String,
    timestamp: DateTime<Local>,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self { level, message: message.into(), timestamp: Local::now() }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Renders `<timestamp> <LEVEL> message` with a strftime style `date_format`.
    /// An unusable date format falls back to RFC 3339 instead of failing.
    pub fn render(&self, date_format: &str) -> String {
        let mut line = String::with_capacity(self.message.len() + 32);
        if write!(line, "{}", self.timestamp.format(date_format)).is_err() {
            line.clear();
            line.push_str(&self.timestamp.to_rfc3339());
        }
        let _ = write!(line, " <{}> {}", self.level, self.message);
        line
    }
}

/// One fan-out target of the sink.
pub trait LogDestination: Send + Sync {
    fn name(&self) -> &'static str;

    fn accepts(&self, _level: Level) -> bool {
        true
    }

    fn write(&self, record: &LogRecord) -> Result<(), LogDestinationError>;
}

pub struct LogSink {
    destinations: Vec<Box<dyn LogDestination>>,
    max_level: LevelFilter,
    failures: AtomicU64,
}

impl LogSink {
    pub fn new(max_level: LevelFilter) -> Self {
        Self { destinations: Vec::new(), max_level, failures: AtomicU64::new(0) }
    }

    /// A sink that drops everything.
    pub fn disabled() -> Self {
        Self::new(LevelFilter::Off)
    }

    pub fn with_destination(mut self, destination: impl LogDestination + 'static) -> Self {
        self.destinations.push(Box::new(destination));
        self
    }

    /// Builds the sink described by the settings. Destinations that cannot be opened are left
    /// out and reported through the ones that could.
    pub fn from_settings(settings: &LogSettings) -> Self {
        let mut sink = Self::new(settings.level);
        let mut open_errors = Vec::new();

        if let Some(path) = settings.file_path() {
            match FileDestination::open(&path, &settings.date_format) {
                Ok(file) => sink = sink.with_destination(file),
                Err(e) => open_errors.push(e),
            }
        }
        if settings.debug_output {
            sink = sink.with_destination(DebugOutputDestination::new(&settings.date_format));
        }
        if settings.event_log {
            match EventLogDestination::open() {
                Ok(event_log) => sink = sink.with_destination(event_log),
                Err(e) => open_errors.push(e),
            }
        }

        for e in open_errors {
            sink.warn(format_args!("Log destination unavailable: {}", e));
        }
        sink
    }

    pub fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    pub fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    /// Number of destination writes that failed since the sink was created.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Delivers `record` to every destination that accepts its level.
    ///
    /// Never fails. A destination error is counted and reported once through the remaining
    /// destinations; errors raised while reporting are ignored.
    pub fn emit(&self, record: &LogRecord) {
        for (index, destination) in self.destinations.iter().enumerate() {
            if !destination.accepts(record.level()) {
                continue;
            }
            if let Err(e) = destination.write(record) {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.report_failure(index, &e);
            }
        }
    }

    fn report_failure(&self, failed: usize, error: &LogDestinationError) {
        let notice = LogRecord::new(Level::Warn, format!("Log destination failed: {}", error));
        for (index, destination) in self.destinations.iter().enumerate() {
            if index != failed && destination.accepts(Level::Warn) {
                let _ = destination.write(&notice);
            }
        }
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            self.emit(&LogRecord::new(level, args.to_string()));
        }
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }
}

/// Routes the `log` crate macros into a [`LogSink`].
struct FacadeLogger {
    sink: Arc<LogSink>,
}

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sink.enabled(metadata.level())
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.sink.emit(&LogRecord::new(record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

/// Installs `sink` as the process-wide `log` logger, so `log::info!` and friends (ours and those
/// of dependencies) end up in the same destinations.
pub fn install_global(sink: Arc<LogSink>) -> Result<(), SetLoggerError> {
    let level = sink.max_level();
    log::set_boxed_logger(Box::new(FacadeLogger { sink }))?;
    log::set_max_level(level);
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::thread;

    /// In-memory destination shared with the test through an `Arc`.
    #[derive(Clone, Default)]
    pub(crate) struct MemoryDestination {
        pub(crate) records: Arc<Mutex<Vec<LogRecord>>>,
        warn_and_above_only: bool,
    }

    impl MemoryDestination {
        pub(crate) fn warn_and_above() -> Self {
            Self { warn_and_above_only: true, ..Self::default() }
        }

        pub(crate) fn messages(&self) -> Vec<String> {
            self.records.lock().unwrap().iter().map(|r| r.message().to_string()).collect()
        }
    }

    impl LogDestination for MemoryDestination {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn accepts(&self, level: Level) -> bool {
            !self.warn_and_above_only || level <= Level::Warn
        }

        fn write(&self, record: &LogRecord) -> Result<(), LogDestinationError> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingDestination {
        attempts: AtomicU64,
        fail: AtomicBool,
    }

    impl LogDestination for Arc<FailingDestination> {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn write(&self, _record: &LogRecord) -> Result<(), LogDestinationError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            if self.fail.load(Ordering::Relaxed) {
                Err(LogDestinationError::Write { destination: "failing", reason: "disk full".into() })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn records_below_max_level_are_dropped() {
        let memory = MemoryDestination::default();
        let sink = LogSink::new(LevelFilter::Info).with_destination(memory.clone());
        sink.debug(format_args!("hidden"));
        sink.info(format_args!("shown {}", 1));
        assert_eq!(memory.messages(), vec!["shown 1".to_string()]);
    }

    #[test]
    fn destination_level_filter_is_respected() {
        let all = MemoryDestination::default();
        let severe = MemoryDestination::warn_and_above();
        let sink = LogSink::new(LevelFilter::Debug)
            .with_destination(all.clone())
            .with_destination(severe.clone());
        sink.info(format_args!("routine"));
        sink.warn(format_args!("careful"));
        sink.error(format_args!("broken"));
        assert_eq!(all.messages().len(), 3);
        assert_eq!(severe.messages(), vec!["careful".to_string(), "broken".to_string()]);
    }

    #[test]
    fn failing_destination_does_not_block_others() {
        let failing = Arc::new(FailingDestination::default());
        failing.fail.store(true, Ordering::Relaxed);
        let memory = MemoryDestination::default();
        let sink = LogSink::new(LevelFilter::Debug)
            .with_destination(failing.clone())
            .with_destination(memory.clone());

        sink.info(format_args!("payload"));

        let messages = memory.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m == "payload"));
        assert!(messages.iter().any(|m| m.contains("disk full")));
        assert_eq!(sink.failures(), 1);
        // The failure notice is not written back to the failed destination.
        assert_eq!(failing.attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn concurrent_emit_keeps_every_record() {
        let memory = MemoryDestination::default();
        let sink = Arc::new(LogSink::new(LevelFilter::Debug).with_destination(memory.clone()));
        let threads: Vec<_> = (0..3)
            .map(|context| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for i in 0..200 {
                        sink.info(format_args!("context {} record {}", context, i));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(memory.messages().len(), 600);
    }

    #[test]
    fn render_uses_date_format_and_level() {
        let record = LogRecord::new(Level::Warn, "low battery");
        let line = record.render("%Y");
        assert!(line.ends_with(" <WARN> low battery"), "{line}");
        assert_eq!(&line[..4], record.timestamp().format("%Y").to_string());
    }

    #[test]
    fn render_survives_invalid_date_format() {
        let record = LogRecord::new(Level::Info, "x");
        let line = record.render("%Q%");
        assert!(line.ends_with(" <INFO> x"), "{line}");
    }
}
