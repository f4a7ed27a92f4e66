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

use std::path::{Path, PathBuf};

use log::Level;
use log4rs::append::file::FileAppender;
use log4rs::append::Append;
use log4rs::encode::pattern::PatternEncoder;

use super::{LogDestination, LogRecord};
use crate::errors::LogDestinationError;

const LINE_PATTERN: &str = "{m}{n}";

fn append_line(appender: &dyn Append, level: Level, line: &str) -> anyhow::Result<()> {
    appender.append(
        &log::Record::builder()
            .args(format_args!("{}", line))
            .level(level)
            .target("bridged")
            .build(),
    )
}

/// Append-only log file. Every record is written and flushed before `write` returns.
#[derive(Debug)]
pub struct FileDestination {
    path: PathBuf,
    date_format: String,
    appender: FileAppender,
}

impl FileDestination {
    /// Opens `path` for appending, creating it and its parent directories when missing.
    pub fn open(path: &Path, date_format: &str) -> Result<Self, LogDestinationError> {
        let appender = FileAppender::builder()
            .append(true)
            .encoder(Box::new(PatternEncoder::new(LINE_PATTERN)))
            .build(path)
            .map_err(|e| LogDestinationError::Open {
                destination: "file",
                reason: format!("{}: {}", path.display(), e),
            })?;
        Ok(Self { path: path.to_path_buf(), date_format: date_format.to_string(), appender })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogDestination for FileDestination {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write(&self, record: &LogRecord) -> Result<(), LogDestinationError> {
        append_line(&self.appender, record.level(), &record.render(&self.date_format))
            .map_err(|e| LogDestinationError::Write { destination: "file", reason: e.to_string() })
    }
}

/// Platform debug output: `OutputDebugStringW` on Windows, standard error elsewhere.
///
/// Best effort; a write here never reports a failure.
#[derive(Debug)]
pub struct DebugOutputDestination {
    date_format: String,
    #[cfg(not(target_os = "windows"))]
    console: log4rs::append::console::ConsoleAppender,
}

impl DebugOutputDestination {
    pub fn new(date_format: &str) -> Self {
        Self {
            date_format: date_format.to_string(),
            #[cfg(not(target_os = "windows"))]
            console: log4rs::append::console::ConsoleAppender::builder()
                .target(log4rs::append::console::Target::Stderr)
                .encoder(Box::new(PatternEncoder::new(LINE_PATTERN)))
                .build(),
        }
    }
}

impl LogDestination for DebugOutputDestination {
    fn name(&self) -> &'static str {
        "debug output"
    }

    #[cfg(target_os = "windows")]
    fn write(&self, record: &LogRecord) -> Result<(), LogDestinationError> {
        use windows::core::PCWSTR;
        use windows::Win32::System::Diagnostics::Debug::OutputDebugStringW;

        let wide: Vec<u16> = record
            .render(&self.date_format)
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        unsafe { OutputDebugStringW(PCWSTR(wide.as_ptr())) };
        Ok(())
    }

    #[cfg(not(target_os = "windows"))]
    fn write(&self, record: &LogRecord) -> Result<(), LogDestinationError> {
        let _ = append_line(&self.console, record.level(), &record.render(&self.date_format));
        Ok(())
    }
}

/// OS event log. Only warnings and errors are forwarded.
pub struct EventLogDestination {
    #[cfg(target_os = "windows")]
    source: windows_event_log::EventSource,
}

impl EventLogDestination {
    #[cfg(target_os = "windows")]
    pub fn open() -> Result<Self, LogDestinationError> {
        Ok(Self { source: windows_event_log::EventSource::register(crate::config::EVENT_SOURCE)? })
    }

    #[cfg(unix)]
    pub fn open() -> Result<Self, LogDestinationError> {
        let ident = syslog_ident()?;
        unsafe { libc::openlog(ident.as_ptr(), libc::LOG_PID | libc::LOG_NDELAY, libc::LOG_DAEMON) };
        Ok(Self {})
    }

    #[cfg(not(any(unix, target_os = "windows")))]
    pub fn open() -> Result<Self, LogDestinationError> {
        Err(LogDestinationError::Open {
            destination: "event log",
            reason: "not available on this platform".into(),
        })
    }
}

// openlog keeps the ident pointer, so it lives for the whole process.
#[cfg(unix)]
static SYSLOG_IDENT: std::sync::OnceLock<std::ffi::CString> = std::sync::OnceLock::new();

#[cfg(unix)]
fn syslog_ident() -> Result<&'static std::ffi::CStr, LogDestinationError> {
    if let Some(ident) = SYSLOG_IDENT.get() {
        return Ok(ident);
    }
    let ident = std::ffi::CString::new(crate::config::EVENT_SOURCE).map_err(|e| LogDestinationError::Open {
        destination: "event log",
        reason: e.to_string(),
    })?;
    Ok(SYSLOG_IDENT.get_or_init(|| ident))
}

impl LogDestination for EventLogDestination {
    fn name(&self) -> &'static str {
        "event log"
    }

    fn accepts(&self, level: Level) -> bool {
        level <= Level::Warn
    }

    #[cfg(target_os = "windows")]
    fn write(&self, record: &LogRecord) -> Result<(), LogDestinationError> {
        self.source.report(record.level(), record.message())
    }

    #[cfg(unix)]
    fn write(&self, record: &LogRecord) -> Result<(), LogDestinationError> {
        let priority = match record.level() {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            _ => libc::LOG_INFO,
        };
        let message = std::ffi::CString::new(record.message().replace('\0', " ")).map_err(|e| {
            LogDestinationError::Write { destination: "event log", reason: e.to_string() }
        })?;
        unsafe { libc::syslog(priority, c"%s".as_ptr(), message.as_ptr()) };
        Ok(())
    }

    #[cfg(not(any(unix, target_os = "windows")))]
    fn write(&self, _record: &LogRecord) -> Result<(), LogDestinationError> {
        Ok(())
    }
}

#[cfg(target_os = "windows")]
mod windows_event_log {
    use log::Level;
    use windows::core::{HSTRING, PCWSTR};
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Security::PSID;
    use windows::Win32::System::EventLog::{
        DeregisterEventSource, RegisterEventSourceW, ReportEventW, EVENTLOG_ERROR_TYPE,
        EVENTLOG_WARNING_TYPE,
    };

    use crate::errors::LogDestinationError;

    const EVENT_ID: u32 = 1;

    /// Registered event source handle, kept as an integer so the owner stays `Send + Sync`.
    pub(super) struct EventSource {
        handle: isize,
    }

    impl EventSource {
        pub(super) fn register(name: &str) -> Result<Self, LogDestinationError> {
            let handle = unsafe { RegisterEventSourceW(PCWSTR::null(), &HSTRING::from(name)) }
                .map_err(|e| LogDestinationError::Open {
                    destination: "event log",
                    reason: e.to_string(),
                })?;
            Ok(Self { handle: handle.0 as isize })
        }

        pub(super) fn report(&self, level: Level, message: &str) -> Result<(), LogDestinationError> {
            let kind = match level {
                Level::Error => EVENTLOG_ERROR_TYPE,
                _ => EVENTLOG_WARNING_TYPE,
            };
            let text = HSTRING::from(message);
            let strings = [PCWSTR(text.as_ptr())];
            unsafe {
                ReportEventW(
                    HANDLE(self.handle as *mut _),
                    kind,
                    0,
                    EVENT_ID,
                    PSID::default(),
                    0,
                    Some(&strings),
                    None,
                )
            }
            .map_err(|e| LogDestinationError::Write { destination: "event log", reason: e.to_string() })
        }
    }

    impl Drop for EventSource {
        fn drop(&mut self) {
            let _ = unsafe { DeregisterEventSource(HANDLE(self.handle as *mut _)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn file_destination_appends_flushed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridged.log");
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        let file = FileDestination::open(&path, "%Y-%m-%d %H:%M:%S").unwrap();
        file.write(&LogRecord::new(Level::Info, "first")).unwrap();
        file.write(&LogRecord::new(Level::Error, "second")).unwrap();

        // Readable without dropping the destination: every write is flushed.
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" <INFO> first"));
        assert!(lines[1].ends_with(" <ERROR> second"));
        assert_eq!(file.path(), path.as_path());
    }

    #[test]
    fn file_destination_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridged.log");
        fs::write(&path, "earlier run\n").unwrap();

        let file = FileDestination::open(&path, "%H").unwrap();
        file.write(&LogRecord::new(Level::Warn, "later run")).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("earlier run\n"));
        assert!(content.trim_end().ends_with("<WARN> later run"));
    }

    #[test]
    fn concurrent_file_writes_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridged.log");
        let file = Arc::new(FileDestination::open(&path, "%H:%M:%S").unwrap());

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let file = file.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let message = format!("writer-{}-record-{}", w, i);
                        file.write(&LogRecord::new(Level::Info, message)).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 400);
        for line in lines {
            let message = line.rsplit("<INFO> ").next().unwrap();
            assert!(message.starts_with("writer-") && message.contains("-record-"), "{line}");
        }
    }

    #[test]
    fn event_log_only_accepts_warnings_and_errors() {
        let event_log = EventLogDestination::open();
        if let Ok(event_log) = event_log {
            assert!(event_log.accepts(Level::Error));
            assert!(event_log.accepts(Level::Warn));
            assert!(!event_log.accepts(Level::Info));
            assert!(!event_log.accepts(Level::Debug));
        }
    }

    #[test]
    fn debug_output_never_fails() {
        let debug = DebugOutputDestination::new("%H");
        assert!(debug.write(&LogRecord::new(Level::Debug, "trace")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn syslog_ident_is_the_event_source() {
        let ident = syslog_ident().unwrap();
        assert_eq!(ident.to_str().unwrap(), crate::config::EVENT_SOURCE);
        assert!(std::ptr::eq(ident, syslog_ident().unwrap()));
    }
}
