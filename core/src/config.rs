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

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use log::LevelFilter;

use crate::event_loop::LoopSettings;
use crate::notification::DeviceClassFilter;

pub const DEFAULT_PORT: u16 = 4223;
pub const DEFAULT_VENDOR_ID: u16 = 0x16D0;
pub const DEFAULT_PRODUCT_ID: u16 = 0x063D;
pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DEFAULT_LOG_FILE_NAME: &str = "bridged.log";

/// Event source identifier used for OS event log entries.
pub const EVENT_SOURCE: &str = "Bridge Daemon";

/// Overrides the default log directory on every platform.
pub const DATA_DIR_ENV: &str = "BRIDGED_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    /// No directory means no file destination.
    pub directory: Option<PathBuf>,
    pub file_name: String,
    pub date_format: String,
    pub debug_output: bool,
    pub event_log: bool,
}

impl LogSettings {
    pub fn file_path(&self) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| dir.join(&self.file_name))
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            directory: default_log_dir(),
            file_name: DEFAULT_LOG_FILE_NAME.to_string(),
            date_format: DEFAULT_DATE_FORMAT.to_string(),
            debug_output: true,
            event_log: true,
        }
    }
}

/// Everything the service reads once when it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub device_filter: DeviceClassFilter,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub grace_period: Duration,
    pub log: LogSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            device_filter: DeviceClassFilter::new(DEFAULT_VENDOR_ID, DEFAULT_PRODUCT_ID),
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            grace_period: Duration::from_secs(2),
            log: LogSettings::default(),
        }
    }
}

impl ServiceConfig {
    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            bind_address: self.bind_address,
            port: self.port,
            grace_period: self.grace_period,
            start_timeout: self.start_timeout,
        }
    }
}

/// Directory the log file goes to when none is configured.
pub fn default_log_dir() -> Option<PathBuf> {
    if let Some(dir) = env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    platform_log_dir()
}

#[cfg(target_os = "windows")]
fn platform_log_dir() -> Option<PathBuf> {
    env::var_os("PROGRAMDATA").map(|dir| PathBuf::from(dir).join("BridgeDaemon"))
}

#[cfg(unix)]
fn platform_log_dir() -> Option<PathBuf> {
    if unsafe { libc::geteuid() } == 0 {
        return Some(PathBuf::from("/var/log"));
    }
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir).join("bridged"));
    }
    env::var_os("HOME").map(|home| PathBuf::from(home).join(".bridged"))
}

#[cfg(not(any(unix, target_os = "windows")))]
fn platform_log_dir() -> Option<PathBuf> {
    None
}
