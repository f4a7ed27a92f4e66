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

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use bridged_core::config::{DEFAULT_DATE_FORMAT, DEFAULT_LOG_FILE_NAME, DEFAULT_PORT, DEFAULT_PRODUCT_ID, DEFAULT_VENDOR_ID};
use bridged_core::{DeviceClassFilter, LogSettings, ServiceConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

fn parse_hex_u16(value: &str) -> Result<u16, String> {
    let digits = value.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex id '{}': {}", value, e))
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Set the log level
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info, global = true)]
    pub log_level: LogLevel,

    #[command(flatten)]
    pub options: ServiceOptions,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Settings read once when the service starts.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// TCP port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT, global = true)]
    pub port: u16,

    /// Directory of the log file [default: platform data directory]
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Log file name
    #[arg(long, default_value = DEFAULT_LOG_FILE_NAME, global = true)]
    pub log_file: String,

    /// strftime format of log timestamps
    #[arg(long, default_value = DEFAULT_DATE_FORMAT, global = true)]
    pub log_date_format: String,

    /// USB vendor id of the device class to watch (hex)
    #[arg(long, value_parser = parse_hex_u16, default_value = "16d0", global = true)]
    pub vendor_id: u16,

    /// USB product id of the device class to watch (hex)
    #[arg(long, value_parser = parse_hex_u16, default_value = "063d", global = true)]
    pub product_id: u16,

    /// Time in-flight connections get to finish on stop
    #[arg(long, default_value_t = 2000, global = true)]
    pub grace_period_ms: u64,

    /// Upper bound for waiting on the event loop to stop
    #[arg(long, default_value_t = 10000, global = true)]
    pub stop_timeout_ms: u64,
}

impl ServiceOptions {
    pub fn to_config(&self, log_level: LogLevel) -> ServiceConfig {
        let defaults = LogSettings::default();
        ServiceConfig {
            port: self.port,
            device_filter: DeviceClassFilter::new(self.vendor_id, self.product_id),
            grace_period: Duration::from_millis(self.grace_period_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            log: LogSettings {
                level: log_level.to_level_filter(),
                directory: self.log_dir.clone().or(defaults.directory),
                file_name: self.log_file.clone(),
                date_format: self.log_date_format.clone(),
                ..defaults
            },
            ..ServiceConfig::default()
        }
    }

    /// Arguments that reproduce the non-default options, for the service manager command line.
    pub fn to_launch_arguments(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: String| {
            args.push(OsString::from(flag));
            args.push(OsString::from(value));
        };
        if self.port != DEFAULT_PORT {
            push("--port", self.port.to_string());
        }
        if let Some(dir) = &self.log_dir {
            push("--log-dir", dir.display().to_string());
        }
        if self.log_file != DEFAULT_LOG_FILE_NAME {
            push("--log-file", self.log_file.clone());
        }
        if self.log_date_format != DEFAULT_DATE_FORMAT {
            push("--log-date-format", self.log_date_format.clone());
        }
        if self.vendor_id != DEFAULT_VENDOR_ID {
            push("--vendor-id", format!("{:04x}", self.vendor_id));
        }
        if self.product_id != DEFAULT_PRODUCT_ID {
            push("--product-id", format!("{:04x}", self.product_id));
        }
        if self.grace_period_ms != 2000 {
            push("--grace-period-ms", self.grace_period_ms.to_string());
        }
        if self.stop_timeout_ms != 10000 {
            push("--stop-timeout-ms", self.stop_timeout_ms.to_string());
        }
        args
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Service management commands
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },
}

#[derive(Subcommand)]
pub enum ServiceCommands {
    /// Install the service
    Install {
        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,

        /// Service log level
        #[arg(short, long, value_enum)]
        service_log_level: Option<LogLevel>,
    },

    /// Uninstall the service
    Uninstall {
        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Run under the service manager
    Run,
}
