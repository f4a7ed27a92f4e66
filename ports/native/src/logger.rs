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

use std::sync::Arc;

use bridged_core::logging::{install_global, LogSink};
use bridged_core::LogSettings;
use env_logger::Env;
use log::debug;

use crate::cli::LogLevel;

/// Environment variable overriding the console filter of administrative commands.
pub const LOG_ENV: &str = "BRIDGED_LOG";

/// Builds the service log sink and routes the `log` macros into it.
pub fn init_service_sink(settings: &LogSettings) -> anyhow::Result<Arc<LogSink>> {
    let sink = Arc::new(LogSink::from_settings(settings));
    install_global(sink.clone())?;
    debug!("Logger initialized with level: {}", settings.level);
    Ok(sink)
}

/// Console logging for install and uninstall.
pub fn init_admin_logger(verbose: bool, log_level: LogLevel) -> anyhow::Result<()> {
    let default_filter = if verbose { LogLevel::Debug } else { log_level };
    env_logger::Builder::from_env(Env::default().filter_or(LOG_ENV, default_filter.to_string()))
        .format_timestamp_millis()
        .try_init()?;
    Ok(())
}
