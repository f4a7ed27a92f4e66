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

pub mod cli;
pub mod logger;
pub mod standalone;

#[cfg(target_os = "windows")]
pub mod windows;

use std::sync::Arc;

use bridged_core::{ExitStatus, LogSink, ServiceConfig};
use clap::Parser;
use log::{debug, error, info};

use crate::cli::{Cli, Commands, LogLevel, ServiceCommands, ServiceOptions};
use crate::logger::{init_admin_logger, init_service_sink};

#[cfg(target_os = "windows")]
fn install(log_level: Option<LogLevel>, options: &ServiceOptions) -> anyhow::Result<()> {
    windows::install_service(log_level, options)
}

#[cfg(not(target_os = "windows"))]
fn install(_log_level: Option<LogLevel>, _options: &ServiceOptions) -> anyhow::Result<()> {
    anyhow::bail!("Service installation is only supported on Windows; use your init system instead")
}

#[cfg(target_os = "windows")]
fn uninstall() -> anyhow::Result<()> {
    windows::uninstall_service()
}

#[cfg(not(target_os = "windows"))]
fn uninstall() -> anyhow::Result<()> {
    anyhow::bail!("Service removal is only supported on Windows")
}

/// Runs under the service manager where there is one, in the foreground otherwise.
#[cfg(target_os = "windows")]
fn run_service(config: ServiceConfig, log: Arc<LogSink>) -> anyhow::Result<ExitStatus> {
    windows::start_service(config, log)
}

#[cfg(not(target_os = "windows"))]
fn run_service(config: ServiceConfig, log: Arc<LogSink>) -> anyhow::Result<ExitStatus> {
    standalone::run_standalone(config, log)
}

fn run_admin(verbose: bool, log_level: LogLevel, action: &str, f: impl FnOnce() -> anyhow::Result<()>) -> anyhow::Result<()> {
    init_admin_logger(verbose, log_level)?;
    debug!("Service {} with log level: {}", action, log_level);
    let result = f();
    if let Err(ref e) = result {
        error!("Service {} failed: {:#}", action, e);
    }
    result
}

/// Entry point of the `bridged` executable.
pub fn bridged_main() -> anyhow::Result<ExitStatus> {
    let cli = Cli::parse();
    let log_level = cli.log_level;
    let options = cli.options;

    match cli.command {
        Some(Commands::Service { command: ServiceCommands::Install { verbose, service_log_level } }) => {
            run_admin(verbose, log_level, "install", || install(service_log_level, &options))?;
            Ok(ExitStatus::Success)
        }
        Some(Commands::Service { command: ServiceCommands::Uninstall { verbose } }) => {
            run_admin(verbose, log_level, "uninstall", uninstall)?;
            Ok(ExitStatus::Success)
        }
        Some(Commands::Service { command: ServiceCommands::Run }) => {
            let config = options.to_config(log_level);
            let log = init_service_sink(&config.log)?;
            info!("Service starting with log level: {}", log_level);
            run_service(config, log)
        }
        None => {
            let config = options.to_config(log_level);
            let log = init_service_sink(&config.log)?;
            standalone::run_standalone(config, log)
        }
    }
}
