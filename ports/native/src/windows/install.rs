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

use anyhow::{Context, Result};
use log::{debug, info};
use windows_service::{
    service::{ServiceAccess, ServiceErrorControl, ServiceInfo, ServiceStartType, ServiceType},
    service_manager::{ServiceManager, ServiceManagerAccess},
};

use crate::cli::{LogLevel, ServiceOptions};
use crate::windows::constants::{SERVICE_DESCRIPTION, SERVICE_DISPLAY_NAME, SERVICE_NAME};

fn launch_arguments(log_level: Option<LogLevel>, options: &ServiceOptions) -> Vec<OsString> {
    let mut arguments = vec![];
    if let Some(log_level) = log_level {
        arguments.extend([OsString::from("--log-level"), OsString::from(log_level.to_string())]);
    }
    arguments.extend(options.to_launch_arguments());
    arguments.extend([OsString::from("service"), OsString::from("run")]);
    arguments
}

/// Registers the current executable as an auto-start service running `service run`.
pub fn install_service(log_level: Option<LogLevel>, options: &ServiceOptions) -> Result<()> {
    debug!("Connecting to service manager");
    let manager_access = ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE;
    let service_manager = ServiceManager::local_computer(None::<&str>, manager_access)
        .context("Failed to connect to service manager")?;

    let executable_path = std::env::current_exe().context("Failed to get current executable path")?;
    debug!("Service binary path: {}", executable_path.display());

    let service_info = ServiceInfo {
        name: OsString::from(SERVICE_NAME),
        display_name: OsString::from(SERVICE_DISPLAY_NAME),
        service_type: ServiceType::OWN_PROCESS,
        start_type: ServiceStartType::AutoStart,
        error_control: ServiceErrorControl::Normal,
        executable_path,
        launch_arguments: launch_arguments(log_level, options),
        dependencies: vec![],
        account_name: None, // LocalSystem
        account_password: None,
    };

    debug!("Creating service");
    let service = service_manager
        .create_service(&service_info, ServiceAccess::CHANGE_CONFIG)
        .context("Failed to create service")?;
    service
        .set_description(SERVICE_DESCRIPTION)
        .context("Failed to set service description")?;

    info!("Service {} installed", SERVICE_NAME);
    println!("Service installed successfully");
    Ok(())
}

pub fn uninstall_service() -> Result<()> {
    debug!("Connecting to service manager");
    let service_manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
        .context("Failed to connect to service manager")?;

    debug!("Opening service: {}", SERVICE_NAME);
    let service = service_manager
        .open_service(SERVICE_NAME, ServiceAccess::DELETE)
        .context("Failed to open service")?;
    service.delete().context("Failed to delete service")?;

    info!("Service {} uninstalled", SERVICE_NAME);
    println!("Service uninstalled successfully");
    Ok(())
}
