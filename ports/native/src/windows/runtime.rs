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
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use bridged_core::service_state::ControlsAccepted;
use bridged_core::usb::{inventory_collaborators, UsbHotplugRegistrar};
use bridged_core::{
    control_channel, run_control_loop, ExitStatus, LifecycleController, LogSink, ServiceConfig, ServiceState,
    StatusReport, StatusReporter,
};
use log::{debug, error, info};
use windows_service::{
    define_windows_service,
    service::{ServiceControl, ServiceControlAccept, ServiceExitCode, ServiceStatus, ServiceType},
    service_control_handler::{self, ServiceControlHandlerResult, ServiceStatusHandle},
    service_dispatcher,
};

use crate::windows::constants::SERVICE_NAME;

struct ServiceContext {
    config: ServiceConfig,
    log: Arc<LogSink>,
}

// The dispatcher calls `service_main` without a way to pass state, so the context is parked here
// before dispatching.
static SERVICE_CONTEXT: OnceLock<ServiceContext> = OnceLock::new();
static EXIT_CODE: AtomicU32 = AtomicU32::new(0);

define_windows_service!(ffi_service_main, service_main);

/// Hands the process over to the service control dispatcher. Returns once the service stopped.
pub fn start_service(config: ServiceConfig, log: Arc<LogSink>) -> Result<ExitStatus> {
    SERVICE_CONTEXT
        .set(ServiceContext { config, log })
        .map_err(|_| anyhow!("Service already dispatched"))?;
    service_dispatcher::start(SERVICE_NAME, ffi_service_main)?;
    Ok(match EXIT_CODE.load(Ordering::SeqCst) {
        0 => ExitStatus::Success,
        code => ExitStatus::ServiceSpecific(code),
    })
}

fn service_main(_arguments: Vec<OsString>) {
    if let Err(e) = run_service_main() {
        error!("Service failed: {}", e);
    }
}

struct WindowsStatusReporter {
    handle: ServiceStatusHandle,
    checkpoint: AtomicU32,
}

fn windows_state(state: ServiceState) -> windows_service::service::ServiceState {
    use windows_service::service::ServiceState as Scm;
    match state {
        ServiceState::Stopped => Scm::Stopped,
        ServiceState::StartPending => Scm::StartPending,
        ServiceState::Running => Scm::Running,
        ServiceState::StopPending => Scm::StopPending,
    }
}

fn windows_controls(controls: ControlsAccepted) -> ServiceControlAccept {
    let mut accepted = ServiceControlAccept::empty();
    if controls.contains(ControlsAccepted::STOP) {
        accepted |= ServiceControlAccept::STOP;
    }
    if controls.contains(ControlsAccepted::SHUTDOWN) {
        accepted |= ServiceControlAccept::SHUTDOWN;
    }
    accepted
}

impl StatusReporter for WindowsStatusReporter {
    fn report(&self, status: &StatusReport) -> anyhow::Result<()> {
        let checkpoint = if status.state.is_pending() {
            self.checkpoint.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.checkpoint.store(0, Ordering::Relaxed);
            0
        };
        let exit_code = match status.exit_status {
            ExitStatus::Success => ServiceExitCode::Win32(0),
            ExitStatus::ServiceSpecific(code) => ServiceExitCode::ServiceSpecific(code),
        };
        debug!("Setting service status to {}", status.state);
        self.handle.set_service_status(ServiceStatus {
            service_type: ServiceType::OWN_PROCESS,
            current_state: windows_state(status.state),
            controls_accepted: windows_controls(status.controls_accepted),
            exit_code,
            checkpoint,
            wait_hint: status.wait_hint,
            process_id: None,
        })?;
        Ok(())
    }
}

fn run_service_main() -> Result<()> {
    let context = SERVICE_CONTEXT.get().ok_or_else(|| anyhow!("Service context not initialized"))?;
    let (control, mut requests) = control_channel();

    let handler_control = control.clone();
    let event_handler = move |control_event| -> ServiceControlHandlerResult {
        match control_event {
            // System shutdown is handled like a stop.
            ServiceControl::Stop | ServiceControl::Shutdown => {
                debug!("Received {:?} control event", control_event);
                handler_control.request_stop();
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => {
                debug!("Received unsupported control event: {:?}", control_event);
                ServiceControlHandlerResult::NotImplemented
            }
        }
    };

    debug!("Registering service control handler");
    let status_handle = service_control_handler::register(SERVICE_NAME, event_handler)?;
    let reporter = WindowsStatusReporter { handle: status_handle, checkpoint: AtomicU32::new(0) };

    let collaborators = inventory_collaborators(context.config.device_filter, context.log.clone());
    let mut controller = LifecycleController::new(
        context.config.clone(),
        Box::new(UsbHotplugRegistrar::new()),
        collaborators,
        Box::new(reporter),
        control,
        context.log.clone(),
    );

    let status = run_control_loop(&mut controller, &mut requests);
    if let ExitStatus::ServiceSpecific(code) = status {
        EXIT_CODE.store(code, Ordering::SeqCst);
    }
    info!("Exiting service");
    Ok(())
}
