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
use std::thread;

use bridged_core::usb::{inventory_collaborators, UsbHotplugRegistrar};
use bridged_core::{
    control_channel, run_control_loop, ControlSender, ExitStatus, LifecycleController, LogSink, ServiceConfig,
    StatusReport, StatusReporter,
};
use log::{debug, info, warn};

/// Status reporter for runs without a service manager: transitions only go to the log.
struct LoggingReporter;

impl StatusReporter for LoggingReporter {
    fn report(&self, status: &StatusReport) -> anyhow::Result<()> {
        match status.exit_status {
            ExitStatus::Success => info!("Service {}", status.state),
            ExitStatus::ServiceSpecific(code) => warn!("Service {} (exit code {})", status.state, code),
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C signal, exiting..."),
                    _ = terminate.recv() => info!("Received SIGTERM, exiting..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(windows)]
    {
        use tokio::signal::windows::ctrl_close;
        match ctrl_close() {
            Ok(mut close) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C signal, exiting..."),
                    _ = close.recv() => info!("Received close signal from Windows, exiting..."),
                }
            }
            Err(e) => {
                warn!("Failed to install console close handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
}

/// Turns termination signals into a stop request on a small dedicated thread.
fn spawn_signal_watch(control: ControlSender) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    thread::Builder::new().name("signal-watch".into()).spawn(move || {
        runtime.block_on(shutdown_signal());
        control.request_stop();
    })?;
    Ok(())
}

/// Runs the service in the foreground until Ctrl+C or SIGTERM.
pub fn run_standalone(config: ServiceConfig, log: Arc<LogSink>) -> anyhow::Result<ExitStatus> {
    debug!("Starting in standalone mode on port {}", config.port);
    let (control, mut requests) = control_channel();
    spawn_signal_watch(control.clone())?;

    let collaborators = inventory_collaborators(config.device_filter, log.clone());
    let mut controller = LifecycleController::new(
        config,
        Box::new(UsbHotplugRegistrar::new()),
        collaborators,
        Box::new(LoggingReporter),
        control,
        log,
    );

    let status = run_control_loop(&mut controller, &mut requests);
    debug!("Standalone mode exited");
    Ok(status)
}
