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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::collaborator::CollaboratorFactory;
use crate::config::ServiceConfig;
use crate::control::{ControlSender, OtherControl};
use crate::errors::{ShutdownTimeout, StartError, TransitionError};
use crate::event_loop::{event_queue, EventLoop, LoopHandle};
use crate::logging::LogSink;
use crate::notification::{HotplugRegistrar, NotificationBridge, RegistrationHandle};
use crate::service_state::{ExitStatus, ServiceState, StateMachine, StatusReport, StatusReporter};

struct RunningService {
    event_loop: LoopHandle,
    registration: RegistrationHandle,
}

/// Owns the service state and drives start and stop on behalf of the service manager.
///
/// All methods are meant to be called from the control context, one at a time.
pub struct LifecycleController {
    config: ServiceConfig,
    machine: StateMachine,
    reporter: Box<dyn StatusReporter>,
    bridge: NotificationBridge,
    collaborators: CollaboratorFactory,
    log: Arc<LogSink>,
    control: ControlSender,
    running: Option<RunningService>,
}

impl LifecycleController {
    /// `control` must feed the [`ControlReceiver`](crate::ControlReceiver) that drives this
    /// controller: a faulted event loop posts `Stop` through it so `Stopped` gets reported.
    pub fn new(
        config: ServiceConfig,
        registrar: Box<dyn HotplugRegistrar>,
        collaborators: CollaboratorFactory,
        reporter: Box<dyn StatusReporter>,
        control: ControlSender,
        log: Arc<LogSink>,
    ) -> Self {
        Self {
            config,
            machine: StateMachine::new(),
            reporter,
            bridge: NotificationBridge::new(registrar, log.clone()),
            collaborators,
            log,
            control,
            running: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.machine.state()
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.event_loop.local_addr())
    }

    /// Registers for device notifications and brings up the event loop.
    ///
    /// A no-op when already running. On failure everything acquired so far is released, the
    /// service manager sees `Stopped` with a service specific exit code, and the error is
    /// returned.
    pub fn start(&mut self) -> Result<(), StartError> {
        match self.machine.state() {
            ServiceState::Running => {
                self.log.debug(format_args!("Start requested while running, ignoring"));
                return Ok(());
            }
            ServiceState::Stopped => {}
            state => return Err(TransitionError { from: state, to: ServiceState::StartPending }.into()),
        }

        self.set_state(ServiceState::StartPending, ExitStatus::Success, self.config.start_timeout)?;
        match self.launch() {
            Ok(running) => {
                let local_addr = running.event_loop.local_addr();
                self.running = Some(running);
                self.set_state(ServiceState::Running, ExitStatus::Success, Duration::ZERO)?;
                self.log.info(format_args!("Service running, listening on {}", local_addr));
                Ok(())
            }
            Err(e) => {
                self.log.error(format_args!("Failed to start service: {}", e));
                let exit_status = ExitStatus::ServiceSpecific(e.exit_code());
                if let Err(e) = self.set_state(ServiceState::Stopped, exit_status, Duration::ZERO) {
                    self.log.warn(format_args!("{}", e));
                }
                Err(e)
            }
        }
    }

    fn launch(&mut self) -> Result<RunningService, StartError> {
        let (sender, receiver) = event_queue();
        let registration = self.bridge.register(&self.config.device_filter, sender.clone())?;

        let event_loop = EventLoop::new(self.config.loop_settings(), self.collaborators.clone(), self.log.clone())
            .with_fault_notifier(self.control.clone());
        match event_loop.spawn(sender, receiver) {
            Ok(event_loop) => Ok(RunningService { event_loop, registration }),
            Err(e) => {
                self.bridge.unregister(registration);
                Err(e)
            }
        }
    }

    /// Stops the event loop and waits, bounded by the configured stop timeout, for it to
    /// confirm. `Stopped` is reported in every case; a timeout is logged and returned.
    pub fn stop(&mut self) -> Result<(), ShutdownTimeout> {
        let Some(mut running) = self.running.take() else {
            self.log.debug(format_args!("Stop requested while {}, ignoring", self.machine.state()));
            return Ok(());
        };

        if let Err(e) = self.set_state(ServiceState::StopPending, ExitStatus::Success, self.config.stop_timeout) {
            self.log.warn(format_args!("{}", e));
        }
        running.event_loop.request_stop();
        let result = running.event_loop.wait_stopped(self.config.stop_timeout);
        if let Err(e) = &result {
            self.log.warn(format_args!("{}, reporting stopped anyway", e));
        }
        self.bridge.unregister(running.registration);

        if let Err(e) = self.set_state(ServiceState::Stopped, ExitStatus::Success, Duration::ZERO) {
            self.log.warn(format_args!("{}", e));
        }
        self.log.info(format_args!("Service stopped"));
        result
    }

    /// Forwards device notifications to the bridge; other codes are ignored.
    pub fn handle_other(&mut self, control: OtherControl) {
        match control {
            OtherControl::DeviceEvent { event_type } => {
                if let Some(running) = &self.running {
                    running.registration.callback().notify_raw(event_type);
                }
            }
        }
    }

    fn set_state(
        &mut self,
        next: ServiceState,
        exit_status: ExitStatus,
        wait_hint: Duration,
    ) -> Result<(), TransitionError> {
        let previous = self.machine.transition(next)?;
        self.log.debug(format_args!("Service state {} -> {}", previous, next));
        if let Err(e) = self.reporter.report(&StatusReport::new(next, exit_status, wait_hint)) {
            self.log.warn(format_args!("Failed to report service status '{}': {}", next, e));
        }
        Ok(())
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
