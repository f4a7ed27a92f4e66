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

use tokio::sync::mpsc;

use crate::controller::LifecycleController;
use crate::service_state::ExitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtherControl {
    /// Device interface notification with its raw OS event code.
    DeviceEvent { event_type: u32 },
}

/// Requests handled one at a time on the control context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Start,
    Stop,
    Other(OtherControl),
}

/// Posts control requests from any thread: the OS control handler, a signal handler or the
/// event loop reporting a fault.
#[derive(Clone, Debug)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlRequest>,
}

impl ControlSender {
    /// Returns `false` once the control loop is gone.
    pub fn send(&self, request: ControlRequest) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn request_stop(&self) -> bool {
        self.send(ControlRequest::Stop)
    }
}

/// Consumed by the control context, which is a plain thread: the OS service dispatcher thread
/// or the process main thread. Must not be used from inside a tokio runtime.
pub struct ControlReceiver {
    rx: mpsc::UnboundedReceiver<ControlRequest>,
}

impl ControlReceiver {
    /// Blocks until a request arrives; `None` once every sender is gone.
    pub fn recv(&mut self) -> Option<ControlRequest> {
        self.rx.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Option<ControlRequest> {
        self.rx.try_recv().ok()
    }
}

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ControlSender { tx }, ControlReceiver { rx })
}

/// Drives `controller` for one service run: starts it, then serves requests until a stop
/// request arrives or every sender is gone. Returns the exit status for the service manager.
pub fn run_control_loop(controller: &mut LifecycleController, requests: &mut ControlReceiver) -> ExitStatus {
    if let Err(e) = controller.start() {
        return ExitStatus::ServiceSpecific(e.exit_code());
    }
    while let Some(request) = requests.recv() {
        match request {
            ControlRequest::Start => {
                if let Err(e) = controller.start() {
                    return ExitStatus::ServiceSpecific(e.exit_code());
                }
            }
            ControlRequest::Stop => break,
            ControlRequest::Other(control) => controller.handle_other(control),
        }
    }
    // A shutdown timeout is logged by the controller; the service still reports Stopped.
    let _ = controller.stop();
    ExitStatus::Success
}
