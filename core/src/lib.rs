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

pub mod collaborator;
pub mod config;
pub mod control;
pub mod controller;
pub mod errors;
pub mod event_loop;
pub mod listener;
pub mod logging;
pub mod notification;
pub mod service_state;
pub mod stop_signal;
pub mod usb;

pub use collaborator::{Collaborator, CollaboratorFactory, Connection};
pub use config::{LogSettings, ServiceConfig};
pub use control::{control_channel, run_control_loop, ControlReceiver, ControlRequest, ControlSender, OtherControl};
pub use controller::LifecycleController;
pub use logging::{LogRecord, LogSink};
pub use notification::{DeviceClassFilter, DeviceEvent, DeviceEventKind, HotplugRegistrar};
pub use service_state::{ExitStatus, ServiceState, StatusReport, StatusReporter};
pub use stop_signal::StopSignal;
