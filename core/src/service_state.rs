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

use std::fmt;
use std::time::Duration;
use bitflags::bitflags;

use crate::errors::TransitionError;

/// State of the service as seen by the OS service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Stopped,
    StartPending,
    Running,
    StopPending,
}

impl ServiceState {
    /// Whether `self -> next` is an edge of the lifecycle.
    ///
    /// The forward cycle is `Stopped -> StartPending -> Running -> StopPending -> Stopped`.
    /// The only other edge is `StartPending -> Stopped`, taken when a start is aborted.
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, StartPending)
                | (StartPending, Running)
                | (StartPending, Stopped)
                | (Running, StopPending)
                | (StopPending, Stopped)
        )
    }

    pub fn is_pending(self) -> bool {
        matches!(self, ServiceState::StartPending | ServiceState::StopPending)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::StartPending => write!(f, "start pending"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::StopPending => write!(f, "stop pending"),
        }
    }
}

bitflags! {
    /// Controls the service accepts in its current state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControlsAccepted: u32 {
        const STOP = 0x0000_0001;
        const SHUTDOWN = 0x0000_0004;
        /// Reserved. Device notifications come from the hotplug registrar, not the service
        /// manager, so no report advertises it.
        const DEVICE_EVENT = 0x0000_0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    ServiceSpecific(u32),
}

impl ExitStatus {
    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }
}

/// One status update sent to the service manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: ServiceState,
    pub controls_accepted: ControlsAccepted,
    pub exit_status: ExitStatus,
    pub wait_hint: Duration,
}

impl StatusReport {
    pub fn new(state: ServiceState, exit_status: ExitStatus, wait_hint: Duration) -> Self {
        let controls_accepted = match state {
            ServiceState::Running => ControlsAccepted::STOP | ControlsAccepted::SHUTDOWN,
            _ => ControlsAccepted::empty(),
        };
        let wait_hint = if state.is_pending() { wait_hint } else { Duration::ZERO };
        Self { state, controls_accepted, exit_status, wait_hint }
    }
}

/// Channel back to the service manager.
pub trait StatusReporter: Send {
    fn report(&self, status: &StatusReport) -> anyhow::Result<()>;
}

/// Guards the lifecycle: only edges accepted by [`ServiceState::can_transition_to`] are applied.
#[derive(Debug)]
pub struct StateMachine {
    state: ServiceState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self { state: ServiceState::Stopped }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(&mut self, next: ServiceState) -> Result<ServiceState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError { from: self.state, to: next });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceState::*;

    const ALL: [ServiceState; 4] = [Stopped, StartPending, Running, StopPending];

    #[test]
    fn initial_state_is_stopped() {
        assert_eq!(StateMachine::new().state(), Stopped);
    }

    #[test]
    fn full_cycle_is_accepted_and_restartable() {
        let mut machine = StateMachine::new();
        for _ in 0..2 {
            for next in [StartPending, Running, StopPending, Stopped] {
                machine.transition(next).unwrap();
            }
        }
        assert_eq!(machine.state(), Stopped);
    }

    #[test]
    fn aborted_start_returns_to_stopped() {
        let mut machine = StateMachine::new();
        machine.transition(StartPending).unwrap();
        assert_eq!(machine.transition(Stopped).unwrap(), StartPending);
    }

    #[test]
    fn skipping_states_is_rejected() {
        let forbidden = [
            (Stopped, Running),
            (Stopped, StopPending),
            (Running, StartPending),
            (Running, Stopped),
            (StopPending, Running),
            (StopPending, StartPending),
            (StartPending, StopPending),
        ];
        for (from, to) in forbidden {
            assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
        }
    }

    #[test]
    fn rejected_transition_keeps_state() {
        let mut machine = StateMachine::new();
        let err = machine.transition(Running).unwrap_err();
        assert_eq!(err, TransitionError { from: Stopped, to: Running });
        assert_eq!(machine.state(), Stopped);
    }

    #[test]
    fn only_running_accepts_controls() {
        for state in ALL {
            let report = StatusReport::new(state, ExitStatus::Success, Duration::from_secs(3));
            assert_eq!(report.controls_accepted.is_empty(), state != Running);
            assert_eq!(report.wait_hint.is_zero(), !state.is_pending());
            assert!(!report.controls_accepted.contains(ControlsAccepted::DEVICE_EVENT));
        }
        let running = StatusReport::new(Running, ExitStatus::Success, Duration::ZERO);
        assert_eq!(running.controls_accepted, ControlsAccepted::STOP | ControlsAccepted::SHUTDOWN);
    }
}
