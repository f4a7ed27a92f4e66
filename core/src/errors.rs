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

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use crate::service_state::ServiceState;

/// The OS refused the hardware notification registration.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Device notification filter {filter} rejected: {reason}")]
    Rejected {
        filter: String,
        reason: String,
    },

    #[error("Failed to start notification thread: {0}")]
    Worker(#[from] io::Error),

    #[error("Notification thread exited before confirming registration")]
    WorkerExited,
}

#[derive(Error, Debug)]
#[error("Failed to bind TCP listener on {address}: {source}")]
pub struct BindError {
    pub address: SocketAddr,
    #[source]
    pub source: io::Error,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid service state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ServiceState,
    pub to: ServiceState,
}

/// Everything that can abort `start()`. All of these are fatal for the start attempt.
#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("Event loop did not confirm startup within {0:?}")]
    Timeout(Duration),

    #[error("Failed to create event loop runtime: {0}")]
    Runtime(io::Error),

    #[error("Failed to spawn event loop thread: {0}")]
    Spawn(io::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl StartError {
    /// Service specific exit code reported to the service manager for a failed start.
    pub fn exit_code(&self) -> u32 {
        match self {
            StartError::Registration(_) => 1,
            StartError::Bind(_) => 2,
            StartError::Timeout(_) => 3,
            StartError::Runtime(_) | StartError::Spawn(_) => 4,
            StartError::Transition(_) => 5,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Event loop did not confirm shutdown within {0:?}")]
pub struct ShutdownTimeout(pub Duration);

#[derive(Error, Debug)]
pub enum LogDestinationError {
    #[error("{destination}: cannot open: {reason}")]
    Open {
        destination: &'static str,
        reason: String,
    },

    #[error("{destination}: write failed: {reason}")]
    Write {
        destination: &'static str,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum UnregisterError {
    #[error("Notification thread panicked")]
    WorkerPanicked,

    #[error("Notification thread already gone")]
    WorkerGone,
}
