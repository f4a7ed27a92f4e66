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

use futures::future::LocalBoxFuture;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::notification::DeviceEvent;

/// An accepted client, handed to the collaborator on the loop thread.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    shutdown: CancellationToken,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) -> Self {
        Self { stream, peer, shutdown }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Cancelled when the loop starts its teardown. Handlers should wind down once it fires;
    /// whatever is still running after the grace period is aborted.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn into_parts(self) -> (TcpStream, SocketAddr, CancellationToken) {
        (self.stream, self.peer, self.shutdown)
    }
}

/// Consumer side of the event loop. Every method runs on the loop thread, one at a time, in the
/// order the items were queued.
///
/// A panic in any of these is treated as a loop fault: the run phase ends and the service stops.
pub trait Collaborator {
    fn on_started(&mut self) {}

    /// Returns the task serving the connection; it runs on the loop thread alongside later
    /// items.
    fn on_connection(&mut self, connection: Connection) -> LocalBoxFuture<'static, ()>;

    fn on_device_event(&mut self, event: DeviceEvent);

    fn on_shutdown(&mut self) {}
}

/// Builds the collaborator on the loop thread, once per start.
pub type CollaboratorFactory = Arc<dyn Fn() -> Box<dyn Collaborator> + Send + Sync>;
