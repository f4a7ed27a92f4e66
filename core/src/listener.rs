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

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::errors::BindError;
use crate::event_loop::EventSender;
use crate::logging::LogSink;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// TCP listener owned by the event loop.
///
/// Accepted sockets are not served here: they are pushed onto the loop queue so they are
/// processed in arrival order with device events. Must be started inside a `LocalSet`.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ListenerHandle {
    pub async fn start(address: SocketAddr, queue: EventSender, log: Arc<LogSink>) -> Result<Self, BindError> {
        let bind_error = |source| BindError { address, source };
        let listener = TcpListener::bind(address).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        log.info(format_args!("Listening on {}", local_addr));

        let accept_task = tokio::task::spawn_local(accept_loop(listener, queue, log));
        Ok(Self { local_addr, accept_task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes the listening socket. Returns once the socket is released.
    pub async fn close(self) {
        self.accept_task.abort();
        let _ = self.accept_task.await;
    }
}

async fn accept_loop(listener: TcpListener, queue: EventSender, log: Arc<LogSink>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log.debug(format_args!("Accepted connection from {}", peer));
                if queue.send_accepted(stream, peer).is_err() {
                    break;
                }
            }
            Err(e) => {
                // Typically descriptor exhaustion; the listener itself stays usable.
                log.warn(format_args!("Failed to accept connection: {}", e));
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{event_queue, LoopEvent};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::task::LocalSet;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn accepted_connections_are_queued() {
        LocalSet::new()
            .run_until(async {
                let (sender, mut receiver) = event_queue();
                let listener = ListenerHandle::start(loopback(), sender, Arc::new(LogSink::disabled()))
                    .await
                    .unwrap();

                let client = tokio::net::TcpStream::connect(listener.local_addr()).await.unwrap();
                match receiver.recv().await {
                    Some(LoopEvent::Accepted { peer, .. }) => assert_eq!(peer, client.local_addr().unwrap()),
                    _ => panic!("expected an accepted connection"),
                }
                listener.close().await;
            })
            .await;
    }

    #[tokio::test]
    async fn close_releases_the_port() {
        LocalSet::new()
            .run_until(async {
                let (sender, _receiver) = event_queue();
                let listener = ListenerHandle::start(loopback(), sender, Arc::new(LogSink::disabled()))
                    .await
                    .unwrap();
                let address = listener.local_addr();
                listener.close().await;

                assert!(tokio::net::TcpStream::connect(address).await.is_err());
                let rebound = TcpListener::bind(address).await;
                assert!(rebound.is_ok());
            })
            .await;
    }

    #[tokio::test]
    async fn bind_conflict_is_a_bind_error() {
        LocalSet::new()
            .run_until(async {
                let taken = std::net::TcpListener::bind(loopback()).unwrap();
                let address = taken.local_addr().unwrap();
                let (sender, _receiver) = event_queue();
                let err = ListenerHandle::start(address, sender, Arc::new(LogSink::disabled()))
                    .await
                    .err()
                    .unwrap();
                assert_eq!(err.address, address);
            })
            .await;
    }
}
