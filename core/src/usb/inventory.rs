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

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tokio::io::AsyncReadExt;

use crate::collaborator::{Collaborator, CollaboratorFactory, Connection};
use crate::logging::LogSink;
use crate::notification::{DeviceClassFilter, DeviceEvent, DeviceEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {}, address {}", self.bus, self.address)
    }
}

pub trait DeviceEnumerator {
    fn enumerate(&self) -> io::Result<Vec<DeviceAddress>>;
}

/// Lists currently connected devices matching the filter.
#[derive(Debug, Clone)]
pub struct UsbEnumerator {
    filter: DeviceClassFilter,
}

impl UsbEnumerator {
    pub fn new(filter: DeviceClassFilter) -> Self {
        Self { filter }
    }
}

impl DeviceEnumerator for UsbEnumerator {
    fn enumerate(&self) -> io::Result<Vec<DeviceAddress>> {
        Ok(nusb::list_devices()?
            .filter(|info| self.filter.matches(info.vendor_id(), info.product_id()))
            .map(|info| DeviceAddress { bus: info.bus_number(), address: info.device_address() })
            .collect())
    }
}

/// Default collaborator: keeps the set of connected devices current and serves clients by
/// draining their input.
pub struct DeviceInventory<E> {
    enumerator: E,
    devices: BTreeSet<DeviceAddress>,
    log: Arc<LogSink>,
}

impl<E: DeviceEnumerator> DeviceInventory<E> {
    pub fn new(enumerator: E, log: Arc<LogSink>) -> Self {
        Self { enumerator, devices: BTreeSet::new(), log }
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.devices.iter()
    }

    fn scan(&self) -> Option<BTreeSet<DeviceAddress>> {
        match self.enumerator.enumerate() {
            Ok(devices) => Some(devices.into_iter().collect()),
            Err(e) => {
                self.log.error(format_args!("Could not enumerate USB devices: {}", e));
                None
            }
        }
    }

    /// Picks up devices that appeared since the last scan.
    pub fn rescan_added(&mut self) {
        let Some(current) = self.scan() else { return };
        for device in current.difference(&self.devices) {
            self.log.info(format_args!("Added USB device ({})", device));
        }
        self.devices.extend(current);
    }

    /// Releases devices that are no longer connected.
    pub fn rescan_removed(&mut self) {
        let Some(current) = self.scan() else { return };
        let log = &self.log;
        self.devices.retain(|device| {
            let present = current.contains(device);
            if !present {
                log.info(format_args!("Removed USB device ({})", device));
            }
            present
        });
    }

    pub fn release_all(&mut self) {
        for device in std::mem::take(&mut self.devices) {
            self.log.debug(format_args!("Released USB device ({})", device));
        }
    }
}

impl<E: DeviceEnumerator> Collaborator for DeviceInventory<E> {
    fn on_started(&mut self) {
        self.rescan_added();
    }

    fn on_connection(&mut self, connection: Connection) -> LocalBoxFuture<'static, ()> {
        let log = self.log.clone();
        async move {
            let (mut stream, peer, shutdown) = connection.into_parts();
            log.info(format_args!("Client connected ({})", peer));
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    read = stream.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) => {
                            log.debug(format_args!("Client {} read failed: {}", peer, e));
                            break;
                        }
                    },
                }
            }
            log.info(format_args!("Client disconnected ({})", peer));
        }
        .boxed_local()
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event.kind {
            DeviceEventKind::Attached => self.rescan_added(),
            DeviceEventKind::Removed => self.rescan_removed(),
        }
    }

    fn on_shutdown(&mut self) {
        self.release_all();
    }
}

/// Factory building a [`DeviceInventory`] over real USB enumeration for every start.
pub fn inventory_collaborators(filter: DeviceClassFilter, log: Arc<LogSink>) -> CollaboratorFactory {
    Arc::new(move || Box::new(DeviceInventory::new(UsbEnumerator::new(filter), log.clone())) as Box<dyn Collaborator>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::tests::MemoryDestination;
    use log::LevelFilter;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Default)]
    struct FakeEnumerator {
        devices: Arc<Mutex<Vec<DeviceAddress>>>,
        failing: Arc<Mutex<bool>>,
    }

    impl FakeEnumerator {
        fn set(&self, devices: &[(u8, u8)]) {
            *self.devices.lock().unwrap() =
                devices.iter().map(|&(bus, address)| DeviceAddress { bus, address }).collect();
        }
    }

    impl DeviceEnumerator for FakeEnumerator {
        fn enumerate(&self) -> io::Result<Vec<DeviceAddress>> {
            if *self.failing.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "no access"));
            }
            Ok(self.devices.lock().unwrap().clone())
        }
    }

    fn inventory() -> (DeviceInventory<FakeEnumerator>, FakeEnumerator, MemoryDestination) {
        let enumerator = FakeEnumerator::default();
        let memory = MemoryDestination::default();
        let log = Arc::new(LogSink::new(LevelFilter::Debug).with_destination(memory.clone()));
        (DeviceInventory::new(enumerator.clone(), log), enumerator, memory)
    }

    fn addresses(inventory: &DeviceInventory<FakeEnumerator>) -> Vec<(u8, u8)> {
        inventory.devices().map(|d| (d.bus, d.address)).collect()
    }

    #[test]
    fn initial_scan_records_connected_devices() {
        let (mut inventory, enumerator, _) = inventory();
        enumerator.set(&[(1, 4), (2, 7)]);
        inventory.on_started();
        assert_eq!(addresses(&inventory), vec![(1, 4), (2, 7)]);
    }

    #[test]
    fn attach_adds_and_remove_releases() {
        let (mut inventory, enumerator, memory) = inventory();
        enumerator.set(&[(1, 4)]);
        inventory.on_started();

        enumerator.set(&[(1, 4), (1, 5)]);
        inventory.on_device_event(DeviceEvent::now(DeviceEventKind::Attached));
        assert_eq!(addresses(&inventory), vec![(1, 4), (1, 5)]);

        enumerator.set(&[(1, 5)]);
        inventory.on_device_event(DeviceEvent::now(DeviceEventKind::Removed));
        assert_eq!(addresses(&inventory), vec![(1, 5)]);

        let messages = memory.messages();
        assert!(messages.contains(&"Added USB device (bus 1, address 5)".to_string()));
        assert!(messages.contains(&"Removed USB device (bus 1, address 4)".to_string()));
    }

    #[test]
    fn enumeration_failure_keeps_inventory() {
        let (mut inventory, enumerator, memory) = inventory();
        enumerator.set(&[(3, 1)]);
        inventory.on_started();
        *enumerator.failing.lock().unwrap() = true;

        inventory.on_device_event(DeviceEvent::now(DeviceEventKind::Removed));
        assert_eq!(addresses(&inventory), vec![(3, 1)]);
        assert!(memory.messages().iter().any(|m| m.starts_with("Could not enumerate USB devices")));
    }

    #[test]
    fn shutdown_releases_everything() {
        let (mut inventory, enumerator, _) = inventory();
        enumerator.set(&[(1, 1), (1, 2)]);
        inventory.on_started();
        inventory.on_shutdown();
        assert!(addresses(&inventory).is_empty());
    }

    #[tokio::test]
    async fn connection_is_drained_until_client_closes() {
        let (mut inventory, _, memory) = inventory();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let serve = inventory.on_connection(Connection::new(stream, peer, CancellationToken::new()));
        client.write_all(b"ignored payload").await.unwrap();
        drop(client);
        serve.await;

        let messages = memory.messages();
        assert!(messages.contains(&format!("Client connected ({})", peer)));
        assert!(messages.contains(&format!("Client disconnected ({})", peer)));
    }

    #[tokio::test]
    async fn connection_ends_on_shutdown() {
        let (mut inventory, _, _) = inventory();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();

        let shutdown = CancellationToken::new();
        let serve = inventory.on_connection(Connection::new(stream, peer, shutdown.clone()));
        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), serve).await.unwrap();
    }
}
