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
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use futures::StreamExt;
use log::debug;
use nusb::hotplug::HotplugEvent;
use tokio::sync::oneshot;

use crate::errors::{RegistrationError, UnregisterError};
use crate::notification::{
    DeviceClassFilter, DeviceEventKind, HotplugRegistrar, HotplugSubscription, NotificationCallback,
};

/// Hotplug registrar backed by `nusb::watch_devices`.
///
/// Each registration owns a `usb-hotplug` thread, which plays the OS notification context:
/// it does nothing but translate watch events and hand them to the callback.
#[derive(Debug, Default)]
pub struct UsbHotplugRegistrar;

impl UsbHotplugRegistrar {
    pub fn new() -> Self {
        Self
    }
}

impl HotplugRegistrar for UsbHotplugRegistrar {
    fn register(
        &mut self,
        filter: &DeviceClassFilter,
        callback: NotificationCallback,
    ) -> Result<Box<dyn HotplugSubscription>, RegistrationError> {
        let filter = *filter;
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name("usb-hotplug".into())
            .spawn(move || watch_thread(filter, callback, ready_tx, shutdown_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(UsbHotplugSubscription { shutdown: Some(shutdown_tx), thread: Some(thread) })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(RegistrationError::Rejected { filter: filter.to_string(), reason: e.to_string() })
            }
            Err(_) => {
                let _ = thread.join();
                Err(RegistrationError::WorkerExited)
            }
        }
    }
}

/// Attach events are matched against the filter. A removal carries no descriptor, so every
/// removal is forwarded and consumers rescan.
fn event_kind(filter: &DeviceClassFilter, event: &HotplugEvent) -> Option<DeviceEventKind> {
    match event {
        HotplugEvent::Connected(info) if filter.matches(info.vendor_id(), info.product_id()) => {
            Some(DeviceEventKind::Attached)
        }
        HotplugEvent::Connected(_) => None,
        HotplugEvent::Disconnected(_) => Some(DeviceEventKind::Removed),
    }
}

fn watch_thread(
    filter: DeviceClassFilter,
    callback: NotificationCallback,
    ready_tx: mpsc::SyncSender<io::Result<()>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    runtime.block_on(async move {
        let mut events = match nusb::watch_devices() {
            Ok(events) => events,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        if ready_tx.send(Ok(())).is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                event = events.next() => match event {
                    Some(event) => {
                        if let Some(kind) = event_kind(&filter, &event) {
                            callback.notify(kind);
                        }
                    }
                    None => {
                        debug!("Device events stream ended");
                        break;
                    }
                },
            }
        }
    });
}

struct UsbHotplugSubscription {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl HotplugSubscription for UsbHotplugSubscription {
    fn unregister(mut self: Box<Self>) -> Result<(), UnregisterError> {
        let delivered = self.shutdown.take().map(|tx| tx.send(()).is_ok()).unwrap_or(false);
        let joined = self.thread.take().map(|thread| thread.join());
        match joined {
            Some(Err(_)) => Err(UnregisterError::WorkerPanicked),
            Some(Ok(())) if delivered => Ok(()),
            _ => Err(UnregisterError::WorkerGone),
        }
    }
}

impl Drop for UsbHotplugSubscription {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
