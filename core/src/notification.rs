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

//! Hardware notification bridge.
//!
//! The OS delivers attach and removal notifications on a context it owns. The bridge turns each
//! one into a [`DeviceEvent`] and pushes it onto the event loop queue, nothing more: no I/O, no
//! logging, no lock shared with the loop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use uuid::Uuid;

use crate::errors::{RegistrationError, UnregisterError};
use crate::event_loop::EventSender;
use crate::logging::LogSink;

/// Device interface arrival, as delivered with a device-event control.
pub const DBT_DEVICEARRIVAL: u32 = 0x8000;
/// Device interface removal, as delivered with a device-event control.
pub const DBT_DEVICEREMOVECOMPLETE: u32 = 0x8004;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    Attached,
    Removed,
}

impl DeviceEventKind {
    /// Maps an OS notification code. Anything other than arrival and removal is `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            DBT_DEVICEARRIVAL => Some(DeviceEventKind::Attached),
            DBT_DEVICEREMOVECOMPLETE => Some(DeviceEventKind::Removed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub timestamp: SystemTime,
}

impl DeviceEvent {
    pub fn now(kind: DeviceEventKind) -> Self {
        Self { kind, timestamp: SystemTime::now() }
    }
}

/// Device class the service wants notifications for. `None` matches any id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceClassFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceClassFilter {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self { vendor_id: Some(vendor_id), product_id: Some(product_id) }
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.map_or(true, |v| v == vendor_id) && self.product_id.map_or(true, |p| p == product_id)
    }
}

impl fmt::Display for DeviceClassFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(vid) => write!(f, "{:04x}", vid)?,
            None => write!(f, "*")?,
        }
        match self.product_id {
            Some(pid) => write!(f, ":{:04x}", pid),
            None => write!(f, ":*"),
        }
    }
}

/// Entry point invoked on the OS notification context.
///
/// Cloneable and cheap to call: it only timestamps the event and pushes it onto the unbounded
/// loop queue. Events that can no longer be queued because the loop is gone are counted.
#[derive(Clone)]
pub struct NotificationCallback {
    queue: EventSender,
    dropped: Arc<AtomicU64>,
}

impl NotificationCallback {
    pub fn new(queue: EventSender) -> Self {
        Self { queue, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn notify(&self, kind: DeviceEventKind) {
        if self.queue.send_device(DeviceEvent::now(kind)).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forwards a raw OS code. Returns `false` for codes that are ignored.
    pub fn notify_raw(&self, code: u32) -> bool {
        match DeviceEventKind::from_code(code) {
            Some(kind) => {
                self.notify(kind);
                true
            }
            None => false,
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// OS facility delivering hotplug notifications for a device class.
pub trait HotplugRegistrar: Send {
    fn register(
        &mut self,
        filter: &DeviceClassFilter,
        callback: NotificationCallback,
    ) -> Result<Box<dyn HotplugSubscription>, RegistrationError>;
}

/// A live registration. Dropping it without `unregister` leaks the OS side.
pub trait HotplugSubscription: Send {
    fn unregister(self: Box<Self>) -> Result<(), UnregisterError>;
}

pub struct RegistrationHandle {
    id: Uuid,
    filter: DeviceClassFilter,
    subscription: Box<dyn HotplugSubscription>,
    callback: NotificationCallback,
}

impl RegistrationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn filter(&self) -> &DeviceClassFilter {
        &self.filter
    }

    pub fn callback(&self) -> &NotificationCallback {
        &self.callback
    }
}

pub struct NotificationBridge {
    registrar: Box<dyn HotplugRegistrar>,
    log: Arc<LogSink>,
}

impl NotificationBridge {
    pub fn new(registrar: Box<dyn HotplugRegistrar>, log: Arc<LogSink>) -> Self {
        Self { registrar, log }
    }

    pub fn register(
        &mut self,
        filter: &DeviceClassFilter,
        queue: EventSender,
    ) -> Result<RegistrationHandle, RegistrationError> {
        let callback = NotificationCallback::new(queue);
        let subscription = self.registrar.register(filter, callback.clone())?;
        let handle = RegistrationHandle { id: Uuid::new_v4(), filter: *filter, subscription, callback };
        self.log.info(format_args!(
            "Registered for device notifications on {} (registration {})",
            filter, handle.id
        ));
        Ok(handle)
    }

    /// Never fails: problems are logged and shutdown goes on.
    pub fn unregister(&mut self, handle: RegistrationHandle) {
        let RegistrationHandle { id, filter, subscription, callback } = handle;
        match subscription.unregister() {
            Ok(()) => self.log.info(format_args!("Unregistered device notifications on {} (registration {})", filter, id)),
            Err(e) => self.log.warn(format_args!("Failed to unregister device notifications (registration {}): {}", id, e)),
        }
        let dropped = callback.dropped_events();
        if dropped > 0 {
            self.log.warn(format_args!("{} device notification(s) arrived after the event loop stopped and were dropped", dropped));
        }
    }
}
