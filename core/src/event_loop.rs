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

//! Single-threaded event loop hosting the TCP listener and the collaborator.
//!
//! The loop owns a dedicated OS thread running a current-thread tokio runtime inside a
//! `LocalSet`. Work reaches it through one MPSC queue (accepted connections and device events,
//! processed in arrival order) and a cancellation token, which is always checked first.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinSet, LocalSet};
use tokio_util::sync::CancellationToken;

use crate::collaborator::{Collaborator, CollaboratorFactory, Connection};
use crate::control::ControlSender;
use crate::errors::{ShutdownTimeout, StartError};
use crate::listener::ListenerHandle;
use crate::logging::LogSink;
use crate::notification::DeviceEvent;
use crate::stop_signal::StopSignal;

pub(crate) enum LoopEvent {
    Accepted { stream: TcpStream, peer: SocketAddr },
    Device(DeviceEvent),
}

/// Producer side of the loop queue. Never blocks.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl EventSender {
    /// Hands the event back when the loop is gone.
    pub fn send_device(&self, event: DeviceEvent) -> Result<(), DeviceEvent> {
        self.tx.send(LoopEvent::Device(event)).map_err(|_| event)
    }

    pub(crate) fn send_accepted(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ()> {
        self.tx.send(LoopEvent::Accepted { stream, peer }).map_err(|_| ())
    }
}

pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<LoopEvent>,
}

impl EventReceiver {
    pub(crate) async fn recv(&mut self) -> Option<LoopEvent> {
        self.rx.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<LoopEvent> {
        self.rx.try_recv().ok()
    }

    fn close(&mut self) {
        self.rx.close()
    }
}

pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub bind_address: IpAddr,
    pub port: u16,
    /// How long in-flight connections get to finish once the loop is stopping.
    pub grace_period: Duration,
    /// How long `spawn` waits for the listener to come up.
    pub start_timeout: Duration,
}

pub struct EventLoop {
    settings: LoopSettings,
    collaborators: CollaboratorFactory,
    log: Arc<LogSink>,
    fault_notifier: Option<ControlSender>,
}

impl EventLoop {
    pub fn new(settings: LoopSettings, collaborators: CollaboratorFactory, log: Arc<LogSink>) -> Self {
        Self { settings, collaborators, log, fault_notifier: None }
    }

    /// Where to post a stop request when the loop faults on its own.
    pub fn with_fault_notifier(mut self, control: ControlSender) -> Self {
        self.fault_notifier = Some(control);
        self
    }

    /// Starts the loop thread and blocks until the listener accepts connections.
    ///
    /// `sender` is the producer side of `receiver`; the listener uses it to queue accepted
    /// sockets.
    pub fn spawn(self, sender: EventSender, receiver: EventReceiver) -> Result<LoopHandle, StartError> {
        let start_timeout = self.settings.start_timeout;
        let stop_token = CancellationToken::new();
        let stopped = StopSignal::new();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name("event-loop".into())
            .spawn({
                let stop_token = stop_token.clone();
                let stopped = stopped.clone();
                move || self.run_thread(sender, receiver, stop_token, stopped, ready_tx)
            })
            .map_err(StartError::Spawn)?;

        match ready_rx.recv_timeout(start_timeout) {
            Ok(Ok(local_addr)) => Ok(LoopHandle { stop_token, stopped, local_addr, thread: Some(thread) }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread exits on its own once it sees the token.
                stop_token.cancel();
                Err(StartError::Timeout(start_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                Err(StartError::Runtime(io::Error::other("event loop exited during startup")))
            }
        }
    }

    fn run_thread(
        self,
        sender: EventSender,
        receiver: EventReceiver,
        stop_token: CancellationToken,
        stopped: StopSignal,
        ready_tx: std_mpsc::SyncSender<Result<SocketAddr, StartError>>,
    ) {
        // Declared first so it is dropped last, after the runtime is gone.
        let mut completion = CompletionGuard {
            stopped,
            fault_notifier: self.fault_notifier.clone(),
            running: false,
            faulted: false,
        };

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready_tx.send(Err(StartError::Runtime(e)));
                return;
            }
        };
        let local = LocalSet::new();
        local.block_on(&runtime, self.run(sender, receiver, stop_token, ready_tx, &mut completion));
    }

    async fn run(
        self,
        sender: EventSender,
        mut receiver: EventReceiver,
        stop_token: CancellationToken,
        ready_tx: std_mpsc::SyncSender<Result<SocketAddr, StartError>>,
        completion: &mut CompletionGuard,
    ) {
        let log = self.log.clone();
        let address = SocketAddr::new(self.settings.bind_address, self.settings.port);
        let listener = match ListenerHandle::start(address, sender, log.clone()).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
        };
        let mut collaborator = (self.collaborators)();

        if ready_tx.send(Ok(listener.local_addr())).is_err() || stop_token.is_cancelled() {
            // Startup was abandoned by the controller.
            listener.close().await;
            return;
        }
        completion.running = true;

        let connection_shutdown = CancellationToken::new();
        let mut connections = JoinSet::new();

        let fault = if catch_unwind(AssertUnwindSafe(|| collaborator.on_started())).is_err() {
            Some("start handler panicked")
        } else {
            self.dispatch(&mut receiver, &mut *collaborator, &mut connections, &connection_shutdown, &stop_token)
                .await
        };
        if let Some(reason) = fault {
            log.error(format_args!("Event loop fault: {}; stopping", reason));
            completion.faulted = true;
        }

        self.teardown(listener, receiver, &mut *collaborator, connections, connection_shutdown, &stop_token, completion)
            .await;
        log.info(format_args!("Event loop stopped"));
    }

    /// Run phase. Returns the fault reason if it ended for anything but a stop request.
    async fn dispatch(
        &self,
        receiver: &mut EventReceiver,
        collaborator: &mut dyn Collaborator,
        connections: &mut JoinSet<()>,
        connection_shutdown: &CancellationToken,
        stop_token: &CancellationToken,
    ) -> Option<&'static str> {
        loop {
            tokio::select! {
                biased;
                _ = stop_token.cancelled() => return None,
                item = receiver.recv() => match item {
                    Some(LoopEvent::Accepted { stream, peer }) => {
                        let connection = Connection::new(stream, peer, connection_shutdown.clone());
                        match catch_unwind(AssertUnwindSafe(|| collaborator.on_connection(connection))) {
                            Ok(task) => {
                                connections.spawn_local(task);
                            }
                            Err(_) => return Some("connection handler panicked"),
                        }
                    }
                    Some(LoopEvent::Device(event)) => {
                        if catch_unwind(AssertUnwindSafe(|| collaborator.on_device_event(event))).is_err() {
                            return Some("device event handler panicked");
                        }
                    }
                    None => return Some("event queue closed"),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            return Some("connection task panicked");
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn teardown(
        &self,
        listener: ListenerHandle,
        mut receiver: EventReceiver,
        collaborator: &mut dyn Collaborator,
        mut connections: JoinSet<()>,
        connection_shutdown: CancellationToken,
        stop_token: &CancellationToken,
        completion: &mut CompletionGuard,
    ) {
        let log = &self.log;
        stop_token.cancel();
        listener.close().await;

        receiver.close();
        let mut dropped_events = 0usize;
        while let Some(item) = receiver.try_recv() {
            match item {
                LoopEvent::Accepted { peer, .. } => {
                    log.debug(format_args!("Closing connection from {} accepted during shutdown", peer))
                }
                LoopEvent::Device(_) => dropped_events += 1,
            }
        }
        if dropped_events > 0 {
            log.warn(format_args!("Dropped {} device event(s) queued during shutdown", dropped_events));
        }

        connection_shutdown.cancel();
        if !connections.is_empty() {
            let drain = async {
                while let Some(finished) = connections.join_next().await {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            log.warn(format_args!("Connection task panicked during shutdown"));
                        }
                    }
                }
            };
            if tokio::time::timeout(self.settings.grace_period, drain).await.is_err() {
                log.warn(format_args!(
                    "{} connection(s) still open after {:?}, closing them",
                    connections.len(),
                    self.settings.grace_period
                ));
                connections.shutdown().await;
            }
        }

        if catch_unwind(AssertUnwindSafe(|| collaborator.on_shutdown())).is_err() {
            log.error(format_args!("Event loop fault: shutdown handler panicked"));
            completion.faulted = true;
        }
    }
}

/// Sets the stop signal when the loop thread finishes, including by panic. If the run phase
/// ended because of a fault the controller is asked to stop.
struct CompletionGuard {
    stopped: StopSignal,
    fault_notifier: Option<ControlSender>,
    running: bool,
    faulted: bool,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.running && (self.faulted || thread::panicking()) {
            if let Some(control) = &self.fault_notifier {
                control.request_stop();
            }
        }
        self.stopped.set();
    }
}

/// Control-side handle of a running loop.
pub struct LoopHandle {
    stop_token: CancellationToken,
    stopped: StopSignal,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl LoopHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Callable from any thread. The loop finishes the item it is processing, then tears down.
    pub fn request_stop(&self) {
        self.stop_token.cancel();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stopped.clone()
    }

    /// Blocks until teardown completed or `timeout` elapsed. On timeout the thread is left
    /// running detached.
    pub fn wait_stopped(&mut self, timeout: Duration) -> Result<(), ShutdownTimeout> {
        if !self.stopped.wait_timeout(timeout) {
            return Err(ShutdownTimeout(timeout));
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::control_channel;
    use crate::control::ControlRequest;
    use crate::logging::tests::MemoryDestination;
    use crate::notification::DeviceEventKind;
    use log::LevelFilter;
    use futures::future::LocalBoxFuture;
    use futures::FutureExt;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Started,
        Connection,
        Device(DeviceEventKind),
        Shutdown,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Seen>>>,
        panic_on_device: bool,
        ignore_shutdown: bool,
        device_delay: Option<Duration>,
    }

    impl Recorder {
        fn factory(&self) -> CollaboratorFactory {
            let recorder = self.clone();
            Arc::new(move || Box::new(recorder.clone()) as Box<dyn Collaborator>)
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Collaborator for Recorder {
        fn on_started(&mut self) {
            self.seen.lock().unwrap().push(Seen::Started);
        }

        fn on_connection(&mut self, connection: Connection) -> LocalBoxFuture<'static, ()> {
            self.seen.lock().unwrap().push(Seen::Connection);
            let ignore_shutdown = self.ignore_shutdown;
            async move {
                let (mut stream, _, shutdown) = connection.into_parts();
                let mut buf = [0u8; 64];
                if ignore_shutdown {
                    std::future::pending::<()>().await;
                }
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        read = stream.read(&mut buf) => match read {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        },
                    }
                }
            }
            .boxed_local()
        }

        fn on_device_event(&mut self, event: DeviceEvent) {
            if self.panic_on_device {
                panic!("collaborator failure");
            }
            self.seen.lock().unwrap().push(Seen::Device(event.kind));
            if let Some(delay) = self.device_delay {
                thread::sleep(delay);
            }
        }

        fn on_shutdown(&mut self) {
            self.seen.lock().unwrap().push(Seen::Shutdown);
        }
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            grace_period: Duration::from_millis(200),
            start_timeout: Duration::from_secs(5),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn device_events_are_delivered_in_order() {
        let recorder = Recorder::default();
        let (sender, receiver) = event_queue();
        let device_sender = sender.clone();
        let mut handle = EventLoop::new(settings(), recorder.factory(), Arc::new(LogSink::disabled()))
            .spawn(sender, receiver)
            .unwrap();

        let kinds = [DeviceEventKind::Attached, DeviceEventKind::Removed, DeviceEventKind::Attached];
        for kind in kinds {
            device_sender.send_device(DeviceEvent::now(kind)).unwrap();
        }
        wait_until(|| recorder.seen().len() == 4);

        handle.request_stop();
        handle.wait_stopped(Duration::from_secs(5)).unwrap();
        let mut expected = vec![Seen::Started];
        expected.extend(kinds.into_iter().map(Seen::Device));
        expected.push(Seen::Shutdown);
        assert_eq!(recorder.seen(), expected);
    }

    #[test]
    fn stop_closes_listener_and_drains_clients() {
        let recorder = Recorder::default();
        let (sender, receiver) = event_queue();
        let mut handle = EventLoop::new(settings(), recorder.factory(), Arc::new(LogSink::disabled()))
            .spawn(sender, receiver)
            .unwrap();
        let address = handle.local_addr();

        let _client = std::net::TcpStream::connect(address).unwrap();
        wait_until(|| recorder.seen().contains(&Seen::Connection));

        handle.request_stop();
        handle.wait_stopped(Duration::from_secs(5)).unwrap();
        assert!(handle.stop_signal().is_set());
        assert!(std::net::TcpStream::connect(address).is_err());
    }

    #[test]
    fn stuck_connection_is_aborted_after_grace_period() {
        let recorder = Recorder { ignore_shutdown: true, ..Recorder::default() };
        let (sender, receiver) = event_queue();
        let mut handle = EventLoop::new(settings(), recorder.factory(), Arc::new(LogSink::disabled()))
            .spawn(sender, receiver)
            .unwrap();

        let _client = std::net::TcpStream::connect(handle.local_addr()).unwrap();
        wait_until(|| recorder.seen().contains(&Seen::Connection));

        let begin = std::time::Instant::now();
        handle.request_stop();
        handle.wait_stopped(Duration::from_secs(5)).unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(200));
        assert_eq!(recorder.seen().last(), Some(&Seen::Shutdown));
    }

    #[test]
    fn port_in_use_fails_startup() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let settings = LoopSettings { port: taken.local_addr().unwrap().port(), ..settings() };
        let (sender, receiver) = event_queue();
        let result = EventLoop::new(settings, Recorder::default().factory(), Arc::new(LogSink::disabled()))
            .spawn(sender, receiver);
        assert!(matches!(result, Err(StartError::Bind(_))));
    }

    #[test]
    fn collaborator_panic_posts_stop_request() {
        let recorder = Recorder { panic_on_device: true, ..Recorder::default() };
        let (control, mut control_rx) = control_channel();
        let (sender, receiver) = event_queue();
        let device_sender = sender.clone();
        let mut handle = EventLoop::new(settings(), recorder.factory(), Arc::new(LogSink::disabled()))
            .with_fault_notifier(control)
            .spawn(sender, receiver)
            .unwrap();

        device_sender.send_device(DeviceEvent::now(DeviceEventKind::Attached)).unwrap();

        let mut posted = None;
        wait_until(|| {
            posted = control_rx.try_recv();
            posted.is_some()
        });
        assert_eq!(posted, Some(ControlRequest::Stop));
        handle.wait_stopped(Duration::from_secs(5)).unwrap();
        assert_eq!(recorder.seen().last(), Some(&Seen::Shutdown));
    }

    #[test]
    fn events_after_stop_are_refused() {
        let recorder = Recorder::default();
        let (sender, receiver) = event_queue();
        let device_sender = sender.clone();
        let mut handle = EventLoop::new(settings(), recorder.factory(), Arc::new(LogSink::disabled()))
            .spawn(sender, receiver)
            .unwrap();
        handle.request_stop();
        handle.wait_stopped(Duration::from_secs(5)).unwrap();

        let event = DeviceEvent::now(DeviceEventKind::Removed);
        assert_eq!(device_sender.send_device(event), Err(event));
    }

    #[test]
    fn events_queued_behind_stop_are_dropped_with_warning() {
        let recorder = Recorder { device_delay: Some(Duration::from_millis(200)), ..Recorder::default() };
        let memory = MemoryDestination::default();
        let log = Arc::new(LogSink::new(LevelFilter::Debug).with_destination(memory.clone()));
        let (sender, receiver) = event_queue();
        let device_sender = sender.clone();
        let mut handle = EventLoop::new(settings(), recorder.factory(), log).spawn(sender, receiver).unwrap();

        for _ in 0..4 {
            device_sender.send_device(DeviceEvent::now(DeviceEventKind::Attached)).unwrap();
        }
        // The first event is being handled, the other three wait in the queue.
        wait_until(|| recorder.seen().contains(&Seen::Device(DeviceEventKind::Attached)));
        handle.request_stop();
        handle.wait_stopped(Duration::from_secs(5)).unwrap();

        assert_eq!(
            recorder.seen(),
            vec![Seen::Started, Seen::Device(DeviceEventKind::Attached), Seen::Shutdown]
        );
        assert!(memory
            .messages()
            .contains(&"Dropped 3 device event(s) queued during shutdown".to_string()));
        let late = DeviceEvent::now(DeviceEventKind::Removed);
        assert_eq!(device_sender.send_device(late), Err(late));
    }
}
