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

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Manual-reset event confirming that the event loop finished its teardown.
///
/// Set once by the loop thread when it is done. The control context blocks on it with a bound
/// after requesting a stop. Once set it stays set; every start creates a fresh signal.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the signal is set or `timeout` elapses. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn wait_returns_false_on_timeout() {
        let signal = StopSignal::new();
        let started = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn set_from_other_thread_wakes_waiter() {
        let signal = StopSignal::new();
        let setter = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        assert!(signal.wait_timeout(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn stays_set() {
        let signal = StopSignal::new();
        signal.set();
        assert!(signal.is_set());
        assert!(signal.wait_timeout(Duration::ZERO));
        assert!(signal.wait_timeout(Duration::from_millis(1)));
    }
}
