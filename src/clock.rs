// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Microsecond clocks used for deferred volume scheduling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Monotonic time in microseconds.
    fn now_usec(&self) -> u64;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_usec(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn set(&self, usec: u64) {
        self.0.store(usec, Ordering::SeqCst);
    }

    pub fn advance(&self, usec: u64) {
        self.0.fetch_add(usec, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_usec(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
