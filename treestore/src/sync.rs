// SPDX-License-Identifier: AGPL-3.0-only

//! Small concurrency primitives shared by the lock manager and the
//! shared-memory remap path. `Backoff` is lifted from the teacher's
//! `engine::sync` module almost unchanged: a cheap exponential spin before
//! falling back to yielding the OS scheduler, used while a reader races a
//! writer's region remap (spec.md §4.D "Remap discipline").

use std::{cell::Cell, hint::spin_loop, thread, time::{Duration, Instant}};

pub struct Backoff {
    cur: Cell<u8>,
}

impl Backoff {
    const MAX_SPIN: u8 = 6;
    const MAX_YIELD: u8 = 8;

    pub fn new() -> Self {
        Self { cur: Cell::new(0) }
    }

    /// Spin a few times, giving way to the CPU, then fall back to yielding
    /// to the OS scheduler once spinning stops being worthwhile.
    pub fn snooze(&self) {
        if self.cur.get() <= Self::MAX_SPIN {
            for _ in 0..1u32 << self.cur.get() {
                spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.cur.get() <= Self::MAX_YIELD {
            self.cur.set(self.cur.get() + 1);
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A monotonic deadline every lock acquire and every event-delivery phase
/// carries (spec.md §4.E "Timeouts", §5 "Suspension points"). `None` means
/// "wait forever", which callers should use sparingly: the spec requires
/// every suspension point to be boundable.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    pub fn forever() -> Self {
        Self(None)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Remaining budget, or `None` if unbounded. Returns `Some(Duration::ZERO)`
    /// rather than going negative once the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }
}
