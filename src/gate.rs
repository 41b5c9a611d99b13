use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// One-shot latch: fired once by startup, waited on by any number of
/// consumers. Waiting after it fired returns immediately.
#[derive(Default)]
pub struct ReadinessGate {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate. Returns false if it was already open.
    pub fn fire(&self) -> bool {
        let mut fired = self.fired.lock();
        if *fired {
            return false;
        }
        *fired = true;
        self.cond.notify_all();
        true
    }

    /// Blocks until fired or `timeout` elapses. Returns whether it fired.
    /// A timeout too large to form a deadline waits without one.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut fired = self.fired.lock();
        while !*fired {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut fired, deadline).timed_out() {
                        return *fired;
                    }
                }
                None => self.cond.wait(&mut fired),
            }
        }
        true
    }
}
