//! A virtual clock for tests: sleeping advances time instantly.

use std::{cell::Cell, rc::Rc};

use crate::settle::{Clock, Duration, Instant};

#[derive(Clone, Default)]
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
    sleeps: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.set(self.now_ms.get() + by.to_millis());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.now_ms.get()
    }

    pub fn sleeps(&self) -> u32 {
        self.sleeps.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_ticks(self.now_ms.get())
    }

    fn sleep(&mut self, duration: Duration) {
        self.sleeps.set(self.sleeps.get() + 1);
        self.advance(duration);
    }
}
