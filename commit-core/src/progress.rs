//! Structured progress reporting (C9): tracks `items_total`/`items_done` and
//! logs at a bounded cadence rather than once per item.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

const LOG_EVERY: usize = 1000;

pub struct ProgressLogger {
    total: AtomicI64,
    done: AtomicUsize,
}

impl ProgressLogger {
    pub fn new(total: usize) -> Self {
        Self {
            total: AtomicI64::new(total as i64),
            done: AtomicUsize::new(0),
        }
    }

    /// Advance the done counter by `n`, logging every `LOG_EVERY` items.
    pub fn advance(&self, n: usize) {
        let previous = self.done.fetch_add(n, Ordering::Relaxed);
        let now = previous + n;
        if previous / LOG_EVERY != now / LOG_EVERY {
            tracing::info!(
                event = "publish",
                items_done = now,
                items_total = self.total.load(Ordering::Relaxed),
                "write progress"
            );
        }
    }

    /// Adjust the denominator, used when items are reclassified mid-stream.
    pub fn adjust_total(&self, delta: i64) {
        self.total.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }
}
