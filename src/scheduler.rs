//! Decides, per demultiplexed update, whether to flush now or batch.
//!
//! The scheduler owns policy only; the run driver owns the clock. A deferred
//! update arms a single shared deadline (never re-armed while one is
//! pending), and the driver sleeps on it in its select loop. The pending map
//! keeps the latest content per index across flushes, so a reader that
//! attaches mid-run always sees every index seen so far and firing twice in
//! a row hands back identical data.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Accumulated content above this many characters flushes immediately.
pub const FLUSH_LENGTH_THRESHOLD: usize = 100;

/// Shared batching window for sub-threshold updates.
pub const THROTTLE_WINDOW: Duration = Duration::from_millis(300);

/// What the driver should do with the update it just offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDirective {
    /// Flush every pending update synchronously, cancelling the timer.
    Immediate,
    /// Leave the update batched; the shared deadline will fire it.
    Deferred,
}

/// Latest known state for one index.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub index: usize,
    pub content: String,
    pub complete: bool,
}

pub struct UpdateScheduler {
    latest: BTreeMap<usize, PendingUpdate>,
    deadline: Option<Instant>,
    threshold: usize,
    window: Duration,
}

impl UpdateScheduler {
    pub fn new(threshold: usize, window: Duration) -> Self {
        UpdateScheduler {
            latest: BTreeMap::new(),
            deadline: None,
            threshold,
            window,
        }
    }

    /// Record the newest content for `index` and decide how to propagate it.
    /// Final updates and long content force an immediate flush; everything
    /// else waits for the shared window.
    pub fn offer(&mut self, index: usize, content: String, complete: bool) -> FlushDirective {
        let long = content.chars().count() > self.threshold;
        self.latest.insert(
            index,
            PendingUpdate {
                index,
                content,
                complete,
            },
        );

        if complete || long {
            self.deadline = None;
            FlushDirective::Immediate
        } else {
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.window);
            }
            FlushDirective::Deferred
        }
    }

    /// The armed throttle deadline, if any, for the driver's sleep arm.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fire a flush: clears the timer and returns the latest update for
    /// every index seen so far. The set is retained, so calling this twice
    /// with nothing offered in between returns identical data.
    pub fn fire(&mut self) -> Vec<PendingUpdate> {
        self.deadline = None;
        self.latest.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}
