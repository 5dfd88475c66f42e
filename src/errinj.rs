//! Error-injection knobs.
//!
//! Background failures are hard to reproduce on demand, so the run writer
//! and the task completion path consult these counters and fail artificially
//! while one is armed. All knobs default to off; tests share a handle with
//! the scheduler through [`crate::config::SchedulerConfig`].

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct Injection {
    /// Fail the next N run writes with `Error::Injected`.
    pub run_write_fail: AtomicI64,
    /// Fail the next N task completions on the coordinator.
    pub task_complete_fail: AtomicI64,
    /// Skip logging `drop_run` when discarding a prepared run, leaking the
    /// record until the recovery sweep picks it up.
    pub run_discard_skip: AtomicBool,
    /// Stall compaction execution until cleared.
    pub compaction_delay: AtomicBool,
}

impl Injection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one shot from an armed counter. Returns true when the
    /// injection fires.
    pub fn fire(counter: &AtomicI64) -> bool {
        loop {
            let n = counter.load(Ordering::SeqCst);
            if n <= 0 {
                return false;
            }
            if counter
                .compare_exchange(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Arm a counter for the next `shots` firings.
    pub fn arm(counter: &AtomicI64, shots: i64) {
        counter.store(shots, Ordering::SeqCst);
    }
}
