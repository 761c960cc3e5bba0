//! Heuristic progress for a compression run.
//!
//! The compressor never reports how many files it will process, so progress
//! is estimated by counting "compressing" lines: each one moves the bar by
//! `STEP` until it reaches `CEILING`. Only a successful exit moves it to 1.0.
//! This is an approximation and should stay one; the tool's output format
//! is not a stable contract.
//!
//! One writer (the run's drain task) updates the estimator while any number
//! of readers query it. All state lives in a single atomic word.

use std::sync::atomic::{AtomicU32, Ordering};

/// Progress added per progress line.
pub const STEP: f64 = 0.05;

/// Highest value reachable through progress lines.
pub const CEILING: f64 = 0.9;

/// Number of ticks that reach `CEILING`.
const MAX_TICKS: u32 = 18;

/// Set once the run succeeded.
const COMPLETE: u32 = u32::MAX;

/// Set once the run failed or was cancelled; the tick count is kept in the low bits.
const FROZEN_BIT: u32 = 1 << 30;

#[derive(Debug, Default)]
pub struct ProgressEstimator {
    state: AtomicU32,
}

impl ProgressEstimator {
    pub fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Record one progress line. Returns the new value if it changed.
    pub fn advance(&self) -> Option<f64> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s & FROZEN_BIT == 0 && s < MAX_TICKS).then_some(s + 1)
            })
            .ok()
            .map(|prev| value_of(prev + 1))
    }

    /// Force the value to 1.0.
    pub fn complete(&self) {
        self.state.store(COMPLETE, Ordering::Release);
    }

    /// Pin the current value; later `advance` calls are ignored.
    pub fn freeze(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != COMPLETE).then_some(s | FROZEN_BIT)
            });
    }

    pub fn value(&self) -> f64 {
        value_of(self.state.load(Ordering::Acquire))
    }
}

fn value_of(state: u32) -> f64 {
    if state == COMPLETE {
        return 1.0;
    }
    let ticks = state & !FROZEN_BIT;
    (f64::from(ticks) * STEP).min(CEILING)
}
