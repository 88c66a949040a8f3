// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bounded sample storage and rank-based statistics.
//!
//! Samples live in fixed-capacity rings with FIFO eviction, so memory stays flat
//! no matter how long a stream runs. Percentiles use the nearest-rank estimator:
//! the returned value is always one of the samples, never an interpolation.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use ts_rs::TS;

/// Fixed-capacity FIFO buffer. Pushing into a full ring evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct BoundedRing<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedRing<T> {
    /// Creates an empty ring. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { items: VecDeque::with_capacity(capacity), capacity }
    }

    /// Appends `item`, returning the evicted oldest entry if the ring was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity { self.items.pop_front() } else { None };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest.
    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, T> {
        self.items.iter()
    }

    /// The newest `n` entries, oldest first.
    pub fn last_n(&self, n: usize) -> std::collections::vec_deque::Iter<'_, T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.range(skip..)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Nearest-rank percentile of `sorted` (ascending).
///
/// Index is `floor(p / 100 * len)`, clamped to the last element. Empty input yields 0.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let last = sorted.len() - 1;
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let rank = ((p / 100.0) * sorted.len() as f64).floor().max(0.0) as usize;
    sorted[rank.min(last)]
}

/// Nearest-rank percentile of unsorted samples.
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

/// 50th nearest-rank percentile.
pub fn median(samples: &[f64]) -> f64 {
    percentile(samples, 50.0)
}

/// Median and 95th percentile of a sample set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Percentiles {
    pub median: f64,
    pub p95: f64,
}

impl Percentiles {
    /// Sorts once and reads both ranks.
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Self {
        let mut sorted: Vec<f64> = samples.into_iter().collect();
        sorted.sort_by(f64::total_cmp);
        Self { median: percentile_sorted(&sorted, 50.0), p95: percentile_sorted(&sorted, 95.0) }
    }

    /// Applies a presentation rounding function to both values.
    #[must_use]
    pub fn map(self, f: impl Fn(f64) -> f64) -> Self {
        Self { median: f(self.median), p95: f(self.p95) }
    }
}

/// Per-stream frame accounting kept by a scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct StreamStats {
    /// Frames offered by the capture source
    pub offered: u64,
    /// Frames forwarded to the detection pipeline
    pub forwarded: u64,
    /// Frames refused because a detection was still in flight
    pub dropped_busy: u64,
    /// Frames refused by the cadence gate
    pub skipped_cadence: u64,
    /// Forwarded frames whose processing failed
    pub failed: u64,
    /// Forwarded frames that produced a result
    pub completed: u64,
}
