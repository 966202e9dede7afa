// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Lock-free progress accounting for a job.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

/// Execution stage of a job.
///
/// A job starts in the [`Undefined`](Stage::Undefined) stage until the first
/// worker begins the map phase, and then moves through [`Map`](Stage::Map),
/// [`Shuffle`](Stage::Shuffle) and [`Reduce`](Stage::Reduce) in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// The job was started but no worker has begun mapping yet.
    Undefined = 0,
    /// Workers are applying the map transformation to the input pairs.
    Map = 1,
    /// The coordinator is grouping intermediate pairs by key.
    Shuffle = 2,
    /// Workers are applying the reduce transformation to the groups.
    Reduce = 3,
}

/// The stage, processed count and total count of a job, packed into a single
/// `u64` so that the whole triple can be read and written atomically.
///
/// Layout: bits 63-62 hold the stage, bits 61-31 the processed count and bits
/// 30-0 the total count.
#[derive(Clone, Copy)]
struct PackedProgress(u64);

const STAGE_SHIFT: u32 = 62;
const PROCESSED_SHIFT: u32 = 31;
/// Mask of the 31 bits available to each of the processed and total counts.
const COUNT_MASK: u64 = 0x7FFF_FFFF;

/// Largest processed or total count that fits in the packed layout.
pub const MAX_COUNT: usize = COUNT_MASK as usize;

impl PackedProgress {
    /// Packs the given triple.
    #[inline(always)]
    fn new(stage: Stage, processed: u32, total: u32) -> Self {
        debug_assert!(processed as u64 <= COUNT_MASK);
        debug_assert!(total as u64 <= COUNT_MASK);
        Self(
            ((stage as u64) << STAGE_SHIFT)
                | ((processed as u64 & COUNT_MASK) << PROCESSED_SHIFT)
                | (total as u64 & COUNT_MASK),
        )
    }

    /// Reads the stage.
    #[inline(always)]
    fn stage(self) -> Stage {
        match self.0 >> STAGE_SHIFT {
            0 => Stage::Undefined,
            1 => Stage::Map,
            2 => Stage::Shuffle,
            _ => Stage::Reduce,
        }
    }

    /// Reads the processed count.
    #[inline(always)]
    fn processed(self) -> u32 {
        ((self.0 >> PROCESSED_SHIFT) & COUNT_MASK) as u32
    }

    /// Reads the total count.
    #[inline(always)]
    fn total(self) -> u32 {
        (self.0 & COUNT_MASK) as u32
    }
}

/// Atomic progress word of a job.
///
/// Any thread may take a [`snapshot()`](Self::snapshot) at any time and
/// obtain a mutually consistent `(stage, processed, total)` triple, because
/// all three fields live in one atomic `u64`. Workers bump the processed
/// count concurrently with a compare-exchange loop; stage and total
/// transitions are only performed by the coordinator.
///
/// The word is purely informational and gates no other memory, so acquire
/// loads and release stores are all the ordering it needs.
pub struct JobProgress(CachePadded<AtomicU64>);

impl JobProgress {
    /// Creates a progress word in the [`Undefined`](Stage::Undefined) stage,
    /// with nothing processed out of the given total.
    pub fn new(total: usize) -> Self {
        let packed = PackedProgress::new(Stage::Undefined, 0, to_count(total));
        Self(CachePadded::new(AtomicU64::new(packed.0)))
    }

    /// Reads the current `(stage, processed, total)` triple.
    pub fn snapshot(&self) -> (Stage, u32, u32) {
        let packed = PackedProgress(self.0.load(Ordering::Acquire));
        (packed.stage(), packed.processed(), packed.total())
    }

    /// Atomically increments the processed count, preserving the stage and
    /// total published by concurrent coordinator transitions.
    pub fn increment_processed(&self) {
        let mut old = self.0.load(Ordering::Acquire);
        loop {
            let packed = PackedProgress(old);
            let new = PackedProgress::new(packed.stage(), packed.processed() + 1, packed.total());
            match self.0.compare_exchange_weak(
                old,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    /// Sets the total count and resets the processed count to zero,
    /// preserving the current stage.
    pub fn set_total(&self, total: usize) {
        let total = to_count(total);
        let mut old = self.0.load(Ordering::Acquire);
        loop {
            let new = PackedProgress::new(PackedProgress(old).stage(), 0, total);
            match self.0.compare_exchange_weak(
                old,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    /// Sets the stage and resets the processed count to zero, preserving the
    /// current total.
    pub fn set_stage(&self, stage: Stage) {
        let mut old = self.0.load(Ordering::Acquire);
        loop {
            let new = PackedProgress::new(stage, 0, PackedProgress(old).total());
            match self.0.compare_exchange_weak(
                old,
                new.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(current) => old = current,
            }
        }
    }

    /// Publishes a whole new triple at once, for stage transitions where the
    /// total changes as well.
    pub fn store_all(&self, stage: Stage, processed: usize, total: usize) {
        let packed = PackedProgress::new(stage, to_count(processed), to_count(total));
        self.0.store(packed.0, Ordering::Release);
    }
}

/// Narrows a count to the 31 bits available in the packed layout.
fn to_count(count: usize) -> u32 {
    if count > MAX_COUNT {
        panic!(
            "cannot track progress of {count} items: only up to {MAX_COUNT} items (2^31 - 1) are supported"
        );
    }
    count as u32
}
