// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A reusable rendezvous point for a fixed set of worker threads.

use std::sync::{Condvar, Mutex};

/// A barrier that releases its waiters once all of the configured threads
/// have arrived, and can then be used again for the next rendezvous.
///
/// Re-use is what distinguishes this from a one-shot latch: a thread that is
/// released from one cycle may immediately arrive for the next cycle without
/// disturbing threads still waking up from the previous one. Each cycle is
/// identified by a generation counter; waiters block until the generation
/// changes, so a fast thread entering cycle `g + 1` only ever increments the
/// arrival count of the new cycle.
///
/// Calling [`arrive()`](Self::arrive) from fewer threads than the configured
/// count deadlocks, as any barrier does.
pub struct Barrier {
    /// Arrival count and generation of the current cycle.
    state: Mutex<BarrierState>,
    /// Condition variable on which waiters block until the cycle completes.
    condvar: Condvar,
    /// Number of threads that must arrive to complete a cycle.
    num_threads: usize,
}

/// State of the current barrier cycle, updated under the barrier's mutex.
struct BarrierState {
    /// Number of threads that have arrived in the current cycle.
    count: usize,
    /// Cycle counter, incremented when the last thread arrives.
    generation: u64,
}

impl Barrier {
    /// Creates a barrier for the given number of threads.
    pub fn new(num_threads: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                count: 0,
                generation: 0,
            }),
            condvar: Condvar::new(),
            num_threads,
        }
    }

    /// Blocks until all of the configured threads have called this function
    /// in the current cycle, then releases them all and starts a new cycle.
    pub fn arrive(&self) {
        let mut state = self.state.lock().unwrap();
        let generation = state.generation;

        state.count += 1;
        if state.count < self.num_threads {
            // Waiting on the generation (rather than the count) ensures that
            // a thread re-entering for the next cycle cannot release waiters
            // of the current one.
            let _guard = self
                .condvar
                .wait_while(state, |state| state.generation == generation)
                .unwrap();
        } else {
            state.count = 0;
            state.generation += 1;
            self.condvar.notify_all();
        }
    }
}
