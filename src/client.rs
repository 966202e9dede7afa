// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The client contract: the pair of transformations a job executes.

use std::sync::Mutex;

/// A MapReduce client: a map transformation producing intermediate pairs
/// from each input pair, and a reduce transformation aggregating all
/// intermediate pairs that share a key.
///
/// The engine calls [`map()`](Self::map) once per input pair and
/// [`reduce()`](Self::reduce) once per group of intermediate pairs with
/// equal keys, from multiple worker threads concurrently. Which worker
/// processes which pair is unspecified.
pub trait MapReduce: Send + Sync + 'static {
    /// Key type of the input pairs.
    type InputKey: Send + Sync + 'static;
    /// Value type of the input pairs.
    type InputValue: Send + Sync + 'static;
    /// Key type of the intermediate pairs produced by the map
    /// transformation. Keys that compare [`Equal`](std::cmp::Ordering::Equal)
    /// end up in the same group.
    type Key: Ord + Send + 'static;
    /// Value type of the intermediate pairs produced by the map
    /// transformation.
    type Value: Send + 'static;
    /// Key type of the output pairs produced by the reduce transformation.
    type OutputKey: Send + 'static;
    /// Value type of the output pairs produced by the reduce transformation.
    type OutputValue: Send + 'static;

    /// Transforms one input pair into any number of intermediate pairs,
    /// emitted through `out`.
    fn map(
        &self,
        key: &Self::InputKey,
        value: &Self::InputValue,
        out: &mut IntermediateEmitter<'_, Self::Key, Self::Value>,
    );

    /// Aggregates one group of intermediate pairs into any number of output
    /// pairs (usually one), emitted through `out`.
    ///
    /// All keys in the group compare equal, and the group is never empty.
    /// The group is passed by value: the reduce transformation owns the
    /// intermediate pairs from here on.
    fn reduce(
        &self,
        group: Vec<(Self::Key, Self::Value)>,
        out: &mut OutputEmitter<'_, Self::OutputKey, Self::OutputValue>,
    );
}

/// Sink for the intermediate pairs emitted by a [`MapReduce::map()`] call.
///
/// Each worker thread emits into its own buffer, so emitting takes no lock.
pub struct IntermediateEmitter<'a, K, V> {
    /// Intermediate buffer of the worker running the map call.
    buffer: &'a mut Vec<(K, V)>,
}

impl<'a, K, V> IntermediateEmitter<'a, K, V> {
    pub(crate) fn new(buffer: &'a mut Vec<(K, V)>) -> Self {
        Self { buffer }
    }

    /// Hands an intermediate pair over to the engine.
    pub fn emit(&mut self, key: K, value: V) {
        self.buffer.push((key, value));
    }
}

/// Sink for the output pairs emitted by a [`MapReduce::reduce()`] call.
///
/// The output container is shared by all worker threads, so each emitted
/// pair is appended under a lock held for the duration of the append.
pub struct OutputEmitter<'a, K, V> {
    /// Output container of the job, shared by all workers.
    output: &'a Mutex<Vec<(K, V)>>,
}

impl<'a, K, V> OutputEmitter<'a, K, V> {
    pub(crate) fn new(output: &'a Mutex<Vec<(K, V)>>) -> Self {
        Self { output }
    }

    /// Hands an output pair over to the job's output container.
    pub fn emit(&mut self, key: K, value: V) {
        self.output.lock().unwrap().push((key, value));
    }
}
