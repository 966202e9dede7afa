// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Job lifecycle: starting a job, polling it, waiting for it and closing it.

use crate::client::{IntermediateEmitter, MapReduce, OutputEmitter};
use crate::core::barrier::Barrier;
use crate::core::progress::{JobProgress, Stage};
use crate::macros::{log_debug, log_error, log_warn};
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

/// The worker that performs the one-time stage transitions and the shuffle
/// phase, by index convention.
const COORDINATOR: usize = 0;

/// Largest value reported in [`JobState::percentage`].
const MAX_PERCENTAGE: f32 = 100.0;

/// Serializes job creation process-wide, so that concurrent starts do not
/// interleave their spawning.
static START_LOCK: Mutex<()> = Mutex::new(());

/// A progress snapshot of a job, as reported by [`Job::state()`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobState {
    /// Stage the job is currently in.
    pub stage: Stage,
    /// Share of the current stage that is complete, in `[0, 100]`.
    pub percentage: f32,
}

/// A running MapReduce job.
///
/// A job is created with [`start()`](Self::start) and runs on its own pool
/// of worker threads. The handle can be polled with
/// [`state()`](Self::state), waited on with [`wait()`](Self::wait) (from
/// any number of threads concurrently) and finally consumed by
/// [`close()`](Self::close) to collect the output pairs.
///
/// Dropping the handle without closing it detaches the job: the workers run
/// to completion in the background and the output is discarded.
pub struct Job<C: MapReduce> {
    /// Shared context of the job, also referenced by every worker thread.
    inner: Arc<JobContext<C>>,
}

impl<C: MapReduce> Job<C> {
    /// Starts a job executing the given client over the given input batch on
    /// `num_threads` worker threads, and returns without blocking once the
    /// workers are launched.
    ///
    /// An empty input batch yields a job that is born complete: no worker
    /// threads are spawned, [`state()`](Self::state) immediately reports the
    /// reduce stage at 100%, and [`wait()`](Self::wait) and
    /// [`close()`](Self::close) return immediately.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned, or if the input batch
    /// holds more items than the progress word can track (2³¹ − 1).
    pub fn start(
        client: C,
        input: Vec<(C::InputKey, C::InputValue)>,
        num_threads: NonZeroUsize,
    ) -> Self {
        let _guard = START_LOCK.lock().unwrap();

        if input.is_empty() {
            let inner = Arc::new(JobContext::new(client, input, 0));
            inner.progress.store_all(Stage::Reduce, 0, 0);
            return Self { inner };
        }

        let num_threads = num_threads.get();
        if num_threads > input.len() {
            log_warn!(
                "[job] spawning {num_threads} workers for {} input pairs, some will idle until the reduce phase",
                input.len()
            );
        }

        let inner = Arc::new(JobContext::new(client, input, num_threads));
        let mut workers = inner.workers.lock().unwrap();
        for id in 0..num_threads {
            let context = Arc::clone(&inner);
            let builder = std::thread::Builder::new().name(format!("maplight-worker-{id}"));
            match builder.spawn(move || context.run(id)) {
                Ok(handle) => workers.push(Some(handle)),
                Err(e) => {
                    log_error!("failed to spawn worker thread #{id}: {e}");
                    panic!("failed to spawn worker thread #{id}: {e}");
                }
            }
        }
        log_debug!("[job] spawned {num_threads} worker threads");

        drop(workers);
        Self { inner }
    }

    /// Reads the current stage and completion percentage of the job, without
    /// blocking.
    ///
    /// The snapshot is taken from a single atomic word, so the reported pair
    /// is always self-consistent, and the percentage is non-decreasing
    /// within a stage. A stage with nothing to process reports 100%.
    pub fn state(&self) -> JobState {
        let (stage, processed, total) = self.inner.progress.snapshot();
        let percentage = if total == 0 {
            MAX_PERCENTAGE
        } else {
            (processed as f32 / total as f32 * MAX_PERCENTAGE).min(MAX_PERCENTAGE)
        };
        JobState { stage, percentage }
    }

    /// Blocks until every worker thread of this job has finished.
    ///
    /// Safe to call from several threads concurrently, and idempotent: each
    /// worker is joined exactly once, and no caller returns before all
    /// workers are joined.
    pub fn wait(&self) {
        let num_workers = self.inner.workers.lock().unwrap().len();
        for index in 0..num_workers {
            // Taking the handle and joining it under the lock makes
            // concurrent callers block on the join in progress instead of
            // skipping past an unfinished worker.
            let mut workers = self.inner.workers.lock().unwrap();
            if let Some(handle) = workers[index].take() {
                if let Err(panic) = handle.join() {
                    log_error!("[job] worker thread #{index} panicked");
                    drop(workers);
                    std::panic::resume_unwind(panic);
                }
            }
        }
    }

    /// Waits for the job to finish, releases its resources and returns the
    /// output pairs.
    pub fn close(self) -> Vec<(C::OutputKey, C::OutputValue)> {
        self.wait();
        // All workers are joined, so this handle holds the last reference.
        let inner = Arc::into_inner(self.inner).unwrap();
        inner.output.into_inner().unwrap()
    }
}

/// Everything the workers of one job share: the client, the data moving
/// through the phases, the progress word, the dispatch counters and the
/// barrier.
struct JobContext<C: MapReduce> {
    /// The client whose transformations the job executes.
    client: C,
    /// Input batch, read-only for the duration of the job.
    input: Vec<(C::InputKey, C::InputValue)>,
    /// Output container, shared by all workers during the reduce phase and
    /// handed to the caller by [`Job::close()`].
    output: Mutex<Vec<(C::OutputKey, C::OutputValue)>>,
    /// Progress word observed by pollers.
    progress: JobProgress,
    /// Rendezvous point between the phases.
    barrier: Barrier,
    /// One slot per worker, filled with the worker's sorted intermediate
    /// buffer before the first barrier and drained by the coordinator
    /// during the shuffle.
    intermediate: Vec<Mutex<Vec<(C::Key, C::Value)>>>,
    /// Groups of key-equivalent intermediate pairs, published once by the
    /// coordinator before the second barrier. Each group is taken by exactly
    /// one reduce call.
    shuffled: OnceLock<Vec<Mutex<Option<Vec<(C::Key, C::Value)>>>>>,
    /// Number of groups formed by the shuffle; bounds the reduce dispatch.
    shuffle_count: CachePadded<AtomicUsize>,
    /// Dispatch counter of the map phase.
    next_input_index: CachePadded<AtomicUsize>,
    /// Dispatch counter of the reduce phase.
    next_reduce_index: CachePadded<AtomicUsize>,
    /// Join handles of the worker threads, taken one by one by
    /// [`Job::wait()`].
    workers: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl<C: MapReduce> JobContext<C> {
    /// Creates the context for a job over the given input with the given
    /// number of workers.
    fn new(client: C, input: Vec<(C::InputKey, C::InputValue)>, num_threads: usize) -> Self {
        let progress = JobProgress::new(input.len());
        Self {
            client,
            input,
            output: Mutex::new(Vec::new()),
            progress,
            barrier: Barrier::new(num_threads),
            intermediate: (0..num_threads).map(|_| Mutex::new(Vec::new())).collect(),
            shuffled: OnceLock::new(),
            shuffle_count: CachePadded::new(AtomicUsize::new(0)),
            next_input_index: CachePadded::new(AtomicUsize::new(0)),
            next_reduce_index: CachePadded::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::with_capacity(num_threads)),
        }
    }

    /// Main function run by worker thread `id`: map and sort, rendezvous,
    /// shuffle (coordinator only), rendezvous, reduce.
    fn run(&self, id: usize) {
        let buffer = self.map_phase(id);
        *self.intermediate[id].lock().unwrap() = buffer;

        // The shuffle may only inspect buffers that are fully populated and
        // sorted.
        self.barrier.arrive();

        if id == COORDINATOR {
            self.progress.set_stage(Stage::Shuffle);
            self.shuffle_phase();
        }

        // The groups and the reduce total must be published before any
        // worker starts claiming reduce indices.
        self.barrier.arrive();

        self.reduce_phase();
        log_debug!("[thread {id}] done");
    }

    /// Claims input pairs until the batch is exhausted, mapping each one
    /// into this worker's own buffer, and returns the buffer sorted by key.
    fn map_phase(&self, id: usize) -> Vec<(C::Key, C::Value)> {
        if id == COORDINATOR {
            self.progress.set_stage(Stage::Map);
        }

        let mut buffer = Vec::new();
        loop {
            let index = self.next_input_index.fetch_add(1, Ordering::Relaxed);
            let Some((key, value)) = self.input.get(index) else {
                break;
            };
            self.client
                .map(key, value, &mut IntermediateEmitter::new(&mut buffer));
            self.progress.increment_processed();
        }
        log_debug!(
            "[thread {id}] map phase done, {} intermediate pairs",
            buffer.len()
        );

        buffer.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        buffer
    }

    /// Merges all workers' sorted buffers into groups of key-equivalent
    /// pairs and publishes them. Run by the coordinator only, between the
    /// two barriers.
    fn shuffle_phase(&self) {
        let mut buffers: Vec<Vec<(C::Key, C::Value)>> = self
            .intermediate
            .iter()
            .map(|slot| std::mem::take(&mut *slot.lock().unwrap()))
            .collect();

        let num_pairs: usize = buffers.iter().map(Vec::len).sum();
        self.progress.set_total(num_pairs);

        let mut groups = Vec::new();
        loop {
            // Each buffer is sorted ascending, so its back pair holds its
            // greatest key: the overall greatest remaining key is the
            // greatest of the backs.
            let mut max_index: Option<usize> = None;
            for (i, buffer) in buffers.iter().enumerate() {
                if let Some((key, _)) = buffer.last() {
                    let greatest_so_far = match max_index {
                        None => true,
                        Some(j) => buffers[j].last().unwrap().0 < *key,
                    };
                    if greatest_so_far {
                        max_index = Some(i);
                    }
                }
            }
            let Some(max_index) = max_index else {
                break;
            };

            let (max_key, max_value) = buffers[max_index].pop().unwrap();
            self.progress.increment_processed();

            let mut group = Vec::new();
            for buffer in &mut buffers {
                while buffer
                    .last()
                    .is_some_and(|(key, _)| key.cmp(&max_key).is_eq())
                {
                    group.push(buffer.pop().unwrap());
                    self.progress.increment_processed();
                }
            }
            group.push((max_key, max_value));

            self.shuffle_count.fetch_add(1, Ordering::Relaxed);
            groups.push(group);
        }

        log_debug!(
            "[thread 0] shuffle phase done, {num_pairs} pairs in {} groups",
            groups.len()
        );

        let num_groups = groups.len();
        let slots = groups
            .into_iter()
            .map(|group| Mutex::new(Some(group)))
            .collect();
        // The coordinator is the only writer of the shuffled groups.
        if self.shuffled.set(slots).is_err() {
            unreachable!("shuffled groups published twice");
        }

        self.progress.store_all(Stage::Reduce, 0, num_groups);
    }

    /// Claims groups until they are exhausted, reducing each one into the
    /// shared output container.
    fn reduce_phase(&self) {
        let groups = self.shuffled.get().unwrap();
        loop {
            let index = self.next_reduce_index.fetch_add(1, Ordering::Relaxed);
            if index >= self.shuffle_count.load(Ordering::Relaxed) {
                break;
            }
            // The dispatch counter hands each index to exactly one worker,
            // so the group is always still present here.
            let group = groups[index].lock().unwrap().take().unwrap();
            self.client
                .reduce(group, &mut OutputEmitter::new(&self.output));
            self.progress.increment_processed();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A client over `(char, u32)` intermediate pairs whose transformations
    /// are never called, for exercising the shuffle phase directly.
    struct InertClient;

    impl MapReduce for InertClient {
        type InputKey = ();
        type InputValue = ();
        type Key = char;
        type Value = u32;
        type OutputKey = char;
        type OutputValue = u32;

        fn map(&self, _: &(), _: &(), _: &mut IntermediateEmitter<char, u32>) {
            unreachable!("map is not exercised by these tests");
        }

        fn reduce(&self, _: Vec<(char, u32)>, _: &mut OutputEmitter<char, u32>) {
            unreachable!("reduce is not exercised by these tests");
        }
    }

    /// Builds a context whose per-worker buffers hold the given sorted
    /// contents, and runs the shuffle phase on it.
    fn shuffle(buffers: Vec<Vec<(char, u32)>>) -> Vec<Vec<(char, u32)>> {
        let context = JobContext::new(InertClient, Vec::new(), buffers.len());
        for (slot, buffer) in context.intermediate.iter().zip(buffers) {
            assert!(buffer.windows(2).all(|pairs| pairs[0].0 <= pairs[1].0));
            *slot.lock().unwrap() = buffer;
        }

        context.progress.set_stage(Stage::Shuffle);
        context.shuffle_phase();

        let groups = context.shuffled.get().unwrap();
        assert_eq!(
            groups.len(),
            context.shuffle_count.load(Ordering::Relaxed)
        );
        groups
            .iter()
            .map(|slot| slot.lock().unwrap().take().unwrap())
            .collect()
    }

    #[test]
    fn test_shuffle_with_no_pairs() {
        let groups = shuffle(vec![Vec::new(), Vec::new(), Vec::new()]);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_shuffle_groups_are_in_descending_key_order() {
        let groups = shuffle(vec![
            vec![('a', 1), ('c', 2), ('d', 3)],
            vec![('b', 4), ('b', 5), ('d', 6)],
            vec![('a', 7)],
            Vec::new(),
        ]);

        let keys = groups
            .iter()
            .map(|group| group[0].0)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!['d', 'c', 'b', 'a']);
    }

    #[test]
    fn test_shuffle_groups_hold_all_pairs_of_their_key() {
        let mut groups = shuffle(vec![
            vec![('a', 1), ('b', 2)],
            vec![('a', 3), ('a', 4), ('c', 5)],
            vec![('b', 6)],
        ]);

        for group in &mut groups {
            assert!(!group.is_empty());
            let first = group[0].0;
            assert!(group.iter().all(|(key, _)| *key == first));
            group.sort_unstable();
        }
        assert_eq!(
            groups,
            vec![
                vec![('c', 5)],
                vec![('b', 2), ('b', 6)],
                vec![('a', 1), ('a', 3), ('a', 4)],
            ]
        );
    }

    #[test]
    fn test_shuffle_publishes_reduce_progress() {
        let context = JobContext::new(InertClient, Vec::new(), 2);
        *context.intermediate[0].lock().unwrap() = vec![('x', 1), ('y', 2)];
        *context.intermediate[1].lock().unwrap() = vec![('x', 3)];

        context.progress.set_stage(Stage::Shuffle);
        context.shuffle_phase();

        assert_eq!(context.progress.snapshot(), (Stage::Reduce, 0, 2));
        assert_eq!(context.shuffle_count.load(Ordering::Relaxed), 2);
    }
}
