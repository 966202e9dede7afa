// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

fn main() {
    divan::main();
}

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const NUM_STRINGS: &[usize] = &[100, 1_000, 10_000];

/// Generates a reproducible batch of random lowercase strings.
fn make_strings(num_strings: usize) -> Vec<((), String)> {
    use rand::{Rng, SeedableRng};

    let mut rng = rand_chacha::ChaCha12Rng::seed_from_u64(42);
    (0..num_strings)
        .map(|_| {
            let len = rng.random_range(10..100);
            let s = (0..len)
                .map(|_| (b'a' + rng.random_range(0..26u8)) as char)
                .collect::<String>();
            ((), s)
        })
        .collect()
}

/// Baseline benchmark counting characters with a serial loop (without any
/// multi-threading involved).
mod serial {
    use super::{make_strings, NUM_STRINGS};
    use std::collections::BTreeMap;

    #[divan::bench(args = NUM_STRINGS)]
    fn char_count(bencher: divan::Bencher, num_strings: usize) {
        let input = make_strings(num_strings);
        bencher.bench_local(|| {
            let mut counts = BTreeMap::new();
            for (_, s) in &input {
                for c in s.chars() {
                    *counts.entry(c).or_insert(0u64) += 1;
                }
            }
            counts
        })
    }
}

/// Benchmarks counting characters with a MapReduce job.
mod engine {
    use super::{make_strings, NUM_STRINGS, NUM_THREADS};
    use maplight::{IntermediateEmitter, Job, MapReduce, OutputEmitter};
    use std::collections::BTreeMap;
    use std::num::NonZeroUsize;

    struct CharCount;

    impl MapReduce for CharCount {
        type InputKey = ();
        type InputValue = String;
        type Key = char;
        type Value = u64;
        type OutputKey = char;
        type OutputValue = u64;

        fn map(&self, _key: &(), value: &String, out: &mut IntermediateEmitter<char, u64>) {
            let mut counts = BTreeMap::new();
            for c in value.chars() {
                *counts.entry(c).or_insert(0u64) += 1;
            }
            for (c, count) in counts {
                out.emit(c, count);
            }
        }

        fn reduce(&self, group: Vec<(char, u64)>, out: &mut OutputEmitter<char, u64>) {
            out.emit(group[0].0, group.iter().map(|(_, count)| count).sum());
        }
    }

    #[divan::bench(consts = NUM_THREADS, args = NUM_STRINGS)]
    fn char_count<const NUM_THREADS: usize>(bencher: divan::Bencher, num_strings: usize) {
        let input = make_strings(num_strings);
        let num_threads = NonZeroUsize::new(NUM_THREADS).unwrap();
        bencher
            .with_inputs(|| input.clone())
            .bench_local_values(|input| Job::start(CharCount, input, num_threads).close())
    }
}
