// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

extern crate criterion;

pub use criterion::{black_box, criterion_group, criterion_main, Criterion};


use bitmap::benchmark_for_bitmap;
use packet::benchmark_for_packet;

pub fn criterion_benchmark(c: &mut Criterion) {
    benchmark_for_bitmap(c);
    benchmark_for_packet(c);
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(200).measurement_time(std::time::Duration::from_secs(50));
    targets = criterion_benchmark
}

criterion_main! {
    benches,
}
