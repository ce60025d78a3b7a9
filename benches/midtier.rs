//! Criterion-based benchmark target that computes insts/second for
//! arbitrary inputs.

use arbitrary::{Arbitrary, Unstructured};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use midtier_regalloc::fuzzing::func::{machine_config, Func};
use midtier_regalloc::{run, Frame, TickCounter};

fn create_random_func(seed: u64, size: usize) -> Func {
    let mut bytes = vec![0u8; size];
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.fill(&mut bytes[..]);
    let mut u = Unstructured::new(&bytes[..]);
    Func::arbitrary(&mut u).expect("could not generate input")
}

fn run_regalloc(c: &mut Criterion) {
    env_logger::init();
    let config = machine_config();
    let mut group = c.benchmark_group("benches");
    for iter in 0..3u64 {
        let func = create_random_func(iter, 64 * 1024);
        group.throughput(Throughput::Elements(
            func.sequence.instruction_count() as u64
        ));
        group.bench_with_input(BenchmarkId::from_parameter(iter), &iter, |b, _| {
            b.iter(|| {
                // The allocator rewrites the sequence in place, so each
                // iteration allocates a fresh copy.
                let mut sequence = func.sequence.clone();
                let mut frame = Frame::new();
                let mut tick_counter = TickCounter::new();
                run(&mut sequence, &config, &mut frame, &mut tick_counter);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, run_regalloc);
criterion_main!(benches);
