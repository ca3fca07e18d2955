//! Basic benchmarks for the `node_world` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use node_world::{NodeContainer, UntypedNodeRef, World};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = usize;
const TEST_VALUE: TestItem = 1024;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_basic");

    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(NodeContainer::<TestItem>::new()));
            }

            start.elapsed()
        });
    });

    group.bench_function("add_one", |b| {
        b.iter_custom(|iters| {
            let mut containers = iter::repeat_with(NodeContainer::<TestItem>::new)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for container in &mut containers {
                _ = black_box(container.add(black_box(TEST_VALUE)));
            }

            start.elapsed()
        });
    });

    group.bench_function("get_one", |b| {
        b.iter_custom(|iters| {
            let mut container = NodeContainer::new();
            let node = container.add(TEST_VALUE);

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(container.get(black_box(node)));
            }

            start.elapsed()
        });
    });

    group.bench_function("get_stale", |b| {
        b.iter_custom(|iters| {
            let mut container = NodeContainer::new();
            let node = container.add(TEST_VALUE);
            container.remove(node);
            container.add(TEST_VALUE);

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(container.get(black_box(node)));
            }

            start.elapsed()
        });
    });

    group.bench_function("remove_one", |b| {
        b.iter_custom(|iters| {
            let mut containers = iter::repeat_with(NodeContainer::<TestItem>::new)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let nodes = containers
                .iter_mut()
                .map(|container| container.add(TEST_VALUE))
                .collect::<Vec<_>>();

            let start = Instant::now();

            for (container, node) in containers.iter_mut().zip(nodes) {
                container.remove(node);
            }

            start.elapsed()
        });
    });

    group.bench_function("world_get_one", |b| {
        b.iter_custom(|iters| {
            let mut world = World::new();
            world.add(1_u8);
            let node = world.add(TEST_VALUE);

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(world.get(black_box(node)));
            }

            start.elapsed()
        });
    });

    group.bench_function("world_untyped_to_typed", |b| {
        b.iter_custom(|iters| {
            let mut world = World::new();
            world.add(1_u8);
            let node: UntypedNodeRef = world.add(TEST_VALUE).into();

            let start = Instant::now();

            for _ in 0..iters {
                _ = black_box(black_box(node).to_typed::<TestItem>(&world));
            }

            start.elapsed()
        });
    });

    group.finish();

    let mut group = c.benchmark_group("node_slow");

    group.bench_function("add_10k", |b| {
        b.iter_custom(|iters| {
            let mut containers = iter::repeat_with(NodeContainer::<TestItem>::new)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for container in &mut containers {
                for _ in 0..10_000 {
                    _ = black_box(container.add(black_box(TEST_VALUE)));
                }
            }

            start.elapsed()
        });
    });

    group.bench_function("forward_10_back_5_times_1000", |b| {
        // We add 10 nodes, remove the first 5 and repeat this 1000 times.
        // This stresses free list reuse and generation bookkeeping.
        b.iter_custom(|iters| {
            let mut containers = iter::repeat_with(NodeContainer::<TestItem>::new)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let mut to_remove = Vec::with_capacity(5);

            let start = Instant::now();

            for container in &mut containers {
                for _ in 0..1000 {
                    to_remove.clear();

                    for _ in 0..5 {
                        to_remove.push(container.add(black_box(TEST_VALUE)));
                    }

                    for _ in 0..5 {
                        _ = black_box(container.add(black_box(TEST_VALUE)));
                    }

                    for node in &to_remove {
                        container.remove(*node);
                    }
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}
