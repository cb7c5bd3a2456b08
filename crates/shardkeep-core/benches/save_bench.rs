//! Criterion benchmarks for world saves and the timer queue.
//!
//! Three benchmark groups:
//! - `save`: encode worlds of 1k and 20k entities
//! - `load`: decode and fix up the same worlds
//! - `scheduler`: fire 10k one-shot timers in a single tick

use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use shardkeep_core::clock::{DowntimePolicy, GameTime, ManualClock};
use shardkeep_core::engine::Engine;
use shardkeep_core::scheduler::{Payload, Repeat, Scheduler, TaskSpec};
use shardkeep_core::test_utils::*;
use shardkeep_core::world::World;

const WALL: i64 = 1_700_000_000_000;

// ===========================================================================
// World builders
// ===========================================================================

/// `mobiles` mobiles carrying `items_each` items, each mobile with a
/// repeating persistent heal timer.
fn build_world(mobiles: usize, items_each: usize) -> Engine {
    let mut engine = Engine::new(ManualClock::new(WALL));
    engine.install_default_singletons(&sample_registry());
    let owners = populate(&mut engine.world, mobiles, items_each);
    for (n, m) in owners.into_iter().enumerate() {
        engine.schedule(
            TaskSpec::repeating(
                GameTime(1_000 + n as u64),
                Duration::from_secs(10),
                Repeat::Forever,
                Payload::persistent(HealTask { amount: 1 }),
            )
            .owned_by(m),
        );
    }
    engine
}

// ===========================================================================
// Benchmarks
// ===========================================================================

fn bench_save(c: &mut Criterion) {
    let mut group = c.benchmark_group("save");
    group.sample_size(30);

    let small = build_world(250, 3);
    group.bench_function("1k_entities", |b| {
        b.iter(|| {
            small.save().unwrap();
        });
    });

    let large = build_world(2_000, 9);
    group.bench_function("20k_entities", |b| {
        b.iter(|| {
            large.save().unwrap();
        });
    });

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");
    group.sample_size(20);
    let registry = sample_registry();

    let small = build_world(250, 3).save().unwrap();
    group.bench_function("1k_entities", |b| {
        b.iter(|| {
            Engine::load(&small, &registry, ManualClock::new(WALL), DowntimePolicy::Paused)
                .unwrap();
        });
    });

    let large = build_world(2_000, 9).save().unwrap();
    group.bench_function("20k_entities", |b| {
        b.iter(|| {
            Engine::load(&large, &registry, ManualClock::new(WALL), DowntimePolicy::Paused)
                .unwrap();
        });
    });

    group.finish();
}

fn bench_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler");
    group.sample_size(30);

    group.bench_function("fire_10k_one_shots", |b| {
        b.iter_batched(
            || {
                let mut sched = Scheduler::new();
                for n in 0..10_000u64 {
                    sched.schedule(TaskSpec::once(
                        GameTime(n % 97),
                        Payload::closure(|_| {}),
                    ));
                }
                (sched, World::new())
            },
            |(mut sched, mut world)| {
                sched.tick(GameTime(100), &mut world);
            },
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_save, bench_load, bench_scheduler);
criterion_main!(benches);
