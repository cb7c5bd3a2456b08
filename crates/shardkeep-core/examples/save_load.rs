//! Save/load example: a shard going down and coming back up.
//!
//! Builds a small world with a repeating heal timer, saves it, "restarts"
//! ten minutes later, and shows the timer picking up where it left off.
//!
//! Run with: `RUST_LOG=debug cargo run -p shardkeep-core --example save_load`

use std::time::Duration;

use shardkeep_core::clock::{DowntimePolicy, ManualClock};
use shardkeep_core::engine::Engine;
use shardkeep_core::scheduler::{Payload, Repeat, TaskSpec};
use shardkeep_core::test_utils::*;

const WALL: i64 = 1_700_000_000_000;

fn main() {
    env_logger::init();
    let registry = sample_registry();

    // --- Step 1: Build and run ---

    let clock = ManualClock::new(WALL);
    let mut engine = Engine::new(clock.clone());
    engine.install_default_singletons(&registry);
    let (mobile, item) = mobile_with_item(&mut engine.world);

    let first = engine.now() + Duration::from_secs(60);
    engine.schedule(
        TaskSpec::repeating(
            first,
            Duration::from_secs(60 * 15),
            Repeat::Times(4),
            Payload::persistent(HealTask { amount: 10 }),
        )
        .owned_by(mobile),
    );

    clock.advance(Duration::from_secs(60));
    let report = engine.tick();
    println!("Fired {} task(s) before saving", report.fired.len());
    println!(
        "Mobile {mobile} has {} hits",
        engine.world.get::<Mobile>(mobile).map_or(0, |m| m.hits)
    );

    // --- Step 2: Save ---

    let bytes = engine.save().expect("save should succeed");
    println!("Saved {} bytes", bytes.len());

    // --- Step 3: Restart ten minutes later ---

    let restarted = ManualClock::new(WALL + 60_000 + 10 * 60_000);
    let (mut restored, load) =
        Engine::load(&bytes, &registry, restarted.clone(), DowntimePolicy::WallClock)
            .expect("load should succeed");
    println!(
        "Loaded {} entities, {} task(s); downtime {:?}",
        load.entities, load.tasks_restored, load.downtime
    );
    println!(
        "Next heal due in {:?}",
        restored
            .scheduler
            .next_deadline()
            .map(|t| t.saturating_duration_since(restored.now()))
    );

    // --- Step 4: Verify ---

    let lantern = restored.world.get::<Item>(item).expect("item survives");
    assert_eq!(restored.world.resolve(&lantern.parent), Some(mobile));

    restarted.advance(Duration::from_secs(5 * 60));
    let report = restored.tick();
    assert_eq!(report.fired.len(), 1, "heal resumes after the remaining 5 minutes");
    println!(
        "Mobile {mobile} has {} hits after restart",
        restored.world.get::<Mobile>(mobile).map_or(0, |m| m.hits)
    );

    println!("\nSave/load round trip verified successfully.");
}
