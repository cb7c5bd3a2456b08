//! Property-based tests for the shardkeep core engine.
//!
//! Uses proptest to generate random worlds and timer sets, then checks that
//! saves round-trip and that timers fire in deadline order.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use proptest::prelude::*;
use shardkeep_core::clock::{DowntimePolicy, GameTime, ManualClock};
use shardkeep_core::engine::Engine;
use shardkeep_core::reference::EntityRef;
use shardkeep_core::scheduler::{Payload, Scheduler, TaskSpec};
use shardkeep_core::serial::SerialKind;
use shardkeep_core::test_utils::*;
use shardkeep_core::world::World;

const WALL: i64 = 1_700_000_000_000;

// ===========================================================================
// Generators
// ===========================================================================

#[derive(Debug, Clone)]
struct MobileSpec {
    name: String,
    hits: u16,
    items: Vec<(String, u32)>,
}

fn arb_mobiles(max: usize) -> impl Strategy<Value = Vec<MobileSpec>> {
    proptest::collection::vec(
        (
            "[a-zA-Z \\|\\n\\x00]{0,12}",
            any::<u16>(),
            proptest::collection::vec(("[a-z]{1,8}", any::<u32>()), 0..4),
        )
            .prop_map(|(name, hits, items)| MobileSpec { name, hits, items }),
        0..=max,
    )
}

fn build_engine(specs: &[MobileSpec]) -> Engine {
    let mut engine = Engine::new(ManualClock::new(WALL));
    engine.install_default_singletons(&sample_registry());
    for spec in specs {
        let m = engine
            .world
            .spawn(SerialKind::Mobile, |s| Mobile::new(s, &spec.name, spec.hits))
            .unwrap();
        for (name, amount) in &spec.items {
            let i = engine
                .world
                .spawn(SerialKind::Item, |s| Item::new(s, name, *amount))
                .unwrap();
            place_in(&mut engine.world, i, m);
        }
    }
    engine
}

fn reload(bytes: &[u8]) -> Engine {
    Engine::load(
        bytes,
        &sample_registry(),
        ManualClock::new(WALL),
        DowntimePolicy::Paused,
    )
    .unwrap()
    .0
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Saving a loaded world reproduces the original bytes.
    #[test]
    fn save_load_save_is_stable(specs in arb_mobiles(8)) {
        let engine = build_engine(&specs);
        let first = engine.save().unwrap();
        let second = reload(&first).save().unwrap();
        prop_assert_eq!(first, second);
    }

    /// Every entity comes back with equal fields and resolved references.
    #[test]
    fn round_trip_preserves_entities(specs in arb_mobiles(8)) {
        let engine = build_engine(&specs);
        let loaded = reload(&engine.save().unwrap());
        prop_assert_eq!(loaded.world.serials(), engine.world.serials());
        for serial in engine.world.serials() {
            if let Some(m) = engine.world.get::<Mobile>(serial) {
                let back = loaded.world.get::<Mobile>(serial).unwrap();
                prop_assert_eq!(back, m);
                prop_assert!(back.items.iter().all(|r| matches!(r, EntityRef::Resolved(_))));
            } else {
                prop_assert_eq!(
                    loaded.world.get::<Item>(serial),
                    engine.world.get::<Item>(serial)
                );
            }
        }
    }

    /// Tasks fire in deadline order, ties broken by registration order.
    #[test]
    fn tasks_fire_in_deadline_then_registration_order(
        deadlines in proptest::collection::vec(0u64..50, 1..30)
    ) {
        let mut world = World::new();
        let mut sched = Scheduler::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (idx, d) in deadlines.iter().enumerate() {
            let sink = order.clone();
            sched.schedule(TaskSpec::once(
                GameTime(*d),
                Payload::closure(move |_| sink.borrow_mut().push(idx)),
            ));
        }
        sched.tick(GameTime(100), &mut world);

        let mut expected: Vec<usize> = (0..deadlines.len()).collect();
        expected.sort_by_key(|i| (deadlines[*i], *i));
        prop_assert_eq!(&*order.borrow(), &expected);
        prop_assert!(sched.is_empty());
    }

    /// A saved deadline comes back shifted by exactly the measured downtime.
    #[test]
    fn downtime_shifts_deadlines(
        remaining_secs in 0u64..7_200,
        downtime_secs in 0u64..7_200,
    ) {
        let mut engine = build_engine(&[]);
        let (m, _) = mobile_with_item(&mut engine.world);
        let now = engine.now();
        let handle_at = now + Duration::from_secs(remaining_secs);
        engine.schedule(
            TaskSpec::once(handle_at, Payload::persistent(HealTask { amount: 1 })).owned_by(m),
        );
        let bytes = engine.save().unwrap();

        let clock = ManualClock::new(WALL + (downtime_secs * 1_000) as i64);
        let (loaded, _) = Engine::load(
            &bytes,
            &sample_registry(),
            clock,
            DowntimePolicy::WallClock,
        )
        .unwrap();
        let expected = GameTime(remaining_secs.saturating_sub(downtime_secs) * 1_000);
        prop_assert_eq!(loaded.scheduler.next_deadline(), Some(expected));
    }
}
