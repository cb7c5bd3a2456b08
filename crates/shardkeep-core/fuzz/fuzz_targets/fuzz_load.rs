#![no_main]
use libfuzzer_sys::fuzz_target;
use shardkeep_core::clock::{DowntimePolicy, ManualClock};
use shardkeep_core::engine::Engine;
use shardkeep_core::test_utils::sample_registry;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to Engine::load.
    // Must not panic -- returning Err is fine.
    let _ = Engine::load(
        data,
        &sample_registry(),
        ManualClock::new(0),
        DowntimePolicy::WallClock,
    );
});
