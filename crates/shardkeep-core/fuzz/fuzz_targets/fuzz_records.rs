#![no_main]
use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shardkeep_core::clock::{DowntimePolicy, ManualClock};
use shardkeep_core::engine::Engine;
use shardkeep_core::serial::Serial;
use shardkeep_core::test_utils::*;

#[derive(Debug, Arbitrary)]
struct FuzzRecord {
    item: bool,
    serial: u32,
    version: u8,
    fields: Vec<u8>,
}

// Records are wrapped in a correctly checksummed envelope so the fuzzer
// reaches the record decoders and the fixup pass.
fuzz_target!(|records: Vec<FuzzRecord>| {
    let raw: Vec<RawRecord> = records
        .into_iter()
        .take(64)
        .map(|r| RawRecord {
            tag: if r.item { ITEM_TAG } else { MOBILE_TAG },
            serial: Serial(r.serial),
            version: u32::from(r.version % 4),
            fields: r.fields,
        })
        .collect();
    let bytes = raw_save(0, &raw);
    let _ = Engine::load(
        &bytes,
        &sample_registry(),
        ManualClock::new(0),
        DowntimePolicy::Paused,
    );
});
