//! Adversarial input tests for the save loader.
//!
//! Corrupt, truncated, or hand-crafted saves must come back as errors; the
//! loader must never panic on them.

use shardkeep_core::clock::{DowntimePolicy, ManualClock};
use shardkeep_core::codec::CodecError;
use shardkeep_core::engine::Engine;
use shardkeep_core::save::{CHECKSUM_LEN, FORMAT_VERSION, HEADER_LEN, LoadError};
use shardkeep_core::serial::{Serial, SerialError, SerialKind};
use shardkeep_core::test_utils::*;

const WALL: i64 = 1_700_000_000_000;

fn load(bytes: &[u8]) -> Result<Engine, LoadError> {
    Engine::load(
        bytes,
        &sample_registry(),
        ManualClock::new(WALL),
        DowntimePolicy::Paused,
    )
    .map(|(engine, _)| engine)
}

fn small_save() -> Vec<u8> {
    let mut engine = Engine::new(ManualClock::new(WALL));
    engine.install_default_singletons(&sample_registry());
    mobile_with_item(&mut engine.world);
    engine.save().unwrap()
}

/// Every proper prefix of a valid save is rejected.
#[test]
fn every_truncation_is_rejected() {
    let bytes = small_save();
    for len in 0..bytes.len() {
        assert!(load(&bytes[..len]).is_err(), "prefix of {len} bytes loaded");
    }
    assert!(load(&bytes).is_ok());
}

/// Every single-bit flip anywhere in the file is caught.
#[test]
fn every_bit_flip_is_rejected() {
    let bytes = small_save();
    for byte in 0..bytes.len() {
        for bit in 0..8 {
            let mut corrupt = bytes.clone();
            corrupt[byte] ^= 1 << bit;
            assert!(
                matches!(load(&corrupt), Err(LoadError::ChecksumMismatch { .. })),
                "flip at byte {byte} bit {bit} not detected"
            );
        }
    }
}

#[test]
fn empty_input_is_too_short() {
    assert!(matches!(load(&[]), Err(LoadError::TooShort(0))));
}

#[test]
fn foreign_magic_is_rejected() {
    let mut bytes = small_save();
    bytes[..4].copy_from_slice(&0x504B_0304u32.to_le_bytes());
    assert!(matches!(
        load(&reseal_save(bytes)),
        Err(LoadError::InvalidMagic(0x504B_0304))
    ));
}

#[test]
fn future_format_version_is_rejected() {
    let mut bytes = small_save();
    bytes[4..8].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
    assert!(matches!(
        load(&reseal_save(bytes)),
        Err(LoadError::FutureVersion(v)) if v == FORMAT_VERSION + 1
    ));
}

#[test]
fn bytes_after_last_section_are_rejected() {
    let bytes = small_save();
    let mut body = bytes[..bytes.len() - CHECKSUM_LEN].to_vec();
    body.extend_from_slice(&[0, 0, 0, 0]);
    assert!(matches!(
        load(&reseal(body)),
        Err(LoadError::TrailingBytes(4))
    ));
}

#[test]
fn huge_entity_count_hits_end_of_stream() {
    let mut bytes = raw_save(WALL, &[]);
    bytes[HEADER_LEN..HEADER_LEN + 4].copy_from_slice(&u32::MAX.to_le_bytes());
    assert!(matches!(
        load(&reseal_save(bytes)),
        Err(LoadError::Codec(CodecError::UnexpectedEof { .. }))
    ));
}

#[test]
fn duplicate_serial_is_rejected() {
    let record = RawRecord {
        tag: MOBILE_TAG,
        serial: Serial(4),
        version: 0,
        fields: mobile_v0_fields("twin", 1),
    };
    let bytes = raw_save(WALL, &[record.clone(), record]);
    assert!(matches!(
        load(&bytes),
        Err(LoadError::Serial {
            index: 1,
            source: SerialError::Duplicate(Serial(4))
        })
    ));
}

#[test]
fn serial_outside_type_space_is_rejected() {
    let bytes = raw_save(
        WALL,
        &[RawRecord {
            tag: ITEM_TAG,
            serial: Serial(12),
            version: 0,
            fields: item_v0_fields("misfiled", 1, Serial::NULL),
        }],
    );
    assert!(matches!(
        load(&bytes),
        Err(LoadError::Serial {
            source: SerialError::OutOfSpace {
                kind: SerialKind::Item,
                ..
            },
            ..
        })
    ));
}

#[test]
fn short_record_desynchronizes_and_fails() {
    // Claims v2 but carries v0 bytes: stamina and the item count are read
    // from where the next record should start.
    let bytes = raw_save(
        WALL,
        &[RawRecord {
            tag: MOBILE_TAG,
            serial: Serial(1),
            version: 2,
            fields: mobile_v0_fields("Katrina", 30),
        }],
    );
    assert!(load(&bytes).is_err());
}

#[test]
fn garbage_never_panics() {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for len in [0usize, 7, 31, 32, 33, 64, 257] {
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            data.push(state as u8);
        }
        let _ = load(&data);
        let _ = load(&reseal(data));
    }
}
