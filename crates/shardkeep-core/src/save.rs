//! The save stream: header, record sections, and the two-pass loader.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! [Magic u32][FormatVersion u32][SavedAtWallMillis i64][NextMobile u32][NextItem u32]
//! [EntityCount u32]    { [TypeTag str][Serial u32][SchemaVersion u32][fields..] }
//! [SingletonCount u32] { [Name str][SchemaVersion u32][fields..] }
//! [TaskCount u32]      { [Owner u32][Delta i64][TaskTag str][Interval u64][Repeat i32][payload..] }
//! [Checksum u64]
//! ```
//!
//! Records carry no length prefix, so a record the loader cannot interpret
//! makes every later record unreadable. Every such failure aborts the load
//! and leaves the caller's state untouched: the loader builds a fresh
//! [`World`] and [`Scheduler`] and hands them back only on success.

use std::time::Duration;

use crate::clock::GameTime;
use crate::codec::{Checksum, CodecError, Reader, TimeBase, Writer};
use crate::migration::SchemaError;
use crate::registry::TypeRegistry;
use crate::scheduler::{Payload, Repeat, Scheduler, TaskSpec};
use crate::serial::{Serial, SerialAllocator, SerialError, SerialKind};
use crate::world::World;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a shard save ("SHK1").
pub const SAVE_MAGIC: u32 = 0x5348_4B31;

/// Current format version. Increment when the envelope layout changes.
pub const FORMAT_VERSION: u32 = 1;

/// Encoded size of [`SaveHeader`].
pub const HEADER_LEN: usize = 24;

/// Size of the trailing checksum.
pub const CHECKSUM_LEN: usize = 8;

/// `Repeat` field value for tasks that repeat forever.
const REPEAT_FOREVER: i32 = -1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while writing a save.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("entity {serial} ({tag}) failed to serialize: {source}")]
    Entity {
        serial: Serial,
        tag: &'static str,
        source: CodecError,
    },
    #[error("singleton '{name}' failed to serialize: {source}")]
    Singleton {
        name: &'static str,
        source: CodecError,
    },
    #[error("task payload '{tag}' failed to serialize: {source}")]
    Task {
        tag: &'static str,
        source: CodecError,
    },
}

/// Errors that can occur while loading a save. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("save is {0} bytes, too short for header and checksum")]
    TooShort(usize),
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SAVE_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("save from future format version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("checksum mismatch: stored 0x{stored:016X}, computed 0x{computed:016X}")]
    ChecksumMismatch { stored: u64, computed: u64 },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("record {index}: unknown entity type '{tag}'")]
    UnknownType { index: u32, tag: String },
    #[error("unknown singleton '{0}'")]
    UnknownSingleton(String),
    #[error("singleton '{0}' appears twice")]
    DuplicateSingleton(String),
    #[error("task {index}: unknown task type '{tag}'")]
    UnknownTask { index: u32, tag: String },
    #[error("record {index} ({tag} {serial}): {source}")]
    Record {
        index: u32,
        tag: String,
        serial: Serial,
        source: SchemaError,
    },
    #[error("singleton '{name}': {source}")]
    Singleton { name: String, source: SchemaError },
    #[error("task {index} ({tag}): {source}")]
    Task {
        index: u32,
        tag: String,
        source: SchemaError,
    },
    #[error("record {index}: {source}")]
    Serial { index: u32, source: SerialError },
    #[error("{0} unread bytes before checksum")]
    TrailingBytes(usize),
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed-size header at the start of every save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveHeader {
    pub magic: u32,
    pub version: u32,
    /// Wall-clock time of the save, milliseconds since the Unix epoch.
    pub saved_at_wall_millis: i64,
    pub next_mobile_serial: u32,
    pub next_item_serial: u32,
}

impl SaveHeader {
    /// Header for the current format version.
    pub fn new(saved_at_wall_millis: i64, allocator: &SerialAllocator) -> Self {
        Self {
            magic: SAVE_MAGIC,
            version: FORMAT_VERSION,
            saved_at_wall_millis,
            next_mobile_serial: allocator.peek(SerialKind::Mobile).0,
            next_item_serial: allocator.peek(SerialKind::Item).0,
        }
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.magic != SAVE_MAGIC {
            return Err(LoadError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(LoadError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(LoadError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    fn write(&self, w: &mut Writer) {
        w.write_u32(self.magic);
        w.write_u32(self.version);
        w.write_i64(self.saved_at_wall_millis);
        w.write_u32(self.next_mobile_serial);
        w.write_u32(self.next_item_serial);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            magic: r.read_u32()?,
            version: r.read_u32()?,
            saved_at_wall_millis: r.read_i64()?,
            next_mobile_serial: r.read_u32()?,
            next_item_serial: r.read_u32()?,
        })
    }
}

/// Read and validate just the header, without checking the checksum or
/// decoding any records.
pub fn read_save_header(data: &[u8]) -> Result<SaveHeader, LoadError> {
    if data.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(LoadError::TooShort(data.len()));
    }
    let header = SaveHeader::read(&mut Reader::new(data, TimeBase::default()))?;
    header.validate()?;
    Ok(header)
}

/// Check the trailing checksum against the bytes before it.
pub fn verify_checksum(data: &[u8]) -> Result<(), LoadError> {
    if data.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(LoadError::TooShort(data.len()));
    }
    let (body, tail) = data.split_at(data.len() - CHECKSUM_LEN);
    let mut stored = [0u8; CHECKSUM_LEN];
    stored.copy_from_slice(tail);
    let stored = u64::from_le_bytes(stored);
    let computed = Checksum::of(body);
    if stored != computed {
        return Err(LoadError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Load report
// ---------------------------------------------------------------------------

/// Summary of a successful load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub entities: usize,
    pub singletons: usize,
    /// Registered singletons missing from the save, built with defaults.
    pub singletons_defaulted: usize,
    pub dangling_refs: usize,
    /// Entities removed by fixup, including cascaded contents.
    pub deleted: Vec<Serial>,
    pub tasks_restored: usize,
    /// Saved tasks whose owner did not survive the load.
    pub tasks_dropped: usize,
    /// Tasks armed by entities during fixup.
    pub tasks_spawned: usize,
    pub downtime: Duration,
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Capture `world` and the persistent tasks of `scheduler`.
pub(crate) fn write_save(
    world: &World,
    scheduler: &Scheduler,
    now: GameTime,
    wall_millis: i64,
) -> Result<Vec<u8>, SaveError> {
    let mut w = Writer::new(now);
    SaveHeader::new(wall_millis, world.allocator()).write(&mut w);

    w.write_u32(world.len() as u32);
    for (serial, body) in world.iter() {
        let tag = body.type_tag();
        w.write_str(tag);
        w.write_serial(serial);
        w.write_u32(body.schema_version());
        body.serialize(&mut w)
            .map_err(|source| SaveError::Entity { serial, tag, source })?;
    }

    let singletons: Vec<_> = world.singletons().collect();
    w.write_u32(singletons.len() as u32);
    for (name, body) in singletons {
        w.write_str(name);
        w.write_u32(body.schema_version());
        body.serialize(&mut w)
            .map_err(|source| SaveError::Singleton { name, source })?;
    }

    let tasks = scheduler.saved_tasks();
    w.write_u32(tasks.len() as u32);
    for task in tasks {
        let tag = task.payload.task_tag();
        w.write_serial(task.owner.unwrap_or(Serial::NULL));
        w.write_delta_time(task.fire_at);
        w.write_str(tag);
        w.write_duration(task.interval);
        // Finite counts are capped at `MAX_REPEAT` when scheduled.
        w.write_i32(match task.remaining {
            None => REPEAT_FOREVER,
            Some(n) => i32::try_from(n).unwrap_or(i32::MAX),
        });
        task.payload
            .serialize(&mut w)
            .map_err(|source| SaveError::Task { tag, source })?;
    }

    let bytes = seal(w.into_bytes());
    log::debug!(
        "wrote save: {} entities, {} bytes",
        world.len(),
        bytes.len()
    );
    Ok(bytes)
}

/// Append the checksum of everything written so far.
fn seal(mut bytes: Vec<u8>) -> Vec<u8> {
    let sum = Checksum::of(&bytes);
    bytes.extend_from_slice(&sum.to_le_bytes());
    bytes
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Everything a load produces.
#[derive(Debug)]
pub(crate) struct Loaded {
    pub world: World,
    pub scheduler: Scheduler,
    pub report: LoadReport,
}

/// Decode a save into a fresh world and scheduler.
///
/// Pass one constructs and decodes every record with references left
/// pending. Pass two runs each entity's fixup against the complete set of
/// loaded serials. Tasks are armed last, so nothing fires against a
/// half-built world.
pub(crate) fn read_save(
    data: &[u8],
    registry: &TypeRegistry,
    now: GameTime,
    downtime_for: impl FnOnce(i64) -> Duration,
) -> Result<Loaded, LoadError> {
    verify_checksum(data)?;
    let body = &data[..data.len() - CHECKSUM_LEN];

    let mut r = Reader::new(body, TimeBase::default());
    let header = SaveHeader::read(&mut r)?;
    header.validate()?;

    let downtime = downtime_for(header.saved_at_wall_millis);
    r.set_time_base(TimeBase::new(now, downtime));

    let mut world = World::new();
    let mut report = LoadReport {
        downtime,
        ..LoadReport::default()
    };

    read_entities(&mut r, registry, &mut world)?;
    report.entities = world.len();
    report.singletons = read_singletons(&mut r, registry, &mut world)?;
    let restored = read_tasks(&mut r, registry)?;

    if !r.is_empty() {
        return Err(LoadError::TrailingBytes(r.remaining()));
    }

    world.restore_allocator(header.next_mobile_serial, header.next_item_serial);

    for singleton in registry.singletons() {
        if !world.has_singleton(singleton.name) {
            log::info!("singleton '{}' missing from save; using defaults", singleton.name);
            world.install_singleton(singleton.name, singleton.construct());
            report.singletons_defaulted += 1;
        }
    }

    let mut spawned = Vec::new();
    let stats = world.fixup_pass(registry, now, &mut spawned);
    report.dangling_refs = stats.dangling;
    report.deleted = stats.deleted;
    world.take_deleted();

    let mut scheduler = Scheduler::new();
    for spec in restored {
        if spec.owner.is_some_and(|o| !world.contains(o)) {
            log::debug!("dropping saved task owned by {:?}: owner gone", spec.owner);
            report.tasks_dropped += 1;
            continue;
        }
        scheduler.schedule(spec);
        report.tasks_restored += 1;
    }
    for spec in spawned {
        if spec.owner.is_some_and(|o| !world.contains(o)) {
            continue;
        }
        scheduler.schedule(spec);
        report.tasks_spawned += 1;
    }

    Ok(Loaded {
        world,
        scheduler,
        report,
    })
}

fn read_entities(
    r: &mut Reader<'_>,
    registry: &TypeRegistry,
    world: &mut World,
) -> Result<(), LoadError> {
    let count = r.read_u32()?;
    for index in 0..count {
        let tag = r.read_string()?;
        let serial = r.read_serial()?;
        let version = r.read_u32()?;

        let Some(ty) = registry.entity_type(&tag) else {
            return Err(LoadError::UnknownType { index, tag });
        };
        let mut body = ty.construct(serial);
        if let Err(source) = body.deserialize(r, version) {
            return Err(LoadError::Record {
                index,
                tag,
                serial,
                source,
            });
        }
        world
            .insert_loaded(ty.kind, serial, body)
            .map_err(|source| LoadError::Serial { index, source })?;
    }
    Ok(())
}

fn read_singletons(
    r: &mut Reader<'_>,
    registry: &TypeRegistry,
    world: &mut World,
) -> Result<usize, LoadError> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let name = r.read_string()?;
        let version = r.read_u32()?;
        let Some(ty) = registry.singleton(&name) else {
            return Err(LoadError::UnknownSingleton(name));
        };
        if world.has_singleton(ty.name) {
            return Err(LoadError::DuplicateSingleton(name));
        }
        let mut body = ty.construct();
        if let Err(source) = body.deserialize(r, version) {
            return Err(LoadError::Singleton { name, source });
        }
        world.install_singleton(ty.name, body);
    }
    Ok(count as usize)
}

fn read_tasks(r: &mut Reader<'_>, registry: &TypeRegistry) -> Result<Vec<TaskSpec>, LoadError> {
    let count = r.read_u32()?;
    let mut tasks = Vec::new();
    for index in 0..count {
        let owner = r.read_serial()?;
        let fire_at = r.read_delta_time()?;
        let tag = r.read_string()?;
        let interval = r.read_duration()?;
        let repeat = match r.read_i32()? {
            REPEAT_FOREVER => Repeat::Forever,
            n if n > 0 => Repeat::Times(n as u32),
            n => return Err(r.invalid(format!("task repeat count {n}")).into()),
        };
        let payload = match registry.decode_task(&tag, r) {
            None => return Err(LoadError::UnknownTask { index, tag }),
            Some(Err(source)) => return Err(LoadError::Task { index, tag, source }),
            Some(Ok(payload)) => payload,
        };
        tasks.push(TaskSpec {
            fire_at,
            interval,
            repeat,
            owner: (!owner.is_null()).then_some(owner),
            payload: Payload::Persistent(payload),
        });
    }
    Ok(tasks)
}
