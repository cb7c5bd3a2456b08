//! Sample content types and save builders for tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, benchmarks, and the fuzz
//! crate (via the `test-utils` feature).

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::clock::GameTime;
use crate::codec::{Checksum, CodecError, Reader, Writer};
use crate::migration::{SchemaError, VersionedSchema};
use crate::reference::{DanglingPolicy, EntityRef, Fixup, FixupOutcome};
use crate::registry::{Persist, TypeRegistry};
use crate::save::{FORMAT_VERSION, SAVE_MAGIC};
use crate::scheduler::{Payload, TaskContext, TaskPayload, TaskSpec};
use crate::serial::{Serial, SerialKind};
use crate::world::World;

pub const MOBILE_TAG: &str = "mobile";
pub const ITEM_TAG: &str = "item";
pub const STATS_NAME: &str = "world_stats";
pub const DECAY_TASK: &str = "decay";
pub const HEAL_TASK: &str = "heal";

// ===========================================================================
// Mobile
// ===========================================================================

/// A creature. Version history:
/// - v0: name, hits
/// - v1: + carried items
/// - v2: + stamina (migrated as half of hits)
#[derive(Debug, Clone, PartialEq)]
pub struct Mobile {
    pub serial: Serial,
    pub name: String,
    pub hits: u16,
    pub stamina: u16,
    pub items: Vec<EntityRef>,
}

#[derive(Debug, Default)]
struct MobileFields {
    name: String,
    hits: u16,
    stamina: u16,
    items: Vec<EntityRef>,
}

fn mobile_v0(r: &mut Reader<'_>) -> Result<MobileFields, CodecError> {
    Ok(MobileFields {
        name: r.read_string()?,
        hits: r.read_u16()?,
        ..MobileFields::default()
    })
}

fn mobile_v1(r: &mut Reader<'_>) -> Result<MobileFields, CodecError> {
    Ok(MobileFields {
        name: r.read_string()?,
        hits: r.read_u16()?,
        items: r.read_refs()?,
        ..MobileFields::default()
    })
}

fn mobile_v2(r: &mut Reader<'_>) -> Result<MobileFields, CodecError> {
    Ok(MobileFields {
        name: r.read_string()?,
        hits: r.read_u16()?,
        stamina: r.read_u16()?,
        items: r.read_refs()?,
    })
}

fn mobile_v0_to_v1(f: MobileFields) -> MobileFields {
    f
}

fn mobile_v1_to_v2(mut f: MobileFields) -> MobileFields {
    f.stamina = f.hits / 2;
    f
}

fn mobile_schema() -> VersionedSchema<MobileFields> {
    VersionedSchema::new(2)
        .reader(0, mobile_v0)
        .reader(1, mobile_v1)
        .reader(2, mobile_v2)
        .migration(0, mobile_v0_to_v1)
        .migration(1, mobile_v1_to_v2)
}

impl Mobile {
    pub fn new(serial: Serial, name: &str, hits: u16) -> Self {
        Self {
            serial,
            name: name.to_string(),
            hits,
            stamina: hits / 2,
            items: Vec::new(),
        }
    }

    pub fn blank(serial: Serial) -> Box<dyn Persist> {
        Box::new(Self::new(serial, "", 0))
    }
}

impl Persist for Mobile {
    fn type_tag(&self) -> &'static str {
        MOBILE_TAG
    }

    fn schema_version(&self) -> u32 {
        2
    }

    fn serialize(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.write_str(&self.name);
        w.write_u16(self.hits);
        w.write_u16(self.stamina);
        w.write_refs(&self.items);
        Ok(())
    }

    fn deserialize(&mut self, r: &mut Reader<'_>, version: u32) -> Result<(), SchemaError> {
        let f = mobile_schema().read(r, version)?;
        self.name = f.name;
        self.hits = f.hits;
        self.stamina = f.stamina;
        self.items = f.items;
        Ok(())
    }

    fn fixup(&mut self, fx: &mut Fixup<'_>) -> FixupOutcome {
        fx.resolve_all(&mut self.items);
        FixupOutcome::Keep
    }

    fn contents(&self) -> Vec<Serial> {
        self.items.iter().filter_map(|r| r.get()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ===========================================================================
// Item
// ===========================================================================

/// A thing in the world. Version history:
/// - v0: name, amount, parent
/// - v1: + contents, optional decay deadline
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub serial: Serial,
    pub name: String,
    pub amount: u32,
    pub parent: EntityRef,
    pub contents: Vec<EntityRef>,
    pub decay_at: Option<GameTime>,
}

#[derive(Debug, Default)]
struct ItemFields {
    name: String,
    amount: u32,
    parent: EntityRef,
    contents: Vec<EntityRef>,
    decay_at: Option<GameTime>,
}

fn item_v0(r: &mut Reader<'_>) -> Result<ItemFields, CodecError> {
    Ok(ItemFields {
        name: r.read_string()?,
        amount: r.read_u32()?,
        parent: r.read_ref()?,
        ..ItemFields::default()
    })
}

fn item_v1(r: &mut Reader<'_>) -> Result<ItemFields, CodecError> {
    let name = r.read_string()?;
    let amount = r.read_u32()?;
    let parent = r.read_ref()?;
    let contents = r.read_refs()?;
    let decay_at = if r.read_bool()? {
        Some(r.read_delta_time()?)
    } else {
        None
    };
    Ok(ItemFields {
        name,
        amount,
        parent,
        contents,
        decay_at,
    })
}

fn item_v0_to_v1(f: ItemFields) -> ItemFields {
    f
}

fn item_schema() -> VersionedSchema<ItemFields> {
    VersionedSchema::new(1)
        .reader(0, item_v0)
        .reader(1, item_v1)
        .migration(0, item_v0_to_v1)
}

impl Item {
    pub fn new(serial: Serial, name: &str, amount: u32) -> Self {
        Self {
            serial,
            name: name.to_string(),
            amount,
            parent: EntityRef::Null,
            contents: Vec::new(),
            decay_at: None,
        }
    }

    pub fn blank(serial: Serial) -> Box<dyn Persist> {
        Box::new(Self::new(serial, "", 0))
    }

    /// Runtime-only timer that deletes `serial` at `at`.
    pub fn decay_spec(serial: Serial, at: GameTime) -> TaskSpec {
        TaskSpec::once(
            at,
            Payload::closure(move |ctx| {
                ctx.world.delete(serial);
            }),
        )
        .owned_by(serial)
    }
}

impl Persist for Item {
    fn type_tag(&self) -> &'static str {
        ITEM_TAG
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn serialize(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.write_str(&self.name);
        w.write_u32(self.amount);
        w.write_ref(&self.parent);
        w.write_refs(&self.contents);
        w.write_bool(self.decay_at.is_some());
        if let Some(at) = self.decay_at {
            w.write_delta_time(at);
        }
        Ok(())
    }

    fn deserialize(&mut self, r: &mut Reader<'_>, version: u32) -> Result<(), SchemaError> {
        let f = item_schema().read(r, version)?;
        self.name = f.name;
        self.amount = f.amount;
        self.parent = f.parent;
        self.contents = f.contents;
        self.decay_at = f.decay_at;
        Ok(())
    }

    fn fixup(&mut self, fx: &mut Fixup<'_>) -> FixupOutcome {
        fx.resolve_owner(&mut self.parent);
        fx.resolve_all(&mut self.contents);
        if let Some(at) = self.decay_at {
            fx.schedule(Item::decay_spec(self.serial, at));
        }
        FixupOutcome::Keep
    }

    fn contents(&self) -> Vec<Serial> {
        self.contents.iter().filter_map(|r| r.get()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ===========================================================================
// WorldStats singleton
// ===========================================================================

/// Shard-wide counters. `history` is stored as a bitcode blob.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorldStats {
    pub saves: u32,
    pub motd: String,
    pub featured: EntityRef,
    pub history: Vec<SaveMark>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveMark {
    pub wall_millis: i64,
    pub entities: u32,
}

impl WorldStats {
    pub fn boxed() -> Box<dyn Persist> {
        Box::new(Self::default())
    }
}

impl Persist for WorldStats {
    fn type_tag(&self) -> &'static str {
        STATS_NAME
    }

    fn schema_version(&self) -> u32 {
        0
    }

    fn serialize(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.write_u32(self.saves);
        w.write_str(&self.motd);
        w.write_ref(&self.featured);
        w.write_blob(&self.history)
    }

    fn deserialize(&mut self, r: &mut Reader<'_>, version: u32) -> Result<(), SchemaError> {
        if version != 0 {
            return Err(SchemaError::FutureVersion {
                version,
                current: 0,
            });
        }
        self.saves = r.read_u32()?;
        self.motd = r.read_string()?;
        self.featured = r.read_ref()?;
        self.history = r.read_blob()?;
        Ok(())
    }

    fn fixup(&mut self, fx: &mut Fixup<'_>) -> FixupOutcome {
        fx.resolve(&mut self.featured);
        FixupOutcome::Keep
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ===========================================================================
// Persistent task payloads
// ===========================================================================

/// Deletes its owner when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecayTask;

impl TaskPayload for DecayTask {
    fn task_tag(&self) -> &'static str {
        DECAY_TASK
    }

    fn serialize(&self, _w: &mut Writer) -> Result<(), CodecError> {
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) {
        if let Some(owner) = ctx.owner() {
            ctx.world.delete(owner);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn decode_decay(_r: &mut Reader<'_>) -> Result<Box<dyn TaskPayload>, SchemaError> {
    Ok(Box::new(DecayTask))
}

/// Restores hits to its owning mobile each time it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealTask {
    pub amount: u16,
}

impl TaskPayload for HealTask {
    fn task_tag(&self) -> &'static str {
        HEAL_TASK
    }

    fn serialize(&self, w: &mut Writer) -> Result<(), CodecError> {
        w.write_u16(self.amount);
        Ok(())
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) {
        let Some(owner) = ctx.owner() else { return };
        if let Some(m) = ctx.world.get_mut::<Mobile>(owner) {
            m.hits = m.hits.saturating_add(self.amount);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn decode_heal(r: &mut Reader<'_>) -> Result<Box<dyn TaskPayload>, SchemaError> {
    Ok(Box::new(HealTask {
        amount: r.read_u16()?,
    }))
}

// ===========================================================================
// Registry and world builders
// ===========================================================================

/// Registry with `Mobile`, `Item`, `WorldStats`, and both task payloads.
pub fn sample_registry() -> TypeRegistry {
    let mut b = TypeRegistry::builder();
    b.register_entity(MOBILE_TAG, SerialKind::Mobile, DanglingPolicy::ClearField, Mobile::blank)
        .expect("mobile registers");
    b.register_entity(ITEM_TAG, SerialKind::Item, DanglingPolicy::DeleteOwner, Item::blank)
        .expect("item registers");
    b.register_singleton(STATS_NAME, WorldStats::boxed)
        .expect("stats registers");
    b.register_task(DECAY_TASK, decode_decay)
        .expect("decay registers");
    b.register_task(HEAL_TASK, decode_heal)
        .expect("heal registers");
    b.build()
}

/// Put `child` inside `parent`, updating both sides of the link.
pub fn place_in(world: &mut World, child: Serial, parent: Serial) {
    if let Some(item) = world.get_mut::<Item>(child) {
        item.parent = EntityRef::to(parent);
    }
    if let Some(bag) = world.get_mut::<Item>(parent) {
        bag.contents.push(EntityRef::to(child));
    } else if let Some(m) = world.get_mut::<Mobile>(parent) {
        m.items.push(EntityRef::to(child));
    }
}

/// Spawn a mobile holding one item. Returns `(mobile, item)`.
pub fn mobile_with_item(world: &mut World) -> (Serial, Serial) {
    let m = world
        .spawn(SerialKind::Mobile, |s| Mobile::new(s, "Shamino", 60))
        .expect("mobile serial");
    let i = world
        .spawn(SerialKind::Item, |s| Item::new(s, "lantern", 1))
        .expect("item serial");
    place_in(world, i, m);
    (m, i)
}

/// Spawn `mobiles` mobiles each carrying `items_each` items.
pub fn populate(world: &mut World, mobiles: usize, items_each: usize) -> Vec<Serial> {
    let mut out = Vec::with_capacity(mobiles);
    for n in 0..mobiles {
        let m = world
            .spawn(SerialKind::Mobile, |s| {
                Mobile::new(s, &format!("npc{n}"), (n % 200) as u16)
            })
            .expect("mobile serial");
        for k in 0..items_each {
            let i = world
                .spawn(SerialKind::Item, |s| Item::new(s, "coin", k as u32))
                .expect("item serial");
            place_in(world, i, m);
        }
        out.push(m);
    }
    out
}

// ===========================================================================
// Hand-built saves
// ===========================================================================

/// One entity record for [`raw_save`].
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub tag: &'static str,
    pub serial: Serial,
    pub version: u32,
    pub fields: Vec<u8>,
}

/// Encode a save from raw entity records, with no singletons or tasks.
pub fn raw_save(saved_at_wall_millis: i64, records: &[RawRecord]) -> Vec<u8> {
    let mut w = Writer::new(GameTime::ZERO);
    w.write_u32(SAVE_MAGIC);
    w.write_u32(FORMAT_VERSION);
    w.write_i64(saved_at_wall_millis);
    w.write_u32(SerialKind::Mobile.first().0);
    w.write_u32(SerialKind::Item.first().0);
    w.write_u32(records.len() as u32);
    for rec in records {
        w.write_str(rec.tag);
        w.write_serial(rec.serial);
        w.write_u32(rec.version);
        w.write_bytes(&rec.fields);
    }
    w.write_u32(0);
    w.write_u32(0);
    reseal(w.into_bytes())
}

/// Append a fresh checksum to `body`.
pub fn reseal(mut body: Vec<u8>) -> Vec<u8> {
    let sum = Checksum::of(&body);
    body.extend_from_slice(&sum.to_le_bytes());
    body
}

/// Replace the checksum of a complete save after editing its body.
pub fn reseal_save(mut save: Vec<u8>) -> Vec<u8> {
    save.truncate(save.len().saturating_sub(crate::save::CHECKSUM_LEN));
    reseal(save)
}

fn fields(f: impl FnOnce(&mut Writer)) -> Vec<u8> {
    let mut w = Writer::new(GameTime::ZERO);
    f(&mut w);
    w.into_bytes()
}

pub fn mobile_v0_fields(name: &str, hits: u16) -> Vec<u8> {
    fields(|w| {
        w.write_str(name);
        w.write_u16(hits);
    })
}

pub fn mobile_v1_fields(name: &str, hits: u16, items: &[Serial]) -> Vec<u8> {
    fields(|w| {
        w.write_str(name);
        w.write_u16(hits);
        let refs: Vec<EntityRef> = items.iter().map(|s| EntityRef::to(*s)).collect();
        w.write_refs(&refs);
    })
}

pub fn mobile_v2_fields(name: &str, hits: u16, stamina: u16, items: &[Serial]) -> Vec<u8> {
    fields(|w| {
        w.write_str(name);
        w.write_u16(hits);
        w.write_u16(stamina);
        let refs: Vec<EntityRef> = items.iter().map(|s| EntityRef::to(*s)).collect();
        w.write_refs(&refs);
    })
}

pub fn item_v0_fields(name: &str, amount: u32, parent: Serial) -> Vec<u8> {
    fields(|w| {
        w.write_str(name);
        w.write_u32(amount);
        w.write_serial(parent);
    })
}

/// Current item layout without a decay deadline.
pub fn item_v1_fields(name: &str, amount: u32, parent: Serial, contents: &[Serial]) -> Vec<u8> {
    fields(|w| {
        w.write_str(name);
        w.write_u32(amount);
        w.write_serial(parent);
        let refs: Vec<EntityRef> = contents.iter().map(|s| EntityRef::to(*s)).collect();
        w.write_refs(&refs);
        w.write_bool(false);
    })
}
