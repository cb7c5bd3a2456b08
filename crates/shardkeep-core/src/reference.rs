//! Entity references and the fixup pass that resolves them.
//!
//! On disk a reference is just the target's [`Serial`]. During the raw load
//! pass a reference is read as [`EntityRef::Pending`]: the target may not
//! have been read yet, so it cannot be checked. Only the [`Fixup`] context,
//! which exists once every record has been read, can turn a pending reference
//! into [`EntityRef::Resolved`] or [`EntityRef::Null`].

use std::collections::BTreeSet;

use crate::clock::GameTime;
use crate::codec::{CodecError, Reader, Writer};
use crate::scheduler::TaskSpec;
use crate::serial::Serial;

// ---------------------------------------------------------------------------
// EntityRef
// ---------------------------------------------------------------------------

/// A directed edge to another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntityRef {
    #[default]
    Null,
    /// Read from a save; not checked yet.
    Pending(Serial),
    /// Known to name a live entity (at the time it was resolved).
    Resolved(Serial),
}

impl EntityRef {
    /// Reference to a live entity created at runtime.
    pub fn to(serial: Serial) -> Self {
        if serial.is_null() {
            EntityRef::Null
        } else {
            EntityRef::Resolved(serial)
        }
    }

    /// The target, if this reference is resolved.
    pub fn get(&self) -> Option<Serial> {
        match *self {
            EntityRef::Resolved(s) => Some(s),
            _ => None,
        }
    }

    /// The serial written to disk for this reference.
    pub fn raw_serial(&self) -> Serial {
        match *self {
            EntityRef::Null => Serial::NULL,
            EntityRef::Pending(s) | EntityRef::Resolved(s) => s,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, EntityRef::Null)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, EntityRef::Pending(_))
    }
}

impl From<Option<Serial>> for EntityRef {
    fn from(value: Option<Serial>) -> Self {
        value.map_or(EntityRef::Null, EntityRef::to)
    }
}

impl Writer {
    pub fn write_ref(&mut self, r: &EntityRef) {
        self.write_serial(r.raw_serial());
    }

    /// Write a `u32` count followed by each reference.
    pub fn write_refs(&mut self, refs: &[EntityRef]) {
        self.write_u32(refs.len() as u32);
        for r in refs {
            self.write_ref(r);
        }
    }
}

impl Reader<'_> {
    /// Read a reference as pending. Never dereferenceable until fixup.
    pub fn read_ref(&mut self) -> Result<EntityRef, CodecError> {
        let serial = self.read_serial()?;
        Ok(if serial.is_null() {
            EntityRef::Null
        } else {
            EntityRef::Pending(serial)
        })
    }

    pub fn read_refs(&mut self) -> Result<Vec<EntityRef>, CodecError> {
        let count = self.read_u32()? as usize;
        // Every reference takes four bytes; don't trust the count further.
        let mut refs = Vec::with_capacity(count.min(self.remaining() / 4));
        for _ in 0..count {
            refs.push(self.read_ref()?);
        }
        Ok(refs)
    }
}

// ---------------------------------------------------------------------------
// Dangling policy
// ---------------------------------------------------------------------------

/// What happens to an entity whose parent/owner link points at nothing after
/// load. Only links resolved through [`Fixup::resolve_owner`] count; other
/// dangling fields are always cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DanglingPolicy {
    /// The entity deletes itself (and its contents).
    DeleteOwner,
    /// The field is nulled and the entity kept.
    ClearField,
}

/// Result of an entity's fixup step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FixupOutcome {
    #[default]
    Keep,
    Delete,
}

// ---------------------------------------------------------------------------
// Fixup
// ---------------------------------------------------------------------------

/// Resolution context handed to each entity after the raw pass.
pub struct Fixup<'a> {
    live: &'a BTreeSet<Serial>,
    now: GameTime,
    owner: Option<Serial>,
    dangling: Vec<Serial>,
    owner_lost: bool,
    spawned: &'a mut Vec<TaskSpec>,
}

impl<'a> Fixup<'a> {
    pub(crate) fn new(
        live: &'a BTreeSet<Serial>,
        now: GameTime,
        owner: Option<Serial>,
        spawned: &'a mut Vec<TaskSpec>,
    ) -> Self {
        Self {
            live,
            now,
            owner,
            dangling: Vec::new(),
            owner_lost: false,
            spawned,
        }
    }

    /// Serial of the entity being fixed up, `None` for singletons.
    pub fn owner(&self) -> Option<Serial> {
        self.owner
    }

    /// Monotonic time of the load.
    pub fn now(&self) -> GameTime {
        self.now
    }

    /// Resolve a reference in place. A target that does not exist turns the
    /// reference into `Null` and is recorded as dangling.
    pub fn resolve(&mut self, r: &mut EntityRef) -> Option<Serial> {
        match *r {
            EntityRef::Null => None,
            EntityRef::Pending(s) | EntityRef::Resolved(s) => {
                if self.live.contains(&s) {
                    *r = EntityRef::Resolved(s);
                    Some(s)
                } else {
                    self.dangling.push(s);
                    *r = EntityRef::Null;
                    None
                }
            }
        }
    }

    /// Resolve the entity's parent/owner link. If the target is gone the
    /// entity's [`DanglingPolicy`] applies.
    pub fn resolve_owner(&mut self, r: &mut EntityRef) -> Option<Serial> {
        let was_set = !r.is_null();
        let resolved = self.resolve(r);
        if was_set && resolved.is_none() {
            self.owner_lost = true;
        }
        resolved
    }

    /// Whether a link passed to [`Fixup::resolve_owner`] dangled.
    pub fn owner_lost(&self) -> bool {
        self.owner_lost
    }

    /// Resolve every reference in a list, dropping null and dangling entries.
    /// Returns the number of entries removed.
    pub fn resolve_all(&mut self, refs: &mut Vec<EntityRef>) -> usize {
        let before = refs.len();
        refs.retain_mut(|r| self.resolve(r).is_some());
        before - refs.len()
    }

    /// Serials that failed to resolve so far.
    pub fn dangling(&self) -> &[Serial] {
        &self.dangling
    }

    /// Arm a task once the load completes. Tasks owned by an entity that
    /// does not survive the fixup pass are dropped.
    pub fn schedule(&mut self, spec: TaskSpec) {
        self.spawned.push(spec);
    }
}
