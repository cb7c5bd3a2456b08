//! The live object graph: entities by serial plus named singletons.

use std::collections::{BTreeSet, VecDeque};

use crate::clock::GameTime;
use crate::reference::{DanglingPolicy, EntityRef, Fixup, FixupOutcome};
use crate::registry::{Persist, TypeRegistry};
use crate::scheduler::TaskSpec;
use crate::serial::{IdentityTable, Serial, SerialAllocator, SerialError, SerialKind};

/// Counts gathered by the fixup pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct FixupStats {
    pub dangling: usize,
    pub deleted: Vec<Serial>,
}

/// All persistable state of a running shard.
#[derive(Debug, Default)]
pub struct World {
    entities: IdentityTable<Box<dyn Persist>>,
    singletons: Vec<(&'static str, Box<dyn Persist>)>,
    /// Serials removed since the scheduler last looked.
    deleted: Vec<Serial>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Create an entity under a freshly allocated serial of `kind`.
    pub fn spawn<T: Persist + 'static>(
        &mut self,
        kind: SerialKind,
        build: impl FnOnce(Serial) -> T,
    ) -> Result<Serial, SerialError> {
        self.entities
            .register_with(kind, |serial| Box::new(build(serial)) as Box<dyn Persist>)
    }

    pub fn get<T: 'static>(&self, serial: Serial) -> Option<&T> {
        self.entities.lookup(serial)?.as_any().downcast_ref()
    }

    pub fn get_mut<T: 'static>(&mut self, serial: Serial) -> Option<&mut T> {
        self.entities.lookup_mut(serial)?.as_any_mut().downcast_mut()
    }

    pub fn get_dyn(&self, serial: Serial) -> Option<&dyn Persist> {
        self.entities.lookup(serial).map(|b| b.as_ref())
    }

    /// Follow a reference. Dead targets and unresolved references yield
    /// `None`.
    pub fn resolve(&self, r: &EntityRef) -> Option<Serial> {
        r.get().filter(|s| self.entities.contains(*s))
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.entities.contains(serial)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Live serials in ascending order.
    pub fn serials(&self) -> Vec<Serial> {
        self.entities.serials().collect()
    }

    /// `(serial, entity)` pairs in ascending serial order.
    pub fn iter(&self) -> impl Iterator<Item = (Serial, &dyn Persist)> + '_ {
        self.entities.iter().map(|(s, b)| (s, b.as_ref()))
    }

    /// Delete an entity and, transitively, everything it contains. Returns
    /// the removed serials, the requested one first.
    pub fn delete(&mut self, serial: Serial) -> Vec<Serial> {
        let mut removed = Vec::new();
        let mut queue = VecDeque::from([serial]);
        while let Some(next) = queue.pop_front() {
            if let Some(body) = self.entities.unregister(next) {
                queue.extend(body.contents());
                removed.push(next);
            }
        }
        if !removed.is_empty() {
            log::debug!("deleted {serial} and {} contained entities", removed.len() - 1);
        }
        self.deleted.extend_from_slice(&removed);
        removed
    }

    /// Drain the log of deleted serials.
    pub fn take_deleted(&mut self) -> Vec<Serial> {
        std::mem::take(&mut self.deleted)
    }

    pub fn allocator(&self) -> &SerialAllocator {
        self.entities.allocator()
    }

    // -----------------------------------------------------------------------
    // Singletons
    // -----------------------------------------------------------------------

    /// Install or replace a named singleton.
    pub fn install_singleton(&mut self, name: &'static str, body: Box<dyn Persist>) {
        match self.singletons.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = body,
            None => self.singletons.push((name, body)),
        }
    }

    pub fn singleton<T: 'static>(&self, name: &str) -> Option<&T> {
        self.singletons
            .iter()
            .find(|(n, _)| *n == name)?
            .1
            .as_any()
            .downcast_ref()
    }

    pub fn singleton_mut<T: 'static>(&mut self, name: &str) -> Option<&mut T> {
        self.singletons
            .iter_mut()
            .find(|(n, _)| *n == name)?
            .1
            .as_any_mut()
            .downcast_mut()
    }

    pub fn has_singleton(&self, name: &str) -> bool {
        self.singletons.iter().any(|(n, _)| *n == name)
    }

    pub fn singleton_names(&self) -> Vec<&'static str> {
        self.singletons.iter().map(|(n, _)| *n).collect()
    }

    // -----------------------------------------------------------------------
    // Persistence plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn singletons(&self) -> impl Iterator<Item = (&'static str, &dyn Persist)> + '_ {
        self.singletons.iter().map(|(n, b)| (*n, b.as_ref()))
    }

    pub(crate) fn insert_loaded(
        &mut self,
        kind: SerialKind,
        serial: Serial,
        body: Box<dyn Persist>,
    ) -> Result<(), SerialError> {
        self.entities.insert(kind, serial, body)
    }

    pub(crate) fn restore_allocator(&mut self, next_mobile: u32, next_item: u32) {
        self.entities.allocator_mut().restore(next_mobile, next_item);
    }

    /// Resolve every pending reference once all records are in memory.
    ///
    /// Each entity sees the full set of serials that were loaded, so the
    /// outcome does not depend on iteration order. Deletions requested by
    /// fixup, or by an entity's dangling policy when its owner link is gone,
    /// are applied afterwards. Singletons cannot be deleted.
    pub(crate) fn fixup_pass(
        &mut self,
        registry: &TypeRegistry,
        now: GameTime,
        spawned: &mut Vec<TaskSpec>,
    ) -> FixupStats {
        let live: BTreeSet<Serial> = self.entities.serials().collect();
        let mut stats = FixupStats::default();
        let mut doomed = Vec::new();

        for &serial in &live {
            let Some(body) = self.entities.lookup_mut(serial) else {
                continue;
            };
            let tag = body.type_tag();
            let policy = registry
                .entity_type(tag)
                .map_or(DanglingPolicy::ClearField, |t| t.dangling);

            let mut fx = Fixup::new(&live, now, Some(serial), &mut *spawned);
            let outcome = body.fixup(&mut fx);
            let dangling = fx.dangling().len();

            if dangling > 0 {
                log::warn!(
                    "{tag} {serial}: {dangling} dangling reference(s) {:?}, policy {policy:?}",
                    fx.dangling()
                );
            }
            stats.dangling += dangling;
            if outcome == FixupOutcome::Delete
                || (fx.owner_lost() && policy == DanglingPolicy::DeleteOwner)
            {
                doomed.push(serial);
            }
        }

        for (name, body) in &mut self.singletons {
            let mut fx = Fixup::new(&live, now, None, &mut *spawned);
            if body.fixup(&mut fx) == FixupOutcome::Delete {
                log::warn!("singleton '{name}' asked to be deleted during fixup; kept");
            }
            if !fx.dangling().is_empty() {
                log::warn!("singleton '{name}': dangling reference(s) {:?} cleared", fx.dangling());
            }
            stats.dangling += fx.dangling().len();
        }

        for serial in doomed {
            stats.deleted.extend(self.delete(serial));
        }
        stats
    }
}
