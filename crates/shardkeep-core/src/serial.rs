//! Persistent entity handles and the identity table that owns them.
//!
//! Every persistable entity is addressed by a [`Serial`]. Serials are split
//! into disjoint spaces per [`SerialKind`], allocated monotonically, and never
//! handed out twice while the process runs. The [`IdentityTable`] keeps the
//! entities themselves in a `slotmap` arena with an ordered serial index on
//! top, so iteration is always in serial order.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};

new_key_type! {
    /// Arena slot of an entity inside the identity table.
    pub struct EntityKey;
}

// ---------------------------------------------------------------------------
// Serial
// ---------------------------------------------------------------------------

/// Stable integer handle of a persistable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Serial(pub u32);

impl Serial {
    /// Sentinel written for "no entity".
    pub const NULL: Serial = Serial(0);

    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// The serial space this value falls in, if any.
    pub fn kind(self) -> Option<SerialKind> {
        SerialKind::of(self)
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Disjoint serial spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerialKind {
    Mobile,
    Item,
}

impl SerialKind {
    pub const ALL: [SerialKind; 2] = [SerialKind::Mobile, SerialKind::Item];

    pub fn range(self) -> RangeInclusive<u32> {
        match self {
            SerialKind::Mobile => 0x0000_0001..=0x3FFF_FFFF,
            SerialKind::Item => 0x4000_0000..=0x7FFF_FFFF,
        }
    }

    pub fn first(self) -> Serial {
        Serial(*self.range().start())
    }

    pub fn contains(self, serial: Serial) -> bool {
        self.range().contains(&serial.0)
    }

    pub fn of(serial: Serial) -> Option<SerialKind> {
        Self::ALL.into_iter().find(|k| k.contains(serial))
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SerialError {
    #[error("{0:?} serial space exhausted")]
    Exhausted(SerialKind),
    #[error("serial {serial} is outside the {kind:?} space")]
    OutOfSpace { serial: Serial, kind: SerialKind },
    #[error("serial {0} is already registered")]
    Duplicate(Serial),
}

// ---------------------------------------------------------------------------
// SerialAllocator
// ---------------------------------------------------------------------------

/// Monotonic per-space allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialAllocator {
    next_mobile: u32,
    next_item: u32,
}

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self {
            next_mobile: SerialKind::Mobile.first().0,
            next_item: SerialKind::Item.first().0,
        }
    }

    fn slot(&mut self, kind: SerialKind) -> &mut u32 {
        match kind {
            SerialKind::Mobile => &mut self.next_mobile,
            SerialKind::Item => &mut self.next_item,
        }
    }

    /// Next unallocated serial of `kind`, without allocating it.
    pub fn peek(&self, kind: SerialKind) -> Serial {
        match kind {
            SerialKind::Mobile => Serial(self.next_mobile),
            SerialKind::Item => Serial(self.next_item),
        }
    }

    /// Allocate the next serial of `kind`.
    pub fn allocate(&mut self, kind: SerialKind) -> Result<Serial, SerialError> {
        let end = *kind.range().end();
        let next = self.slot(kind);
        if *next > end {
            return Err(SerialError::Exhausted(kind));
        }
        let serial = Serial(*next);
        *next += 1;
        Ok(serial)
    }

    /// Make sure `serial` (and everything below it in its space) is never
    /// allocated again.
    pub fn observe(&mut self, serial: Serial) {
        if let Some(kind) = serial.kind() {
            let next = self.slot(kind);
            *next = (*next).max(serial.0 + 1);
        }
    }

    /// Raise counters to at least the given values. Counters never move
    /// backwards, and values outside a space are ignored.
    pub fn restore(&mut self, next_mobile: u32, next_item: u32) {
        for (kind, next) in [(SerialKind::Mobile, next_mobile), (SerialKind::Item, next_item)] {
            let last = Serial(next.saturating_sub(1));
            if kind.contains(last) {
                self.observe(last);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// IdentityTable
// ---------------------------------------------------------------------------

/// Serial-to-value bijection backed by an arena.
#[derive(Debug)]
pub struct IdentityTable<T> {
    slots: SlotMap<EntityKey, (Serial, T)>,
    index: BTreeMap<Serial, EntityKey>,
    allocator: SerialAllocator,
}

impl<T> Default for IdentityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IdentityTable<T> {
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            index: BTreeMap::new(),
            allocator: SerialAllocator::new(),
        }
    }

    /// Allocate a fresh serial of `kind` and store the value built for it.
    pub fn register_with(
        &mut self,
        kind: SerialKind,
        build: impl FnOnce(Serial) -> T,
    ) -> Result<Serial, SerialError> {
        let serial = self.allocator.allocate(kind)?;
        let key = self.slots.insert((serial, build(serial)));
        self.index.insert(serial, key);
        Ok(serial)
    }

    /// Store a value under a serial read from a save. The serial must fall in
    /// `kind`'s space and must not be registered yet.
    pub fn insert(&mut self, kind: SerialKind, serial: Serial, value: T) -> Result<(), SerialError> {
        if !kind.contains(serial) {
            return Err(SerialError::OutOfSpace { serial, kind });
        }
        if self.index.contains_key(&serial) {
            return Err(SerialError::Duplicate(serial));
        }
        let key = self.slots.insert((serial, value));
        self.index.insert(serial, key);
        self.allocator.observe(serial);
        Ok(())
    }

    pub fn lookup(&self, serial: Serial) -> Option<&T> {
        let key = self.index.get(&serial)?;
        self.slots.get(*key).map(|(_, v)| v)
    }

    pub fn lookup_mut(&mut self, serial: Serial) -> Option<&mut T> {
        let key = self.index.get(&serial)?;
        self.slots.get_mut(*key).map(|(_, v)| v)
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.index.contains_key(&serial)
    }

    /// Remove a value permanently. Its serial is not reused.
    pub fn unregister(&mut self, serial: Serial) -> Option<T> {
        let key = self.index.remove(&serial)?;
        self.slots.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Registered serials in ascending order.
    pub fn serials(&self) -> impl Iterator<Item = Serial> + '_ {
        self.index.keys().copied()
    }

    /// `(serial, value)` pairs in ascending serial order.
    pub fn iter(&self) -> impl Iterator<Item = (Serial, &T)> + '_ {
        self.index
            .values()
            .filter_map(|key| self.slots.get(*key).map(|(s, v)| (*s, v)))
    }

    pub fn allocator(&self) -> &SerialAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut SerialAllocator {
        &mut self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_are_disjoint() {
        assert_eq!(Serial(1).kind(), Some(SerialKind::Mobile));
        assert_eq!(Serial(0x4000_0000).kind(), Some(SerialKind::Item));
        assert_eq!(Serial::NULL.kind(), None);
        assert_eq!(Serial(0x8000_0000).kind(), None);
    }

    #[test]
    fn allocation_is_monotonic_per_space() {
        let mut table = IdentityTable::new();
        let a = table.register_with(SerialKind::Mobile, |_| "a").unwrap();
        let b = table.register_with(SerialKind::Item, |_| "b").unwrap();
        let c = table.register_with(SerialKind::Mobile, |_| "c").unwrap();
        assert_eq!(a, Serial(1));
        assert_eq!(b, Serial(0x4000_0000));
        assert_eq!(c, Serial(2));
    }

    #[test]
    fn unregistered_serials_are_not_reused() {
        let mut table = IdentityTable::new();
        let a = table.register_with(SerialKind::Item, |_| 1).unwrap();
        assert_eq!(table.unregister(a), Some(1));
        let b = table.register_with(SerialKind::Item, |_| 2).unwrap();
        assert_ne!(a, b);
        assert!(table.lookup(a).is_none());
        assert_eq!(table.lookup(b), Some(&2));
    }

    #[test]
    fn insert_resumes_allocation_past_loaded_serials() {
        let mut table = IdentityTable::new();
        table.insert(SerialKind::Mobile, Serial(40), "loaded").unwrap();
        table.insert(SerialKind::Mobile, Serial(7), "older").unwrap();
        let fresh = table.register_with(SerialKind::Mobile, |_| "new").unwrap();
        assert_eq!(fresh, Serial(41));
    }

    #[test]
    fn insert_rejects_duplicates_and_foreign_spaces() {
        let mut table = IdentityTable::new();
        table.insert(SerialKind::Item, Serial(0x4000_0005), ()).unwrap();
        assert_eq!(
            table.insert(SerialKind::Item, Serial(0x4000_0005), ()),
            Err(SerialError::Duplicate(Serial(0x4000_0005)))
        );
        assert_eq!(
            table.insert(SerialKind::Item, Serial(3), ()),
            Err(SerialError::OutOfSpace {
                serial: Serial(3),
                kind: SerialKind::Item
            })
        );
    }

    #[test]
    fn iteration_is_in_serial_order() {
        let mut table = IdentityTable::new();
        table.insert(SerialKind::Item, Serial(0x4000_0002), 'c').unwrap();
        table.insert(SerialKind::Mobile, Serial(9), 'b').unwrap();
        table.insert(SerialKind::Mobile, Serial(2), 'a').unwrap();
        let order: Vec<char> = table.iter().map(|(_, v)| *v).collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
    }

    #[test]
    fn restore_never_moves_counters_backwards() {
        let mut alloc = SerialAllocator::new();
        alloc.restore(100, 0x4000_0010);
        assert_eq!(alloc.peek(SerialKind::Mobile), Serial(100));
        alloc.restore(5, 0);
        assert_eq!(alloc.peek(SerialKind::Mobile), Serial(100));
        assert_eq!(alloc.peek(SerialKind::Item), Serial(0x4000_0010));
    }

    #[test]
    fn exhausted_space_is_an_error() {
        let mut alloc = SerialAllocator::new();
        alloc.observe(Serial(0x3FFF_FFFF));
        assert_eq!(
            alloc.allocate(SerialKind::Mobile),
            Err(SerialError::Exhausted(SerialKind::Mobile))
        );
    }
}
