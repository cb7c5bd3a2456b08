//! Versioned schema readers and forward migrations for content types.
//!
//! A content type keeps one "fields" struct `F` describing its newest layout.
//! For every historical schema version it registers a reader that consumes
//! exactly the bytes that version's writer produced, and for every version
//! step `N -> N+1` a pure migration `F -> F` that fills in what version `N`
//! did not carry. Reading an old record runs its reader and then chains the
//! migrations up to the current version.

use std::collections::BTreeMap;

use crate::codec::{CodecError, Reader};

/// Errors raised while decoding a versioned record.
///
/// Every variant is fatal to the whole load: once a record is read with the
/// wrong layout, the cursor is desynchronized for every record after it.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown schema version {version} (current is {current})")]
    UnknownVersion { version: u32, current: u32 },
    #[error("schema version {version} is newer than this build supports ({current})")]
    FutureVersion { version: u32, current: u32 },
    #[error("no migration path from version {from} to version {to}")]
    NoMigrationPath { from: u32, to: u32 },
}

/// Reads the byte layout of one schema version.
pub type ReadFn<F> = fn(&mut Reader<'_>) -> Result<F, CodecError>;

/// Upgrades fields from version `N` to version `N+1`.
pub type MigrationFn<F> = fn(F) -> F;

/// Per-version readers plus the migration chain for one content type.
pub struct VersionedSchema<F> {
    current: u32,
    readers: BTreeMap<u32, ReadFn<F>>,
    migrations: BTreeMap<u32, MigrationFn<F>>,
}

impl<F> VersionedSchema<F> {
    /// Create a schema whose newest version is `current`.
    pub fn new(current: u32) -> Self {
        Self {
            current,
            readers: BTreeMap::new(),
            migrations: BTreeMap::new(),
        }
    }

    /// Register the reader for records written at `version`.
    pub fn reader(mut self, version: u32, read: ReadFn<F>) -> Self {
        self.readers.insert(version, read);
        self
    }

    /// Register the migration from `from_version` to `from_version + 1`.
    pub fn migration(mut self, from_version: u32, migrate: MigrationFn<F>) -> Self {
        self.migrations.insert(from_version, migrate);
        self
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    /// Check whether a complete migration path exists from `from` to `to`.
    pub fn can_migrate(&self, from: u32, to: u32) -> bool {
        if from >= to {
            return from == to;
        }
        (from..to).all(|v| self.migrations.contains_key(&v))
    }

    /// Number of registered migration steps.
    pub fn step_count(&self) -> usize {
        self.migrations.len()
    }

    /// Apply migrations from `from` up to the current version.
    pub fn migrate(&self, fields: F, from: u32) -> Result<F, SchemaError> {
        let to = self.current;
        if from > to {
            return Err(SchemaError::FutureVersion {
                version: from,
                current: to,
            });
        }
        let mut fields = fields;
        for version in from..to {
            let step = self
                .migrations
                .get(&version)
                .ok_or(SchemaError::NoMigrationPath { from, to })?;
            fields = step(fields);
        }
        Ok(fields)
    }

    /// Read a record written at `version` and bring it up to date.
    pub fn read(&self, r: &mut Reader<'_>, version: u32) -> Result<F, SchemaError> {
        if version > self.current {
            return Err(SchemaError::FutureVersion {
                version,
                current: self.current,
            });
        }
        let read = self
            .readers
            .get(&version)
            .ok_or(SchemaError::UnknownVersion {
                version,
                current: self.current,
            })?;
        let fields = read(r)?;
        self.migrate(fields, version)
    }
}

impl<F> std::fmt::Debug for VersionedSchema<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedSchema")
            .field("current", &self.current)
            .field("readers", &self.readers.keys().collect::<Vec<_>>())
            .field("migrations", &self.migrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::GameTime;
    use crate::codec::{TimeBase, Writer};

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    #[derive(Debug, Default, PartialEq)]
    struct Lamp {
        name: String,
        fuel: u32,
        lit: bool,
    }

    fn read_v0(r: &mut Reader<'_>) -> Result<Lamp, CodecError> {
        Ok(Lamp {
            name: r.read_string()?,
            ..Lamp::default()
        })
    }

    fn read_v1(r: &mut Reader<'_>) -> Result<Lamp, CodecError> {
        Ok(Lamp {
            name: r.read_string()?,
            fuel: r.read_u32()?,
            ..Lamp::default()
        })
    }

    fn read_v2(r: &mut Reader<'_>) -> Result<Lamp, CodecError> {
        Ok(Lamp {
            name: r.read_string()?,
            fuel: r.read_u32()?,
            lit: r.read_bool()?,
        })
    }

    fn v0_to_v1(mut l: Lamp) -> Lamp {
        l.fuel = 100;
        l
    }

    fn v1_to_v2(mut l: Lamp) -> Lamp {
        l.lit = l.fuel > 0;
        l
    }

    fn lamp_schema() -> VersionedSchema<Lamp> {
        VersionedSchema::new(2)
            .reader(0, read_v0)
            .reader(1, read_v1)
            .reader(2, read_v2)
            .migration(0, v0_to_v1)
            .migration(1, v1_to_v2)
    }

    fn bytes(f: impl FnOnce(&mut Writer)) -> Vec<u8> {
        let mut w = Writer::new(GameTime::ZERO);
        f(&mut w);
        w.into_bytes()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[test]
    fn current_version_reads_without_migration() {
        let data = bytes(|w| {
            w.write_str("brass");
            w.write_u32(0);
            w.write_bool(true);
        });
        let mut r = Reader::new(&data, TimeBase::default());
        let lamp = lamp_schema().read(&mut r, 2).unwrap();
        assert_eq!(
            lamp,
            Lamp {
                name: "brass".into(),
                fuel: 0,
                lit: true
            }
        );
        assert!(r.is_empty());
    }

    #[test]
    fn oldest_version_migrates_through_every_step() {
        let data = bytes(|w| w.write_str("iron"));
        let mut r = Reader::new(&data, TimeBase::default());
        let lamp = lamp_schema().read(&mut r, 0).unwrap();
        assert_eq!(
            lamp,
            Lamp {
                name: "iron".into(),
                fuel: 100,
                lit: true
            }
        );
        assert!(r.is_empty());
    }

    #[test]
    fn old_and_new_layouts_agree_on_common_fields() {
        let old = bytes(|w| {
            w.write_str("tin");
            w.write_u32(7);
        });
        let new = bytes(|w| {
            w.write_str("tin");
            w.write_u32(7);
            w.write_bool(true);
        });
        let schema = lamp_schema();
        let a = schema
            .read(&mut Reader::new(&old, TimeBase::default()), 1)
            .unwrap();
        let b = schema
            .read(&mut Reader::new(&new, TimeBase::default()), 2)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_version_is_fatal() {
        let schema = VersionedSchema::<Lamp>::new(3).reader(3, read_v2);
        let mut r = Reader::new(&[], TimeBase::default());
        match schema.read(&mut r, 1) {
            Err(SchemaError::UnknownVersion {
                version: 1,
                current: 3,
            }) => {}
            other => panic!("expected UnknownVersion, got {other:?}"),
        }
    }

    #[test]
    fn future_version_is_fatal() {
        let mut r = Reader::new(&[], TimeBase::default());
        assert!(matches!(
            lamp_schema().read(&mut r, 9),
            Err(SchemaError::FutureVersion {
                version: 9,
                current: 2
            })
        ));
    }

    #[test]
    fn gap_in_chain_reports_no_path() {
        let schema = VersionedSchema::<Lamp>::new(2)
            .reader(0, read_v0)
            .migration(1, v1_to_v2);
        assert!(!schema.can_migrate(0, 2));
        let data = bytes(|w| w.write_str("x"));
        let mut r = Reader::new(&data, TimeBase::default());
        assert!(matches!(
            schema.read(&mut r, 0),
            Err(SchemaError::NoMigrationPath { from: 0, to: 2 })
        ));
    }

    #[test]
    fn truncated_record_surfaces_codec_error() {
        let data = bytes(|w| w.write_str("short"));
        let mut r = Reader::new(&data, TimeBase::default());
        assert!(matches!(
            lamp_schema().read(&mut r, 1),
            Err(SchemaError::Codec(CodecError::UnexpectedEof { .. }))
        ));
    }

    #[test]
    fn can_migrate_matches_registered_steps() {
        let schema = lamp_schema();
        assert!(schema.can_migrate(0, 2));
        assert!(schema.can_migrate(2, 2));
        assert!(!schema.can_migrate(2, 1));
        assert_eq!(schema.step_count(), 2);
        assert_eq!(schema.current(), 2);
    }
}
