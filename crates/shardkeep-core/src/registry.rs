//! The persistence contract and the type registry that dispatches on it.
//!
//! Every persistable content type implements [`Persist`]. The engine writes
//! `[TypeTag][Serial][SchemaVersion]` ahead of each entity's own bytes; on
//! load the [`TypeRegistry`] maps the tag back to a factory that builds a
//! blank instance, and the instance's [`Persist::deserialize`] receives the
//! version that was written so it can pick the matching layout.
//!
//! Registration goes through [`TypeRegistryBuilder`]; the built registry is
//! immutable and shared by every load.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::codec::{CodecError, Reader, Writer};
use crate::migration::SchemaError;
use crate::reference::{DanglingPolicy, Fixup, FixupOutcome};
use crate::scheduler::TaskPayload;
use crate::serial::{Serial, SerialKind};

// ---------------------------------------------------------------------------
// Persist trait
// ---------------------------------------------------------------------------

/// Contract implemented by entities and named singletons.
pub trait Persist: fmt::Debug {
    /// Tag the registry knows this type by. Must be stable across releases.
    fn type_tag(&self) -> &'static str;

    /// Schema version this build writes.
    fn schema_version(&self) -> u32;

    /// Write the fields for [`Persist::schema_version`].
    fn serialize(&self, w: &mut Writer) -> Result<(), CodecError>;

    /// Read fields written at `version`, consuming exactly the bytes that
    /// version's writer produced. References must be read with
    /// [`Reader::read_ref`] and stay pending until [`Persist::fixup`].
    fn deserialize(&mut self, r: &mut Reader<'_>, version: u32) -> Result<(), SchemaError>;

    /// Resolve pending references once every record has been read.
    fn fixup(&mut self, fx: &mut Fixup<'_>) -> FixupOutcome {
        let _ = fx;
        FixupOutcome::Keep
    }

    /// Entities deleted along with this one.
    fn contents(&self) -> Vec<Serial> {
        Vec::new()
    }

    /// Downcast to `&dyn Any` for access to the concrete type.
    fn as_any(&self) -> &dyn Any;

    /// Downcast to `&mut dyn Any` for mutable access to the concrete type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Builds a blank entity for a serial read from a save.
pub type EntityFactory = fn(Serial) -> Box<dyn Persist>;

/// Builds a singleton in its default state.
pub type SingletonFactory = fn() -> Box<dyn Persist>;

/// Decodes a persisted task payload.
pub type TaskDecoder = fn(&mut Reader<'_>) -> Result<Box<dyn TaskPayload>, SchemaError>;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} tag must not be empty")]
    EmptyTag { kind: &'static str },
    #[error("duplicate {kind} tag '{tag}'")]
    Duplicate { kind: &'static str, tag: String },
    #[error("unknown entity type '{0}'")]
    UnknownType(String),
    #[error("unknown singleton '{0}'")]
    UnknownSingleton(String),
    #[error("unknown task type '{0}'")]
    UnknownTask(String),
}

// ---------------------------------------------------------------------------
// Registered types
// ---------------------------------------------------------------------------

/// A registered entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityType {
    pub tag: &'static str,
    pub kind: SerialKind,
    pub dangling: DanglingPolicy,
    factory: EntityFactory,
}

impl EntityType {
    pub fn construct(&self, serial: Serial) -> Box<dyn Persist> {
        (self.factory)(serial)
    }
}

/// A registered singleton.
#[derive(Debug, Clone, Copy)]
pub struct SingletonType {
    pub name: &'static str,
    factory: SingletonFactory,
}

impl SingletonType {
    pub fn construct(&self) -> Box<dyn Persist> {
        (self.factory)()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects type registrations. Tags are checked for uniqueness as they are
/// registered.
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    entities: HashMap<&'static str, EntityType>,
    singletons: Vec<SingletonType>,
    tasks: HashMap<&'static str, TaskDecoder>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_tag(kind: &'static str, tag: &str, taken: bool) -> Result<(), RegistryError> {
        if tag.is_empty() {
            return Err(RegistryError::EmptyTag { kind });
        }
        if taken {
            return Err(RegistryError::Duplicate {
                kind,
                tag: tag.to_string(),
            });
        }
        Ok(())
    }

    /// Register an entity type living in `kind`'s serial space.
    pub fn register_entity(
        &mut self,
        tag: &'static str,
        kind: SerialKind,
        dangling: DanglingPolicy,
        factory: EntityFactory,
    ) -> Result<(), RegistryError> {
        Self::check_tag("entity", tag, self.entities.contains_key(tag))?;
        self.entities.insert(
            tag,
            EntityType {
                tag,
                kind,
                dangling,
                factory,
            },
        );
        Ok(())
    }

    /// Register a named singleton. Singletons are saved in registration
    /// order.
    pub fn register_singleton(
        &mut self,
        name: &'static str,
        factory: SingletonFactory,
    ) -> Result<(), RegistryError> {
        let taken = self.singletons.iter().any(|s| s.name == name);
        Self::check_tag("singleton", name, taken)?;
        self.singletons.push(SingletonType { name, factory });
        Ok(())
    }

    /// Register a persisted task payload type.
    pub fn register_task(
        &mut self,
        tag: &'static str,
        decode: TaskDecoder,
    ) -> Result<(), RegistryError> {
        Self::check_tag("task", tag, self.tasks.contains_key(tag))?;
        self.tasks.insert(tag, decode);
        Ok(())
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            entities: self.entities,
            singletons: self.singletons,
            tasks: self.tasks,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable tag-to-constructor tables.
#[derive(Debug)]
pub struct TypeRegistry {
    entities: HashMap<&'static str, EntityType>,
    singletons: Vec<SingletonType>,
    tasks: HashMap<&'static str, TaskDecoder>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    pub fn entity_type(&self, tag: &str) -> Option<&EntityType> {
        self.entities.get(tag)
    }

    /// Build a blank entity for `tag`.
    pub fn construct(&self, tag: &str, serial: Serial) -> Result<Box<dyn Persist>, RegistryError> {
        self.entity_type(tag)
            .map(|t| t.construct(serial))
            .ok_or_else(|| RegistryError::UnknownType(tag.to_string()))
    }

    pub fn singleton(&self, name: &str) -> Option<&SingletonType> {
        self.singletons.iter().find(|s| s.name == name)
    }

    /// Registered singletons in registration order.
    pub fn singletons(&self) -> impl Iterator<Item = &SingletonType> {
        self.singletons.iter()
    }

    pub fn decode_task(
        &self,
        tag: &str,
        r: &mut Reader<'_>,
    ) -> Option<Result<Box<dyn TaskPayload>, SchemaError>> {
        self.tasks.get(tag).map(|decode| decode(r))
    }

    pub fn entity_type_count(&self) -> usize {
        self.entities.len()
    }

    pub fn task_type_count(&self) -> usize {
        self.tasks.len()
    }
}
