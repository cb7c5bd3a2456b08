//! Shardkeep Core -- world persistence and timers for persistent-world game
//! servers.
//!
//! A shard's state is a graph of entities addressed by stable [`serial::Serial`]
//! handles, a handful of named singletons, and a queue of pending timers.
//! This crate writes all of it to one compact binary stream and reads it
//! back, resolving cross-references and re-arming timers on the way in.
//!
//! # Load Pipeline
//!
//! [`engine::Engine::load`] runs in fixed stages against a fresh world:
//!
//! 1. **Verify** -- Check the trailing checksum, then magic and format version.
//! 2. **Raw pass** -- Construct every record through the registry and decode
//!    its fields. References stay pending.
//! 3. **Fixup pass** -- Each entity resolves its references against the full
//!    set of loaded serials. Dangling references fall back per type.
//! 4. **Arm** -- Saved tasks, and tasks entities requested during fixup, are
//!    scheduled against the loader's clock.
//!
//! Any failure aborts the load; nothing partial is ever returned.
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Owns the world, scheduler, and clock.
//! - [`world::World`] -- Entities by serial plus named singletons.
//! - [`registry::Persist`] -- The contract every content type implements.
//! - [`registry::TypeRegistry`] -- Tag-to-factory dispatch used by the loader.
//! - [`migration::VersionedSchema`] -- Per-version readers and migrations.
//! - [`reference::EntityRef`] -- A cross-entity link, pending until fixup.
//! - [`scheduler::Scheduler`] -- One-shot and repeating timers.
//! - [`save`] -- The stream layout, header, and load errors.

pub mod clock;
pub mod codec;
pub mod engine;
pub mod migration;
pub mod reference;
pub mod registry;
pub mod save;
pub mod scheduler;
pub mod serial;
pub mod world;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
