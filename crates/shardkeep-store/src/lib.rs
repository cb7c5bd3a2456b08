//! File-backed persistence for a shard: configuration, atomic save files with
//! rotating backups, fallback loading, and a timer for autosaves.
//!
//! The binary format itself lives in `shardkeep_core::save`; this crate only
//! decides where the bytes go and which file to trust on startup.

pub mod autosave;
pub mod config;
pub mod store;

pub use autosave::Autosave;
pub use config::{ConfigError, StoreConfig};
pub use store::{FileStatus, LoadedSave, SaveOutcome, SaveStore, StoreError};
