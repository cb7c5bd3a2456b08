//! On-disk save files with rotating backups.
//!
//! A save is first written to a temporary sibling, synced, and then renamed
//! over the primary file, so a crash mid-write never leaves a torn save
//! behind. The previous primary shifts into `<name>.1`, `.1` into `.2`, and
//! so on up to the configured backup count.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use shardkeep_core::clock::{Clock, DowntimePolicy, ManualClock};
use shardkeep_core::engine::Engine;
use shardkeep_core::registry::TypeRegistry;
use shardkeep_core::save::{self, LoadError, LoadReport, SaveError, SaveHeader};

use crate::config::{ConfigError, StoreConfig};

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error("failed to load {path}: {source}")]
    Load { path: PathBuf, source: LoadError },

    #[error("no save found in {0}")]
    NoSave(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StoreError {
    /// File the error is about, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            StoreError::Io { path, .. }
            | StoreError::Load { path, .. }
            | StoreError::NoSave(path) => Some(path),
            StoreError::Save(_) | StoreError::Config(_) => None,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ===========================================================================
// Results
// ===========================================================================

/// Where a save landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub path: PathBuf,
    pub bytes: usize,
}

/// An engine restored from disk.
#[derive(Debug)]
pub struct LoadedSave {
    pub engine: Engine,
    pub report: LoadReport,
    /// The file the engine came from.
    pub path: PathBuf,
    /// Newer files that could not be read or failed to load, newest first.
    /// Each is a [`StoreError::Io`] or a [`StoreError::Load`].
    pub skipped: Vec<StoreError>,
}

/// Health of one file on disk.
#[derive(Debug)]
pub struct FileStatus {
    pub path: PathBuf,
    pub size: u64,
    /// `None` when even the header is unreadable.
    pub header: Option<SaveHeader>,
    /// A [`StoreError::Io`] or [`StoreError::Load`] on failure.
    pub outcome: Result<LoadReport, StoreError>,
}

// ===========================================================================
// SaveStore
// ===========================================================================

#[derive(Debug, Clone)]
pub struct SaveStore {
    config: StoreConfig,
}

impl SaveStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Build a store from a RON, TOML, or JSON config file.
    pub fn from_config_file(path: &Path) -> Result<Self, StoreError> {
        Self::new(StoreConfig::from_file(path)?)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Save paths that exist, newest first. An entry that exists but cannot
    /// be read is still listed so that loading can report it.
    pub fn candidates(&self) -> Vec<PathBuf> {
        std::iter::once(self.config.save_path())
            .chain((1..=self.config.backups).map(|n| self.config.backup_path(n)))
            .filter(|p| p.exists())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Serialize `engine` and write it as the new primary save.
    pub fn save(&self, engine: &Engine) -> Result<SaveOutcome, StoreError> {
        let bytes = engine.save()?;
        self.write(&bytes)
    }

    /// Atomically replace the primary save with `bytes`, rotating backups.
    pub fn write(&self, bytes: &[u8]) -> Result<SaveOutcome, StoreError> {
        let dir = &self.config.save_dir;
        fs::create_dir_all(dir).map_err(io_err(dir))?;

        let temp = self.config.temp_path();
        {
            let mut file = File::create(&temp).map_err(io_err(&temp))?;
            file.write_all(bytes).map_err(io_err(&temp))?;
            file.sync_all().map_err(io_err(&temp))?;
        }

        self.rotate_backups()?;

        let primary = self.config.save_path();
        fs::rename(&temp, &primary).map_err(io_err(&primary))?;
        fsync_directory(dir);

        log::info!("saved {} bytes to {}", bytes.len(), primary.display());
        Ok(SaveOutcome {
            path: primary,
            bytes: bytes.len(),
        })
    }

    fn rotate_backups(&self) -> Result<(), StoreError> {
        let primary = self.config.save_path();
        if self.config.backups == 0 || !primary.exists() {
            return Ok(());
        }
        for n in (1..self.config.backups).rev() {
            let from = self.config.backup_path(n);
            if from.exists() {
                let to = self.config.backup_path(n + 1);
                fs::rename(&from, &to).map_err(io_err(&to))?;
            }
        }
        let first = self.config.backup_path(1);
        fs::rename(&primary, &first).map_err(io_err(&first))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Load the newest save that passes every check.
    ///
    /// A file that cannot be read is skipped the same way as one that fails
    /// to load. With `fallback_to_backup` off only the primary file is
    /// tried. When every candidate fails, the primary file's error is
    /// returned.
    pub fn load<C>(&self, registry: &TypeRegistry, clock: C) -> Result<LoadedSave, StoreError>
    where
        C: Clock + Clone + 'static,
    {
        let mut candidates = self.candidates();
        if candidates.is_empty() {
            return Err(StoreError::NoSave(self.config.save_dir.clone()));
        }
        if !self.config.fallback_to_backup {
            candidates.truncate(1);
        }

        let mut skipped: Vec<StoreError> = Vec::new();
        for path in candidates {
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("{} is unreadable: {e}", path.display());
                    skipped.push(io_err(&path)(e));
                    continue;
                }
            };
            match Engine::load(&data, registry, clock.clone(), self.config.downtime) {
                Ok((engine, report)) => {
                    if !skipped.is_empty() {
                        log::warn!(
                            "recovered from {} after {} newer save(s) failed",
                            path.display(),
                            skipped.len()
                        );
                    }
                    return Ok(LoadedSave {
                        engine,
                        report,
                        path,
                        skipped,
                    });
                }
                Err(source) => {
                    log::warn!("{} is unusable: {source}", path.display());
                    skipped.push(StoreError::Load { path, source });
                }
            }
        }

        Err(skipped.swap_remove(0))
    }

    /// Check every save on disk without keeping the result.
    ///
    /// Each file is loaded against a clock frozen at its own save time, so
    /// the report reflects the file rather than how long ago it was written.
    pub fn validate(&self, registry: &TypeRegistry) -> Result<Vec<FileStatus>, StoreError> {
        let mut statuses = Vec::new();
        for path in self.candidates() {
            let data = match fs::read(&path) {
                Ok(data) => data,
                Err(e) => {
                    statuses.push(FileStatus {
                        outcome: Err(io_err(&path)(e)),
                        path,
                        size: 0,
                        header: None,
                    });
                    continue;
                }
            };
            let header = save::read_save_header(&data).ok();
            let clock = ManualClock::new(header.map_or(0, |h| h.saved_at_wall_millis));
            let outcome = Engine::load(&data, registry, clock, DowntimePolicy::Paused)
                .map(|(_, report)| report)
                .map_err(|source| StoreError::Load {
                    path: path.clone(),
                    source,
                });
            statuses.push(FileStatus {
                path,
                size: data.len() as u64,
                header,
                outcome,
            });
        }
        Ok(statuses)
    }
}

fn fsync_directory(path: &Path) {
    if let Ok(dir) = File::open(path) {
        let _ = dir.sync_all();
    }
}
