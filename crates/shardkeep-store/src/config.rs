//! Store configuration, read from RON, TOML, or JSON.
//!
//! The format is detected from the file extension. Every field has a default,
//! so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardkeep_core::clock::DowntimePolicy;

/// Upper bound on rotating backups.
pub const MAX_BACKUPS: usize = 32;

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file has an extension we don't support.
    #[error("unsupported config format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    #[error("invalid store config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

pub fn detect_format(path: &Path) -> Result<Format, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// StoreConfig
// ===========================================================================

/// Where and how saves are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub save_dir: PathBuf,
    pub file_name: String,
    /// Number of previous saves kept as `<file_name>.1`, `.2`, ...
    pub backups: usize,
    /// Seconds between autosaves; 0 disables autosave.
    pub autosave_secs: u64,
    pub downtime: DowntimePolicy,
    /// Try older backups when the newest save fails to load.
    pub fallback_to_backup: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("saves"),
            file_name: "world.shk".to_string(),
            backups: 3,
            autosave_secs: 300,
            downtime: DowntimePolicy::WallClock,
            fallback_to_backup: true,
        }
    }
}

impl StoreConfig {
    /// Read a config file, detecting the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content, format).map_err(|detail| ConfigError::Parse {
            file: path.to_path_buf(),
            detail,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str, format: Format) -> Result<Self, String> {
        match format {
            Format::Ron => ron::from_str(content).map_err(|e| e.to_string()),
            Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
            Format::Toml => toml::from_str(content).map_err(|e| e.to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_name.is_empty() {
            return Err(ConfigError::Invalid("file_name must not be empty".into()));
        }
        if self.file_name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "file_name '{}' must not contain a path separator",
                self.file_name
            )));
        }
        if self.backups > MAX_BACKUPS {
            return Err(ConfigError::Invalid(format!(
                "backups is {}, at most {MAX_BACKUPS} allowed",
                self.backups
            )));
        }
        Ok(())
    }

    pub fn save_path(&self) -> PathBuf {
        self.save_dir.join(&self.file_name)
    }

    /// Path of backup `n`, 1 being the most recent.
    pub fn backup_path(&self, n: usize) -> PathBuf {
        self.save_dir.join(format!("{}.{n}", self.file_name))
    }

    pub fn temp_path(&self) -> PathBuf {
        self.save_dir.join(format!("{}.tmp", self.file_name))
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_secs > 0).then(|| Duration::from_secs(self.autosave_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn detect_format_by_extension() {
        assert_eq!(detect_format(Path::new("store.ron")).unwrap(), Format::Ron);
        assert_eq!(detect_format(Path::new("store.toml")).unwrap(), Format::Toml);
        assert_eq!(detect_format(Path::new("store.json")).unwrap(), Format::Json);
        assert!(matches!(
            detect_format(Path::new("store.yaml")),
            Err(ConfigError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn all_formats_agree() {
        let dir = tempfile::tempdir().unwrap();
        let ron = write(
            dir.path(),
            "a.ron",
            r#"(save_dir: "data", backups: 5, autosave_secs: 60, downtime: paused)"#,
        );
        let toml = write(
            dir.path(),
            "b.toml",
            "save_dir = \"data\"\nbackups = 5\nautosave_secs = 60\ndowntime = \"paused\"\n",
        );
        let json = write(
            dir.path(),
            "c.json",
            r#"{"save_dir": "data", "backups": 5, "autosave_secs": 60, "downtime": "paused"}"#,
        );

        let a = StoreConfig::from_file(&ron).unwrap();
        let b = StoreConfig::from_file(&toml).unwrap();
        let c = StoreConfig::from_file(&json).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.save_dir, PathBuf::from("data"));
        assert_eq!(a.file_name, "world.shk");
        assert_eq!(a.downtime, DowntimePolicy::Paused);
        assert_eq!(a.autosave_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "empty.json", "{}");
        assert_eq!(StoreConfig::from_file(&path).unwrap(), StoreConfig::default());
    }

    #[test]
    fn parse_error_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bad.toml", "backups = \"many\"");
        match StoreConfig::from_file(&path) {
            Err(ConfigError::Parse { file, .. }) => assert_eq!(file, path),
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn file_name_with_separator_is_invalid() {
        let config = StoreConfig {
            file_name: "../escape".into(),
            ..StoreConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_autosave_disables_it() {
        let config = StoreConfig {
            autosave_secs: 0,
            ..StoreConfig::default()
        };
        assert_eq!(config.autosave_interval(), None);
    }

    #[test]
    fn backup_paths_are_numbered_siblings() {
        let config = StoreConfig {
            save_dir: PathBuf::from("/srv/shard"),
            ..StoreConfig::default()
        };
        assert_eq!(config.save_path(), PathBuf::from("/srv/shard/world.shk"));
        assert_eq!(config.backup_path(2), PathBuf::from("/srv/shard/world.shk.2"));
        assert_eq!(config.temp_path(), PathBuf::from("/srv/shard/world.shk.tmp"));
    }
}
