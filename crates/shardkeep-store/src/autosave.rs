//! Periodic saves driven by engine time.

use std::time::Duration;

use shardkeep_core::clock::GameTime;
use shardkeep_core::engine::Engine;

use crate::config::StoreConfig;
use crate::store::{SaveOutcome, SaveStore, StoreError};

/// Delay before retrying a failed autosave.
pub const RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Autosave {
    interval: Option<Duration>,
    next_due: Option<GameTime>,
}

impl Autosave {
    /// `None` disables autosave.
    pub fn new(interval: Option<Duration>, now: GameTime) -> Self {
        let next_due = interval.map(|interval| now + interval);
        Self { interval, next_due }
    }

    pub fn from_config(config: &StoreConfig, now: GameTime) -> Self {
        Self::new(config.autosave_interval(), now)
    }

    pub fn due(&self, now: GameTime) -> bool {
        self.next_due.is_some_and(|next| now >= next)
    }

    pub fn mark_saved(&mut self, now: GameTime) {
        if let Some(interval) = self.interval {
            self.next_due = Some(now + interval);
        }
    }

    pub fn next_due(&self) -> Option<GameTime> {
        self.next_due
    }

    /// Save through `store` if the interval has elapsed. Returns `None` when
    /// nothing was due.
    pub fn run_if_due(
        &mut self,
        engine: &Engine,
        store: &SaveStore,
    ) -> Option<Result<SaveOutcome, StoreError>> {
        let now = engine.now();
        if !self.due(now) {
            return None;
        }
        let result = store.save(engine);
        match &result {
            Ok(_) => self.mark_saved(now),
            Err(e) => {
                let retry = self.interval.map_or(RETRY_DELAY, |i| i.min(RETRY_DELAY));
                log::error!("autosave failed, retrying in {retry:?}: {e}");
                self.next_due = Some(now + retry);
            }
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardkeep_core::clock::ManualClock;

    #[test]
    fn disabled_is_never_due() {
        let auto = Autosave::new(None, GameTime::ZERO);
        assert!(!auto.due(GameTime(u64::MAX)));
        assert_eq!(auto.next_due(), None);
    }

    #[test]
    fn due_after_interval_and_rearms() {
        let mut auto = Autosave::new(Some(Duration::from_secs(60)), GameTime(1_000));
        assert!(!auto.due(GameTime(60_999)));
        assert!(auto.due(GameTime(61_000)));
        auto.mark_saved(GameTime(61_500));
        assert_eq!(auto.next_due(), Some(GameTime(121_500)));
    }

    #[test]
    fn run_if_due_writes_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            save_dir: dir.path().to_path_buf(),
            autosave_secs: 10,
            ..StoreConfig::default()
        };
        let store = SaveStore::new(config.clone()).unwrap();
        let clock = ManualClock::new(0);
        let engine = Engine::new(clock.clone());
        let mut auto = Autosave::from_config(&config, engine.now());

        assert!(auto.run_if_due(&engine, &store).is_none());
        clock.advance(Duration::from_secs(10));
        assert!(auto.run_if_due(&engine, &store).unwrap().is_ok());
        assert!(store.config().save_path().exists());
        assert!(auto.run_if_due(&engine, &store).is_none());
        assert_eq!(auto.next_due(), Some(GameTime(20_000)));
    }

    #[test]
    fn failure_retries_sooner() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the save directory should be.
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"").unwrap();
        let store = SaveStore::new(StoreConfig {
            save_dir: blocker,
            ..StoreConfig::default()
        })
        .unwrap();
        let clock = ManualClock::new(0);
        let engine = Engine::new(clock.clone());
        let mut auto = Autosave::new(Some(Duration::from_secs(300)), engine.now());

        clock.advance(Duration::from_secs(300));
        let result = auto.run_if_due(&engine, &store).unwrap();
        assert!(matches!(result, Err(StoreError::Io { .. })));
        assert_eq!(auto.next_due(), Some(GameTime(330_000)));
    }
}
