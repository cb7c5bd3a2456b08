//! Time sources for the scheduler and the delta-time codec.
//!
//! All deadlines inside the engine are [`GameTime`] values: milliseconds on a
//! monotonic clock that starts at zero when the process starts. Wall-clock
//! time is only consulted when writing and reading the save header, so that
//! real-world downtime between a save and the next load can be measured.

use std::cell::Cell;
use std::fmt;
use std::ops::Add;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GameTime
// ---------------------------------------------------------------------------

/// A point on the process-local monotonic clock, in milliseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GameTime(pub u64);

impl GameTime {
    pub const ZERO: GameTime = GameTime(0);

    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Signed distance `self - earlier` in milliseconds.
    pub fn millis_since(self, earlier: GameTime) -> i64 {
        (self.0 as i128 - earlier.0 as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Shift by a signed millisecond offset, saturating at both ends.
    pub fn offset(self, delta_ms: i64) -> GameTime {
        if delta_ms >= 0 {
            GameTime(self.0.saturating_add(delta_ms as u64))
        } else {
            GameTime(self.0.saturating_sub(delta_ms.unsigned_abs()))
        }
    }

    /// Time remaining until `self`, or zero if `self` is not after `now`.
    pub fn saturating_duration_since(self, now: GameTime) -> Duration {
        Duration::from_millis(self.0.saturating_sub(now.0))
    }
}

impl Add<Duration> for GameTime {
    type Output = GameTime;

    fn add(self, rhs: Duration) -> GameTime {
        GameTime(self.0.saturating_add(duration_millis(rhs)))
    }
}

impl fmt::Display for GameTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of monotonic and wall-clock time.
pub trait Clock: fmt::Debug {
    /// Current monotonic time.
    fn now(&self) -> GameTime;

    /// Current wall-clock time as milliseconds since the Unix epoch.
    fn wall_millis(&self) -> i64;
}

/// Clock backed by [`Instant`] and [`SystemTime`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> GameTime {
        GameTime(duration_millis(self.start.elapsed()))
    }

    fn wall_millis(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
            Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
        }
    }
}

/// A hand-driven clock. Clones share the same time, so a test can keep a
/// handle and advance the clock an engine owns.
#[derive(Debug, Clone)]
pub struct ManualClock {
    state: Rc<Cell<(u64, i64)>>,
}

impl ManualClock {
    /// Start at monotonic time zero and the given wall-clock time.
    pub fn new(wall_millis: i64) -> Self {
        Self {
            state: Rc::new(Cell::new((0, wall_millis))),
        }
    }

    /// Advance both monotonic and wall-clock time.
    pub fn advance(&self, d: Duration) {
        let (mono, wall) = self.state.get();
        let ms = duration_millis(d);
        self.state.set((
            mono.saturating_add(ms),
            wall.saturating_add(i64::try_from(ms).unwrap_or(i64::MAX)),
        ));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> GameTime {
        GameTime(self.state.get().0)
    }

    fn wall_millis(&self) -> i64 {
        self.state.get().1
    }
}

// ---------------------------------------------------------------------------
// Downtime policy
// ---------------------------------------------------------------------------

/// How saved deadlines treat the real-world time the server spent offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DowntimePolicy {
    /// Deadlines are absolute: downtime counts against every countdown.
    #[default]
    WallClock,
    /// Countdowns freeze while the server is down.
    Paused,
}

impl DowntimePolicy {
    /// Downtime to subtract from saved deltas, given the wall-clock time
    /// recorded at save and the wall-clock time now. Clock skew that puts the
    /// load before the save counts as no downtime.
    pub fn downtime(self, saved_wall_millis: i64, now_wall_millis: i64) -> Duration {
        match self {
            DowntimePolicy::Paused => Duration::ZERO,
            DowntimePolicy::WallClock => {
                let elapsed = now_wall_millis.saturating_sub(saved_wall_millis);
                Duration::from_millis(elapsed.max(0) as u64)
            }
        }
    }
}
