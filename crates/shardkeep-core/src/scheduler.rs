//! Deferred execution: one-shot and repeating timers.
//!
//! The [`Scheduler`] is a single-threaded priority queue keyed by
//! `(fire_at, registration order)`. Each [`Scheduler::tick`] fires every due
//! task synchronously, in order, and re-arms repeating ones at
//! `now + interval`. Task handles are `slotmap` keys, so a handle to a
//! finished task never aliases a newer one.
//!
//! # Task lifecycle
//!
//! ```text
//! Pending --due--> Firing --+--> Pending    (interval > 0, repeats left)
//!    |                      +--> Completed  (last fire)
//!    +--cancel / owner deleted--> Cancelled
//! ```
//!
//! Tasks with a [`Payload::Persistent`] payload are written to saves and
//! re-armed on load; closure payloads live only in memory.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Duration;

use slotmap::{SecondaryMap, SlotMap, new_key_type};

use crate::clock::GameTime;
use crate::codec::{CodecError, Writer};
use crate::serial::Serial;
use crate::world::World;

new_key_type! {
    /// Handle to a scheduled task.
    pub struct TaskHandle;
}

// ---------------------------------------------------------------------------
// Task description
// ---------------------------------------------------------------------------

/// Largest finite repeat count. Saves store the count as an `i32`, so larger
/// counts are capped when the task is scheduled.
pub const MAX_REPEAT: u32 = i32::MAX as u32;

/// Shortest non-zero interval. Deadlines have millisecond resolution.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// How many times a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Fire this many times in total. `Times(0)` fires once; counts above
    /// [`MAX_REPEAT`] are capped.
    Times(u32),
    Forever,
}

/// Lifecycle state of a task.
///
/// `Completed` and `Cancelled` are terminal. [`Scheduler::state`] reports
/// them until the next tick starts; after that the handle is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Firing,
    Completed,
    Cancelled,
}

/// A task payload that can be written to a save.
///
/// The payload's bytes follow the scheduling fields in the task record and,
/// like entity records, carry no length prefix. Payloads that expect their
/// layout to change should write a version of their own first.
pub trait TaskPayload: fmt::Debug {
    /// Tag the registry decodes this payload by.
    fn task_tag(&self) -> &'static str;

    fn serialize(&self, w: &mut Writer) -> Result<(), CodecError>;

    fn run(&mut self, ctx: &mut TaskContext<'_>);

    fn as_any(&self) -> &dyn Any;
}

/// The work a task performs when it fires.
pub enum Payload {
    Persistent(Box<dyn TaskPayload>),
    /// Runtime-only work. Never saved; an entity that needs it after a
    /// restart re-creates it from its own fixup step.
    Transient(Box<dyn FnMut(&mut TaskContext<'_>)>),
}

impl Payload {
    pub fn persistent(payload: impl TaskPayload + 'static) -> Self {
        Payload::Persistent(Box::new(payload))
    }

    pub fn closure(f: impl FnMut(&mut TaskContext<'_>) + 'static) -> Self {
        Payload::Transient(Box::new(f))
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Payload::Persistent(_))
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) {
        match self {
            Payload::Persistent(p) => p.run(ctx),
            Payload::Transient(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Persistent(p) => f.debug_tuple("Persistent").field(p).finish(),
            Payload::Transient(_) => f.write_str("Transient(..)"),
        }
    }
}

/// Everything needed to schedule a task.
#[derive(Debug)]
pub struct TaskSpec {
    pub fire_at: GameTime,
    /// Zero makes the task one-shot regardless of `repeat`. Sub-millisecond
    /// intervals are rounded up to [`MIN_INTERVAL`].
    pub interval: Duration,
    pub repeat: Repeat,
    /// Entity the task acts on. Deleting it cancels the task.
    pub owner: Option<Serial>,
    pub payload: Payload,
}

impl TaskSpec {
    pub fn once(fire_at: GameTime, payload: Payload) -> Self {
        Self {
            fire_at,
            interval: Duration::ZERO,
            repeat: Repeat::Times(1),
            owner: None,
            payload,
        }
    }

    pub fn repeating(
        first: GameTime,
        interval: Duration,
        repeat: Repeat,
        payload: Payload,
    ) -> Self {
        Self {
            fire_at: first,
            interval,
            repeat,
            owner: None,
            payload,
        }
    }

    pub fn owned_by(mut self, owner: Serial) -> Self {
        self.owner = Some(owner);
        self
    }
}

// ---------------------------------------------------------------------------
// Internal storage
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Task {
    fire_at: GameTime,
    interval: Duration,
    /// Fires left including the next one; `None` repeats forever.
    remaining: Option<u32>,
    owner: Option<Serial>,
    /// Taken out while the task is firing.
    payload: Option<Payload>,
    state: TaskState,
    seq: u64,
    /// Bumped on every re-arm so older queue entries are recognised as stale.
    arm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    fire_at: GameTime,
    seq: u64,
    arm: u32,
    handle: TaskHandle,
}

enum CancelOutcome {
    Removed,
    /// The task is mid-fire; it is retired when its payload returns.
    Deferred,
    Missing,
}

/// Scheduling fields of a task that will be written to a save.
#[derive(Debug)]
pub(crate) struct SavedTask<'a> {
    pub owner: Option<Serial>,
    pub fire_at: GameTime,
    pub interval: Duration,
    pub remaining: Option<u32>,
    pub payload: &'a dyn TaskPayload,
}

// ---------------------------------------------------------------------------
// TickReport
// ---------------------------------------------------------------------------

/// What happened during one [`Scheduler::tick`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<TaskHandle>,
    pub rearmed: Vec<TaskHandle>,
    pub completed: Vec<TaskHandle>,
    pub cancelled: Vec<TaskHandle>,
}

impl TickReport {
    pub fn fired_count(&self) -> usize {
        self.fired.len()
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Access handed to a payload while it fires.
pub struct TaskContext<'a> {
    pub world: &'a mut World,
    scheduler: &'a mut Scheduler,
    handle: TaskHandle,
    owner: Option<Serial>,
    now: GameTime,
}

impl TaskContext<'_> {
    pub fn now(&self) -> GameTime {
        self.now
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn owner(&self) -> Option<Serial> {
        self.owner
    }

    /// Schedule follow-up work. It fires on a later tick at the earliest.
    pub fn schedule(&mut self, spec: TaskSpec) -> TaskHandle {
        self.scheduler.schedule(spec)
    }

    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        self.scheduler.cancel(handle)
    }

    /// Stop a repeating task from re-arming.
    pub fn cancel_self(&mut self) {
        self.scheduler.cancel(self.handle);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Priority queue of pending tasks.
#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: SlotMap<TaskHandle, Task>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    /// Queue entries whose task was cancelled before they came due.
    stale: usize,
    /// Terminal states of tasks retired since the last tick started.
    retired: SecondaryMap<TaskHandle, TaskState>,
    next_seq: u64,
}

/// Below this many stale entries the queue is never compacted.
const COMPACT_MIN: usize = 32;

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, spec: TaskSpec) -> TaskHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let remaining = match spec.repeat {
            Repeat::Times(n) => Some(n.clamp(1, MAX_REPEAT)),
            Repeat::Forever => None,
        };
        let interval = if spec.interval.is_zero() {
            Duration::ZERO
        } else {
            spec.interval.max(MIN_INTERVAL)
        };
        let fire_at = spec.fire_at;
        let handle = self.tasks.insert(Task {
            fire_at,
            interval,
            remaining,
            owner: spec.owner,
            payload: Some(spec.payload),
            state: TaskState::Pending,
            seq,
            arm: 0,
        });
        self.queue.push(Reverse(QueueEntry {
            fire_at,
            seq,
            arm: 0,
            handle,
        }));
        handle
    }

    pub fn schedule_once(&mut self, fire_at: GameTime, payload: Payload) -> TaskHandle {
        self.schedule(TaskSpec::once(fire_at, payload))
    }

    pub fn schedule_repeating(
        &mut self,
        first: GameTime,
        interval: Duration,
        repeat: Repeat,
        payload: Payload,
    ) -> TaskHandle {
        self.schedule(TaskSpec::repeating(first, interval, repeat, payload))
    }

    fn cancel_handle(&mut self, handle: TaskHandle) -> CancelOutcome {
        match self.tasks.get_mut(handle) {
            None => CancelOutcome::Missing,
            Some(task) if task.state == TaskState::Firing => {
                task.state = TaskState::Cancelled;
                CancelOutcome::Deferred
            }
            Some(_) => {
                self.tasks.remove(handle);
                self.retired.insert(handle, TaskState::Cancelled);
                self.stale += 1;
                self.compact_if_stale();
                CancelOutcome::Removed
            }
        }
    }

    /// Drop queue entries of cancelled tasks once they outnumber live ones.
    fn compact_if_stale(&mut self) {
        if self.stale < COMPACT_MIN || self.stale <= self.tasks.len() {
            return;
        }
        let tasks = &self.tasks;
        self.queue.retain(|Reverse(e)| {
            tasks
                .get(e.handle)
                .is_some_and(|t| t.arm == e.arm && t.state == TaskState::Pending)
        });
        log::trace!("compacted timer queue: {} stale entries dropped", self.stale);
        self.stale = 0;
    }

    /// Cancel a pending task. Returns `false` if the handle is stale.
    pub fn cancel(&mut self, handle: TaskHandle) -> bool {
        !matches!(self.cancel_handle(handle), CancelOutcome::Missing)
    }

    /// Cancel every task owned by `owner`. Returns the handles removed
    /// immediately; a task owned by `owner` that is currently firing is
    /// retired when it returns.
    pub fn cancel_owned(&mut self, owner: Serial) -> Vec<TaskHandle> {
        let owned: Vec<TaskHandle> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.owner == Some(owner))
            .map(|(h, _)| h)
            .collect();
        owned
            .into_iter()
            .filter(|h| matches!(self.cancel_handle(*h), CancelOutcome::Removed))
            .collect()
    }

    /// State of a live task, or the terminal state of one retired since the
    /// last tick started.
    pub fn state(&self, handle: TaskHandle) -> Option<TaskState> {
        match self.tasks.get(handle) {
            Some(t) => Some(t.state),
            None => self.retired.get(handle).copied(),
        }
    }

    /// Fires left, counting the next one.
    pub fn repeats_left(&self, handle: TaskHandle) -> Option<Repeat> {
        self.tasks
            .get(handle)
            .map(|t| t.remaining.map_or(Repeat::Forever, Repeat::Times))
    }

    pub fn fire_at(&self, handle: TaskHandle) -> Option<GameTime> {
        self.tasks.get(handle).map(|t| t.fire_at)
    }

    pub fn owner(&self, handle: TaskHandle) -> Option<Serial> {
        self.tasks.get(handle).and_then(|t| t.owner)
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.tasks.contains_key(handle)
    }

    /// Earliest deadline among pending tasks.
    pub fn next_deadline(&self) -> Option<GameTime> {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .map(|t| t.fire_at)
            .min()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Handles in registration order.
    pub fn handles(&self) -> Vec<TaskHandle> {
        let mut all: Vec<(u64, TaskHandle)> = self.tasks.iter().map(|(h, t)| (t.seq, h)).collect();
        all.sort_unstable();
        all.into_iter().map(|(_, h)| h).collect()
    }

    /// Persistent tasks in registration order.
    pub(crate) fn saved_tasks(&self) -> Vec<SavedTask<'_>> {
        self.handles()
            .into_iter()
            .filter_map(|h| {
                let task = self.tasks.get(h)?;
                match task.payload.as_ref()? {
                    Payload::Persistent(p) => Some(SavedTask {
                        owner: task.owner,
                        fire_at: task.fire_at,
                        interval: task.interval,
                        remaining: task.remaining,
                        payload: p.as_ref(),
                    }),
                    Payload::Transient(_) => None,
                }
            })
            .collect()
    }

    /// Fire every task due at `now`.
    ///
    /// Tasks fire in `(fire_at, registration order)` and each fires at most
    /// once per tick. Work scheduled while the tick runs waits for the next
    /// tick. Entities deleted by a payload have their owned tasks cancelled
    /// before those tasks can fire.
    pub fn tick(&mut self, now: GameTime, world: &mut World) -> TickReport {
        let mut report = TickReport::default();
        self.retired.clear();
        self.cascade_deletions(world, &mut report);

        let horizon = self.next_seq;
        let mut deferred = Vec::new();

        while let Some(Reverse(entry)) = self.queue.peek().copied() {
            if entry.fire_at > now {
                break;
            }
            self.queue.pop();

            let Some(task) = self.tasks.get_mut(entry.handle) else {
                self.stale = self.stale.saturating_sub(1);
                continue;
            };
            if task.arm != entry.arm || task.state != TaskState::Pending {
                continue;
            }
            if task.seq >= horizon {
                deferred.push(entry);
                continue;
            }
            if task.owner.is_some_and(|o| !world.contains(o)) {
                log::debug!(
                    "task {:?} dropped: owner {:?} no longer exists",
                    entry.handle,
                    task.owner
                );
                self.tasks.remove(entry.handle);
                self.retired.insert(entry.handle, TaskState::Cancelled);
                report.cancelled.push(entry.handle);
                continue;
            }
            let Some(mut payload) = task.payload.take() else {
                continue;
            };
            task.state = TaskState::Firing;
            let owner = task.owner;

            let mut ctx = TaskContext {
                world: &mut *world,
                scheduler: &mut *self,
                handle: entry.handle,
                owner,
                now,
            };
            payload.run(&mut ctx);
            report.fired.push(entry.handle);

            self.cascade_deletions(world, &mut report);
            if let Some(next) = self.retire_or_rearm(entry.handle, payload, now, &mut report) {
                if next.fire_at > now {
                    self.queue.push(Reverse(next));
                } else {
                    deferred.push(next);
                }
            }
        }

        for entry in deferred {
            self.queue.push(Reverse(entry));
        }
        report
    }

    fn cascade_deletions(&mut self, world: &mut World, report: &mut TickReport) {
        for serial in world.take_deleted() {
            report.cancelled.extend(self.cancel_owned(serial));
        }
    }

    /// Returns the queue entry of a re-armed task for the caller to enqueue.
    fn retire_or_rearm(
        &mut self,
        handle: TaskHandle,
        payload: Payload,
        now: GameTime,
        report: &mut TickReport,
    ) -> Option<QueueEntry> {
        let task = self.tasks.get_mut(handle)?;
        if task.state == TaskState::Cancelled {
            self.tasks.remove(handle);
            self.retired.insert(handle, TaskState::Cancelled);
            report.cancelled.push(handle);
            return None;
        }
        if let Some(left) = task.remaining.as_mut() {
            *left = left.saturating_sub(1);
        }
        if !task.interval.is_zero() && task.remaining != Some(0) {
            task.fire_at = now + task.interval;
            task.arm = task.arm.wrapping_add(1);
            task.state = TaskState::Pending;
            task.payload = Some(payload);
            report.rearmed.push(handle);
            Some(QueueEntry {
                fire_at: task.fire_at,
                seq: task.seq,
                arm: task.arm,
                handle,
            })
        } else {
            self.tasks.remove(handle);
            self.retired.insert(handle, TaskState::Completed);
            report.completed.push(handle);
            None
        }
    }
}
