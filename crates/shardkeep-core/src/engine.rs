//! The engine owns the world, the scheduler, and the clock that drives them.

use std::time::Duration;

use crate::clock::{Clock, DowntimePolicy, GameTime};
use crate::registry::TypeRegistry;
use crate::save::{self, LoadError, LoadReport, SaveError};
use crate::scheduler::{Scheduler, TaskHandle, TaskSpec, TickReport};
use crate::serial::Serial;
use crate::world::World;

/// A running shard.
#[derive(Debug)]
pub struct Engine {
    pub world: World,
    pub scheduler: Scheduler,
    clock: Box<dyn Clock>,
}

impl Engine {
    /// Create an empty engine driven by `clock`.
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            world: World::new(),
            scheduler: Scheduler::new(),
            clock: Box::new(clock),
        }
    }

    pub fn now(&self) -> GameTime {
        self.clock.now()
    }

    /// Install every registered singleton that is not present yet.
    pub fn install_default_singletons(&mut self, registry: &TypeRegistry) {
        for singleton in registry.singletons() {
            if !self.world.has_singleton(singleton.name) {
                self.world
                    .install_singleton(singleton.name, singleton.construct());
            }
        }
    }

    /// Fire every task due at the clock's current time.
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let report = self.scheduler.tick(now, &mut self.world);
        if !report.fired.is_empty() {
            log::trace!("tick at {now}: {} task(s) fired", report.fired.len());
        }
        report
    }

    pub fn schedule(&mut self, spec: TaskSpec) -> TaskHandle {
        self.scheduler.schedule(spec)
    }

    /// Schedule `spec` to fire `delay` from now.
    pub fn schedule_in(&mut self, delay: Duration, mut spec: TaskSpec) -> TaskHandle {
        spec.fire_at = self.clock.now() + delay;
        self.scheduler.schedule(spec)
    }

    /// Delete an entity with its contents and cancel every task they own.
    pub fn delete_entity(&mut self, serial: Serial) -> Vec<Serial> {
        let removed = self.world.delete(serial);
        for s in self.world.take_deleted() {
            self.scheduler.cancel_owned(s);
        }
        removed
    }

    /// Capture the world and all persistent tasks.
    pub fn save(&self) -> Result<Vec<u8>, SaveError> {
        save::write_save(
            &self.world,
            &self.scheduler,
            self.clock.now(),
            self.clock.wall_millis(),
        )
    }

    /// Build an engine from a save.
    ///
    /// `policy` decides whether real-world time spent offline counts against
    /// saved deadlines. On failure nothing is returned; a caller holding a
    /// running engine keeps it as it was.
    pub fn load(
        data: &[u8],
        registry: &TypeRegistry,
        clock: impl Clock + 'static,
        policy: DowntimePolicy,
    ) -> Result<(Engine, LoadReport), LoadError> {
        let now = clock.now();
        let wall = clock.wall_millis();
        match save::read_save(data, registry, now, |saved| policy.downtime(saved, wall)) {
            Ok(loaded) => {
                let report = loaded.report;
                log::info!(
                    "loaded {} entities, {} singletons, {} tasks ({} spawned); {} dangling, {} deleted, downtime {:?}",
                    report.entities,
                    report.singletons,
                    report.tasks_restored,
                    report.tasks_spawned,
                    report.dangling_refs,
                    report.deleted.len(),
                    report.downtime,
                );
                let engine = Engine {
                    world: loaded.world,
                    scheduler: loaded.scheduler,
                    clock: Box::new(clock),
                };
                Ok((engine, report))
            }
            Err(e) => {
                log::error!("load failed: {e}");
                Err(e)
            }
        }
    }
}
