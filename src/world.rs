//! Simulation loop
//!
//! Drives the render core at a fixed rate:
//! - Drains scheduled sync tasks
//! - Ticks every tracker, isolating panics to the tracker that raised them
//! - Drops closed trackers from the registry

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::net::viewer::ViewerManager;
use crate::render::registry::TrackerRegistry;
use crate::render::tracker::TickContext;
use crate::scheduler::Scheduler;

/// Ticks between milestone log lines
const MILESTONE_TICKS: u64 = 1000;

/// Result of one simulation step
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub tick: u64,
    pub tasks: usize,
    pub trackers: usize,
    pub panicked: usize,
    pub purged: usize,
}

/// Fixed-rate driver for trackers and scheduled work
pub struct ModelWorld {
    registry: Arc<TrackerRegistry>,
    viewers: Arc<ViewerManager>,
    scheduler: Arc<Scheduler>,
    tick_rate: Duration,
    tick: AtomicU64,
    running: AtomicBool,
    start_time: RwLock<Option<Instant>>,
}

impl ModelWorld {
    pub fn new(
        registry: Arc<TrackerRegistry>,
        viewers: Arc<ViewerManager>,
        scheduler: Arc<Scheduler>,
        tick_rate: Duration,
    ) -> Self {
        Self {
            registry,
            viewers,
            scheduler,
            tick_rate,
            tick: AtomicU64::new(0),
            running: AtomicBool::new(false),
            start_time: RwLock::new(None),
        }
    }

    /// Ticks processed so far
    pub fn tick(&self) -> u64 {
        self.tick.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask a running loop to exit at its next tick
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time
            .read()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Run until shutdown is signalled or `stop` is called
    pub async fn run(&self, shutdown_rx: &mut broadcast::Receiver<()>) {
        info!(
            tick_rate_ms = self.tick_rate.as_millis() as u64,
            "Starting simulation loop"
        );
        self.running.store(true, Ordering::SeqCst);
        *self.start_time.write() = Some(Instant::now());

        let mut tick_interval = interval(self.tick_rate);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    if !self.is_running() {
                        break;
                    }
                    self.step();
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(
            total_ticks = self.tick(),
            uptime_secs = self.uptime_secs(),
            "Simulation loop stopped"
        );
    }

    /// Process a single tick
    pub fn step(&self) -> TickSummary {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) + 1;
        let tasks = self.scheduler.tick(tick);

        let viewers = self.viewers.viewers();
        let ctx = TickContext {
            tick,
            dt: self.tick_rate.as_secs_f32(),
            viewers: &viewers,
        };

        let mut summary = TickSummary {
            tick,
            tasks,
            ..TickSummary::default()
        };
        for tracker in self.registry.trackers() {
            match catch_unwind(AssertUnwindSafe(|| tracker.tick(&ctx))) {
                Ok(true) => summary.trackers += 1,
                Ok(false) => {}
                Err(_) => {
                    summary.panicked += 1;
                    error!(
                        tracker_id = tracker.id().0,
                        model = %tracker.model_name(),
                        tick,
                        "Tracker panicked during tick, closing it"
                    );
                    self.registry.close(tracker.id(), "panic");
                }
            }
        }
        summary.purged = self.registry.purge_closed();

        if tick % MILESTONE_TICKS == 0 {
            debug!(
                tick,
                trackers = self.registry.len(),
                viewers = viewers.len(),
                "Simulation milestone"
            );
        }
        summary
    }
}

impl std::fmt::Debug for ModelWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelWorld")
            .field("tick", &self.tick())
            .field("running", &self.is_running())
            .field("trackers", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoneSpec, SkeletonBuilder, VisualRef};
    use crate::protocol::adapter::select_adapter;
    use crate::render::tracker::TrackerSettings;
    use glam::Vec3;
    use std::sync::atomic::AtomicUsize;

    fn world() -> ModelWorld {
        let adapter = select_adapter(767).unwrap();
        let registry = Arc::new(TrackerRegistry::new(adapter, TrackerSettings::default()));
        ModelWorld::new(
            registry,
            Arc::new(ViewerManager::new()),
            Arc::new(Scheduler::default()),
            Duration::from_millis(50),
        )
    }

    fn skeleton() -> Arc<crate::model::Skeleton> {
        Arc::new(
            SkeletonBuilder::new("lamp")
                .bone(BoneSpec::new("base").visual(VisualRef::new("paper", 1)))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_step_runs_tasks_and_trackers() {
        let world = world();
        world.registry.create_dummy(skeleton(), Vec3::ZERO, 0.0);

        let count = Arc::new(AtomicUsize::new(0));
        let shared = count.clone();
        world.scheduler.run_sync(move || {
            shared.fetch_add(1, Ordering::SeqCst);
        });

        let summary = world.step();
        assert_eq!(summary.tick, 1);
        assert_eq!(summary.tasks, 1);
        assert_eq!(summary.trackers, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(world.tick(), 1);
    }

    #[test]
    fn test_closed_trackers_are_purged() {
        let world = world();
        let tracker = world.registry.create_dummy(skeleton(), Vec3::ZERO, 0.0);
        world.registry.close(tracker.id(), "test");

        let summary = world.step();
        assert_eq!(summary.trackers, 0);
        assert!(world.registry.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let world = Arc::new(world());
        let (tx, _) = broadcast::channel::<()>(1);
        let mut rx = tx.subscribe();

        let runner = world.clone();
        let handle = tokio::spawn(async move { runner.run(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(!world.is_running());
        assert!(world.tick() >= 1);
    }
}
