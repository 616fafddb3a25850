//! Render context
//!
//! The shared state a host wires into its connection handlers and its
//! simulation thread.

use std::sync::Arc;
use std::time::Duration;

use glam::Vec3;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::RenderConfig;
use crate::error::{ModelError, Result};
use crate::model::ModelStore;
use crate::net::channel::ViewerChannel;
use crate::net::viewer::{Viewer, ViewerManager};
use crate::protocol::adapter::{select_adapter, ProtocolAdapter};
use crate::reload::{ReloadPool, ReloadReport};
use crate::render::registry::TrackerRegistry;
use crate::render::tracker::{BonePredicate, Tracker, TrackerAction, TrackerSettings};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::skin::{MemoryResolver, ProfileKey, ProfileResolver, SkinService};
use crate::world::ModelWorld;

/// State shared across connections and the simulation loop
pub struct RenderContext {
    pub config: RenderConfig,
    pub adapter: Arc<dyn ProtocolAdapter>,
    pub models: ModelStore,
    pub registry: Arc<TrackerRegistry>,
    pub viewers: Arc<ViewerManager>,
    pub scheduler: Arc<Scheduler>,
    pub skins: Arc<SkinService>,
    pub reload: ReloadPool,
    pub world: Arc<ModelWorld>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl RenderContext {
    /// Build a context with an in-memory skin resolver
    pub fn new(config: RenderConfig, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        Self::with_resolver(config, shutdown_tx, Arc::new(MemoryResolver::new()))
    }

    /// Build a context around a host-supplied profile resolver
    pub fn with_resolver(
        config: RenderConfig,
        shutdown_tx: broadcast::Sender<()>,
        resolver: Arc<dyn ProfileResolver>,
    ) -> Result<Self> {
        config.validate().map_err(|e| crate::error::RigError::Config(e.to_string()))?;

        let adapter = select_adapter(config.protocol_revision)?;
        let registry = Arc::new(TrackerRegistry::new(
            adapter.clone(),
            TrackerSettings::from_config(&config),
        ));
        let viewers = Arc::new(ViewerManager::new());
        let scheduler = Arc::new(Scheduler::new(tokio::runtime::Handle::try_current().ok()));
        let skins = Arc::new(SkinService::new(
            resolver,
            Duration::from_millis(config.skin_lookup_timeout_ms),
            &config.fallback_skin_url,
        ));
        let reload = ReloadPool::new(&config);
        let world = Arc::new(ModelWorld::new(
            registry.clone(),
            viewers.clone(),
            scheduler.clone(),
            Duration::from_millis(config.tick_rate_ms),
        ));

        info!(
            revision = adapter.revision(),
            reload_threads = reload.threads(),
            reload_available = reload.is_available(),
            "Render context initialized"
        );

        Ok(Self {
            config,
            adapter,
            models: ModelStore::new(),
            registry,
            viewers,
            scheduler,
            skins,
            reload,
            world,
            shutdown_tx,
        })
    }

    /// Reload every definition under the configured model directory
    pub fn reload_models(&self) -> Result<ReloadReport> {
        Ok(self.reload.reload(&self.config.model_dir, &self.models)?)
    }

    /// Register a viewer and install its packet channel
    pub fn connect_viewer(&self, viewer: Viewer) -> Result<ViewerChannel> {
        let viewer = self.viewers.register(viewer)?;
        Ok(ViewerChannel::new(
            viewer,
            self.registry.clone(),
            self.scheduler.clone(),
            &self.config,
        ))
    }

    /// Tear down a viewer's channel and forget the viewer
    pub fn disconnect_viewer(&self, channel: &ViewerChannel) -> usize {
        let released = channel.on_disconnect();
        self.viewers.remove(channel.viewer().uuid);
        released
    }

    /// Place a free-floating model by name
    pub fn spawn_dummy(
        &self,
        model: &str,
        location: Vec3,
        yaw: f32,
        view_distance: Option<f32>,
    ) -> Result<Arc<Tracker>> {
        let skeleton = self
            .models
            .get(model)
            .ok_or_else(|| ModelError::UnknownModel(model.to_string()))?;
        let tracker = self.registry.create_dummy(skeleton, location, yaw);
        if let Some(distance) = view_distance {
            tracker.set_view_distance(self.config.clamp_view_distance(distance));
        }
        Ok(tracker)
    }

    /// Resolve a skin off the simulation thread, then apply it on the next tick
    pub fn apply_skin(
        &self,
        tracker: &Arc<Tracker>,
        profile: ProfileKey,
        predicate: BonePredicate,
    ) -> TaskHandle {
        let skins = self.skins.clone();
        let scheduler = self.scheduler.clone();
        let tracker = tracker.clone();
        self.scheduler.run_async(async move {
            let texture = skins.lookup(profile).await;
            let owner = tracker.clone();
            scheduler.run_later_for(&owner, 0, move || {
                tracker.update(TrackerAction::Skin(texture), &predicate);
            });
        })
    }

    /// Close every tracker, stop scheduling and drop every viewer
    pub fn shutdown(&self) -> usize {
        let _ = self.shutdown_tx.send(());
        self.world.stop();
        let closed = self.registry.close_all("shutdown");
        self.scheduler.shutdown();
        self.viewers.disconnect_all();
        info!(closed, "Render context shut down");
        closed
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("revision", &self.adapter.revision())
            .field("models", &self.models.len())
            .field("trackers", &self.registry.len())
            .field("viewers", &self.viewers.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoneSpec, SkeletonBuilder, VisualRef};
    use crate::net::viewer::RecordingSink;
    use crate::error::RigError;
    use uuid::Uuid;

    fn context() -> RenderContext {
        let (tx, _) = broadcast::channel(1);
        let context = RenderContext::new(RenderConfig::default(), tx).unwrap();
        context.models.insert(
            SkeletonBuilder::new("lamp")
                .bone(BoneSpec::new("base").visual(VisualRef::new("paper", 1)))
                .build()
                .unwrap(),
        );
        context
    }

    #[test]
    fn test_unsupported_revision_is_rejected() {
        let (tx, _) = broadcast::channel(1);
        let config = RenderConfig {
            protocol_revision: 1,
            ..RenderConfig::default()
        };
        assert!(matches!(
            RenderContext::new(config, tx),
            Err(RigError::Protocol(_))
        ));
    }

    #[test]
    fn test_spawn_dummy_clamps_view_distance() {
        let context = context();
        let tracker = context
            .spawn_dummy("lamp", Vec3::ZERO, 0.0, Some(500.0))
            .unwrap();
        assert_eq!(tracker.view_distance(), context.config.max_view_distance);

        let err = context.spawn_dummy("missing", Vec3::ZERO, 0.0, None);
        assert!(matches!(err, Err(RigError::Model(ModelError::UnknownModel(_)))));
    }

    #[tokio::test]
    async fn test_apply_skin_lands_on_next_tick() {
        let context = context();
        let tracker = context.spawn_dummy("lamp", Vec3::ZERO, 0.0, None).unwrap();
        let handle = context.apply_skin(
            &tracker,
            ProfileKey::Name("Nobody".to_string()),
            BonePredicate::All,
        );
        assert!(!handle.is_cancelled());

        for _ in 0..50 {
            if context.scheduler.pending() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(context.scheduler.pending(), 1);
        assert_eq!(context.world.step().tasks, 1);
    }

    #[test]
    fn test_connect_and_shutdown() {
        let context = context();
        let viewer = Viewer::new(Uuid::new_v4(), 7, "alice", Arc::new(RecordingSink::new()));
        let channel = context.connect_viewer(viewer).unwrap();
        assert_eq!(context.viewers.count(), 1);

        context.spawn_dummy("lamp", Vec3::ZERO, 0.0, None).unwrap();
        assert_eq!(context.shutdown(), 1);
        assert!(context.registry.is_empty());
        assert!(!channel.viewer().is_connected());
    }
}
