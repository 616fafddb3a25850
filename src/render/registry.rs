//! Tracker registry
//!
//! Process-wide lookup from tracker, entity, uuid, hitbox and rider ids to
//! live trackers. Viewer channels read it from network threads; the
//! simulation thread writes it. The registry indexes trackers by id and
//! never owns their proxies.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use glam::Vec3;
use tracing::{debug, info};
use uuid::Uuid;

use super::mount::MountController;
use super::tracker::{Tracker, TrackerId, TrackerSettings, TrackerSource};
use crate::entity::EntityHandle;
use crate::model::Skeleton;
use crate::net::viewer::Viewer;
use crate::protocol::adapter::ProtocolAdapter;

/// First id handed to synthetic entities, far above host entity ids
pub const FIRST_SYNTHETIC_ENTITY_ID: i32 = 0x3f00_0000;

/// Hands out entity ids for proxies
#[derive(Debug)]
pub struct EntityIdAllocator {
    next: AtomicI32,
}

impl EntityIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_SYNTHETIC_ENTITY_ID)
    }

    pub fn starting_at(first: i32) -> Self {
        Self {
            next: AtomicI32::new(first),
        }
    }

    /// Next unused id
    pub fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EntityIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent tracker registry
pub struct TrackerRegistry {
    adapter: Arc<dyn ProtocolAdapter>,
    settings: TrackerSettings,
    allocator: Arc<EntityIdAllocator>,
    next_id: AtomicU64,
    trackers: DashMap<TrackerId, Arc<Tracker>>,
    by_entity: DashMap<i32, TrackerId>,
    by_uuid: DashMap<Uuid, TrackerId>,
    by_hitbox: DashMap<i32, TrackerId>,
    by_rider: DashMap<i32, TrackerId>,
}

impl TrackerRegistry {
    pub fn new(adapter: Arc<dyn ProtocolAdapter>, settings: TrackerSettings) -> Self {
        Self {
            adapter,
            settings,
            allocator: Arc::new(EntityIdAllocator::new()),
            next_id: AtomicU64::new(1),
            trackers: DashMap::new(),
            by_entity: DashMap::new(),
            by_uuid: DashMap::new(),
            by_hitbox: DashMap::new(),
            by_rider: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn adapter(&self) -> &Arc<dyn ProtocolAdapter> {
        &self.adapter
    }

    fn next_tracker_id(&self) -> TrackerId {
        TrackerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn build(&self, skeleton: Arc<Skeleton>, source: TrackerSource) -> Arc<Tracker> {
        Arc::new(Tracker::new(
            self.next_tracker_id(),
            skeleton,
            source,
            self.adapter.clone(),
            self.allocator.clone(),
            self.settings.clone(),
        ))
    }

    // ============ Creation ============

    /// Attach a model to an entity, replacing any model it already had
    pub fn create_entity_tracker(
        &self,
        skeleton: Arc<Skeleton>,
        entity: Arc<dyn EntityHandle>,
    ) -> Arc<Tracker> {
        let entity_id = entity.entity_id();
        if let Some(previous) = self.by_entity(entity_id) {
            self.close(previous.id(), "replaced");
        }

        let uuid = entity.uuid();
        let tracker = self.build(skeleton, TrackerSource::Entity(entity));
        let id = tracker.id();
        self.trackers.insert(id, tracker.clone());
        self.by_entity.insert(entity_id, id);
        self.by_uuid.insert(uuid, id);
        info!(tracker_id = id.0, model = %tracker.model_name(), entity_id, "Entity tracker created");
        tracker
    }

    /// Place a free-floating model
    pub fn create_dummy(&self, skeleton: Arc<Skeleton>, location: Vec3, yaw: f32) -> Arc<Tracker> {
        let tracker = self.build(skeleton, TrackerSource::Dummy { location, yaw });
        let id = tracker.id();
        self.trackers.insert(id, tracker.clone());
        info!(tracker_id = id.0, model = %tracker.model_name(), ?location, "Dummy tracker created");
        tracker
    }

    // ============ Lookup ============

    pub fn get(&self, id: TrackerId) -> Option<Arc<Tracker>> {
        self.trackers.get(&id).map(|entry| entry.clone())
    }

    fn resolve(&self, id: Option<TrackerId>) -> Option<Arc<Tracker>> {
        id.and_then(|id| self.get(id))
    }

    /// Tracker rendering a host entity
    pub fn by_entity(&self, entity_id: i32) -> Option<Arc<Tracker>> {
        self.resolve(self.by_entity.get(&entity_id).map(|entry| *entry))
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<Arc<Tracker>> {
        self.resolve(self.by_uuid.get(&uuid).map(|entry| *entry))
    }

    /// Tracker owning a hitbox entity
    pub fn by_hitbox(&self, hitbox: i32) -> Option<Arc<Tracker>> {
        self.resolve(self.by_hitbox.get(&hitbox).map(|entry| *entry))
    }

    /// Tracker whose hitbox carries a rider
    pub fn by_rider(&self, rider: i32) -> Option<Arc<Tracker>> {
        self.resolve(self.by_rider.get(&rider).map(|entry| *entry))
    }

    pub fn is_hitbox(&self, entity_id: i32) -> bool {
        self.by_hitbox.contains_key(&entity_id)
    }

    pub fn trackers(&self) -> Vec<Arc<Tracker>> {
        self.trackers.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    // ============ Hitboxes ============

    /// Create a bone's hitbox and index it
    pub fn create_hitbox(
        &self,
        id: TrackerId,
        bone: &str,
        controller: Option<Arc<MountController>>,
    ) -> Option<i32> {
        let tracker = self.get(id)?;
        let hitbox = tracker.create_hitbox(bone, controller)?;
        self.by_hitbox.insert(hitbox, id);
        Some(hitbox)
    }

    /// Seat a rider; a rider sits on at most one hitbox
    pub fn mount(&self, hitbox: i32, rider: i32) -> bool {
        if self.by_rider.contains_key(&rider) {
            return false;
        }
        let tracker = match self.by_hitbox(hitbox) {
            Some(tracker) => tracker,
            None => return false,
        };
        if !tracker.mount(hitbox, rider) {
            return false;
        }
        self.by_rider.insert(rider, tracker.id());
        true
    }

    /// Explicit dismount; always succeeds when someone is riding
    pub fn dismount(&self, hitbox: i32) -> Option<i32> {
        let rider = self.by_hitbox(hitbox)?.dismount(hitbox)?;
        self.by_rider.remove(&rider);
        Some(rider)
    }

    /// Rider-initiated dismount, subject to the controller's veto
    pub fn dismount_by_rider(&self, rider: i32) -> bool {
        let tracker = match self.by_rider(rider) {
            Some(tracker) => tracker,
            None => return false,
        };
        if !tracker.try_dismount_by_rider(rider) {
            return false;
        }
        self.by_rider.remove(&rider);
        true
    }

    // ============ Removal ============

    fn unregister(&self, id: TrackerId) -> Option<Arc<Tracker>> {
        let (_, tracker) = self.trackers.remove(&id)?;
        self.by_entity.retain(|_, tracker_id| *tracker_id != id);
        self.by_uuid.retain(|_, tracker_id| *tracker_id != id);
        self.by_hitbox.retain(|_, tracker_id| *tracker_id != id);
        self.by_rider.retain(|_, tracker_id| *tracker_id != id);
        Some(tracker)
    }

    /// Close and forget a tracker
    pub fn close(&self, id: TrackerId, reason: &str) -> bool {
        match self.unregister(id) {
            Some(tracker) => tracker.close(reason),
            None => false,
        }
    }

    /// Drop trackers that closed themselves
    pub fn purge_closed(&self) -> usize {
        let closed: Vec<TrackerId> = self
            .trackers
            .iter()
            .filter(|entry| entry.value().is_closed())
            .map(|entry| *entry.key())
            .collect();
        for id in &closed {
            self.unregister(*id);
        }
        closed.len()
    }

    /// The host removed an entity
    pub fn remove_entity(&self, entity_id: i32) -> bool {
        if let Some(tracker) = self.by_rider(entity_id) {
            if let Some(hitbox) = tracker.hitbox_of_rider(entity_id) {
                self.dismount(hitbox);
            }
        }
        match self.by_entity(entity_id) {
            Some(tracker) => self.close(tracker.id(), "entity removed"),
            None => false,
        }
    }

    /// Forget a disconnected viewer everywhere. Returns the trackers touched.
    pub fn remove_viewer(&self, viewer: &Viewer) -> usize {
        if let Some(tracker) = self.by_rider(viewer.entity_id) {
            if let Some(hitbox) = tracker.hitbox_of_rider(viewer.entity_id) {
                self.dismount(hitbox);
            }
        }
        let removed = self
            .trackers
            .iter()
            .filter(|entry| entry.value().remove_viewer(viewer.uuid))
            .count();
        debug!(viewer = %viewer.uuid, trackers = removed, "Viewer removed from trackers");
        removed
    }

    /// Close every tracker
    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<TrackerId> = self.trackers.iter().map(|entry| *entry.key()).collect();
        let closed = ids.into_iter().filter(|id| self.close(*id, reason)).count();
        info!(closed, reason, "Closed all trackers");
        closed
    }
}

impl std::fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("trackers", &self.trackers.len())
            .field("hitboxes", &self.by_hitbox.len())
            .field("riders", &self.by_rider.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::BasicEntity;
    use crate::model::{Aabb, BoneSpec, SkeletonBuilder, VisualRef};
    use crate::net::viewer::RecordingSink;
    use crate::protocol::adapter::select_adapter;

    fn registry() -> TrackerRegistry {
        TrackerRegistry::new(select_adapter(767).unwrap(), TrackerSettings::default())
    }

    fn skeleton() -> Arc<Skeleton> {
        Arc::new(
            SkeletonBuilder::new("horse")
                .bone(
                    BoneSpec::new("saddle")
                        .visual(VisualRef::new("paper", 7))
                        .hitbox(Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))),
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_allocator_is_monotonic() {
        let allocator = EntityIdAllocator::starting_at(100);
        assert_eq!(allocator.next(), 100);
        assert_eq!(allocator.next(), 101);
    }

    #[test]
    fn test_entity_lookup() {
        let registry = registry();
        let entity = Arc::new(BasicEntity::new(3, Uuid::new_v4(), Vec3::ZERO));
        let tracker = registry.create_entity_tracker(skeleton(), entity.clone());

        assert_eq!(registry.by_entity(3).unwrap().id(), tracker.id());
        assert_eq!(registry.by_uuid(entity.uuid()).unwrap().id(), tracker.id());
        assert!(registry.by_entity(4).is_none());

        // Re-attaching closes the previous model
        let replacement = registry.create_entity_tracker(skeleton(), entity);
        assert!(tracker.is_closed());
        assert_eq!(registry.by_entity(3).unwrap().id(), replacement.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_mount_indexes_rider() {
        let registry = registry();
        let entity = Arc::new(BasicEntity::new(3, Uuid::new_v4(), Vec3::ZERO));
        let tracker = registry.create_entity_tracker(skeleton(), entity);
        let hitbox = registry.create_hitbox(tracker.id(), "saddle", None).unwrap();

        assert!(registry.is_hitbox(hitbox));
        assert!(registry.mount(hitbox, 42));
        assert!(!registry.mount(hitbox, 43));
        assert_eq!(registry.by_rider(42).unwrap().id(), tracker.id());

        assert!(registry.dismount_by_rider(42));
        assert!(registry.by_rider(42).is_none());
    }

    #[test]
    fn test_close_removes_indexes() {
        let registry = registry();
        let entity = Arc::new(BasicEntity::new(3, Uuid::new_v4(), Vec3::ZERO));
        let tracker = registry.create_entity_tracker(skeleton(), entity);
        let hitbox = registry.create_hitbox(tracker.id(), "saddle", None).unwrap();
        registry.mount(hitbox, 42);

        assert!(registry.remove_entity(3));
        assert!(registry.is_empty());
        assert!(registry.by_hitbox(hitbox).is_none());
        assert!(registry.by_rider(42).is_none());
        assert!(!registry.close(tracker.id(), "again"));
    }

    #[test]
    fn test_remove_viewer() {
        let registry = registry();
        let dummy = registry.create_dummy(skeleton(), Vec3::ZERO, 0.0);
        let sink = Arc::new(RecordingSink::new());
        let viewer = Arc::new(Viewer::new(Uuid::new_v4(), 50, "alex", sink));
        dummy.show(&viewer);

        assert_eq!(registry.remove_viewer(&viewer), 1);
        assert_eq!(dummy.viewer_count(), 0);
        assert_eq!(registry.close_all("shutdown"), 1);
    }
}
