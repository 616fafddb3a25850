//! Trackers
//!
//! A tracker is one live instance of a skeleton: its animation state, the
//! proxies that draw and collide for it, and what every viewer has been
//! shown. Lifecycle runs `Active -> Closing -> Closed`.
//!
//! Threading:
//! - `tick`, `animate`, `update`, hitbox mutation and `close` run on the
//!   simulation thread and serialize on the core lock.
//! - Per-viewer state lives in a concurrent map that viewer channels read
//!   and write from network threads without touching the core lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use glam::{Quat, Vec3};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::flags::ProxyFlags;
use super::hitbox::{BodyState, DamageOutcome, HitBoxListener, HitBoxProxy};
use super::mount::{MountController, RiderInput};
use super::proxy::RenderProxy;
use super::registry::EntityIdAllocator;
use crate::config::RenderConfig;
use crate::entity::EntityHandle;
use crate::model::{
    sample, AnimationClip, BoneDelta, BoneId, LoopMode, PlaybackStatus, Skeleton,
};
use crate::net::bundle::PacketBundle;
use crate::net::viewer::Viewer;
use crate::protocol::adapter::ProtocolAdapter;
use crate::protocol::packets::{
    shared_flags, ClientboundPacket, EquipmentSlot, ItemStack, MetadataEntry,
};
use crate::skin::SkinTexture;

/// Process-unique tracker id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(pub u64);

impl fmt::Display for TrackerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Tracker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Active = 0,
    Closing = 1,
    Closed = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Active,
            1 => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }
}

/// What a tracker is anchored to
#[derive(Clone)]
pub enum TrackerSource {
    /// A host entity; proxies ride it
    Entity(Arc<dyn EntityHandle>),
    /// A free-floating location
    Dummy { location: Vec3, yaw: f32 },
}

impl fmt::Debug for TrackerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerSource::Entity(entity) => f
                .debug_tuple("Entity")
                .field(&entity.entity_id())
                .finish(),
            TrackerSource::Dummy { location, yaw } => f
                .debug_struct("Dummy")
                .field("location", location)
                .field("yaw", yaw)
                .finish(),
        }
    }
}

/// Parts of the source entity a viewer must not see raw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HideOptions {
    pub equipment: bool,
    pub fire: bool,
    pub glowing: bool,
    pub visibility: bool,
}

impl Default for HideOptions {
    fn default() -> Self {
        Self {
            equipment: true,
            fire: true,
            glowing: true,
            visibility: true,
        }
    }
}

impl HideOptions {
    /// Nothing hidden
    pub const NONE: Self = Self {
        equipment: false,
        fire: false,
        glowing: false,
        visibility: false,
    };

    /// Rewrite a shared flags byte
    pub fn mask_shared_flags(&self, flags: i8) -> i8 {
        let mut flags = flags;
        if self.visibility {
            flags |= shared_flags::INVISIBLE;
        }
        if self.fire {
            flags &= !shared_flags::ON_FIRE;
        }
        if self.glowing {
            flags &= !shared_flags::GLOWING;
        }
        flags
    }
}

/// How a clip should be played
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationModifier {
    /// Playback rate multiplier
    pub speed: f32,
    /// Overrides the clip's own loop mode
    pub loop_mode: Option<LoopMode>,
    /// Seconds into the clip to start at
    pub start_offset: f32,
    /// Crossfade length; the configured lerp frames when unset
    pub blend_ticks: Option<u32>,
}

impl Default for AnimationModifier {
    fn default() -> Self {
        Self {
            speed: 1.0,
            loop_mode: None,
            start_offset: 0.0,
            blend_ticks: None,
        }
    }
}

impl AnimationModifier {
    pub fn speed(mut self, speed: f32) -> Self {
        self.speed = if speed.is_finite() { speed } else { 1.0 };
        self
    }

    pub fn loop_mode(mut self, loop_mode: LoopMode) -> Self {
        self.loop_mode = Some(loop_mode);
        self
    }

    pub fn start_offset(mut self, seconds: f32) -> Self {
        self.start_offset = seconds.max(0.0);
        self
    }

    pub fn blend_ticks(mut self, ticks: u32) -> Self {
        self.blend_ticks = Some(ticks);
        self
    }
}

/// The clip currently playing
#[derive(Debug, Clone)]
pub struct AnimationState {
    pub clip: Arc<AnimationClip>,
    pub elapsed: f32,
    pub speed: f32,
    pub loop_mode: LoopMode,
}

/// Linear blend from a frozen pose to whatever is playing
#[derive(Debug, Clone)]
struct Crossfade {
    from: Vec<BoneDelta>,
    remaining: u32,
    total: u32,
}

/// One-off mutation applied to matching bones
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerAction {
    Tint(Option<u32>),
    Glow { enabled: bool, color: i32 },
    Brightness(Option<u8>),
    Visibility(bool),
    /// Swap the displayed item; `None` restores the bone's own
    Item(Option<ItemStack>),
    Skin(SkinTexture),
}

impl TrackerAction {
    fn apply(&self, proxy: &mut RenderProxy) {
        match self {
            TrackerAction::Tint(tint) => proxy.set_tint(*tint),
            TrackerAction::Glow { enabled, color } => proxy.set_glow(*enabled, *color),
            TrackerAction::Brightness(level) => proxy.set_brightness(*level),
            TrackerAction::Visibility(visible) => proxy.set_visible(*visible),
            TrackerAction::Item(item) => proxy.set_item(item.clone()),
            TrackerAction::Skin(skin) => proxy.set_skin(skin.clone()),
        }
    }
}

/// Which bones an action applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BonePredicate {
    Exact(String),
    Contains(String),
    /// The named bone and all of its descendants
    Tree(String),
    All,
}

impl BonePredicate {
    /// Matching bone ids in hierarchy order
    pub fn resolve(&self, skeleton: &Skeleton) -> Vec<BoneId> {
        match self {
            BonePredicate::Exact(name) => skeleton.find(name).into_iter().collect(),
            BonePredicate::Contains(part) => skeleton
                .bones()
                .iter()
                .filter(|bone| bone.name.contains(part.as_str()))
                .map(|bone| bone.id)
                .collect(),
            BonePredicate::Tree(name) => skeleton
                .find(name)
                .map(|id| skeleton.descendants(id))
                .unwrap_or_default(),
            BonePredicate::All => skeleton.bones().iter().map(|bone| bone.id).collect(),
        }
    }
}

/// What one viewer has been shown of a tracker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewerState {
    /// Proxies are live on the viewer's client
    pub spawned: bool,
    /// Tick at which proxies go out
    pub spawn_due: Option<u64>,
    /// Tick at which the passenger splice goes out
    pub passengers_due: Option<u64>,
    /// Explicitly hidden from this viewer
    pub hidden: bool,
    pub hide_override: Option<HideOptions>,
    /// Real equipment withheld from the viewer
    pub last_equipment: Vec<(EquipmentSlot, Option<ItemStack>)>,
}

impl ViewerState {
    fn pending(due: u64) -> Self {
        Self {
            spawn_due: Some(due),
            ..Self::default()
        }
    }
}

struct ViewerEntry {
    viewer: Arc<Viewer>,
    state: ViewerState,
}

/// Per-tick input from the simulation loop
pub struct TickContext<'a> {
    pub tick: u64,
    /// Step length in seconds
    pub dt: f32,
    /// Connected viewers, for range-based visibility
    pub viewers: &'a [Arc<Viewer>],
}

/// Knobs a tracker reads from configuration
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub lerp_frames: u32,
    pub hide_delay_ticks: u32,
    pub view_distance: f32,
    pub bundle_max_items: usize,
    pub default_mount: Arc<MountController>,
}

impl TrackerSettings {
    pub fn from_config(config: &RenderConfig) -> Self {
        let default_mount = MountController::builtin(&config.default_mount).unwrap_or_else(|| {
            warn!(mount = %config.default_mount, "Unknown default mount, using walk");
            MountController::walk()
        });
        Self {
            lerp_frames: config.lerp_frames,
            hide_delay_ticks: config.hide_delay_ticks,
            view_distance: config.max_view_distance,
            bundle_max_items: config.bundle_max_items,
            default_mount: Arc::new(default_mount),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from_config(&RenderConfig::default())
    }
}

struct TrackerCore {
    proxies: Vec<RenderProxy>,
    proxy_index: HashMap<BoneId, usize>,
    hitboxes: HashMap<BoneId, HitBoxProxy>,
    animation: Option<AnimationState>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
    crossfade: Option<Crossfade>,
    locked: bool,
    last_deltas: Vec<BoneDelta>,
    location: Vec3,
    yaw: f32,
    moved: bool,
    /// One-off packets for every spawned viewer on the next tick
    pending: Vec<ClientboundPacket>,
}

/// A live model instance
pub struct Tracker {
    id: TrackerId,
    skeleton: Arc<Skeleton>,
    source: Option<Arc<dyn EntityHandle>>,
    adapter: Arc<dyn ProtocolAdapter>,
    allocator: Arc<EntityIdAllocator>,
    settings: TrackerSettings,
    state: AtomicU8,
    force_update: AtomicBool,
    current_tick: AtomicU64,
    /// Source entity's selected slot before the model took over
    held_slot: AtomicI32,
    render_ids: Vec<i32>,
    hitbox_ids: RwLock<Vec<i32>>,
    hide: RwLock<HideOptions>,
    view_distance: RwLock<f32>,
    viewers: DashMap<Uuid, ViewerEntry>,
    core: Mutex<TrackerCore>,
}

fn yaw_rotation(yaw: f32) -> Quat {
    Quat::from_rotation_y(-yaw.to_radians())
}

impl Tracker {
    /// Create a tracker with one render proxy per visual bone
    pub fn new(
        id: TrackerId,
        skeleton: Arc<Skeleton>,
        source: TrackerSource,
        adapter: Arc<dyn ProtocolAdapter>,
        allocator: Arc<EntityIdAllocator>,
        settings: TrackerSettings,
    ) -> Self {
        let (entity, location, yaw) = match source {
            TrackerSource::Entity(entity) => {
                let position = entity.position();
                let yaw = entity.body_yaw();
                (Some(entity), position, yaw)
            }
            TrackerSource::Dummy { location, yaw } => (None, location, yaw),
        };

        let mut proxies = Vec::new();
        let mut proxy_index = HashMap::new();
        for bone in skeleton.bones().iter().filter(|bone| bone.visual.is_some()) {
            proxy_index.insert(bone.id, proxies.len());
            proxies.push(RenderProxy::new(
                allocator.next(),
                Uuid::new_v4(),
                bone,
                settings.lerp_frames,
            ));
        }
        let render_ids = proxies.iter().map(RenderProxy::entity_id).collect();
        let held_slot = entity.as_ref().map(|e| i32::from(e.held_slot())).unwrap_or(0);

        let core = TrackerCore {
            proxies,
            proxy_index,
            hitboxes: HashMap::new(),
            animation: None,
            on_complete: None,
            crossfade: None,
            locked: false,
            last_deltas: vec![BoneDelta::IDENTITY; skeleton.len()],
            location,
            yaw,
            moved: false,
            pending: Vec::new(),
        };

        let view_distance = settings.view_distance;
        let tracker = Self {
            id,
            skeleton,
            source: entity,
            adapter,
            allocator,
            settings,
            state: AtomicU8::new(LifecycleState::Active as u8),
            force_update: AtomicBool::new(false),
            current_tick: AtomicU64::new(0),
            held_slot: AtomicI32::new(held_slot),
            render_ids,
            hitbox_ids: RwLock::new(Vec::new()),
            hide: RwLock::new(HideOptions::default()),
            view_distance: RwLock::new(view_distance),
            viewers: DashMap::new(),
            core: Mutex::new(core),
        };

        {
            let mut core = tracker.core.lock();
            let (origin, yaw, scale) = tracker.owner_frame(&core);
            tracker.apply_pose(&mut core, origin, yaw, scale, None);
        }

        debug!(
            tracker_id = id.0,
            model = %tracker.skeleton.name(),
            proxies = tracker.render_ids.len(),
            "Tracker created"
        );
        tracker
    }

    // ============ Accessors ============

    pub fn id(&self) -> TrackerId {
        self.id
    }

    pub fn skeleton(&self) -> &Arc<Skeleton> {
        &self.skeleton
    }

    pub fn model_name(&self) -> &str {
        self.skeleton.name()
    }

    /// Source entity, `None` for dummies
    pub fn source(&self) -> Option<&Arc<dyn EntityHandle>> {
        self.source.as_ref()
    }

    pub fn source_entity_id(&self) -> Option<i32> {
        self.source.as_ref().map(|entity| entity.entity_id())
    }

    pub fn source_uuid(&self) -> Option<Uuid> {
        self.source.as_ref().map(|entity| entity.uuid())
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == LifecycleState::Closed
    }

    /// Entity ids of the render proxies
    pub fn render_ids(&self) -> &[i32] {
        &self.render_ids
    }

    /// Entity ids of the hitbox proxies
    pub fn hitbox_ids(&self) -> Vec<i32> {
        self.hitbox_ids.read().clone()
    }

    /// Live render proxies
    pub fn proxy_count(&self) -> usize {
        self.core.lock().proxies.len()
    }

    /// Live hitbox proxies
    pub fn hitbox_count(&self) -> usize {
        self.core.lock().hitboxes.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewer_uuids(&self) -> Vec<Uuid> {
        self.viewers.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of one viewer's state
    pub fn viewer_state(&self, viewer: Uuid) -> Option<ViewerState> {
        self.viewers.get(&viewer).map(|entry| entry.state.clone())
    }

    /// Whether proxies are live on the viewer's client
    pub fn is_spawned_for(&self, viewer: Uuid) -> bool {
        self.viewers
            .get(&viewer)
            .map(|entry| entry.state.spawned)
            .unwrap_or(false)
    }

    /// Slot to echo back while inventory input is blocked
    pub fn held_slot(&self) -> i32 {
        self.held_slot.load(Ordering::SeqCst)
    }

    /// Last tick this tracker ran
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::SeqCst)
    }

    /// Anchor location and yaw
    pub fn location(&self) -> (Vec3, f32) {
        let core = self.core.lock();
        let (origin, yaw, _) = self.owner_frame(&core);
        (origin, yaw)
    }

    /// Resend full proxy metadata on the next tick
    pub fn request_full_update(&self) {
        self.force_update.store(true, Ordering::SeqCst);
    }

    // ============ Hide options ============

    pub fn hide_options(&self) -> HideOptions {
        *self.hide.read()
    }

    /// Range inside which a free-floating model is shown
    pub fn view_distance(&self) -> f32 {
        *self.view_distance.read()
    }

    pub fn set_view_distance(&self, distance: f32) {
        *self.view_distance.write() = distance;
    }

    pub fn set_hide_options(&self, options: HideOptions) {
        *self.hide.write() = options;
    }

    /// Per-viewer override; `None` falls back to the tracker's options
    pub fn set_viewer_hide_override(&self, viewer: Uuid, options: Option<HideOptions>) -> bool {
        match self.viewers.get_mut(&viewer) {
            Some(mut entry) => {
                entry.state.hide_override = options;
                true
            }
            None => false,
        }
    }

    /// Options in force for a viewer that is shown the model
    pub fn effective_hide(&self, viewer: Uuid) -> Option<HideOptions> {
        if !self.is_active() {
            return None;
        }
        let entry = self.viewers.get(&viewer)?;
        if entry.state.hidden {
            return None;
        }
        Some(entry.state.hide_override.unwrap_or_else(|| self.hide_options()))
    }

    /// Remember equipment withheld from a viewer
    pub fn snapshot_equipment(&self, viewer: Uuid, slots: &[(EquipmentSlot, Option<ItemStack>)]) {
        if let Some(mut entry) = self.viewers.get_mut(&viewer) {
            for (slot, item) in slots {
                let last = &mut entry.state.last_equipment;
                match last.iter_mut().find(|(existing, _)| existing == slot) {
                    Some(existing) => existing.1 = item.clone(),
                    None => last.push((*slot, item.clone())),
                }
            }
        }
    }

    // ============ Visibility ============

    /// Show the model to a viewer on the next tick
    pub fn show(&self, viewer: &Arc<Viewer>) -> bool {
        if !self.is_active() {
            return false;
        }
        let due = self.current_tick();
        self.viewers
            .entry(viewer.uuid)
            .and_modify(|entry| {
                if entry.state.hidden {
                    entry.state.hidden = false;
                    entry.state.spawn_due = Some(due);
                }
            })
            .or_insert_with(|| ViewerEntry {
                viewer: viewer.clone(),
                state: ViewerState::pending(due),
            });
        self.settle_viewer_insert(viewer.uuid)
    }

    /// A concurrent `close` may have cleared the map between the activity check
    /// and the insert; drop whatever landed after it.
    fn settle_viewer_insert(&self, viewer: Uuid) -> bool {
        if self.is_active() {
            return true;
        }
        self.viewers.remove(&viewer);
        false
    }

    /// Hide the model from a viewer until `show` is called again
    pub fn hide(&self, viewer: &Arc<Viewer>) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut entry = self
            .viewers
            .entry(viewer.uuid)
            .or_insert_with(|| ViewerEntry {
                viewer: viewer.clone(),
                state: ViewerState::default(),
            });
        if entry.state.spawned {
            let packets = self.teardown_packets(&entry.state);
            if let Err(e) = entry.viewer.send_bundle(packets) {
                debug!(tracker_id = self.id.0, viewer = %viewer.uuid, error = %e, "Hide not delivered");
            }
        }
        let state = &mut entry.state;
        state.spawned = false;
        state.spawn_due = None;
        state.passengers_due = None;
        state.hidden = true;
        state.last_equipment.clear();
        drop(entry);
        self.settle_viewer_insert(viewer.uuid)
    }

    /// (Re)spawn proxies for a viewer after `delay` ticks
    pub fn schedule_spawn(&self, viewer: &Arc<Viewer>, delay: u32) -> bool {
        if !self.is_active() {
            return false;
        }
        let due = self.current_tick() + u64::from(delay);
        let mut entry = self
            .viewers
            .entry(viewer.uuid)
            .or_insert_with(|| ViewerEntry {
                viewer: viewer.clone(),
                state: ViewerState::default(),
            });
        if entry.state.hidden {
            drop(entry);
            self.settle_viewer_insert(viewer.uuid);
            return false;
        }
        entry.state.spawned = false;
        entry.state.spawn_due = Some(due);
        drop(entry);
        trace!(tracker_id = self.id.0, viewer = %viewer.uuid, due, "Spawn scheduled");
        self.settle_viewer_insert(viewer.uuid)
    }

    /// Drop a viewer's state and return the packets tearing its proxies down
    pub fn despawn_for(&self, viewer: Uuid) -> Vec<ClientboundPacket> {
        match self.viewers.remove(&viewer) {
            Some((_, entry)) if entry.state.spawned => vec![self.despawn_packet()],
            _ => Vec::new(),
        }
    }

    /// Forget a viewer without sending anything
    pub fn remove_viewer(&self, viewer: Uuid) -> bool {
        self.viewers.remove(&viewer).is_some()
    }

    // ============ Animation ============

    /// Start a clip
    pub fn animate(&self, name: &str, modifier: AnimationModifier) -> bool {
        self.start_animation(name, modifier, None)
    }

    /// Start a clip and run `on_complete` once when a play-once clip ends
    pub fn animate_then<F>(&self, name: &str, modifier: AnimationModifier, on_complete: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.start_animation(name, modifier, Some(Box::new(on_complete)))
    }

    fn start_animation(
        &self,
        name: &str,
        modifier: AnimationModifier,
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut core = self.core.lock();
        if core.locked {
            debug!(tracker_id = self.id.0, clip = name, "Animation locked");
            return false;
        }
        let clip = match self.skeleton.clip(name) {
            Some(clip) => clip,
            None => {
                warn!(model = %self.skeleton.name(), clip = name, "Unknown animation");
                return false;
            }
        };

        let loop_mode = modifier.loop_mode.unwrap_or_else(|| clip.loop_mode());
        let blend = modifier.blend_ticks.unwrap_or(self.settings.lerp_frames);
        Self::begin_crossfade(&mut core, blend);
        core.animation = Some(AnimationState {
            clip,
            elapsed: modifier.start_offset,
            speed: modifier.speed,
            loop_mode,
        });
        core.on_complete = on_complete;
        debug!(tracker_id = self.id.0, model = %self.skeleton.name(), clip = name, ?loop_mode, "Animation started");
        true
    }

    /// Return to the base pose through the crossfade
    pub fn stop_animation(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut core = self.core.lock();
        if core.animation.take().is_none() {
            return false;
        }
        core.on_complete = None;
        Self::begin_crossfade(&mut core, self.settings.lerp_frames);
        true
    }

    /// While locked, `animate` is refused
    pub fn lock_animation(&self, locked: bool) {
        self.core.lock().locked = locked;
    }

    pub fn is_animation_locked(&self) -> bool {
        self.core.lock().locked
    }

    /// Name of the clip playing
    pub fn current_animation(&self) -> Option<String> {
        self.core
            .lock()
            .animation
            .as_ref()
            .map(|state| state.clip.name().to_string())
    }

    pub fn animation_state(&self) -> Option<AnimationState> {
        self.core.lock().animation.clone()
    }

    fn begin_crossfade(core: &mut TrackerCore, ticks: u32) {
        core.crossfade = if ticks > 0 {
            Some(Crossfade {
                from: core.last_deltas.clone(),
                remaining: ticks,
                total: ticks,
            })
        } else {
            None
        };
    }

    /// Advance the clip and crossfade by one step
    fn advance_animation(
        &self,
        core: &mut TrackerCore,
        dt: f32,
    ) -> Option<Box<dyn FnOnce() + Send>> {
        let mut target = vec![BoneDelta::IDENTITY; self.skeleton.len()];
        let mut finished = false;

        if let Some(animation) = core.animation.as_mut() {
            let sampled = sample(&animation.clip, animation.elapsed, animation.loop_mode);
            for (bone, delta) in sampled.iter() {
                if let Some(slot) = target.get_mut(bone.index()) {
                    *slot = *delta;
                }
            }
            animation.elapsed += dt * animation.speed;
            finished = sampled.status == PlaybackStatus::Finished;
        }

        let mut callback = None;
        if finished {
            if let Some(animation) = core.animation.take() {
                debug!(tracker_id = self.id.0, clip = %animation.clip.name(), "Animation finished");
            }
            callback = core.on_complete.take();
        }

        let blended: Vec<BoneDelta> = match core.crossfade.as_mut() {
            Some(fade) if fade.remaining > 0 => {
                let t = 1.0 - fade.remaining as f32 / fade.total as f32;
                fade.remaining -= 1;
                fade.from
                    .iter()
                    .zip(&target)
                    .map(|(from, to)| from.lerp(to, t))
                    .collect()
            }
            _ => target,
        };
        if core.crossfade.as_ref().map_or(false, |fade| fade.remaining == 0) {
            core.crossfade = None;
        }
        core.last_deltas = blended;

        if finished {
            Self::begin_crossfade(core, self.settings.lerp_frames);
        }
        callback
    }

    // ============ Mutation ============

    /// Apply an action to every matching bone. Returns the number of proxies changed.
    pub fn update(&self, action: TrackerAction, predicate: &BonePredicate) -> usize {
        if !self.is_active() {
            return 0;
        }
        let bones = predicate.resolve(&self.skeleton);
        if bones.is_empty() {
            warn!(model = %self.skeleton.name(), ?predicate, "No bone matches update");
            return 0;
        }
        let mut core = self.core.lock();
        let mut changed = 0;
        for bone in bones {
            if let Some(&index) = core.proxy_index.get(&bone) {
                if let Some(proxy) = core.proxies.get_mut(index) {
                    action.apply(proxy);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Move a free-floating tracker
    pub fn teleport(&self, location: Vec3, yaw: f32) -> bool {
        if !self.is_active() || self.source.is_some() {
            return false;
        }
        let mut core = self.core.lock();
        core.location = location;
        core.yaw = yaw;
        core.moved = true;
        true
    }

    // ============ Hitboxes ============

    /// Create the hitbox of a bone, or return the existing one
    pub fn create_hitbox(
        &self,
        bone: &str,
        controller: Option<Arc<MountController>>,
    ) -> Option<i32> {
        if !self.is_active() {
            return None;
        }
        let bone_ref = match self.skeleton.find(bone).and_then(|id| self.skeleton.bone(id)) {
            Some(bone_ref) => bone_ref,
            None => {
                warn!(model = %self.skeleton.name(), bone, "Hitbox requested for unknown bone");
                return None;
            }
        };
        let base = match bone_ref.hitbox {
            Some(base) => base,
            None => {
                warn!(model = %self.skeleton.name(), bone, "Bone has no hitbox");
                return None;
            }
        };

        let mut core = self.core.lock();
        if let Some(existing) = core.hitboxes.get(&bone_ref.id) {
            return Some(existing.entity_id());
        }

        let mut hitbox = HitBoxProxy::new(
            self.allocator.next(),
            Uuid::new_v4(),
            self.id,
            bone_ref,
            base,
            controller.unwrap_or_else(|| self.settings.default_mount.clone()),
            *self.adapter.behavior(),
        );
        let (origin, yaw, scale) = self.owner_frame(&core);
        let deltas = &core.last_deltas;
        let poses = self
            .skeleton
            .pose(|id| deltas.get(id.index()).copied().unwrap_or(BoneDelta::IDENTITY));
        if let Some(pose) = poses.get(bone_ref.id.index()) {
            hitbox.set_owner_scale(scale);
            hitbox.follow(origin + yaw_rotation(yaw) * (pose.position * scale));
            hitbox.take_moved();
        }

        let entity_id = hitbox.entity_id();
        let packets = hitbox.spawn_packets(self.adapter.as_ref());
        core.pending.extend(packets);
        core.hitboxes.insert(bone_ref.id, hitbox);
        self.hitbox_ids.write().push(entity_id);
        debug!(tracker_id = self.id.0, bone, hitbox = entity_id, "Hitbox created");
        Some(entity_id)
    }

    fn hitbox_mut(core: &mut TrackerCore, hitbox: i32) -> Option<&mut HitBoxProxy> {
        core.hitboxes
            .values_mut()
            .find(|candidate| candidate.entity_id() == hitbox)
    }

    /// Read a hitbox
    pub fn inspect_hitbox<R, F>(&self, hitbox: i32, f: F) -> Option<R>
    where
        F: FnOnce(&HitBoxProxy) -> R,
    {
        let core = self.core.lock();
        core.hitboxes
            .values()
            .find(|candidate| candidate.entity_id() == hitbox)
            .map(f)
    }

    pub fn set_hitbox_listener(&self, bone: &str, listener: Arc<dyn HitBoxListener>) -> bool {
        let id = match self.skeleton.find(bone) {
            Some(id) => id,
            None => return false,
        };
        match self.core.lock().hitboxes.get_mut(&id) {
            Some(hitbox) => {
                hitbox.set_listener(listener);
                true
            }
            None => false,
        }
    }

    /// Seat a rider on a hitbox
    pub fn mount(&self, hitbox: i32, rider: i32) -> bool {
        if !self.is_active() {
            return false;
        }
        let mut core = self.core.lock();
        let packet = match Self::hitbox_mut(&mut core, hitbox) {
            Some(target) => {
                if !target.mount(rider) {
                    return false;
                }
                target.passengers_packet()
            }
            None => return false,
        };
        core.pending.push(packet);
        true
    }

    /// Remove a hitbox's rider unconditionally
    pub fn dismount(&self, hitbox: i32) -> Option<i32> {
        let mut core = self.core.lock();
        let (rider, packet) = {
            let target = Self::hitbox_mut(&mut core, hitbox)?;
            let rider = target.dismount()?;
            (rider, target.passengers_packet())
        };
        core.pending.push(packet);
        Some(rider)
    }

    /// Rider-initiated dismount, subject to the controller's veto
    pub fn try_dismount_by_rider(&self, rider: i32) -> bool {
        let mut core = self.core.lock();
        let packet = match core
            .hitboxes
            .values_mut()
            .find(|hitbox| hitbox.rider() == Some(rider))
        {
            Some(hitbox) => {
                if !hitbox.try_dismount_by_rider() {
                    return false;
                }
                hitbox.passengers_packet()
            }
            None => return false,
        };
        core.pending.push(packet);
        true
    }

    /// Hitbox a rider sits on
    pub fn hitbox_of_rider(&self, rider: i32) -> Option<i32> {
        self.core
            .lock()
            .hitboxes
            .values()
            .find(|hitbox| hitbox.rider() == Some(rider))
            .map(HitBoxProxy::entity_id)
    }

    /// Latest movement intent of a rider
    pub fn set_rider_input(&self, rider: i32, input: RiderInput) -> bool {
        let mut core = self.core.lock();
        match core
            .hitboxes
            .values_mut()
            .find(|hitbox| hitbox.rider() == Some(rider))
        {
            Some(hitbox) => {
                hitbox.set_input(input);
                true
            }
            None => false,
        }
    }

    /// Damage dealt to a hitbox
    pub fn damage_hitbox(&self, hitbox: i32, source: Option<i32>, amount: f32) -> Option<DamageOutcome> {
        let outcome = {
            let core = self.core.lock();
            core.hitboxes
                .values()
                .find(|candidate| candidate.entity_id() == hitbox)?
                .on_damage(source, amount)
        };
        if outcome == DamageOutcome::Forwarded {
            if let Some(entity) = &self.source {
                entity.damage(source, amount);
            }
        }
        trace!(tracker_id = self.id.0, hitbox, ?outcome, "Hitbox damaged");
        Some(outcome)
    }

    /// A click on a hitbox
    pub fn interact_hitbox(&self, hitbox: i32, source: i32) -> bool {
        let core = self.core.lock();
        match core
            .hitboxes
            .values()
            .find(|candidate| candidate.entity_id() == hitbox)
        {
            Some(target) => {
                target.on_interact(source);
                true
            }
            None => false,
        }
    }

    // ============ Tick ============

    fn owner_frame(&self, core: &TrackerCore) -> (Vec3, f32, f32) {
        match &self.source {
            Some(entity) => (entity.position(), entity.body_yaw(), entity.scale()),
            None => (core.location, core.yaw, 1.0),
        }
    }

    fn body_state(&self) -> BodyState {
        match &self.source {
            Some(entity) => BodyState {
                on_ground: entity.on_ground(),
                horizontal_collision: entity.horizontal_collision(),
                has_gravity: entity.has_gravity(),
                velocity: entity.velocity(),
            },
            None => BodyState::default(),
        }
    }

    /// Pose proxies from the current deltas. Returns hitbox packets.
    fn apply_pose(
        &self,
        core: &mut TrackerCore,
        origin: Vec3,
        yaw: f32,
        scale: f32,
        body: Option<BodyState>,
    ) -> Vec<ClientboundPacket> {
        let deltas = &core.last_deltas;
        let poses = self
            .skeleton
            .pose(|id| deltas.get(id.index()).copied().unwrap_or(BoneDelta::IDENTITY));
        let facing = yaw_rotation(yaw);

        for proxy in core.proxies.iter_mut() {
            if let Some(pose) = poses.get(proxy.bone().index()) {
                proxy.set_transform(
                    facing * (pose.position * scale),
                    facing * pose.rotation,
                    pose.scale * scale,
                );
            }
        }

        // Steering pushes the owner; dummies only drift horizontally
        let travel = facing * Vec3::Z;
        let mut drift = Vec3::ZERO;
        if let Some(body) = &body {
            for hitbox in core.hitboxes.values_mut() {
                let delta = hitbox.steer(body, travel);
                if delta == Vec3::ZERO {
                    continue;
                }
                match &self.source {
                    Some(entity) => entity.apply_velocity(delta),
                    None => drift += Vec3::new(delta.x, 0.0, delta.z),
                }
            }
        }
        if drift != Vec3::ZERO {
            core.location += drift;
            core.moved = true;
        }

        let origin = origin + drift;
        let mut packets = Vec::new();
        for hitbox in core.hitboxes.values_mut() {
            let pose = match poses.get(hitbox.bone().index()) {
                Some(pose) => pose,
                None => continue,
            };
            if hitbox.set_owner_scale(scale) {
                packets.push(hitbox.size_packet(self.adapter.as_ref()));
            }
            hitbox.follow(origin + facing * (pose.position * scale));
            if hitbox.take_moved() {
                packets.push(hitbox.teleport_packet());
            }
        }
        packets
    }

    fn collect_updates(
        &self,
        core: &mut TrackerCore,
        origin: Vec3,
        extra: Vec<ClientboundPacket>,
    ) -> PacketBundle {
        let adapter = self.adapter.as_ref();
        let mut bundle = PacketBundle::lazy(self.settings.bundle_max_items);
        let force = self.force_update.swap(false, Ordering::SeqCst);
        let moved = std::mem::take(&mut core.moved);

        for proxy in core.proxies.iter_mut() {
            let mut flags = proxy.take_changes();
            if force {
                flags |= ProxyFlags::SPAWN;
            }
            if moved {
                bundle.add(proxy.teleport_packet(origin, 0.0));
            }
            if let Some(packet) = proxy.update_packet(adapter, flags) {
                bundle.add(packet);
            }
        }
        bundle.extend(extra);
        bundle.extend(core.pending.drain(..));
        bundle
    }

    fn spawn_bundle(&self, core: &TrackerCore, origin: Vec3, state: &ViewerState) -> PacketBundle {
        let adapter = self.adapter.as_ref();
        let mut bundle = PacketBundle::new(self.settings.bundle_max_items);
        for proxy in &core.proxies {
            bundle.extend(proxy.spawn_packets(adapter, origin, 0.0));
        }
        for hitbox in core.hitboxes.values() {
            bundle.extend(hitbox.spawn_packets(adapter));
        }
        if let Some(entity) = &self.source {
            let hide = state.hide_override.unwrap_or_else(|| self.hide_options());
            if hide.visibility {
                bundle.add(ClientboundPacket::EntityMetadata {
                    entity_id: entity.entity_id(),
                    entries: vec![MetadataEntry::shared_flags(hide.mask_shared_flags(0))],
                });
            }
            if hide.equipment {
                bundle.add(ClientboundPacket::Equipment {
                    entity_id: entity.entity_id(),
                    slots: EquipmentSlot::ALL.iter().map(|slot| (*slot, None)).collect(),
                });
            }
        }
        bundle
    }

    fn passengers_packet(&self) -> Option<ClientboundPacket> {
        let entity = self.source.as_ref()?;
        let mut passengers = self.render_ids.clone();
        passengers.extend(
            entity
                .passenger_ids()
                .into_iter()
                .filter(|id| !self.render_ids.contains(id)),
        );
        Some(ClientboundPacket::SetPassengers {
            vehicle_id: entity.entity_id(),
            passengers,
        })
    }

    fn despawn_packet(&self) -> ClientboundPacket {
        let mut entity_ids = self.render_ids.clone();
        entity_ids.extend(self.hitbox_ids.read().iter().copied());
        ClientboundPacket::RemoveEntities { entity_ids }
    }

    /// Proxy removal plus whatever the real entity needs restored
    fn teardown_packets(&self, state: &ViewerState) -> Vec<ClientboundPacket> {
        let mut packets = vec![self.despawn_packet()];
        if let Some(entity) = &self.source {
            packets.push(ClientboundPacket::SetPassengers {
                vehicle_id: entity.entity_id(),
                passengers: entity.passenger_ids(),
            });
            if !state.last_equipment.is_empty() {
                packets.push(ClientboundPacket::Equipment {
                    entity_id: entity.entity_id(),
                    slots: state.last_equipment.clone(),
                });
            }
        }
        packets
    }

    fn source_tagged(&self) -> bool {
        self.source
            .as_ref()
            .map_or(true, |entity| entity.has_model_tag())
    }

    /// Range-based visibility for free-floating trackers
    fn update_range(&self, ctx: &TickContext<'_>, location: Vec3) {
        for viewer in ctx.viewers {
            if !viewer.is_connected() {
                continue;
            }
            let inside = viewer.position().distance(location) <= self.view_distance();
            if inside {
                if !self.viewers.contains_key(&viewer.uuid) {
                    self.viewers.insert(
                        viewer.uuid,
                        ViewerEntry {
                            viewer: viewer.clone(),
                            state: ViewerState::pending(ctx.tick),
                        },
                    );
                }
            } else if let Some((_, entry)) =
                self.viewers.remove_if(&viewer.uuid, |_, entry| !entry.state.hidden)
            {
                if entry.state.spawned {
                    let _ = entry.viewer.send_bundle(vec![self.despawn_packet()]);
                }
                trace!(tracker_id = self.id.0, viewer = %viewer.uuid, "Viewer left range");
            }
        }
    }

    /// Send each viewer exactly one bundle for this tick
    fn flush_viewers(&self, core: &TrackerCore, update: &PacketBundle, tick: u64, origin: Vec3) {
        let follow_delay = u64::from(self.adapter.behavior().invisible_follow_delay_ticks);
        let mut dropped = Vec::new();

        for mut entry in self.viewers.iter_mut() {
            let uuid = *entry.key();
            let ViewerEntry { viewer, state } = entry.value_mut();
            if !viewer.is_connected() {
                dropped.push(uuid);
                continue;
            }
            if state.hidden {
                continue;
            }

            let mut bundle = if state.spawned {
                update.copy()
            } else if state.spawn_due.map_or(false, |due| due <= tick) {
                state.spawn_due = None;
                if !self.source_tagged() {
                    debug!(tracker_id = self.id.0, viewer = %uuid, "Source lost its model tag, spawn skipped");
                    continue;
                }
                state.spawned = true;
                if self.source.is_some() {
                    state.passengers_due = Some(tick + follow_delay);
                }
                self.spawn_bundle(core, origin, state)
            } else {
                continue;
            };

            if state.passengers_due.map_or(false, |due| due <= tick) {
                state.passengers_due = None;
                if let Some(packet) = self.passengers_packet() {
                    bundle.add(packet);
                }
            }
            if bundle.is_empty() {
                continue;
            }
            if let Err(e) = bundle.send(&**viewer) {
                debug!(tracker_id = self.id.0, viewer = %uuid, error = %e, "Dropping viewer");
                dropped.push(uuid);
            }
        }

        for uuid in dropped {
            self.viewers.remove(&uuid);
        }
    }

    /// Advance one simulation step. Returns whether the tracker is still active.
    pub fn tick(&self, ctx: &TickContext<'_>) -> bool {
        if !self.is_active() {
            return false;
        }
        self.current_tick.store(ctx.tick, Ordering::SeqCst);

        if let Some(entity) = &self.source {
            if !entity.is_alive() {
                self.close("source entity removed");
                return false;
            }
        }

        let callback = {
            let mut core = self.core.lock();
            let callback = self.advance_animation(&mut core, ctx.dt);
            let (origin, yaw, scale) = self.owner_frame(&core);
            if self.source.is_none() {
                self.update_range(ctx, origin);
            }
            let body = self.body_state();
            let extra = self.apply_pose(&mut core, origin, yaw, scale, Some(body));
            let (origin, _, _) = self.owner_frame(&core);
            let update = self.collect_updates(&mut core, origin, extra);
            self.flush_viewers(&core, &update, ctx.tick, origin);
            callback
        };

        if let Some(callback) = callback {
            callback();
        }
        true
    }

    // ============ Lifecycle ============

    /// Tear down every proxy and viewer. Returns false if already closing or closed.
    pub fn close(&self, reason: &str) -> bool {
        if self
            .state
            .compare_exchange(
                LifecycleState::Active as u8,
                LifecycleState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        let mut core = self.core.lock();
        for entry in self.viewers.iter() {
            if entry.state.spawned && entry.viewer.is_connected() {
                let packets = self.teardown_packets(&entry.state);
                if let Err(e) = entry.viewer.send_bundle(packets) {
                    debug!(tracker_id = self.id.0, viewer = %entry.key(), error = %e, "Teardown not delivered");
                }
            }
        }
        self.viewers.clear();

        for hitbox in core.hitboxes.values_mut() {
            hitbox.set_force_dismount(true);
            hitbox.dismount();
            hitbox.notify_removed();
        }
        core.hitboxes.clear();
        core.proxies.clear();
        core.proxy_index.clear();
        core.animation = None;
        core.on_complete = None;
        core.crossfade = None;
        core.pending.clear();
        self.hitbox_ids.write().clear();
        drop(core);

        self.state.store(LifecycleState::Closed as u8, Ordering::SeqCst);
        info!(tracker_id = self.id.0, model = %self.skeleton.name(), reason, "Tracker closed");
        true
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("id", &self.id)
            .field("model", &self.skeleton.name())
            .field("source", &self.source_entity_id())
            .field("state", &self.state())
            .field("viewers", &self.viewers.len())
            .finish()
    }
}
