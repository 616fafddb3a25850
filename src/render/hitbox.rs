//! HitBox proxies
//!
//! An invisible interaction entity bound to one bone. It shadows the bone's
//! world position every tick, can carry one rider, and turns that rider's
//! input into velocity through its `MountController`.
//!
//! Listener callbacks run on the simulation thread while the owning tracker
//! is locked; they must not call back into the tracker.

use std::fmt;
use std::sync::Arc;

use glam::Vec3;
use tracing::debug;
use uuid::Uuid;

use super::mount::{MountController, MoveType, RiderInput};
use crate::model::{Aabb, Bone, BoneId};
use crate::protocol::adapter::{AdapterBehavior, ProtocolAdapter};
use crate::protocol::packets::{ClientboundPacket, EntityKind};
use crate::render::tracker::TrackerId;

/// Ticks between two mount jumps
pub const JUMP_DELAY_TICKS: u32 = 10;

/// Vertical speed below which a body counts as resting
pub const VERTICAL_REST_EPSILON: f32 = 0.01;

/// Hooks into hitbox events
pub trait HitBoxListener: Send + Sync {
    fn on_mount(&self, _hitbox: i32, _rider: i32) {}

    fn on_dismount(&self, _hitbox: i32, _rider: i32) {}

    fn on_interact(&self, _hitbox: i32, _source: i32) {}

    /// Return `true` to intercept the damage before it reaches the owner
    fn on_damage(&self, _hitbox: i32, _source: Option<i32>, _amount: f32) -> bool {
        false
    }

    fn on_remove(&self, _hitbox: i32) {}
}

/// What happened to damage dealt to a hitbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageOutcome {
    /// Dropped because the rider may not hurt its mount
    Cancelled,
    /// Consumed by the listener
    Intercepted,
    /// Passed on to the owning entity
    Forwarded,
}

/// Physical state of the body a hitbox moves
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyState {
    pub on_ground: bool,
    pub horizontal_collision: bool,
    pub has_gravity: bool,
    pub velocity: Vec3,
}

impl Default for BodyState {
    fn default() -> Self {
        Self {
            on_ground: true,
            horizontal_collision: false,
            has_gravity: true,
            velocity: Vec3::ZERO,
        }
    }
}

/// A collidable, mountable proxy for one bone
pub struct HitBoxProxy {
    entity_id: i32,
    uuid: Uuid,
    tracker: TrackerId,
    bone: BoneId,
    bone_name: String,
    base: Aabb,
    owner_scale: f32,
    size: Vec3,
    position: Vec3,
    sent_position: Option<Vec3>,
    velocity: Vec3,
    rider: Option<i32>,
    input: RiderInput,
    collision: bool,
    jump_cooldown: u32,
    force_dismount: bool,
    controller: Arc<MountController>,
    behavior: AdapterBehavior,
    listener: Option<Arc<dyn HitBoxListener>>,
}

impl HitBoxProxy {
    /// Create a hitbox for a bone
    pub fn new(
        entity_id: i32,
        uuid: Uuid,
        tracker: TrackerId,
        bone: &Bone,
        base: Aabb,
        controller: Arc<MountController>,
        behavior: AdapterBehavior,
    ) -> Self {
        Self {
            entity_id,
            uuid,
            tracker,
            bone: bone.id,
            bone_name: bone.name.clone(),
            base,
            owner_scale: 1.0,
            size: base.size(),
            position: Vec3::ZERO,
            sent_position: None,
            velocity: Vec3::ZERO,
            rider: None,
            input: RiderInput::default(),
            collision: true,
            jump_cooldown: 0,
            force_dismount: false,
            controller,
            behavior,
            listener: None,
        }
    }

    pub fn entity_id(&self) -> i32 {
        self.entity_id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Owning tracker (non-owning back-reference)
    pub fn tracker(&self) -> TrackerId {
        self.tracker
    }

    pub fn bone(&self) -> BoneId {
        self.bone
    }

    pub fn bone_name(&self) -> &str {
        &self.bone_name
    }

    pub fn size(&self) -> Vec3 {
        self.size
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn velocity(&self) -> Vec3 {
        self.velocity
    }

    pub fn rider(&self) -> Option<i32> {
        self.rider
    }

    pub fn jump_cooldown(&self) -> u32 {
        self.jump_cooldown
    }

    pub fn controller(&self) -> &Arc<MountController> {
        &self.controller
    }

    pub fn collision(&self) -> bool {
        self.collision
    }

    pub fn set_collision(&mut self, collision: bool) {
        self.collision = collision;
    }

    pub fn set_controller(&mut self, controller: Arc<MountController>) {
        self.controller = controller;
    }

    pub fn set_listener(&mut self, listener: Arc<dyn HitBoxListener>) {
        self.listener = Some(listener);
    }

    /// Follow the owner's scale. Returns whether the size changed.
    pub fn set_owner_scale(&mut self, scale: f32) -> bool {
        let scale = if scale.is_finite() && scale > 0.0 {
            scale
        } else {
            1.0
        };
        if (scale - self.owner_scale).abs() <= f32::EPSILON {
            return false;
        }
        self.owner_scale = scale;
        self.size = self.base.size() * scale;
        true
    }

    // ============ Riding ============

    /// Seat a rider. Fails if mounting is not allowed or the seat is taken.
    pub fn mount(&mut self, rider: i32) -> bool {
        if !self.controller.can_mount || self.rider.is_some() {
            return false;
        }
        self.rider = Some(rider);
        self.input = RiderInput::default();
        if let Some(listener) = &self.listener {
            listener.on_mount(self.entity_id, rider);
        }
        debug!(hitbox = self.entity_id, bone = %self.bone_name, rider, "Rider mounted");
        true
    }

    /// Remove the rider unconditionally
    pub fn dismount(&mut self) -> Option<i32> {
        let rider = self.rider.take()?;
        self.input = RiderInput::default();
        self.velocity = Vec3::ZERO;
        if let Some(listener) = &self.listener {
            listener.on_dismount(self.entity_id, rider);
        }
        debug!(hitbox = self.entity_id, bone = %self.bone_name, rider, "Rider dismounted");
        Some(rider)
    }

    /// A dismount the rider asked for; vetoed unless allowed or forced
    pub fn try_dismount_by_rider(&mut self) -> bool {
        if self.rider.is_none() {
            return false;
        }
        if !self.controller.can_dismount_by_self && !self.force_dismount {
            return false;
        }
        self.dismount().is_some()
    }

    /// Allow the rider to leave regardless of the controller
    pub fn set_force_dismount(&mut self, force: bool) {
        self.force_dismount = force;
    }

    pub fn force_dismount(&self) -> bool {
        self.force_dismount
    }

    /// Latest rider intent
    pub fn set_input(&mut self, input: RiderInput) {
        if self.rider.is_some() {
            self.input = input;
        }
    }

    /// Whether the rider is steering
    pub fn is_controlled(&self) -> bool {
        self.rider.is_some() && self.controller.can_control
    }

    // ============ Damage ============

    /// Route damage dealt to this hitbox
    pub fn on_damage(&self, source: Option<i32>, amount: f32) -> DamageOutcome {
        if let (Some(rider), Some(source)) = (self.rider, source) {
            if rider == source && !self.controller.can_be_damaged_by_rider {
                return DamageOutcome::Cancelled;
            }
        }
        let intercepted = self
            .listener
            .as_ref()
            .map(|listener| listener.on_damage(self.entity_id, source, amount))
            .unwrap_or(false);
        if intercepted {
            DamageOutcome::Intercepted
        } else {
            DamageOutcome::Forwarded
        }
    }

    /// Forward a click to the listener
    pub fn on_interact(&self, source: i32) {
        if let Some(listener) = &self.listener {
            listener.on_interact(self.entity_id, source);
        }
    }

    // ============ Motion ============

    /// Shadow the bone anchor (pivot in world space).
    ///
    /// Steering velocity is carried by the owner body, never by the hitbox,
    /// so a ridden hitbox stays on its bone.
    pub fn follow(&mut self, anchor: Vec3) {
        self.position = anchor + Vec3::new(0.0, self.base.min.y * self.owner_scale, 0.0);
    }

    /// Whether the position moved since the last call
    pub fn take_moved(&mut self) -> bool {
        let moved = match self.sent_position {
            Some(sent) => !sent.abs_diff_eq(self.position, 1e-4),
            None => true,
        };
        self.sent_position = Some(self.position);
        moved
    }

    fn can_jump_now(&self, body: &BodyState) -> bool {
        let supported = body.on_ground
            || (body.horizontal_collision && !self.behavior.jump_requires_ground);
        self.controller.can_jump
            && supported
            && body.velocity.y.abs() < VERTICAL_REST_EPSILON
            && self.jump_cooldown == 0
    }

    /// Turn the rider's intent into a velocity delta for the owner body
    pub fn steer(&mut self, body: &BodyState, travel: Vec3) -> Vec3 {
        self.jump_cooldown = self.jump_cooldown.saturating_sub(1);
        if !self.is_controlled() {
            return Vec3::ZERO;
        }

        let move_type = self.controller.move_type(
            &self.input,
            body.has_gravity,
            self.behavior.fly_when_no_gravity,
        );
        let mut delta = self.controller.movement(move_type, &self.input, travel);

        if move_type == MoveType::Default && self.input.jump && self.can_jump_now(body) {
            delta.y += self.behavior.jump_velocity;
            self.jump_cooldown = JUMP_DELAY_TICKS;
        }

        self.velocity = delta;
        delta
    }

    // ============ Packets ============

    /// Spawn plus sizing metadata
    pub fn spawn_packets(&self, adapter: &dyn ProtocolAdapter) -> Vec<ClientboundPacket> {
        let mut packets = vec![
            ClientboundPacket::SpawnEntity {
                entity_id: self.entity_id,
                uuid: self.uuid,
                kind: EntityKind::Interaction,
                position: self.position,
                pitch: 0.0,
                yaw: 0.0,
                data: 0,
            },
            self.size_packet(adapter),
        ];
        if let Some(rider) = self.rider {
            packets.push(ClientboundPacket::SetPassengers {
                vehicle_id: self.entity_id,
                passengers: vec![rider],
            });
        }
        packets
    }

    /// Sizing metadata
    pub fn size_packet(&self, adapter: &dyn ProtocolAdapter) -> ClientboundPacket {
        ClientboundPacket::EntityMetadata {
            entity_id: self.entity_id,
            entries: adapter.hitbox_metadata(self.size),
        }
    }

    /// Current position
    pub fn teleport_packet(&self) -> ClientboundPacket {
        ClientboundPacket::Teleport {
            entity_id: self.entity_id,
            position: self.position,
            yaw: 0.0,
            pitch: 0.0,
            on_ground: false,
        }
    }

    /// Current rider list
    pub fn passengers_packet(&self) -> ClientboundPacket {
        ClientboundPacket::SetPassengers {
            vehicle_id: self.entity_id,
            passengers: self.rider.into_iter().collect(),
        }
    }

    /// Let the listener know the hitbox is going away
    pub fn notify_removed(&self) {
        if let Some(listener) = &self.listener {
            listener.on_remove(self.entity_id);
        }
    }
}

impl fmt::Debug for HitBoxProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HitBoxProxy")
            .field("entity_id", &self.entity_id)
            .field("tracker", &self.tracker)
            .field("bone", &self.bone_name)
            .field("size", &self.size)
            .field("position", &self.position)
            .field("rider", &self.rider)
            .field("controller", &self.controller.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoneSpec, SkeletonBuilder};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn hitbox(controller: MountController) -> HitBoxProxy {
        let base = Aabb::new(Vec3::new(-0.5, 0.0, -0.5), Vec3::new(0.5, 2.0, 0.5));
        let skeleton = SkeletonBuilder::new("golem")
            .bone(BoneSpec::new("body").hitbox(base))
            .build()
            .unwrap();
        HitBoxProxy::new(
            500,
            Uuid::new_v4(),
            TrackerId(1),
            &skeleton.bones()[0],
            base,
            Arc::new(controller),
            AdapterBehavior::default(),
        )
    }

    #[test]
    fn test_second_rider_is_rejected() {
        let mut hitbox = hitbox(MountController::walk());
        assert!(hitbox.mount(1));
        assert!(!hitbox.mount(2));
        assert_eq!(hitbox.rider(), Some(1));
    }

    #[test]
    fn test_unmountable_controller() {
        let mut hitbox = hitbox(MountController::none());
        assert!(!hitbox.mount(1));
        assert_eq!(hitbox.rider(), None);
    }

    #[test]
    fn test_dismount_rules() {
        let seat = MountController {
            can_dismount_by_self: false,
            ..MountController::seat()
        };
        let mut hitbox = hitbox(seat);
        hitbox.mount(7);

        assert!(!hitbox.try_dismount_by_rider());
        assert_eq!(hitbox.rider(), Some(7));

        hitbox.set_force_dismount(true);
        assert!(hitbox.try_dismount_by_rider());
        assert_eq!(hitbox.rider(), None);

        hitbox.set_force_dismount(false);
        hitbox.mount(8);
        assert_eq!(hitbox.dismount(), Some(8));
        assert_eq!(hitbox.dismount(), None);
    }

    #[test]
    fn test_jump_sets_velocity_and_cooldown() {
        let mut hitbox = hitbox(MountController::walk());
        hitbox.mount(1);
        hitbox.set_input(RiderInput::new(0.0, 0.0, true, false));

        let body = BodyState::default();
        let delta = hitbox.steer(&body, Vec3::Z);
        assert!(delta.y > 0.0);
        assert!(hitbox.velocity().y > 0.0);
        assert!(hitbox.jump_cooldown() > 0);

        // Cooldown blocks an immediate second jump
        let delta = hitbox.steer(&body, Vec3::Z);
        assert_eq!(delta.y, 0.0);
    }

    #[test]
    fn test_jump_gating() {
        let mut hitbox = hitbox(MountController::walk());
        hitbox.mount(1);
        hitbox.set_input(RiderInput::new(0.0, 0.0, true, false));

        let airborne = BodyState {
            on_ground: false,
            ..BodyState::default()
        };
        assert_eq!(hitbox.steer(&airborne, Vec3::Z).y, 0.0);

        let falling = BodyState {
            velocity: Vec3::new(0.0, -0.3, 0.0),
            ..BodyState::default()
        };
        assert_eq!(hitbox.steer(&falling, Vec3::Z).y, 0.0);

        let against_wall = BodyState {
            on_ground: false,
            horizontal_collision: true,
            ..BodyState::default()
        };
        assert!(hitbox.steer(&against_wall, Vec3::Z).y > 0.0);
    }

    #[test]
    fn test_damage_routing() {
        struct Shield(AtomicBool);
        impl HitBoxListener for Shield {
            fn on_damage(&self, _hitbox: i32, _source: Option<i32>, _amount: f32) -> bool {
                self.0.load(Ordering::SeqCst)
            }
        }

        let mut hitbox = hitbox(MountController::walk());
        let shield = Arc::new(Shield(AtomicBool::new(false)));
        hitbox.set_listener(shield.clone());
        hitbox.mount(3);

        assert_eq!(hitbox.on_damage(Some(3), 1.0), DamageOutcome::Cancelled);
        assert_eq!(hitbox.on_damage(Some(4), 1.0), DamageOutcome::Forwarded);
        assert_eq!(hitbox.on_damage(None, 1.0), DamageOutcome::Forwarded);

        shield.0.store(true, Ordering::SeqCst);
        assert_eq!(hitbox.on_damage(Some(4), 1.0), DamageOutcome::Intercepted);
    }

    #[test]
    fn test_size_follows_owner_scale() {
        let mut hitbox = hitbox(MountController::walk());
        assert_eq!(hitbox.size(), Vec3::new(1.0, 2.0, 1.0));
        assert!(hitbox.set_owner_scale(2.0));
        assert_eq!(hitbox.size(), Vec3::new(2.0, 4.0, 2.0));
        assert!(!hitbox.set_owner_scale(2.0));
        assert!(hitbox.set_owner_scale(0.5));
        assert_eq!(hitbox.size(), Vec3::new(0.5, 1.0, 0.5));
    }

    #[test]
    fn test_ridden_hitbox_stays_on_anchor() {
        let mut hitbox = hitbox(MountController::walk());
        hitbox.mount(1);
        hitbox.set_input(RiderInput::new(1.0, 0.0, true, false));
        let anchor = Vec3::new(0.0, 64.0, 0.0);

        let delta = hitbox.steer(&BodyState::default(), Vec3::Z);
        assert!(delta.y > 0.0);
        hitbox.follow(anchor);
        assert_eq!(hitbox.position(), anchor);

        hitbox.set_input(RiderInput::default());
        for _ in 0..5 {
            hitbox.steer(&BodyState::default(), Vec3::Z);
            hitbox.follow(anchor);
        }
        assert_eq!(hitbox.position(), anchor);
    }

    #[test]
    fn test_follow_anchor() {
        let mut hitbox = hitbox(MountController::walk());
        hitbox.follow(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(hitbox.position(), Vec3::new(1.0, 2.0, 3.0));
        assert!(hitbox.take_moved());
        hitbox.follow(Vec3::new(1.0, 2.0, 3.0));
        assert!(!hitbox.take_moved());
    }
}
