//! Host entity accessor
//!
//! The render core never reaches into the host's entity internals. It reads
//! live state and pushes motion through `EntityHandle`, resolved once per
//! host revision.

use glam::Vec3;
use parking_lot::RwLock;
use uuid::Uuid;

/// Live view of a host entity
pub trait EntityHandle: Send + Sync {
    fn entity_id(&self) -> i32;
    fn uuid(&self) -> Uuid;
    fn position(&self) -> Vec3;
    /// Body yaw in degrees
    fn body_yaw(&self) -> f32;
    fn velocity(&self) -> Vec3;
    fn on_ground(&self) -> bool;
    fn is_alive(&self) -> bool;
    /// Whether the entity still carries model tracking metadata
    fn has_model_tag(&self) -> bool;
    /// Add to the entity's velocity
    fn apply_velocity(&self, delta: Vec3);
    /// Apply damage from an optional attacker entity
    fn damage(&self, source: Option<i32>, amount: f32);

    /// Generic scale attribute
    fn scale(&self) -> f32 {
        1.0
    }

    fn horizontal_collision(&self) -> bool {
        false
    }

    fn has_gravity(&self) -> bool {
        true
    }

    /// Selected hotbar slot, for players
    fn held_slot(&self) -> i16 {
        0
    }

    /// Entity ids riding this entity
    fn passenger_ids(&self) -> Vec<i32> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct BasicEntityState {
    position: Vec3,
    body_yaw: f32,
    velocity: Vec3,
    scale: f32,
    on_ground: bool,
    horizontal_collision: bool,
    has_gravity: bool,
    alive: bool,
    model_tag: bool,
    held_slot: i16,
    passengers: Vec<i32>,
    damage_taken: Vec<(Option<i32>, f32)>,
}

/// Plain in-memory entity
#[derive(Debug)]
pub struct BasicEntity {
    entity_id: i32,
    uuid: Uuid,
    state: RwLock<BasicEntityState>,
}

impl BasicEntity {
    /// Create a grounded, living entity carrying a model tag
    pub fn new(entity_id: i32, uuid: Uuid, position: Vec3) -> Self {
        Self {
            entity_id,
            uuid,
            state: RwLock::new(BasicEntityState {
                position,
                body_yaw: 0.0,
                velocity: Vec3::ZERO,
                scale: 1.0,
                on_ground: true,
                horizontal_collision: false,
                has_gravity: true,
                alive: true,
                model_tag: true,
                held_slot: 0,
                passengers: Vec::new(),
                damage_taken: Vec::new(),
            }),
        }
    }

    pub fn set_position(&self, position: Vec3) {
        self.state.write().position = position;
    }

    pub fn set_body_yaw(&self, yaw: f32) {
        self.state.write().body_yaw = yaw;
    }

    pub fn set_velocity(&self, velocity: Vec3) {
        self.state.write().velocity = velocity;
    }

    pub fn set_scale(&self, scale: f32) {
        self.state.write().scale = scale;
    }

    pub fn set_on_ground(&self, on_ground: bool) {
        self.state.write().on_ground = on_ground;
    }

    pub fn set_horizontal_collision(&self, collision: bool) {
        self.state.write().horizontal_collision = collision;
    }

    pub fn set_gravity(&self, gravity: bool) {
        self.state.write().has_gravity = gravity;
    }

    pub fn set_alive(&self, alive: bool) {
        self.state.write().alive = alive;
    }

    pub fn set_model_tag(&self, tagged: bool) {
        self.state.write().model_tag = tagged;
    }

    pub fn set_held_slot(&self, slot: i16) {
        self.state.write().held_slot = slot;
    }

    pub fn set_passengers(&self, passengers: Vec<i32>) {
        self.state.write().passengers = passengers;
    }

    /// Every damage event received, in order
    pub fn damage_taken(&self) -> Vec<(Option<i32>, f32)> {
        self.state.read().damage_taken.clone()
    }
}

impl EntityHandle for BasicEntity {
    fn entity_id(&self) -> i32 {
        self.entity_id
    }

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn position(&self) -> Vec3 {
        self.state.read().position
    }

    fn body_yaw(&self) -> f32 {
        self.state.read().body_yaw
    }

    fn velocity(&self) -> Vec3 {
        self.state.read().velocity
    }

    fn on_ground(&self) -> bool {
        self.state.read().on_ground
    }

    fn is_alive(&self) -> bool {
        self.state.read().alive
    }

    fn has_model_tag(&self) -> bool {
        self.state.read().model_tag
    }

    fn apply_velocity(&self, delta: Vec3) {
        self.state.write().velocity += delta;
    }

    fn damage(&self, source: Option<i32>, amount: f32) {
        self.state.write().damage_taken.push((source, amount));
    }

    fn scale(&self) -> f32 {
        self.state.read().scale
    }

    fn horizontal_collision(&self) -> bool {
        self.state.read().horizontal_collision
    }

    fn has_gravity(&self) -> bool {
        self.state.read().has_gravity
    }

    fn held_slot(&self) -> i16 {
        self.state.read().held_slot
    }

    fn passenger_ids(&self) -> Vec<i32> {
        self.state.read().passengers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_entity() {
        let entity = BasicEntity::new(5, Uuid::new_v4(), Vec3::new(1.0, 64.0, 1.0));
        assert_eq!(entity.entity_id(), 5);
        assert!(entity.on_ground());
        assert!(entity.has_model_tag());

        entity.apply_velocity(Vec3::new(0.0, 0.5, 0.0));
        entity.apply_velocity(Vec3::new(0.1, 0.0, 0.0));
        assert!(entity
            .velocity()
            .abs_diff_eq(Vec3::new(0.1, 0.5, 0.0), 1e-6));

        entity.damage(Some(9), 2.0);
        assert_eq!(entity.damage_taken(), vec![(Some(9), 2.0)]);

        entity.set_scale(2.0);
        assert_eq!(entity.scale(), 2.0);
    }
}
