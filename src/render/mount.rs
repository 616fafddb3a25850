//! Mount controllers
//!
//! A controller is an immutable strategy shared by any number of hitboxes.
//! It says what a rider may do and maps raw rider intent to a velocity
//! delta; it keeps no state of its own.

use glam::Vec3;

/// How a controlled hitbox moves this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveType {
    Default,
    Fly,
}

/// Raw rider intent, axes in `-1.0..=1.0`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RiderInput {
    pub forward: f32,
    pub strafe: f32,
    pub jump: bool,
    pub sneak: bool,
}

impl RiderInput {
    /// Create rider input, clamping the axes
    pub fn new(forward: f32, strafe: f32, jump: bool, sneak: bool) -> Self {
        let axis = |v: f32| if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
        Self {
            forward: axis(forward),
            strafe: axis(strafe),
            jump,
            sneak,
        }
    }

    /// No movement requested
    pub fn is_idle(&self) -> bool {
        self.forward == 0.0 && self.strafe == 0.0 && !self.jump && !self.sneak
    }
}

/// Capabilities and movement rule of a mount
#[derive(Debug, Clone, PartialEq)]
pub struct MountController {
    pub name: String,
    pub can_mount: bool,
    pub can_control: bool,
    pub can_fly: bool,
    pub can_jump: bool,
    pub can_dismount_by_self: bool,
    pub can_be_damaged_by_rider: bool,
    /// Horizontal speed in blocks per tick
    pub speed: f32,
    /// Vertical speed while flying
    pub fly_speed: f32,
}

impl MountController {
    /// Rideable and steerable on the ground
    pub fn walk() -> Self {
        Self {
            name: "walk".to_string(),
            can_mount: true,
            can_control: true,
            can_fly: false,
            can_jump: true,
            can_dismount_by_self: true,
            can_be_damaged_by_rider: false,
            speed: 0.25,
            fly_speed: 0.0,
        }
    }

    /// Rideable and steerable in the air
    pub fn fly() -> Self {
        Self {
            name: "fly".to_string(),
            can_fly: true,
            can_jump: false,
            fly_speed: 0.2,
            ..Self::walk()
        }
    }

    /// Rideable but not steerable
    pub fn seat() -> Self {
        Self {
            name: "seat".to_string(),
            can_control: false,
            can_jump: false,
            speed: 0.0,
            ..Self::walk()
        }
    }

    /// Not rideable at all
    pub fn none() -> Self {
        Self {
            name: "none".to_string(),
            can_mount: false,
            can_control: false,
            can_jump: false,
            can_be_damaged_by_rider: true,
            speed: 0.0,
            ..Self::walk()
        }
    }

    /// Look up a built-in controller by name
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "walk" => Some(Self::walk()),
            "fly" => Some(Self::fly()),
            "seat" => Some(Self::seat()),
            "none" => Some(Self::none()),
            _ => None,
        }
    }

    /// Copy with a different name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Copy with a different horizontal speed
    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    /// Choose between ground and flight movement
    pub fn move_type(
        &self,
        input: &RiderInput,
        body_has_gravity: bool,
        fly_when_no_gravity: bool,
    ) -> MoveType {
        if self.can_fly && (input.jump || (fly_when_no_gravity && !body_has_gravity)) {
            MoveType::Fly
        } else {
            MoveType::Default
        }
    }

    /// Velocity delta for one tick.
    ///
    /// `travel` is the rider's horizontal facing; strafing moves along the
    /// axis perpendicular to it.
    pub fn movement(&self, move_type: MoveType, input: &RiderInput, travel: Vec3) -> Vec3 {
        if !self.can_control {
            return Vec3::ZERO;
        }

        let facing = Vec3::new(travel.x, 0.0, travel.z).normalize_or_zero();
        let side = Vec3::Y.cross(facing);
        let mut horizontal = facing * input.forward + side * input.strafe;
        if horizontal.length_squared() > 1.0 {
            horizontal = horizontal.normalize();
        }
        let mut delta = horizontal * self.speed;

        if move_type == MoveType::Fly && self.can_fly {
            let vertical = input.jump as i32 as f32 - input.sneak as i32 as f32;
            delta.y = vertical * self.fly_speed;
        }

        delta
    }
}

impl Default for MountController {
    fn default() -> Self {
        Self::walk()
    }
}
