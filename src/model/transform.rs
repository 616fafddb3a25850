//! Bone transforms
//!
//! `Transform` is a bone's rest-pose translation/rotation/scale;
//! `BoneDelta` is what an animation adds on top of it for one tick.

use glam::{EulerRot, Mat4, Quat, Vec3};

/// Convert an euler rotation in degrees (X, Y, Z) into a quaternion.
///
/// Rotations are applied Z first, then Y, then X, which is the order
/// model editors export.
pub fn euler_degrees_to_quat(degrees: Vec3) -> Quat {
    Quat::from_euler(
        EulerRot::ZYX,
        degrees.z.to_radians(),
        degrees.y.to_radians(),
        degrees.x.to_radians(),
    )
}

/// Translation, rotation and scale of a bone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// Create a new transform
    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    /// Create a transform from an euler rotation in degrees
    pub fn from_euler_degrees(translation: Vec3, rotation: Vec3, scale: Vec3) -> Self {
        Self::new(translation, euler_degrees_to_quat(rotation), scale)
    }

    /// Build the affine matrix for this transform
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Decompose an affine matrix
    pub fn from_matrix(matrix: &Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self::new(translation, rotation.normalize(), scale)
    }

    /// Interpolate towards another transform
    pub fn lerp(&self, other: &Transform, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self {
            translation: self.translation.lerp(other.translation, t),
            rotation: self.rotation.slerp(other.rotation, t),
            scale: self.scale.lerp(other.scale, t),
        }
    }

    /// Whether every component is finite
    pub fn is_finite(&self) -> bool {
        self.translation.is_finite() && self.rotation.is_finite() && self.scale.is_finite()
    }
}

/// Per-tick animation offset applied on top of a bone's rest transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoneDelta {
    /// Offset from the rest position
    pub position: Vec3,
    /// Euler rotation in degrees
    pub rotation: Vec3,
    /// Multiplier on the rest scale
    pub scale: Vec3,
}

impl Default for BoneDelta {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl BoneDelta {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Vec3::ZERO,
        scale: Vec3::ONE,
    };

    /// Rotation as a quaternion
    pub fn rotation_quat(&self) -> Quat {
        euler_degrees_to_quat(self.rotation)
    }

    /// Linear blend used for crossfades
    pub fn lerp(&self, other: &BoneDelta, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.lerp(other.rotation, t),
            scale: self.scale.lerp(other.scale, t),
        }
    }

    /// Whether this delta leaves the rest pose unchanged
    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_matrix() {
        assert_eq!(Transform::IDENTITY.to_matrix(), Mat4::IDENTITY);
        assert!(BoneDelta::IDENTITY.is_identity());
    }

    #[test]
    fn test_matrix_round_trip() {
        let transform = Transform::from_euler_degrees(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.0, 90.0, 0.0),
            Vec3::splat(2.0),
        );
        let back = Transform::from_matrix(&transform.to_matrix());
        assert!(back.translation.abs_diff_eq(transform.translation, 1e-5));
        assert!(back.scale.abs_diff_eq(transform.scale, 1e-5));
        assert!((back.rotation * Vec3::X).abs_diff_eq(transform.rotation * Vec3::X, 1e-5));
    }

    #[test]
    fn test_euler_yaw() {
        let quat = euler_degrees_to_quat(Vec3::new(0.0, 90.0, 0.0));
        let rotated = quat * Vec3::X;
        assert!(rotated.abs_diff_eq(Vec3::new(0.0, 0.0, -1.0), 1e-5));
    }

    #[test]
    fn test_delta_lerp() {
        let a = BoneDelta::IDENTITY;
        let b = BoneDelta {
            position: Vec3::new(0.0, 2.0, 0.0),
            rotation: Vec3::new(90.0, 0.0, 0.0),
            scale: Vec3::splat(3.0),
        };
        let mid = a.lerp(&b, 0.5);
        assert_eq!(mid.position, Vec3::new(0.0, 1.0, 0.0));
        assert_eq!(mid.rotation, Vec3::new(45.0, 0.0, 0.0));
        assert_eq!(mid.scale, Vec3::splat(2.0));
        // Clamped outside [0, 1]
        assert_eq!(a.lerp(&b, 4.0), b);
    }
}
