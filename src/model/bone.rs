//! Skeleton and bone model
//!
//! A `Skeleton` is an immutable arena of bones. Parent/child links are
//! stored as `BoneId` indices, and bones are ordered so that every parent
//! comes before its children, which lets pose composition run in one pass.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::animation::{AnimationClip, ClipBuilder};
use super::transform::{BoneDelta, Transform};
use crate::error::ModelError;
use crate::skin::SkinTexture;

/// Maximum bones in one skeleton
pub const MAX_BONES: usize = 1024;

/// Stable index of a bone within its skeleton
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoneId(pub u16);

impl BoneId {
    /// Index into the skeleton's bone arena
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Axis-aligned box in model space (blocks)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    /// Create a box from two corners
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Box extents
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Box centre
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Box scaled about its centre
    pub fn scaled(&self, factor: f32) -> Self {
        let center = self.center();
        let half = self.size() * 0.5 * factor;
        Self::new(center - half, center + half)
    }

    /// Horizontal footprint used for the hitbox width
    pub fn width(&self) -> f32 {
        let size = self.size();
        size.x.max(size.z)
    }
}

/// Visual payload rendered for a bone (an item-like model reference)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualRef {
    /// Item type the client renders
    pub item: String,
    /// Resource-pack model selector
    #[serde(default)]
    pub model_data: i32,
    /// Player skin applied to head-like items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skin: Option<SkinTexture>,
}

impl VisualRef {
    /// Create a visual reference
    pub fn new(item: impl Into<String>, model_data: i32) -> Self {
        Self {
            item: item.into(),
            model_data,
            skin: None,
        }
    }

    /// Copy with a skin texture applied
    pub fn with_skin(&self, skin: SkinTexture) -> Self {
        Self {
            skin: Some(skin),
            ..self.clone()
        }
    }
}

/// A named node of the skeleton tree
#[derive(Debug, Clone, PartialEq)]
pub struct Bone {
    pub id: BoneId,
    pub name: String,
    pub parent: Option<BoneId>,
    pub children: Vec<BoneId>,
    /// Rotation origin in model space
    pub pivot: Vec3,
    /// Rest transform relative to the pivot
    pub rest: Transform,
    pub visual: Option<VisualRef>,
    pub hitbox: Option<Aabb>,
}

/// Model-space pose of one bone
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BonePose {
    pub matrix: Mat4,
    /// Pivot position after transformation
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

/// Unresolved bone definition
#[derive(Debug, Clone)]
pub struct BoneSpec {
    name: String,
    parent: Option<String>,
    pivot: Vec3,
    rest: Transform,
    visual: Option<VisualRef>,
    hitbox: Option<Aabb>,
}

impl BoneSpec {
    /// Start a bone definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            pivot: Vec3::ZERO,
            rest: Transform::IDENTITY,
            visual: None,
            hitbox: None,
        }
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn pivot(mut self, pivot: Vec3) -> Self {
        self.pivot = pivot;
        self
    }

    pub fn rest(mut self, rest: Transform) -> Self {
        self.rest = rest;
        self
    }

    pub fn visual(mut self, visual: VisualRef) -> Self {
        self.visual = Some(visual);
        self
    }

    pub fn hitbox(mut self, hitbox: Aabb) -> Self {
        self.hitbox = Some(hitbox);
        self
    }
}

/// Builds and validates a `Skeleton`
#[derive(Debug, Clone)]
pub struct SkeletonBuilder {
    name: String,
    bones: Vec<BoneSpec>,
    clips: Vec<ClipBuilder>,
    merge_threshold: f32,
}

impl SkeletonBuilder {
    /// Start a skeleton definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bones: Vec::new(),
            clips: Vec::new(),
            merge_threshold: 0.0,
        }
    }

    /// Keyframes closer than `threshold` seconds are merged
    pub fn merge_threshold(mut self, threshold: f32) -> Self {
        self.merge_threshold = threshold.max(0.0);
        self
    }

    /// Add a bone
    pub fn bone(mut self, bone: BoneSpec) -> Self {
        self.bones.push(bone);
        self
    }

    /// Add an animation clip
    pub fn clip(mut self, clip: ClipBuilder) -> Self {
        self.clips.push(clip);
        self
    }

    /// Resolve the hierarchy and clips
    pub fn build(self) -> Result<Skeleton, ModelError> {
        if self.name.trim().is_empty() {
            return Err(ModelError::MissingName);
        }
        if self.bones.len() > MAX_BONES {
            return Err(ModelError::TooManyBones {
                count: self.bones.len(),
                max: MAX_BONES,
            });
        }

        let mut spec_index: HashMap<&str, usize> = HashMap::with_capacity(self.bones.len());
        for (i, spec) in self.bones.iter().enumerate() {
            if spec_index.insert(spec.name.as_str(), i).is_some() {
                return Err(ModelError::DuplicateBone(spec.name.clone()));
            }
        }

        // Resolve parents and children by definition index
        let mut parents: Vec<Option<usize>> = Vec::with_capacity(self.bones.len());
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.bones.len()];
        for (i, spec) in self.bones.iter().enumerate() {
            let parent = match &spec.parent {
                Some(name) => Some(*spec_index.get(name.as_str()).ok_or_else(|| {
                    ModelError::UnknownParent {
                        bone: spec.name.clone(),
                        parent: name.clone(),
                    }
                })?),
                None => None,
            };
            if let Some(p) = parent {
                children[p].push(i);
            }
            parents.push(parent);
        }

        // Breadth-first from the roots; anything unreached sits on a cycle
        let mut order: Vec<usize> = Vec::with_capacity(self.bones.len());
        let mut queue: VecDeque<usize> = (0..self.bones.len())
            .filter(|&i| parents[i].is_none())
            .collect();
        while let Some(i) = queue.pop_front() {
            order.push(i);
            queue.extend(children[i].iter().copied());
        }
        if order.len() != self.bones.len() {
            let stuck = (0..self.bones.len())
                .find(|i| !order.contains(i))
                .map(|i| self.bones[i].name.clone())
                .unwrap_or_default();
            return Err(ModelError::CyclicHierarchy(stuck));
        }

        let mut new_id = vec![BoneId(0); self.bones.len()];
        for (position, &i) in order.iter().enumerate() {
            new_id[i] = BoneId(position as u16);
        }

        let mut specs: Vec<Option<BoneSpec>> = self.bones.into_iter().map(Some).collect();
        let mut bones = Vec::with_capacity(specs.len());
        let mut by_name = HashMap::with_capacity(specs.len());
        for &i in &order {
            let Some(spec) = specs[i].take() else {
                continue;
            };
            let id = new_id[i];
            by_name.insert(spec.name.clone(), id);
            bones.push(Bone {
                id,
                name: spec.name,
                parent: parents[i].map(|p| new_id[p]),
                children: children[i].iter().map(|&c| new_id[c]).collect(),
                pivot: spec.pivot,
                rest: spec.rest,
                visual: spec.visual,
                hitbox: spec.hitbox,
            });
        }

        // A malformed clip is dropped on its own; the hierarchy stays usable
        let mut clips = HashMap::with_capacity(self.clips.len());
        for clip in self.clips {
            let name = clip.name().to_string();
            if clips.contains_key(&name) {
                return Err(ModelError::DuplicateClip(name));
            }
            match clip.build(|bone| by_name.get(bone).copied(), self.merge_threshold) {
                Ok(built) => {
                    clips.insert(name, Arc::new(built));
                }
                Err(e) => {
                    warn!(model = %self.name, clip = %name, error = %e, "Skipping malformed animation");
                }
            }
        }

        Ok(Skeleton {
            name: self.name,
            bones,
            by_name,
            clips,
        })
    }
}

/// Immutable bone tree plus its animation clips
#[derive(Debug, Clone)]
pub struct Skeleton {
    name: String,
    bones: Vec<Bone>,
    by_name: HashMap<String, BoneId>,
    clips: HashMap<String, Arc<AnimationClip>>,
}

impl Skeleton {
    /// Get the model name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All bones, parents before children
    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    /// Number of bones
    pub fn len(&self) -> usize {
        self.bones.len()
    }

    /// Whether the skeleton has no bones
    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    /// Get a bone by id
    pub fn bone(&self, id: BoneId) -> Option<&Bone> {
        self.bones.get(id.index())
    }

    /// Look up a bone id by name
    pub fn find(&self, name: &str) -> Option<BoneId> {
        self.by_name.get(name).copied()
    }

    /// Root bones
    pub fn roots(&self) -> impl Iterator<Item = &Bone> {
        self.bones.iter().filter(|b| b.parent.is_none())
    }

    /// A bone and every bone below it
    pub fn descendants(&self, id: BoneId) -> Vec<BoneId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(bone) = self.bone(current) {
                out.push(current);
                stack.extend(bone.children.iter().rev().copied());
            }
        }
        out
    }

    /// Get an animation clip by name
    pub fn clip(&self, name: &str) -> Option<Arc<AnimationClip>> {
        self.clips.get(name).cloned()
    }

    /// Names of every clip
    pub fn clip_names(&self) -> impl Iterator<Item = &str> {
        self.clips.keys().map(String::as_str)
    }

    /// Compose model-space poses for every bone.
    ///
    /// `delta` supplies the animation offset of each bone.
    pub fn pose<F>(&self, delta: F) -> Vec<BonePose>
    where
        F: Fn(BoneId) -> BoneDelta,
    {
        let mut world: Vec<Mat4> = Vec::with_capacity(self.bones.len());
        let mut poses = Vec::with_capacity(self.bones.len());

        for bone in &self.bones {
            let d = delta(bone.id);
            let local = Mat4::from_translation(bone.pivot + bone.rest.translation + d.position)
                * Mat4::from_quat(bone.rest.rotation * d.rotation_quat())
                * Mat4::from_scale(bone.rest.scale * d.scale)
                * Mat4::from_translation(-bone.pivot);

            let matrix = match bone.parent {
                Some(parent) => world[parent.index()] * local,
                None => local,
            };
            world.push(matrix);

            let (scale, rotation, _) = matrix.to_scale_rotation_translation();
            poses.push(BonePose {
                matrix,
                position: matrix.transform_point3(bone.pivot),
                rotation: rotation.normalize(),
                scale,
            });
        }

        poses
    }

    /// Rest pose of every bone
    pub fn rest_pose(&self) -> Vec<BonePose> {
        self.pose(|_| BoneDelta::IDENTITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::animation::{ChannelKind, Keyframe};

    fn arm_skeleton() -> Skeleton {
        // Children deliberately listed before their parents
        SkeletonBuilder::new("golem")
            .bone(BoneSpec::new("hand").parent("arm").pivot(Vec3::new(0.0, 1.0, 1.0)))
            .bone(BoneSpec::new("arm").parent("body").pivot(Vec3::new(0.0, 1.0, 0.0)))
            .bone(
                BoneSpec::new("body")
                    .visual(VisualRef::new("paper", 1))
                    .hitbox(Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))),
            )
            .bone(BoneSpec::new("head").parent("body").pivot(Vec3::new(0.0, 2.0, 0.0)))
            .clip(ClipBuilder::new("wave").channel(
                "arm",
                ChannelKind::Rotation,
                vec![Keyframe::linear(0.0, Vec3::ZERO)],
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn test_parents_precede_children() {
        let skeleton = arm_skeleton();
        assert_eq!(skeleton.len(), 4);
        for bone in skeleton.bones() {
            if let Some(parent) = bone.parent {
                assert!(parent < bone.id);
                assert!(skeleton.bone(parent).unwrap().children.contains(&bone.id));
            }
        }
        assert_eq!(skeleton.roots().count(), 1);
    }

    #[test]
    fn test_descendants() {
        let skeleton = arm_skeleton();
        let body = skeleton.find("body").unwrap();
        let arm = skeleton.find("arm").unwrap();
        assert_eq!(skeleton.descendants(body).len(), 4);
        let below_arm = skeleton.descendants(arm);
        assert_eq!(below_arm.len(), 2);
        assert!(below_arm.contains(&skeleton.find("hand").unwrap()));
    }

    #[test]
    fn test_rejects_bad_hierarchies() {
        let unknown = SkeletonBuilder::new("m")
            .bone(BoneSpec::new("a").parent("missing"))
            .build();
        assert!(matches!(unknown, Err(ModelError::UnknownParent { .. })));

        let duplicate = SkeletonBuilder::new("m")
            .bone(BoneSpec::new("a"))
            .bone(BoneSpec::new("a"))
            .build();
        assert!(matches!(duplicate, Err(ModelError::DuplicateBone(_))));

        let cycle = SkeletonBuilder::new("m")
            .bone(BoneSpec::new("a").parent("b"))
            .bone(BoneSpec::new("b").parent("a"))
            .build();
        assert!(matches!(cycle, Err(ModelError::CyclicHierarchy(_))));

        let unnamed = SkeletonBuilder::new(" ").build();
        assert!(matches!(unnamed, Err(ModelError::MissingName)));
    }

    #[test]
    fn test_malformed_clip_is_skipped() {
        let skeleton = SkeletonBuilder::new("golem")
            .bone(BoneSpec::new("body"))
            .clip(ClipBuilder::new("idle").channel(
                "body",
                ChannelKind::Position,
                vec![Keyframe::linear(0.0, Vec3::ZERO), Keyframe::linear(1.0, Vec3::Y)],
            ))
            .clip(ClipBuilder::new("broken").channel(
                "body",
                ChannelKind::Position,
                vec![Keyframe::linear(0.5, Vec3::ZERO), Keyframe::linear(0.5, Vec3::Y)],
            ))
            .clip(ClipBuilder::new("nan").channel(
                "body",
                ChannelKind::Scale,
                vec![Keyframe::linear(f32::NAN, Vec3::ONE)],
            ))
            .build()
            .unwrap();

        assert!(skeleton.clip("idle").is_some());
        assert!(skeleton.clip("broken").is_none());
        assert!(skeleton.clip("nan").is_none());
        assert_eq!(skeleton.clip_names().count(), 1);
    }

    #[test]
    fn test_clip_lookup() {
        let skeleton = arm_skeleton();
        assert!(skeleton.clip("wave").is_some());
        assert!(skeleton.clip("dance").is_none());
        assert_eq!(skeleton.clip_names().count(), 1);
    }

    #[test]
    fn test_pose_inherits_parent_rotation() {
        let skeleton = arm_skeleton();
        let arm = skeleton.find("arm").unwrap();
        let hand = skeleton.find("hand").unwrap();

        let rest = skeleton.rest_pose();
        assert!(rest[hand.index()]
            .position
            .abs_diff_eq(Vec3::new(0.0, 1.0, 1.0), 1e-5));

        // Rotating the arm -90 degrees about X swings the hand up around the arm pivot
        let posed = skeleton.pose(|id| {
            if id == arm {
                BoneDelta {
                    rotation: Vec3::new(-90.0, 0.0, 0.0),
                    ..BoneDelta::IDENTITY
                }
            } else {
                BoneDelta::IDENTITY
            }
        });
        assert!(posed[hand.index()]
            .position
            .abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-5));
        assert!(posed[arm.index()]
            .position
            .abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-5));
    }

    #[test]
    fn test_aabb() {
        let aabb = Aabb::new(Vec3::new(1.0, 2.0, 0.0), Vec3::new(-1.0, 0.0, 0.5));
        assert_eq!(aabb.min, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(aabb.size(), Vec3::new(2.0, 2.0, 0.5));
        assert_eq!(aabb.width(), 2.0);
        assert_eq!(aabb.scaled(2.0).size(), Vec3::new(4.0, 4.0, 1.0));
    }
}
