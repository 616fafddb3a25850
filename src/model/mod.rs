//! Skeleton and animation model
//!
//! This module contains the static shape of a model and its animations:
//! - Transform math and per-bone deltas
//! - The bone arena and pose composition
//! - Keyframe channels, clips and the sampler
//! - The JSON definition interchange and the loaded-model store

pub mod animation;
pub mod bone;
pub mod definition;
pub mod store;
pub mod transform;

pub use animation::{
    sample, AnimationClip, ChannelKind, ClipBuilder, ClipSample, Interpolation, Keyframe,
    LoopMode, PlaybackStatus,
};
pub use bone::{Aabb, Bone, BoneId, BonePose, BoneSpec, Skeleton, SkeletonBuilder, VisualRef};
pub use definition::SkeletonDef;
pub use store::ModelStore;
pub use transform::{BoneDelta, Transform};
