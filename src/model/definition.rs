//! Skeleton definition interchange
//!
//! The JSON shape a model importer hands to the render core. It mirrors
//! `SkeletonBuilder` one to one; all validation happens in the builder.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::animation::{ChannelKind, ClipBuilder, Keyframe, LoopMode};
use super::bone::{Aabb, BoneSpec, Skeleton, SkeletonBuilder, VisualRef};
use super::transform::Transform;
use crate::error::{ModelError, Result};

fn default_scale() -> Vec3 {
    Vec3::ONE
}

/// A complete model definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkeletonDef {
    pub name: String,
    pub bones: Vec<BoneDef>,
    #[serde(default)]
    pub animations: Vec<ClipDef>,
}

/// One bone of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoneDef {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub pivot: Vec3,
    #[serde(default)]
    pub translation: Vec3,
    /// Euler degrees
    #[serde(default)]
    pub rotation: Vec3,
    #[serde(default = "default_scale")]
    pub scale: Vec3,
    #[serde(default)]
    pub visual: Option<VisualRef>,
    #[serde(default)]
    pub hitbox: Option<Aabb>,
}

/// One animation of a definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipDef {
    pub name: String,
    #[serde(default)]
    pub loop_mode: LoopMode,
    #[serde(default)]
    pub length: Option<f32>,
    #[serde(default)]
    pub channels: Vec<ChannelDef>,
}

/// Keyframes of one bone property
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDef {
    pub bone: String,
    pub kind: ChannelKind,
    pub keyframes: Vec<Keyframe>,
}

impl SkeletonDef {
    /// Decode a definition from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Convert into a builder
    pub fn into_builder(self) -> SkeletonBuilder {
        let mut builder = SkeletonBuilder::new(self.name);

        for bone in self.bones {
            let mut spec = BoneSpec::new(bone.name).pivot(bone.pivot).rest(
                Transform::from_euler_degrees(bone.translation, bone.rotation, bone.scale),
            );
            if let Some(parent) = bone.parent {
                spec = spec.parent(parent);
            }
            if let Some(visual) = bone.visual {
                spec = spec.visual(visual);
            }
            if let Some(hitbox) = bone.hitbox {
                spec = spec.hitbox(hitbox);
            }
            builder = builder.bone(spec);
        }

        for clip in self.animations {
            let mut clip_builder = ClipBuilder::new(clip.name).loop_mode(clip.loop_mode);
            if let Some(length) = clip.length {
                clip_builder = clip_builder.length(length);
            }
            for channel in clip.channels {
                clip_builder = clip_builder.channel(channel.bone, channel.kind, channel.keyframes);
            }
            builder = builder.clip(clip_builder);
        }

        builder
    }

    /// Build a validated skeleton
    pub fn build(self, merge_threshold: f32) -> std::result::Result<Skeleton, ModelError> {
        self.into_builder().merge_threshold(merge_threshold).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLEM: &str = r#"{
        "name": "golem",
        "bones": [
            { "name": "body", "visual": { "item": "paper", "model_data": 10 },
              "hitbox": { "min": [-0.5, 0.0, -0.5], "max": [0.5, 2.0, 0.5] } },
            { "name": "head", "parent": "body", "pivot": [0.0, 2.0, 0.0],
              "visual": { "item": "paper", "model_data": 11 } }
        ],
        "animations": [
            { "name": "idle", "loop_mode": "loop", "channels": [
                { "bone": "head", "kind": "rotation", "keyframes": [
                    { "time": 0.0, "value": [0.0, 0.0, 0.0] },
                    { "time": 1.0, "value": [0.0, 30.0, 0.0], "interpolation": "catmull_rom" }
                ] }
            ] }
        ]
    }"#;

    #[test]
    fn test_decode_and_build() {
        let def = SkeletonDef::from_json(GOLEM).unwrap();
        assert_eq!(def.bones.len(), 2);
        assert_eq!(def.bones[0].scale, Vec3::ONE);

        let skeleton = def.build(0.01).unwrap();
        assert_eq!(skeleton.name(), "golem");
        let head = skeleton.find("head").unwrap();
        assert_eq!(
            skeleton.bone(head).unwrap().visual.as_ref().unwrap().model_data,
            11
        );
        let idle = skeleton.clip("idle").unwrap();
        assert_eq!(idle.loop_mode(), LoopMode::Loop);
        assert_eq!(idle.duration(), 1.0);
    }

    #[test]
    fn test_invalid_definition_is_rejected() {
        let text = GOLEM.replace("\"parent\": \"body\"", "\"parent\": \"torso\"");
        let def = SkeletonDef::from_json(&text).unwrap();
        assert!(matches!(
            def.build(0.0),
            Err(ModelError::UnknownParent { .. })
        ));

        assert!(SkeletonDef::from_json("{ not json").is_err());
    }

    #[test]
    fn test_bad_clip_keeps_model() {
        let broken = r#"{ "name": "broken", "channels": [
                { "bone": "body", "kind": "position", "keyframes": [
                    { "time": 0.5, "value": [0.0, 0.0, 0.0] },
                    { "time": 0.5, "value": [0.0, 1.0, 0.0] }
                ] }
            ] },
            { "name": "idle","#;
        let text = GOLEM.replacen(r#"{ "name": "idle","#, broken, 1);
        let skeleton = SkeletonDef::from_json(&text).unwrap().build(0.0).unwrap();
        assert!(skeleton.clip("idle").is_some());
        assert!(skeleton.clip("broken").is_none());
    }
}
