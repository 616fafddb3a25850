//! Animation engine
//!
//! Converts keyframe channels into a per-tick `BoneDelta` for every animated
//! bone. Clips are validated once when they are built; sampling never fails
//! and at worst yields identity deltas.
//!
//! - `Channel` holds the sorted keyframes of one bone property
//! - `AnimationClip` groups channels per bone and carries the loop mode
//! - `sample()` evaluates a clip at an elapsed time under a loop mode

use std::collections::HashMap;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::bone::BoneId;
use super::transform::BoneDelta;
use crate::error::ModelError;

/// How playback behaves once the clip's duration is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Stop after one pass; the last pose is emitted once more
    #[default]
    PlayOnce,
    /// Wrap around to the start
    Loop,
    /// Freeze on the last pose but keep reporting playback as active
    HoldOnLast,
}

/// Interpolation towards the next keyframe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    #[default]
    Linear,
    Step,
    CatmullRom,
}

/// Which bone property a channel drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Position,
    Rotation,
    Scale,
}

impl ChannelKind {
    /// Value used when a bone has no channel of this kind
    pub fn rest_value(self) -> Vec3 {
        match self {
            ChannelKind::Scale => Vec3::ONE,
            ChannelKind::Position | ChannelKind::Rotation => Vec3::ZERO,
        }
    }
}

/// A timestamped value of one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    /// Time in seconds from the clip start
    pub time: f32,
    pub value: Vec3,
    #[serde(default)]
    pub interpolation: Interpolation,
}

impl Keyframe {
    /// Create a keyframe
    pub fn new(time: f32, value: Vec3, interpolation: Interpolation) -> Self {
        Self {
            time,
            value,
            interpolation,
        }
    }

    /// Create a linear keyframe
    pub fn linear(time: f32, value: Vec3) -> Self {
        Self::new(time, value, Interpolation::Linear)
    }

    /// Create a Catmull-Rom keyframe
    pub fn spline(time: f32, value: Vec3) -> Self {
        Self::new(time, value, Interpolation::CatmullRom)
    }
}

/// Uniform Catmull-Rom basis through `p1` (u = 0) and `p2` (u = 1)
fn catmull_rom(p0: Vec3, p1: Vec3, p2: Vec3, p3: Vec3, u: f32) -> Vec3 {
    let u2 = u * u;
    let u3 = u2 * u;
    0.5 * ((2.0 * p1)
        + (p2 - p0) * u
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * u2
        + (3.0 * p1 - p0 - 3.0 * p2 + p3) * u3)
}

/// Sorted, validated keyframes of one bone property
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    keyframes: Vec<Keyframe>,
}

impl Channel {
    /// Validate and sort keyframes.
    ///
    /// Keyframes closer than `merge_threshold` to the start of their run
    /// collapse onto the last keyframe of that run, so the final pose and
    /// end time survive. Exact duplicates are rejected instead.
    pub fn new(
        clip: &str,
        bone: &str,
        mut keyframes: Vec<Keyframe>,
        merge_threshold: f32,
    ) -> Result<Self, ModelError> {
        for keyframe in &keyframes {
            if !keyframe.time.is_finite() || keyframe.time < 0.0 {
                return Err(ModelError::InvalidKeyframe {
                    clip: clip.to_string(),
                    bone: bone.to_string(),
                    time: keyframe.time,
                    reason: "timestamp must be finite and non-negative".to_string(),
                });
            }
            if !keyframe.value.is_finite() {
                return Err(ModelError::InvalidKeyframe {
                    clip: clip.to_string(),
                    bone: bone.to_string(),
                    time: keyframe.time,
                    reason: "value must be finite".to_string(),
                });
            }
        }

        keyframes.sort_by(|a, b| a.time.total_cmp(&b.time));

        if let Some(pair) = keyframes.windows(2).find(|w| w[0].time == w[1].time) {
            return Err(ModelError::DuplicateKeyframe {
                clip: clip.to_string(),
                bone: bone.to_string(),
                time: pair[0].time,
            });
        }

        if merge_threshold > 0.0 {
            let mut merged: Vec<Keyframe> = Vec::with_capacity(keyframes.len());
            let mut run_start = f32::NEG_INFINITY;
            for keyframe in keyframes {
                if keyframe.time - run_start < merge_threshold {
                    if let Some(last) = merged.last_mut() {
                        *last = keyframe;
                        continue;
                    }
                }
                run_start = keyframe.time;
                merged.push(keyframe);
            }
            keyframes = merged;
        }

        Ok(Self { keyframes })
    }

    /// Get the keyframes in time order
    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    /// Number of keyframes
    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    /// Whether the channel has no keyframes
    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    /// Timestamp of the last keyframe
    pub fn end_time(&self) -> f32 {
        self.keyframes.last().map(|k| k.time).unwrap_or(0.0)
    }

    /// Evaluate the channel at `time` seconds
    pub fn sample(&self, time: f32, rest: Vec3) -> Vec3 {
        let frames = &self.keyframes;
        let (first, last) = match (frames.first(), frames.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return rest,
        };
        if time <= first.time {
            return first.value;
        }
        if time >= last.time {
            return last.value;
        }

        // frames[i].time <= time < frames[i + 1].time
        let i = frames.partition_point(|k| k.time <= time) - 1;
        let k1 = &frames[i];
        let k2 = &frames[i + 1];
        let u = (time - k1.time) / (k2.time - k1.time);

        let spline = k1.interpolation == Interpolation::CatmullRom
            || k2.interpolation == Interpolation::CatmullRom;

        if spline && frames.len() >= 3 {
            let p1 = k1.value;
            let p2 = k2.value;
            let p0 = if i > 0 {
                frames[i - 1].value
            } else {
                2.0 * p1 - p2
            };
            let p3 = if i + 2 < frames.len() {
                frames[i + 2].value
            } else {
                2.0 * p2 - p1
            };
            catmull_rom(p0, p1, p2, p3, u)
        } else if k1.interpolation == Interpolation::Step {
            k1.value
        } else {
            k1.value.lerp(k2.value, u)
        }
    }

    /// Insert linear frames every `step` seconds between existing keyframes.
    ///
    /// Inserted values are sampled from this channel, so the curve still
    /// passes through every original keyframe.
    pub fn with_intermediate_frames(&self, step: f32, rest: Vec3) -> Channel {
        if step <= 0.0 || self.keyframes.len() < 2 {
            return self.clone();
        }

        let mut out = Vec::with_capacity(self.keyframes.len() * 2);
        for pair in self.keyframes.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            out.push(start);
            let mut time = start.time + step;
            while time < end.time - step * 0.5 {
                out.push(Keyframe::linear(time, self.sample(time, rest)));
                time += step;
            }
        }
        if let Some(last) = self.keyframes.last() {
            out.push(*last);
        }

        Channel { keyframes: out }
    }
}

/// All channels that animate one bone
#[derive(Debug, Clone, PartialEq)]
pub struct BoneTrack {
    pub bone: BoneId,
    pub position: Option<Channel>,
    pub rotation: Option<Channel>,
    pub scale: Option<Channel>,
}

impl BoneTrack {
    fn new(bone: BoneId) -> Self {
        Self {
            bone,
            position: None,
            rotation: None,
            scale: None,
        }
    }

    fn channel_mut(&mut self, kind: ChannelKind) -> &mut Option<Channel> {
        match kind {
            ChannelKind::Position => &mut self.position,
            ChannelKind::Rotation => &mut self.rotation,
            ChannelKind::Scale => &mut self.scale,
        }
    }

    fn end_time(&self) -> f32 {
        [&self.position, &self.rotation, &self.scale]
            .into_iter()
            .flatten()
            .map(Channel::end_time)
            .fold(0.0, f32::max)
    }

    /// Evaluate every channel of this bone
    pub fn sample(&self, time: f32) -> BoneDelta {
        let eval = |channel: &Option<Channel>, kind: ChannelKind| {
            channel
                .as_ref()
                .map(|c| c.sample(time, kind.rest_value()))
                .unwrap_or_else(|| kind.rest_value())
        };
        BoneDelta {
            position: eval(&self.position, ChannelKind::Position),
            rotation: eval(&self.rotation, ChannelKind::Rotation),
            scale: eval(&self.scale, ChannelKind::Scale),
        }
    }
}

/// Unresolved clip definition keyed by bone name
#[derive(Debug, Clone)]
pub struct ClipBuilder {
    name: String,
    loop_mode: LoopMode,
    length: Option<f32>,
    channels: Vec<(String, ChannelKind, Vec<Keyframe>)>,
}

impl ClipBuilder {
    /// Start a clip definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loop_mode: LoopMode::PlayOnce,
            length: None,
            channels: Vec::new(),
        }
    }

    /// Get the clip name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the default loop mode
    pub fn loop_mode(mut self, loop_mode: LoopMode) -> Self {
        self.loop_mode = loop_mode;
        self
    }

    /// Override the clip length in seconds
    pub fn length(mut self, seconds: f32) -> Self {
        self.length = Some(seconds);
        self
    }

    /// Add a channel for a bone
    pub fn channel(
        mut self,
        bone: impl Into<String>,
        kind: ChannelKind,
        keyframes: Vec<Keyframe>,
    ) -> Self {
        self.channels.push((bone.into(), kind, keyframes));
        self
    }

    /// Resolve bone names and validate every channel
    pub fn build<F>(self, resolve: F, merge_threshold: f32) -> Result<AnimationClip, ModelError>
    where
        F: Fn(&str) -> Option<BoneId>,
    {
        let mut tracks: Vec<BoneTrack> = Vec::new();
        let mut index: HashMap<BoneId, usize> = HashMap::new();

        for (bone_name, kind, keyframes) in self.channels {
            let bone = resolve(&bone_name).ok_or_else(|| ModelError::UnknownBone {
                clip: self.name.clone(),
                bone: bone_name.clone(),
            })?;
            if keyframes.is_empty() {
                continue;
            }
            let channel = Channel::new(&self.name, &bone_name, keyframes, merge_threshold)?;
            let slot = *index.entry(bone).or_insert_with(|| {
                tracks.push(BoneTrack::new(bone));
                tracks.len() - 1
            });
            *tracks[slot].channel_mut(kind) = Some(channel);
        }

        let end = tracks.iter().map(BoneTrack::end_time).fold(0.0, f32::max);
        let duration = match self.length {
            Some(length) if length.is_finite() && length >= 0.0 => length.max(end),
            _ => end,
        };

        Ok(AnimationClip {
            name: self.name,
            loop_mode: self.loop_mode,
            duration,
            tracks,
        })
    }
}

/// A named, validated animation
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationClip {
    name: String,
    loop_mode: LoopMode,
    duration: f32,
    tracks: Vec<BoneTrack>,
}

impl AnimationClip {
    /// Get the clip name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loop mode the clip was authored with
    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Clip length in seconds
    pub fn duration(&self) -> f32 {
        self.duration
    }

    /// Per-bone tracks
    pub fn tracks(&self) -> &[BoneTrack] {
        &self.tracks
    }

    /// Copy of this clip with sub-step frames inserted into every channel
    pub fn with_intermediate_frames(&self, step: f32) -> AnimationClip {
        let densify = |channel: &Option<Channel>, kind: ChannelKind| {
            channel
                .as_ref()
                .map(|c| c.with_intermediate_frames(step, kind.rest_value()))
        };
        AnimationClip {
            name: self.name.clone(),
            loop_mode: self.loop_mode,
            duration: self.duration,
            tracks: self
                .tracks
                .iter()
                .map(|track| BoneTrack {
                    bone: track.bone,
                    position: densify(&track.position, ChannelKind::Position),
                    rotation: densify(&track.rotation, ChannelKind::Rotation),
                    scale: densify(&track.scale, ChannelKind::Scale),
                })
                .collect(),
        }
    }
}

/// Playback state reported by `sample()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    /// Inside the clip
    Playing,
    /// Frozen on the last pose, still active
    Holding,
    /// Past the end of a play-once clip
    Finished,
}

/// Result of sampling a clip
#[derive(Debug, Clone, PartialEq)]
pub struct ClipSample {
    /// Effective clip time after loop handling
    pub time: f32,
    pub status: PlaybackStatus,
    deltas: Vec<(BoneId, BoneDelta)>,
}

impl ClipSample {
    /// Sample with no animated bones
    pub fn identity(status: PlaybackStatus) -> Self {
        Self {
            time: 0.0,
            status,
            deltas: Vec::new(),
        }
    }

    /// Delta for a bone (identity when the clip does not animate it)
    pub fn delta(&self, bone: BoneId) -> BoneDelta {
        self.deltas
            .iter()
            .find(|(id, _)| *id == bone)
            .map(|(_, delta)| *delta)
            .unwrap_or(BoneDelta::IDENTITY)
    }

    /// Iterate over animated bones
    pub fn iter(&self) -> impl Iterator<Item = &(BoneId, BoneDelta)> {
        self.deltas.iter()
    }

    /// Whether playback should continue
    pub fn is_active(&self) -> bool {
        self.status != PlaybackStatus::Finished
    }
}

/// Evaluate a clip at `elapsed` seconds under `loop_mode`
pub fn sample(clip: &AnimationClip, elapsed: f32, loop_mode: LoopMode) -> ClipSample {
    let elapsed = if elapsed.is_finite() {
        elapsed
    } else {
        0.0
    };
    let duration = clip.duration;

    let (time, status) = match loop_mode {
        LoopMode::Loop => {
            if duration > 0.0 {
                (elapsed.rem_euclid(duration), PlaybackStatus::Playing)
            } else {
                (0.0, PlaybackStatus::Playing)
            }
        }
        LoopMode::HoldOnLast => {
            if elapsed >= duration {
                (duration, PlaybackStatus::Holding)
            } else {
                (elapsed.max(0.0), PlaybackStatus::Playing)
            }
        }
        LoopMode::PlayOnce => {
            if elapsed >= duration {
                (duration, PlaybackStatus::Finished)
            } else {
                (elapsed.max(0.0), PlaybackStatus::Playing)
            }
        }
    };

    ClipSample {
        time,
        status,
        deltas: clip
            .tracks
            .iter()
            .map(|track| (track.bone, track.sample(time)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_single(name: &str) -> Option<BoneId> {
        (name == "body").then_some(BoneId(0))
    }

    fn walk_clip() -> AnimationClip {
        ClipBuilder::new("walk")
            .channel(
                "body",
                ChannelKind::Position,
                vec![
                    Keyframe::linear(0.0, Vec3::ZERO),
                    Keyframe::linear(1.0, Vec3::new(0.0, 1.0, 0.0)),
                ],
            )
            .build(resolve_single, 0.0)
            .unwrap()
    }

    fn spline_clip() -> AnimationClip {
        ClipBuilder::new("nod")
            .channel(
                "body",
                ChannelKind::Rotation,
                vec![
                    Keyframe::spline(0.5, Vec3::new(10.0, 0.0, 0.0)),
                    Keyframe::spline(1.5, Vec3::new(15.0, 0.0, 0.0)),
                    Keyframe::spline(2.5, Vec3::new(10.0, 0.0, 0.0)),
                    Keyframe::spline(3.0, Vec3::ZERO),
                ],
            )
            .build(resolve_single, 0.0)
            .unwrap()
    }

    #[test]
    fn test_linear_walk_midpoint() {
        let clip = walk_clip();
        let sample = sample(&clip, 0.5, LoopMode::PlayOnce);
        assert_eq!(sample.status, PlaybackStatus::Playing);
        assert_eq!(sample.delta(BoneId(0)).position, Vec3::new(0.0, 0.5, 0.0));
    }

    #[test]
    fn test_spline_passes_through_keyframe() {
        let clip = spline_clip();
        let sample = sample(&clip, 1.5, LoopMode::PlayOnce);
        assert_eq!(sample.delta(BoneId(0)).rotation, Vec3::new(15.0, 0.0, 0.0));

        for keyframe in clip.tracks()[0].rotation.as_ref().unwrap().keyframes() {
            let value = sample_rotation(&clip, keyframe.time);
            assert!(value.abs_diff_eq(keyframe.value, 1e-5));
        }
    }

    fn sample_rotation(clip: &AnimationClip, time: f32) -> Vec3 {
        sample(clip, time, LoopMode::PlayOnce)
            .delta(BoneId(0))
            .rotation
    }

    #[test]
    fn test_spline_is_smooth_between_keyframes() {
        let clip = spline_clip();
        // Overshoots the linear midpoint because the neighbours pull the curve up
        let value = sample_rotation(&clip, 1.0);
        assert!(value.x > 12.5);
        assert!(value.x < 15.0);
    }

    #[test]
    fn test_two_point_spline_falls_back_to_linear() {
        let clip = ClipBuilder::new("lift")
            .channel(
                "body",
                ChannelKind::Position,
                vec![
                    Keyframe::spline(0.0, Vec3::ZERO),
                    Keyframe::spline(2.0, Vec3::new(0.0, 4.0, 0.0)),
                ],
            )
            .build(resolve_single, 0.0)
            .unwrap();
        let delta = sample(&clip, 0.5, LoopMode::PlayOnce).delta(BoneId(0));
        assert!(delta.position.abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-6));
    }

    #[test]
    fn test_step_interpolation() {
        let clip = ClipBuilder::new("blink")
            .channel(
                "body",
                ChannelKind::Scale,
                vec![
                    Keyframe::new(0.0, Vec3::ONE, Interpolation::Step),
                    Keyframe::new(1.0, Vec3::ZERO, Interpolation::Step),
                ],
            )
            .build(resolve_single, 0.0)
            .unwrap();
        assert_eq!(
            sample(&clip, 0.99, LoopMode::PlayOnce).delta(BoneId(0)).scale,
            Vec3::ONE
        );
        assert_eq!(
            sample(&clip, 1.0, LoopMode::PlayOnce).delta(BoneId(0)).scale,
            Vec3::ZERO
        );
    }

    #[test]
    fn test_loop_is_periodic() {
        let clip = spline_clip();
        let duration = clip.duration();
        for t in [0.0, 0.3, 1.1, 2.2, 2.9] {
            let a = sample(&clip, t, LoopMode::Loop).delta(BoneId(0));
            let b = sample(&clip, t + duration, LoopMode::Loop).delta(BoneId(0));
            assert!(a.rotation.abs_diff_eq(b.rotation, 1e-3), "t = {}", t);
        }
    }

    #[test]
    fn test_play_once_stops_changing() {
        let clip = walk_clip();
        let end = sample(&clip, clip.duration(), LoopMode::PlayOnce);
        let later = sample(&clip, clip.duration() + 5.0, LoopMode::PlayOnce);
        assert_eq!(end.status, PlaybackStatus::Finished);
        assert_eq!(later.status, PlaybackStatus::Finished);
        assert_eq!(end.delta(BoneId(0)), later.delta(BoneId(0)));
        assert!(!later.is_active());
    }

    #[test]
    fn test_hold_on_last_stays_active() {
        let clip = walk_clip();
        let held = sample(&clip, 10.0, LoopMode::HoldOnLast);
        assert_eq!(held.status, PlaybackStatus::Holding);
        assert!(held.is_active());
        assert_eq!(held.delta(BoneId(0)).position, Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_nan_elapsed_is_tolerated() {
        let clip = walk_clip();
        let sample = sample(&clip, f32::NAN, LoopMode::Loop);
        assert_eq!(sample.time, 0.0);
    }

    #[test]
    fn test_rejects_nan_and_duplicate_keyframes() {
        let nan = ClipBuilder::new("bad")
            .channel(
                "body",
                ChannelKind::Position,
                vec![Keyframe::linear(f32::NAN, Vec3::ZERO)],
            )
            .build(resolve_single, 0.0);
        assert!(matches!(nan, Err(ModelError::InvalidKeyframe { .. })));

        let duplicate = ClipBuilder::new("bad")
            .channel(
                "body",
                ChannelKind::Position,
                vec![
                    Keyframe::linear(0.5, Vec3::ZERO),
                    Keyframe::linear(0.5, Vec3::ONE),
                ],
            )
            .build(resolve_single, 0.0);
        assert!(matches!(
            duplicate,
            Err(ModelError::DuplicateKeyframe { .. })
        ));

        let unknown = ClipBuilder::new("bad")
            .channel("tail", ChannelKind::Position, vec![Keyframe::linear(0.0, Vec3::ZERO)])
            .build(resolve_single, 0.0);
        assert!(matches!(unknown, Err(ModelError::UnknownBone { .. })));
    }

    #[test]
    fn test_keyframe_merge_threshold() {
        let channel = Channel::new(
            "clip",
            "body",
            vec![
                Keyframe::linear(0.0, Vec3::ZERO),
                Keyframe::linear(0.005, Vec3::ONE),
                Keyframe::linear(1.0, Vec3::ONE),
            ],
            0.01,
        )
        .unwrap();
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.keyframes()[1].time, 1.0);
    }

    #[test]
    fn test_merge_keeps_final_keyframe() {
        let channel = Channel::new(
            "clip",
            "body",
            vec![
                Keyframe::linear(0.0, Vec3::ZERO),
                Keyframe::linear(1.0, Vec3::ONE),
                Keyframe::linear(1.004, Vec3::X),
                Keyframe::linear(1.008, Vec3::Y),
            ],
            0.01,
        )
        .unwrap();
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.end_time(), 1.008);
        assert_eq!(channel.sample(2.0, Vec3::ZERO), Vec3::Y);
    }

    #[test]
    fn test_intermediate_frames_preserve_curve() {
        let clip = spline_clip();
        let dense = clip.with_intermediate_frames(0.05);
        let original = clip.tracks()[0].rotation.as_ref().unwrap();
        let densified = dense.tracks()[0].rotation.as_ref().unwrap();
        assert!(densified.len() > original.len());
        for keyframe in original.keyframes() {
            assert!(densified.keyframes().contains(keyframe));
        }
        assert_eq!(dense.duration(), clip.duration());
    }

    #[test]
    fn test_explicit_length() {
        let clip = ClipBuilder::new("idle")
            .length(4.0)
            .channel(
                "body",
                ChannelKind::Position,
                vec![Keyframe::linear(1.0, Vec3::ONE)],
            )
            .build(resolve_single, 0.0)
            .unwrap();
        assert_eq!(clip.duration(), 4.0);
    }
}
