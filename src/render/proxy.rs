//! Render proxies
//!
//! One client-rendered item display per visual bone. The proxy keeps the
//! state it wants viewers to see next to the state viewers last received;
//! the difference decides which metadata fields go out on a tick.

use glam::{Quat, Vec3};
use uuid::Uuid;

use super::flags::ProxyFlags;
use crate::model::{Bone, BoneId};
use crate::protocol::adapter::ProtocolAdapter;
use crate::protocol::packets::{ClientboundPacket, EntityKind, ItemStack};
use crate::skin::SkinTexture;

/// Transform changes below this are not re-sent
pub const TRANSFORM_EPSILON: f32 = 1e-4;

/// Default glow colour (white)
pub const DEFAULT_GLOW_COLOR: i32 = 0xffffff;

/// Everything a viewer sees of one render proxy
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayState {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    pub visible: bool,
    pub glow: bool,
    pub glow_color: i32,
    /// Block/sky light override, 0..=15
    pub brightness: Option<u8>,
    pub tint: Option<u32>,
    pub item: Option<ItemStack>,
    pub interpolation_ticks: u32,
}

impl DisplayState {
    /// Initial state for an item
    pub fn new(item: Option<ItemStack>, interpolation_ticks: u32) -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            visible: true,
            glow: false,
            glow_color: DEFAULT_GLOW_COLOR,
            brightness: None,
            tint: None,
            item,
            interpolation_ticks,
        }
    }

    /// Item as it should appear on the wire, `None` while hidden
    pub fn displayed_item(&self) -> Option<ItemStack> {
        if !self.visible {
            return None;
        }
        self.item.clone().map(|item| item.with_tint(self.tint))
    }

    /// Fields that differ from `other`
    pub fn diff(&self, other: &DisplayState) -> ProxyFlags {
        let mut flags = ProxyFlags::NONE;
        let rotation_same = self.rotation.dot(other.rotation).abs() >= 1.0 - TRANSFORM_EPSILON;
        if !self.translation.abs_diff_eq(other.translation, TRANSFORM_EPSILON)
            || !self.scale.abs_diff_eq(other.scale, TRANSFORM_EPSILON)
            || !rotation_same
        {
            flags |= ProxyFlags::TRANSFORM;
        }
        if self.visible != other.visible || self.tint != other.tint || self.item != other.item {
            flags |= ProxyFlags::ITEM;
        }
        if self.glow != other.glow || self.glow_color != other.glow_color {
            flags |= ProxyFlags::GLOW;
        }
        if self.brightness != other.brightness {
            flags |= ProxyFlags::BRIGHTNESS;
        }
        if self.interpolation_ticks != other.interpolation_ticks {
            flags |= ProxyFlags::INTERPOLATION;
        }
        flags
    }
}

/// A synthetic display entity bound to one bone
#[derive(Debug, Clone)]
pub struct RenderProxy {
    entity_id: i32,
    uuid: Uuid,
    bone: BoneId,
    bone_name: String,
    base_item: Option<ItemStack>,
    state: DisplayState,
    sent: Option<DisplayState>,
}

impl RenderProxy {
    /// Create a proxy for a bone
    pub fn new(entity_id: i32, uuid: Uuid, bone: &Bone, interpolation_ticks: u32) -> Self {
        let base_item = bone.visual.as_ref().map(ItemStack::from_visual);
        Self {
            entity_id,
            uuid,
            bone: bone.id,
            bone_name: bone.name.clone(),
            state: DisplayState::new(base_item.clone(), interpolation_ticks),
            base_item,
            sent: None,
        }
    }

    pub fn entity_id(&self) -> i32 {
        self.entity_id
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn bone(&self) -> BoneId {
        self.bone
    }

    pub fn bone_name(&self) -> &str {
        &self.bone_name
    }

    /// Desired display state
    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    // ============ Mutation ============

    pub fn set_transform(&mut self, translation: Vec3, rotation: Quat, scale: Vec3) {
        self.state.translation = translation;
        self.state.rotation = rotation;
        self.state.scale = scale;
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.state.visible = visible;
    }

    pub fn set_glow(&mut self, glow: bool, color: i32) {
        self.state.glow = glow;
        self.state.glow_color = color;
    }

    pub fn set_brightness(&mut self, brightness: Option<u8>) {
        self.state.brightness = brightness.map(|b| b.min(15));
    }

    pub fn set_tint(&mut self, tint: Option<u32>) {
        self.state.tint = tint;
    }

    /// Swap the displayed item; `None` restores the bone's own visual
    pub fn set_item(&mut self, item: Option<ItemStack>) {
        self.state.item = item.or_else(|| self.base_item.clone());
    }

    /// Apply a skin texture to the displayed item
    pub fn set_skin(&mut self, skin: SkinTexture) {
        if let Some(item) = self.state.item.as_mut() {
            item.skin = Some(skin);
        }
    }

    pub fn set_interpolation(&mut self, ticks: u32) {
        self.state.interpolation_ticks = ticks;
    }

    // ============ Dirty tracking ============

    /// Fields changed since the last commit
    pub fn pending(&self) -> ProxyFlags {
        match &self.sent {
            Some(sent) => self.state.diff(sent),
            None => ProxyFlags::SPAWN,
        }
    }

    /// Record the current state as sent and return what changed
    pub fn take_changes(&mut self) -> ProxyFlags {
        let flags = self.pending();
        if flags.has_update() {
            self.sent = Some(self.state.clone());
        }
        flags
    }

    // ============ Packets ============

    /// Spawn plus full metadata
    pub fn spawn_packets(
        &self,
        adapter: &dyn ProtocolAdapter,
        origin: Vec3,
        yaw: f32,
    ) -> Vec<ClientboundPacket> {
        vec![
            ClientboundPacket::SpawnEntity {
                entity_id: self.entity_id,
                uuid: self.uuid,
                kind: EntityKind::ItemDisplay,
                position: origin,
                pitch: 0.0,
                yaw,
                data: 0,
            },
            ClientboundPacket::EntityMetadata {
                entity_id: self.entity_id,
                entries: adapter.display_metadata(&self.state, ProxyFlags::SPAWN),
            },
        ]
    }

    /// Metadata for the flagged fields, if any
    pub fn update_packet(
        &self,
        adapter: &dyn ProtocolAdapter,
        flags: ProxyFlags,
    ) -> Option<ClientboundPacket> {
        if !flags.has_update() {
            return None;
        }
        let entries = adapter.display_metadata(&self.state, flags);
        if entries.is_empty() {
            return None;
        }
        Some(ClientboundPacket::EntityMetadata {
            entity_id: self.entity_id,
            entries,
        })
    }

    /// Move the proxy's anchor
    pub fn teleport_packet(&self, origin: Vec3, yaw: f32) -> ClientboundPacket {
        ClientboundPacket::Teleport {
            entity_id: self.entity_id,
            position: origin,
            yaw,
            pitch: 0.0,
            on_ground: false,
        }
    }
}
