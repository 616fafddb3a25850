//! Packet definitions module
//!
//! Revision-independent view of the entity-management messages the render
//! core produces and rewrites. Adapters translate these to and from bytes.

use bytes::Bytes;
use glam::{Quat, Vec3};
use uuid::Uuid;

use crate::model::VisualRef;
use crate::skin::SkinTexture;

/// Metadata index of the shared entity flags byte
pub const SHARED_FLAGS_INDEX: u8 = 0;

/// Bits of the shared entity flags byte
pub mod shared_flags {
    pub const ON_FIRE: i8 = 0x01;
    pub const INVISIBLE: i8 = 0x20;
    pub const GLOWING: i8 = 0x40;
}

/// Entity types the core spawns or inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Client-rendered item display (render proxies)
    ItemDisplay,
    /// Invisible clickable box (hitbox proxies)
    Interaction,
    Player,
    Other(i32),
}

/// An item as sent on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct ItemStack {
    pub item: String,
    pub count: u8,
    pub model_data: i32,
    /// Packed RGB leather-style tint
    pub tint: Option<u32>,
    pub skin: Option<SkinTexture>,
}

impl ItemStack {
    /// Create a single item
    pub fn new(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            count: 1,
            model_data: 0,
            tint: None,
            skin: None,
        }
    }

    /// Item displayed for a bone visual
    pub fn from_visual(visual: &VisualRef) -> Self {
        Self {
            item: visual.item.clone(),
            count: 1,
            model_data: visual.model_data,
            tint: None,
            skin: visual.skin.clone(),
        }
    }

    /// Copy with a tint applied
    pub fn with_tint(mut self, tint: Option<u32>) -> Self {
        self.tint = tint;
        self
    }
}

/// Equipment slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquipmentSlot {
    MainHand,
    OffHand,
    Feet,
    Legs,
    Chest,
    Head,
}

impl EquipmentSlot {
    pub const ALL: [EquipmentSlot; 6] = [
        EquipmentSlot::MainHand,
        EquipmentSlot::OffHand,
        EquipmentSlot::Feet,
        EquipmentSlot::Legs,
        EquipmentSlot::Chest,
        EquipmentSlot::Head,
    ];

    /// Wire id of the slot
    pub fn id(self) -> u8 {
        match self {
            EquipmentSlot::MainHand => 0,
            EquipmentSlot::OffHand => 1,
            EquipmentSlot::Feet => 2,
            EquipmentSlot::Legs => 3,
            EquipmentSlot::Chest => 4,
            EquipmentSlot::Head => 5,
        }
    }

    /// Slot for a wire id
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => EquipmentSlot::MainHand,
            1 => EquipmentSlot::OffHand,
            2 => EquipmentSlot::Feet,
            3 => EquipmentSlot::Legs,
            4 => EquipmentSlot::Chest,
            5 => EquipmentSlot::Head,
            _ => return None,
        })
    }
}

/// Typed metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Byte(i8),
    VarInt(i32),
    Float(f32),
    Bool(bool),
    Vector3(Vec3),
    Quaternion(Quat),
    Item(Option<ItemStack>),
}

/// One indexed metadata field
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    pub index: u8,
    pub value: MetadataValue,
}

impl MetadataEntry {
    /// Create a new entry
    pub fn new(index: u8, value: MetadataValue) -> Self {
        Self { index, value }
    }

    /// Shared flags entry
    pub fn shared_flags(flags: i8) -> Self {
        Self::new(SHARED_FLAGS_INDEX, MetadataValue::Byte(flags))
    }
}

/// Client-bound entity messages
#[derive(Debug, Clone, PartialEq)]
pub enum ClientboundPacket {
    SpawnEntity {
        entity_id: i32,
        uuid: Uuid,
        kind: EntityKind,
        position: Vec3,
        pitch: f32,
        yaw: f32,
        data: i32,
    },
    RemoveEntities {
        entity_ids: Vec<i32>,
    },
    EntityMetadata {
        entity_id: i32,
        entries: Vec<MetadataEntry>,
    },
    Equipment {
        entity_id: i32,
        slots: Vec<(EquipmentSlot, Option<ItemStack>)>,
    },
    SetPassengers {
        vehicle_id: i32,
        passengers: Vec<i32>,
    },
    Teleport {
        entity_id: i32,
        position: Vec3,
        yaw: f32,
        pitch: f32,
        on_ground: bool,
    },
    Velocity {
        entity_id: i32,
        velocity: Vec3,
    },
    SetHeldSlot {
        slot: i8,
    },
    /// Any message the core passes through untouched
    Other {
        id: i32,
        payload: Bytes,
    },
}

impl ClientboundPacket {
    /// The single entity a message is about, if any
    pub fn entity_id(&self) -> Option<i32> {
        match self {
            ClientboundPacket::SpawnEntity { entity_id, .. }
            | ClientboundPacket::EntityMetadata { entity_id, .. }
            | ClientboundPacket::Equipment { entity_id, .. }
            | ClientboundPacket::Teleport { entity_id, .. }
            | ClientboundPacket::Velocity { entity_id, .. } => Some(*entity_id),
            ClientboundPacket::SetPassengers { vehicle_id, .. } => Some(*vehicle_id),
            _ => None,
        }
    }

    /// Cost of a message when splitting bundles
    pub fn estimated_weight(&self) -> usize {
        match self {
            ClientboundPacket::EntityMetadata { entries, .. } => entries.len().max(1),
            ClientboundPacket::Equipment { slots, .. } => slots.len().max(1),
            ClientboundPacket::RemoveEntities { entity_ids } => entity_ids.len().max(1),
            ClientboundPacket::SetPassengers { passengers, .. } => 1 + passengers.len(),
            _ => 1,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ClientboundPacket::SpawnEntity { .. } => "spawn_entity",
            ClientboundPacket::RemoveEntities { .. } => "remove_entities",
            ClientboundPacket::EntityMetadata { .. } => "entity_metadata",
            ClientboundPacket::Equipment { .. } => "equipment",
            ClientboundPacket::SetPassengers { .. } => "set_passengers",
            ClientboundPacket::Teleport { .. } => "teleport",
            ClientboundPacket::Velocity { .. } => "velocity",
            ClientboundPacket::SetHeldSlot { .. } => "set_held_slot",
            ClientboundPacket::Other { .. } => "other",
        }
    }
}

/// Interaction kinds sent by a viewer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InteractAction {
    Interact { off_hand: bool },
    Attack,
    InteractAt { target: Vec3, off_hand: bool },
}

/// Server-bound messages the core inspects
#[derive(Debug, Clone, PartialEq)]
pub enum ServerboundPacket {
    HeldItemSlot {
        slot: i16,
    },
    SwapHands,
    Interact {
        entity_id: i32,
        action: InteractAction,
        sneaking: bool,
    },
    /// Raw rider movement intent while mounted
    PlayerInput {
        forward: f32,
        strafe: f32,
        jump: bool,
        sneak: bool,
    },
    Other {
        id: i32,
        payload: Bytes,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id() {
        let packet = ClientboundPacket::Velocity {
            entity_id: 7,
            velocity: Vec3::ZERO,
        };
        assert_eq!(packet.entity_id(), Some(7));

        let packet = ClientboundPacket::RemoveEntities {
            entity_ids: vec![1, 2],
        };
        assert_eq!(packet.entity_id(), None);
    }

    #[test]
    fn test_estimated_weight() {
        let metadata = ClientboundPacket::EntityMetadata {
            entity_id: 1,
            entries: vec![
                MetadataEntry::shared_flags(0),
                MetadataEntry::new(8, MetadataValue::VarInt(0)),
                MetadataEntry::new(11, MetadataValue::Vector3(Vec3::ONE)),
            ],
        };
        assert_eq!(metadata.estimated_weight(), 3);

        let passengers = ClientboundPacket::SetPassengers {
            vehicle_id: 1,
            passengers: vec![2, 3],
        };
        assert_eq!(passengers.estimated_weight(), 3);
        assert_eq!(
            ClientboundPacket::SetHeldSlot { slot: 0 }.estimated_weight(),
            1
        );
    }

    #[test]
    fn test_equipment_slot_ids() {
        for id in 0..6 {
            assert_eq!(EquipmentSlot::from_id(id).unwrap().id(), id);
        }
        assert!(EquipmentSlot::from_id(6).is_none());
    }

    #[test]
    fn test_item_from_visual() {
        let visual = VisualRef::new("minecraft:paper", 42);
        let item = ItemStack::from_visual(&visual).with_tint(Some(0xff0000));
        assert_eq!(item.item, "minecraft:paper");
        assert_eq!(item.model_data, 42);
        assert_eq!(item.tint, Some(0xff0000));
    }
}
