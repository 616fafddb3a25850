//! Reference adapter for item-display era revisions (766, 767)
//!
//! Render proxies are item displays, hitbox proxies are interaction
//! entities. Packet ids and metadata layout are shared by both revisions;
//! what differs between them is carried in `AdapterBehavior`.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::Bytes;
use glam::{Quat, Vec3};

use super::adapter::{AdapterBehavior, ProtocolAdapter};
use super::packets::{
    ClientboundPacket, EntityKind, InteractAction, ItemStack, MetadataEntry, MetadataValue,
    ServerboundPacket,
};
use crate::error::ProtocolError;
use crate::net::buffer::PacketBuffer;
use crate::render::flags::ProxyFlags;
use crate::render::proxy::DisplayState;

// ============ Packet ids ============

pub mod clientbound {
    pub const BUNDLE_DELIMITER: i32 = 0x00;
    pub const SPAWN_ENTITY: i32 = 0x01;
    pub const REMOVE_ENTITIES: i32 = 0x42;
    pub const SET_HELD_SLOT: i32 = 0x53;
    pub const SET_ENTITY_METADATA: i32 = 0x58;
    pub const SET_ENTITY_VELOCITY: i32 = 0x5a;
    pub const SET_EQUIPMENT: i32 = 0x5b;
    pub const SET_PASSENGERS: i32 = 0x5d;
    pub const TELEPORT_ENTITY: i32 = 0x70;
}

pub mod serverbound {
    pub const INTERACT: i32 = 0x16;
    pub const PLAYER_INPUT: i32 = 0x22;
    pub const PLAYER_ACTION: i32 = 0x24;
    pub const SET_HELD_SLOT: i32 = 0x2f;
}

/// Player action status for swapping hands
const ACTION_SWAP_HANDS: i32 = 6;

// ============ Metadata layout ============

/// Display entity metadata indices
pub mod display {
    pub const INTERPOLATION_DELAY: u8 = 8;
    pub const TRANSFORM_DURATION: u8 = 9;
    pub const TELEPORT_DURATION: u8 = 10;
    pub const TRANSLATION: u8 = 11;
    pub const SCALE: u8 = 12;
    pub const LEFT_ROTATION: u8 = 13;
    pub const RIGHT_ROTATION: u8 = 14;
    pub const BRIGHTNESS: u8 = 16;
    pub const VIEW_RANGE: u8 = 17;
    pub const GLOW_COLOR: u8 = 22;
    pub const ITEM: u8 = 23;
}

/// Interaction entity metadata indices
pub mod interaction {
    pub const WIDTH: u8 = 8;
    pub const HEIGHT: u8 = 9;
    pub const RESPONSIVE: u8 = 10;
}

/// Metadata serializer ids
fn metadata_type(value: &MetadataValue) -> i32 {
    match value {
        MetadataValue::Byte(_) => 0,
        MetadataValue::VarInt(_) => 1,
        MetadataValue::Float(_) => 3,
        MetadataValue::Item(_) => 7,
        MetadataValue::Bool(_) => 8,
        MetadataValue::Vector3(_) => 28,
        MetadataValue::Quaternion(_) => 29,
    }
}

/// Entity type registry ids
static ENTITY_TYPES: OnceLock<HashMap<EntityKind, i32>> = OnceLock::new();

fn entity_type_id(kind: EntityKind) -> i32 {
    if let EntityKind::Other(id) = kind {
        return id;
    }
    let table = ENTITY_TYPES.get_or_init(|| {
        let mut map = HashMap::new();
        map.insert(EntityKind::ItemDisplay, 58);
        map.insert(EntityKind::Interaction, 64);
        map.insert(EntityKind::Player, 128);
        map
    });
    table.get(&kind).copied().unwrap_or_default()
}

/// Item component ids used by proxy items
mod component {
    pub const CUSTOM_MODEL_DATA: i32 = 0x1b;
    pub const DYED_COLOR: i32 = 0x24;
    pub const PROFILE: i32 = 0x32;
}

/// Adapter for revisions 766 and 767
#[derive(Debug, Clone)]
pub struct ModernAdapter {
    revision: u32,
    behavior: AdapterBehavior,
}

impl ModernAdapter {
    /// Create a new adapter
    pub fn new(revision: u32, behavior: AdapterBehavior) -> Self {
        Self { revision, behavior }
    }

    fn write_item(buf: &mut PacketBuffer, item: &Option<ItemStack>) {
        let Some(item) = item else {
            buf.write_var_int(0);
            return;
        };
        buf.write_var_int(item.count as i32);
        buf.write_string(&item.item);

        let mut components = 0;
        if item.model_data != 0 {
            components += 1;
        }
        if item.tint.is_some() {
            components += 1;
        }
        if item.skin.is_some() {
            components += 1;
        }
        buf.write_var_int(components);
        buf.write_var_int(0); // removed components

        if item.model_data != 0 {
            buf.write_var_int(component::CUSTOM_MODEL_DATA);
            buf.write_var_int(item.model_data);
        }
        if let Some(tint) = item.tint {
            buf.write_var_int(component::DYED_COLOR);
            buf.write_int(tint as i32);
            buf.write_bool(false); // tooltip
        }
        if let Some(skin) = &item.skin {
            buf.write_var_int(component::PROFILE);
            buf.write_bool(false); // no name
            buf.write_bool(false); // no id
            buf.write_var_int(1);
            buf.write_string("textures");
            buf.write_string(&skin.url);
            buf.write_bool(skin.signature.is_some());
            if let Some(signature) = &skin.signature {
                buf.write_string(signature);
            }
        }
    }

    fn write_metadata(buf: &mut PacketBuffer, entries: &[MetadataEntry]) {
        for entry in entries {
            buf.write_ubyte(entry.index);
            buf.write_var_int(metadata_type(&entry.value));
            match &entry.value {
                MetadataValue::Byte(v) => buf.write_byte(*v),
                MetadataValue::VarInt(v) => buf.write_var_int(*v),
                MetadataValue::Float(v) => buf.write_float(*v),
                MetadataValue::Bool(v) => buf.write_bool(*v),
                MetadataValue::Vector3(v) => write_vec3f(buf, *v),
                MetadataValue::Quaternion(q) => {
                    buf.write_float(q.x);
                    buf.write_float(q.y);
                    buf.write_float(q.z);
                    buf.write_float(q.w);
                }
                MetadataValue::Item(item) => Self::write_item(buf, item),
            }
        }
        buf.write_ubyte(0xff);
    }
}

fn write_vec3f(buf: &mut PacketBuffer, v: Vec3) {
    buf.write_float(v.x);
    buf.write_float(v.y);
    buf.write_float(v.z);
}

fn write_position(buf: &mut PacketBuffer, v: Vec3) {
    buf.write_double(v.x as f64);
    buf.write_double(v.y as f64);
    buf.write_double(v.z as f64);
}

/// Velocity in 1/8000 block per tick units
fn velocity_component(v: f32) -> i16 {
    (v.clamp(-3.9, 3.9) * 8000.0) as i16
}

/// Block and sky light packed into one brightness override
fn pack_brightness(brightness: Option<u8>) -> i32 {
    match brightness {
        Some(level) => {
            let level = level.min(15) as i32;
            (level << 4) | (level << 20)
        }
        None => -1,
    }
}

impl ProtocolAdapter for ModernAdapter {
    fn revision(&self) -> u32 {
        self.revision
    }

    fn behavior(&self) -> &AdapterBehavior {
        &self.behavior
    }

    fn display_metadata(&self, state: &DisplayState, changed: ProxyFlags) -> Vec<MetadataEntry> {
        let mut entries = Vec::new();

        if changed.needs_transform() || changed.needs_interpolation() {
            entries.push(MetadataEntry::new(
                display::INTERPOLATION_DELAY,
                MetadataValue::VarInt(0),
            ));
            entries.push(MetadataEntry::new(
                display::TRANSFORM_DURATION,
                MetadataValue::VarInt(state.interpolation_ticks as i32),
            ));
        }
        if changed.needs_interpolation() {
            entries.push(MetadataEntry::new(
                display::TELEPORT_DURATION,
                MetadataValue::VarInt(state.interpolation_ticks.min(59) as i32),
            ));
        }
        if changed.needs_transform() {
            entries.push(MetadataEntry::new(
                display::TRANSLATION,
                MetadataValue::Vector3(state.translation),
            ));
            entries.push(MetadataEntry::new(
                display::SCALE,
                MetadataValue::Vector3(state.scale),
            ));
            entries.push(MetadataEntry::new(
                display::LEFT_ROTATION,
                MetadataValue::Quaternion(state.rotation),
            ));
            entries.push(MetadataEntry::new(
                display::RIGHT_ROTATION,
                MetadataValue::Quaternion(Quat::IDENTITY),
            ));
        }
        if changed.needs_glow() {
            let flags = if state.glow {
                super::packets::shared_flags::GLOWING
            } else {
                0
            };
            entries.push(MetadataEntry::shared_flags(flags));
            entries.push(MetadataEntry::new(
                display::GLOW_COLOR,
                MetadataValue::VarInt(if state.glow { state.glow_color } else { -1 }),
            ));
        }
        if changed.needs_brightness() {
            entries.push(MetadataEntry::new(
                display::BRIGHTNESS,
                MetadataValue::VarInt(pack_brightness(state.brightness)),
            ));
        }
        if changed.needs_item() {
            entries.push(MetadataEntry::new(
                display::ITEM,
                MetadataValue::Item(state.displayed_item()),
            ));
        }

        entries
    }

    fn hitbox_metadata(&self, size: Vec3) -> Vec<MetadataEntry> {
        vec![
            MetadataEntry::new(interaction::WIDTH, MetadataValue::Float(size.x.max(size.z))),
            MetadataEntry::new(interaction::HEIGHT, MetadataValue::Float(size.y)),
            MetadataEntry::new(interaction::RESPONSIVE, MetadataValue::Bool(true)),
        ]
    }

    fn packet_id(&self, packet: &ClientboundPacket) -> Result<i32, ProtocolError> {
        Ok(match packet {
            ClientboundPacket::SpawnEntity { .. } => clientbound::SPAWN_ENTITY,
            ClientboundPacket::RemoveEntities { .. } => clientbound::REMOVE_ENTITIES,
            ClientboundPacket::EntityMetadata { .. } => clientbound::SET_ENTITY_METADATA,
            ClientboundPacket::Equipment { .. } => clientbound::SET_EQUIPMENT,
            ClientboundPacket::SetPassengers { .. } => clientbound::SET_PASSENGERS,
            ClientboundPacket::Teleport { .. } => clientbound::TELEPORT_ENTITY,
            ClientboundPacket::Velocity { .. } => clientbound::SET_ENTITY_VELOCITY,
            ClientboundPacket::SetHeldSlot { .. } => clientbound::SET_HELD_SLOT,
            ClientboundPacket::Other { id, .. } => *id,
        })
    }

    fn bundle_delimiter_id(&self) -> i32 {
        clientbound::BUNDLE_DELIMITER
    }

    fn encode_body(
        &self,
        packet: &ClientboundPacket,
        buf: &mut PacketBuffer,
    ) -> Result<(), ProtocolError> {
        match packet {
            ClientboundPacket::SpawnEntity {
                entity_id,
                uuid,
                kind,
                position,
                pitch,
                yaw,
                data,
            } => {
                buf.write_var_int(*entity_id);
                buf.write_uuid(*uuid);
                buf.write_var_int(entity_type_id(*kind));
                write_position(buf, *position);
                buf.write_angle(*pitch);
                buf.write_angle(*yaw);
                buf.write_angle(*yaw); // head yaw
                buf.write_var_int(*data);
                buf.write_short(0);
                buf.write_short(0);
                buf.write_short(0);
            }
            ClientboundPacket::RemoveEntities { entity_ids } => {
                buf.write_var_int(entity_ids.len() as i32);
                for id in entity_ids {
                    buf.write_var_int(*id);
                }
            }
            ClientboundPacket::EntityMetadata { entity_id, entries } => {
                buf.write_var_int(*entity_id);
                Self::write_metadata(buf, entries);
            }
            ClientboundPacket::Equipment { entity_id, slots } => {
                if slots.is_empty() {
                    return Err(ProtocolError::MalformedPacket(
                        "equipment packet without slots".to_string(),
                    ));
                }
                buf.write_var_int(*entity_id);
                for (i, (slot, item)) in slots.iter().enumerate() {
                    let more = if i + 1 < slots.len() { 0x80 } else { 0 };
                    buf.write_ubyte(slot.id() | more);
                    Self::write_item(buf, item);
                }
            }
            ClientboundPacket::SetPassengers {
                vehicle_id,
                passengers,
            } => {
                buf.write_var_int(*vehicle_id);
                buf.write_var_int(passengers.len() as i32);
                for id in passengers {
                    buf.write_var_int(*id);
                }
            }
            ClientboundPacket::Teleport {
                entity_id,
                position,
                yaw,
                pitch,
                on_ground,
            } => {
                buf.write_var_int(*entity_id);
                write_position(buf, *position);
                buf.write_angle(*yaw);
                buf.write_angle(*pitch);
                buf.write_bool(*on_ground);
            }
            ClientboundPacket::Velocity {
                entity_id,
                velocity,
            } => {
                buf.write_var_int(*entity_id);
                buf.write_short(velocity_component(velocity.x));
                buf.write_short(velocity_component(velocity.y));
                buf.write_short(velocity_component(velocity.z));
            }
            ClientboundPacket::SetHeldSlot { slot } => {
                buf.write_byte(*slot);
            }
            ClientboundPacket::Other { payload, .. } => {
                buf.write_bytes(payload);
            }
        }
        Ok(())
    }

    fn decode_serverbound(
        &self,
        id: i32,
        buf: &mut PacketBuffer,
    ) -> Result<ServerboundPacket, ProtocolError> {
        match id {
            serverbound::SET_HELD_SLOT => Ok(ServerboundPacket::HeldItemSlot {
                slot: buf.read_short()?,
            }),
            serverbound::INTERACT => {
                let entity_id = buf.read_var_int()?;
                let action = match buf.read_var_int()? {
                    0 => InteractAction::Interact {
                        off_hand: buf.read_var_int()? == 1,
                    },
                    1 => InteractAction::Attack,
                    2 => {
                        let target =
                            Vec3::new(buf.read_float()?, buf.read_float()?, buf.read_float()?);
                        InteractAction::InteractAt {
                            target,
                            off_hand: buf.read_var_int()? == 1,
                        }
                    }
                    other => {
                        return Err(ProtocolError::MalformedPacket(format!(
                            "interact type {}",
                            other
                        )))
                    }
                };
                Ok(ServerboundPacket::Interact {
                    entity_id,
                    action,
                    sneaking: buf.read_bool()?,
                })
            }
            serverbound::PLAYER_INPUT => {
                let strafe = buf.read_float()?;
                let forward = buf.read_float()?;
                let flags = buf.read_ubyte()?;
                Ok(ServerboundPacket::PlayerInput {
                    forward,
                    strafe,
                    jump: flags & 0x01 != 0,
                    sneak: flags & 0x02 != 0,
                })
            }
            serverbound::PLAYER_ACTION => {
                let start = buf.read_position();
                let status = buf.read_var_int()?;
                if status == ACTION_SWAP_HANDS {
                    return Ok(ServerboundPacket::SwapHands);
                }
                buf.reset();
                let mut payload = buf.read_remaining();
                payload.drain(..start);
                Ok(ServerboundPacket::Other {
                    id,
                    payload: Bytes::from(payload),
                })
            }
            _ => Ok(ServerboundPacket::Other {
                id,
                payload: Bytes::from(buf.read_remaining()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::EquipmentSlot;
    use uuid::Uuid;

    fn adapter() -> ModernAdapter {
        ModernAdapter::new(767, AdapterBehavior::default())
    }

    #[test]
    fn test_display_metadata_follows_flags() {
        let adapter = adapter();
        let mut state = DisplayState::new(Some(ItemStack::new("minecraft:paper")), 3);

        let indices = |entries: Vec<MetadataEntry>| -> Vec<u8> {
            entries.into_iter().map(|e| e.index).collect()
        };

        assert_eq!(
            indices(adapter.display_metadata(&state, ProxyFlags::BRIGHTNESS)),
            vec![display::BRIGHTNESS]
        );
        assert_eq!(
            indices(adapter.display_metadata(&state, ProxyFlags::ITEM)),
            vec![display::ITEM]
        );
        assert!(adapter
            .display_metadata(&state, ProxyFlags::NONE)
            .is_empty());

        state.glow = true;
        state.glow_color = 0x00ff00;
        let glow = adapter.display_metadata(&state, ProxyFlags::GLOW);
        assert_eq!(
            glow[0].value,
            MetadataValue::Byte(crate::protocol::packets::shared_flags::GLOWING)
        );
        assert_eq!(glow[1].value, MetadataValue::VarInt(0x00ff00));
    }

    #[test]
    fn test_brightness_packing() {
        assert_eq!(pack_brightness(None), -1);
        assert_eq!(pack_brightness(Some(15)), (15 << 4) | (15 << 20));
        assert_eq!(pack_brightness(Some(40)), pack_brightness(Some(15)));
    }

    #[test]
    fn test_encode_remove_entities() {
        let adapter = adapter();
        let mut buf = PacketBuffer::new();
        adapter
            .encode_frame(
                &ClientboundPacket::RemoveEntities {
                    entity_ids: vec![1, 300],
                },
                &mut buf,
            )
            .unwrap();
        // length, id, count, 1, 300 (two bytes)
        assert_eq!(
            buf.as_bytes(),
            &[5, clientbound::REMOVE_ENTITIES as u8, 2, 1, 0xac, 0x02]
        );
    }

    #[test]
    fn test_encode_every_packet() {
        let adapter = adapter();
        let packets = vec![
            ClientboundPacket::SpawnEntity {
                entity_id: 1,
                uuid: Uuid::new_v4(),
                kind: EntityKind::ItemDisplay,
                position: Vec3::ONE,
                pitch: 0.0,
                yaw: 45.0,
                data: 0,
            },
            ClientboundPacket::EntityMetadata {
                entity_id: 1,
                entries: adapter.display_metadata(
                    &DisplayState::new(Some(ItemStack::new("minecraft:paper")), 3),
                    ProxyFlags::SPAWN,
                ),
            },
            ClientboundPacket::Equipment {
                entity_id: 2,
                slots: vec![
                    (EquipmentSlot::Head, None),
                    (EquipmentSlot::MainHand, Some(ItemStack::new("minecraft:stick"))),
                ],
            },
            ClientboundPacket::SetPassengers {
                vehicle_id: 2,
                passengers: vec![1],
            },
            ClientboundPacket::Teleport {
                entity_id: 1,
                position: Vec3::ZERO,
                yaw: 0.0,
                pitch: 0.0,
                on_ground: true,
            },
            ClientboundPacket::Velocity {
                entity_id: 2,
                velocity: Vec3::new(0.0, 10.0, 0.0),
            },
        ];
        let bytes = adapter.encode_bundle(&packets).unwrap();
        assert!(bytes.len() > packets.len() * 2);

        let empty = ClientboundPacket::Equipment {
            entity_id: 2,
            slots: Vec::new(),
        };
        assert!(adapter.encode_bundle(&[empty]).is_err());
    }

    #[test]
    fn test_decode_serverbound() {
        let adapter = adapter();

        let mut buf = PacketBuffer::new();
        buf.write_short(4);
        assert_eq!(
            adapter
                .decode_serverbound(serverbound::SET_HELD_SLOT, &mut buf)
                .unwrap(),
            ServerboundPacket::HeldItemSlot { slot: 4 }
        );

        let mut buf = PacketBuffer::new();
        buf.write_var_int(77);
        buf.write_var_int(1);
        buf.write_bool(true);
        assert_eq!(
            adapter
                .decode_serverbound(serverbound::INTERACT, &mut buf)
                .unwrap(),
            ServerboundPacket::Interact {
                entity_id: 77,
                action: InteractAction::Attack,
                sneaking: true,
            }
        );

        let mut buf = PacketBuffer::new();
        buf.write_float(0.0);
        buf.write_float(1.0);
        buf.write_ubyte(0x01);
        assert_eq!(
            adapter
                .decode_serverbound(serverbound::PLAYER_INPUT, &mut buf)
                .unwrap(),
            ServerboundPacket::PlayerInput {
                forward: 1.0,
                strafe: 0.0,
                jump: true,
                sneak: false,
            }
        );

        let mut buf = PacketBuffer::new();
        buf.write_var_int(ACTION_SWAP_HANDS);
        assert_eq!(
            adapter
                .decode_serverbound(serverbound::PLAYER_ACTION, &mut buf)
                .unwrap(),
            ServerboundPacket::SwapHands
        );

        let mut buf = PacketBuffer::from_bytes(&[1, 2, 3]);
        assert!(matches!(
            adapter.decode_serverbound(0x7e, &mut buf).unwrap(),
            ServerboundPacket::Other { id: 0x7e, .. }
        ));
    }
}
