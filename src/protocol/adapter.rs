//! Protocol revision dispatch
//!
//! Everything that differs between host protocol revisions sits behind
//! `ProtocolAdapter`. One adapter is chosen at startup from a revision
//! table; the rest of the crate only talks to the trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use glam::Vec3;

use super::modern::ModernAdapter;
use super::packets::{ClientboundPacket, MetadataEntry, ServerboundPacket};
use crate::error::ProtocolError;
use crate::net::buffer::{PacketBuffer, MAX_PACKET_SIZE};
use crate::net::bundle::PacketBundle;
use crate::render::flags::ProxyFlags;
use crate::render::proxy::DisplayState;

/// Behaviour that varies between revisions of the same adapter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdapterBehavior {
    /// Use fly movement when the ridden body has no gravity
    pub fly_when_no_gravity: bool,
    /// Only allow jumping while the body touches the ground
    /// (otherwise a horizontal collision is enough)
    pub jump_requires_ground: bool,
    /// Ticks between spawning proxies and attaching them to their entity
    pub invisible_follow_delay_ticks: u32,
    /// Vertical velocity of a mount jump (blocks per tick)
    pub jump_velocity: f32,
}

impl Default for AdapterBehavior {
    fn default() -> Self {
        Self {
            fly_when_no_gravity: true,
            jump_requires_ground: false,
            invisible_follow_delay_ticks: 0,
            jump_velocity: 0.5,
        }
    }
}

/// Capability surface of one protocol revision
pub trait ProtocolAdapter: Send + Sync + fmt::Debug {
    /// Protocol revision this adapter speaks
    fn revision(&self) -> u32;

    /// Revision-specific behaviour switches
    fn behavior(&self) -> &AdapterBehavior;

    /// Metadata describing the flagged fields of a render proxy
    fn display_metadata(&self, state: &DisplayState, changed: ProxyFlags) -> Vec<MetadataEntry>;

    /// Metadata sizing a hitbox proxy
    fn hitbox_metadata(&self, size: Vec3) -> Vec<MetadataEntry>;

    /// Packet id of a message
    fn packet_id(&self, packet: &ClientboundPacket) -> Result<i32, ProtocolError>;

    /// Id of the bundle delimiter message
    fn bundle_delimiter_id(&self) -> i32;

    /// Write a message body (without id or length)
    fn encode_body(
        &self,
        packet: &ClientboundPacket,
        buf: &mut PacketBuffer,
    ) -> Result<(), ProtocolError>;

    /// Decode a server-bound message body
    fn decode_serverbound(
        &self,
        id: i32,
        buf: &mut PacketBuffer,
    ) -> Result<ServerboundPacket, ProtocolError>;

    /// Start a bundle sized for this revision
    fn create_bundle(&self, max_items: usize) -> PacketBundle {
        PacketBundle::new(max_items)
    }

    /// Encode one length-prefixed frame
    fn encode_frame(
        &self,
        packet: &ClientboundPacket,
        out: &mut PacketBuffer,
    ) -> Result<(), ProtocolError> {
        let mut body = PacketBuffer::with_capacity(64);
        body.write_var_int(self.packet_id(packet)?);
        self.encode_body(packet, &mut body)?;
        if body.len() > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: body.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        out.write_var_int(body.len() as i32);
        out.write_bytes(body.as_bytes());
        Ok(())
    }

    /// Encode a group of messages that the client must apply atomically.
    ///
    /// More than one message is wrapped in a pair of bundle delimiters.
    fn encode_bundle(&self, packets: &[ClientboundPacket]) -> Result<Vec<u8>, ProtocolError> {
        let mut out = PacketBuffer::with_capacity(packets.len() * 32);
        let delimit = packets.len() > 1;
        if delimit {
            write_delimiter(self.bundle_delimiter_id(), &mut out);
        }
        for packet in packets {
            self.encode_frame(packet, &mut out)?;
        }
        if delimit {
            write_delimiter(self.bundle_delimiter_id(), &mut out);
        }
        Ok(out.into_inner().to_vec())
    }
}

fn write_delimiter(id: i32, out: &mut PacketBuffer) {
    out.write_var_int(PacketBuffer::var_int_size(id) as i32);
    out.write_var_int(id);
}

type AdapterFactory = fn() -> Arc<dyn ProtocolAdapter>;

/// 1.20.5 / 1.20.6
fn revision_766() -> Arc<dyn ProtocolAdapter> {
    Arc::new(ModernAdapter::new(
        766,
        AdapterBehavior {
            fly_when_no_gravity: false,
            jump_requires_ground: true,
            invisible_follow_delay_ticks: 1,
            ..AdapterBehavior::default()
        },
    ))
}

/// 1.21 / 1.21.1
fn revision_767() -> Arc<dyn ProtocolAdapter> {
    Arc::new(ModernAdapter::new(767, AdapterBehavior::default()))
}

/// Static revision table
static ADAPTERS: OnceLock<HashMap<u32, AdapterFactory>> = OnceLock::new();

fn adapters() -> &'static HashMap<u32, AdapterFactory> {
    ADAPTERS.get_or_init(|| {
        let mut map: HashMap<u32, AdapterFactory> = HashMap::new();
        map.insert(766, revision_766);
        map.insert(767, revision_767);
        map
    })
}

/// Select the adapter for a revision
pub fn select_adapter(revision: u32) -> Result<Arc<dyn ProtocolAdapter>, ProtocolError> {
    adapters()
        .get(&revision)
        .map(|factory| factory())
        .ok_or(ProtocolError::UnsupportedRevision(revision))
}

/// Revisions with an adapter
pub fn supported_revisions() -> Vec<u32> {
    let mut revisions: Vec<u32> = adapters().keys().copied().collect();
    revisions.sort_unstable();
    revisions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_adapter() {
        let adapter = select_adapter(767).unwrap();
        assert_eq!(adapter.revision(), 767);
        assert!(adapter.behavior().fly_when_no_gravity);

        let older = select_adapter(766).unwrap();
        assert!(!older.behavior().fly_when_no_gravity);
        assert_eq!(older.behavior().invisible_follow_delay_ticks, 1);

        assert!(matches!(
            select_adapter(340),
            Err(ProtocolError::UnsupportedRevision(340))
        ));
        assert_eq!(supported_revisions(), vec![766, 767]);
    }

    #[test]
    fn test_single_packet_is_not_delimited() {
        let adapter = select_adapter(767).unwrap();
        let bytes = adapter
            .encode_bundle(&[ClientboundPacket::SetHeldSlot { slot: 2 }])
            .unwrap();
        // length, id, slot
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[2], 2);
    }

    #[test]
    fn test_bundle_is_delimited() {
        let adapter = select_adapter(767).unwrap();
        let packets = vec![
            ClientboundPacket::SetHeldSlot { slot: 1 },
            ClientboundPacket::RemoveEntities {
                entity_ids: vec![5],
            },
        ];
        let bytes = adapter.encode_bundle(&packets).unwrap();
        let delimiter = [1u8, adapter.bundle_delimiter_id() as u8];
        assert_eq!(&bytes[..2], &delimiter);
        assert_eq!(&bytes[bytes.len() - 2..], &delimiter);
    }
}
