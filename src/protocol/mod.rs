//! Protocol module
//!
//! Revision-independent packet model plus the adapters that put it on the
//! wire:
//! - `packets` - clientbound and serverbound messages the core produces and rewrites
//! - `adapter` - the version-dispatch trait and revision table
//! - `modern` - the reference adapter for current revisions

pub mod adapter;
pub mod modern;
pub mod packets;

pub use adapter::{select_adapter, supported_revisions, AdapterBehavior, ProtocolAdapter};
pub use packets::{ClientboundPacket, MetadataEntry, MetadataValue, ServerboundPacket};
