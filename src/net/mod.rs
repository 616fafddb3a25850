//! Networking module
//!
//! Everything between a tracker and a viewer's connection:
//! - Wire buffer codec
//! - Packet bundles
//! - Viewer connections and sinks
//! - Per-viewer packet rewriting channels

pub mod buffer;
pub mod bundle;
pub mod channel;
pub mod viewer;

pub use bundle::PacketBundle;
pub use channel::{InboundResult, ViewerChannel};
pub use viewer::{PacketSink, Viewer, ViewerManager};
