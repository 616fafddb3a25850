//! Viewer connections
//!
//! A viewer is one connected client that can see models. Manages:
//! - The outbound sink each viewer's packets are flushed into
//! - The last known viewer position (for range-based visibility)
//! - A thread-safe registry keyed by uuid and by entity id

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use glam::Vec3;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{NetworkError, Result, RigError};
use crate::protocol::adapter::ProtocolAdapter;
use crate::protocol::packets::ClientboundPacket;

/// Destination of a viewer's outbound messages
pub trait PacketSink: Send + Sync {
    /// Flush a group of messages as one atomic unit
    fn send_bundle(&self, packets: Vec<ClientboundPacket>) -> Result<()>;

    /// Flush a single message
    fn send(&self, packet: ClientboundPacket) -> Result<()> {
        self.send_bundle(vec![packet])
    }
}

/// Encodes bundles with the active adapter and hands the bytes to the
/// connection's writer task
pub struct EncodingSink {
    adapter: Arc<dyn ProtocolAdapter>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
}

impl EncodingSink {
    /// Create a new encoding sink
    pub fn new(adapter: Arc<dyn ProtocolAdapter>, outbound_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            adapter,
            outbound_tx,
        }
    }
}

impl PacketSink for EncodingSink {
    fn send_bundle(&self, packets: Vec<ClientboundPacket>) -> Result<()> {
        if packets.is_empty() {
            return Ok(());
        }
        let bytes = self.adapter.encode_bundle(&packets)?;
        self.outbound_tx.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RigError::Network(NetworkError::WriteBufferFull),
            mpsc::error::TrySendError::Closed(_) => {
                RigError::Network(NetworkError::ConnectionClosed)
            }
        })
    }
}

/// Sink that keeps every bundle it receives
#[derive(Debug, Default)]
pub struct RecordingSink {
    bundles: Mutex<Vec<Vec<ClientboundPacket>>>,
    closed: AtomicBool,
}

impl RecordingSink {
    /// Create an empty recording sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Every bundle received so far
    pub fn bundles(&self) -> Vec<Vec<ClientboundPacket>> {
        self.bundles.lock().clone()
    }

    /// Every message received so far, flattened
    pub fn packets(&self) -> Vec<ClientboundPacket> {
        self.bundles.lock().iter().flatten().cloned().collect()
    }

    /// Forget everything received
    pub fn clear(&self) {
        self.bundles.lock().clear();
    }

    /// Reject further sends
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl PacketSink for RecordingSink {
    fn send_bundle(&self, packets: Vec<ClientboundPacket>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionClosed.into());
        }
        self.bundles.lock().push(packets);
        Ok(())
    }
}

/// A connected client
pub struct Viewer {
    /// Unique viewer identifier
    pub uuid: Uuid,
    /// Entity id of the viewer's own player
    pub entity_id: i32,
    pub name: String,
    sink: Arc<dyn PacketSink>,
    position: RwLock<Vec3>,
    connected: AtomicBool,
    /// Time the viewer connected
    pub connected_at: Instant,
}

impl Viewer {
    /// Create a new viewer
    pub fn new(
        uuid: Uuid,
        entity_id: i32,
        name: impl Into<String>,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        Self {
            uuid,
            entity_id,
            name: name.into(),
            sink,
            position: RwLock::new(Vec3::ZERO),
            connected: AtomicBool::new(true),
            connected_at: Instant::now(),
        }
    }

    /// Last known position
    pub fn position(&self) -> Vec3 {
        *self.position.read()
    }

    /// Update the last known position
    pub fn set_position(&self, position: Vec3) {
        *self.position.write() = position;
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection closed; later sends fail
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Flush messages as one bundle
    pub fn send_bundle(&self, packets: Vec<ClientboundPacket>) -> Result<()> {
        if !self.is_connected() {
            return Err(NetworkError::ConnectionClosed.into());
        }
        trace!(viewer = %self.uuid, packets = packets.len(), "Flushing bundle");
        self.sink.send_bundle(packets)
    }

    /// The viewer's sink
    pub fn sink(&self) -> &dyn PacketSink {
        self.sink.as_ref()
    }
}

impl PacketSink for Viewer {
    fn send_bundle(&self, packets: Vec<ClientboundPacket>) -> Result<()> {
        Viewer::send_bundle(self, packets)
    }
}

impl std::fmt::Debug for Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewer")
            .field("uuid", &self.uuid)
            .field("entity_id", &self.entity_id)
            .field("name", &self.name)
            .field("position", &self.position())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Thread-safe viewer registry
#[derive(Default)]
pub struct ViewerManager {
    /// Map of viewer uuid to viewer
    viewers: DashMap<Uuid, Arc<Viewer>>,
    /// Map of player entity id to viewer uuid
    by_entity: DashMap<i32, Uuid>,
}

impl ViewerManager {
    /// Create a new viewer manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected viewer
    pub fn register(&self, viewer: Viewer) -> Result<Arc<Viewer>> {
        if self.viewers.contains_key(&viewer.uuid) {
            warn!(viewer = %viewer.uuid, "Viewer already connected");
            return Err(NetworkError::AlreadyConnected(viewer.uuid).into());
        }

        let viewer = Arc::new(viewer);
        self.viewers.insert(viewer.uuid, Arc::clone(&viewer));
        self.by_entity.insert(viewer.entity_id, viewer.uuid);

        info!(
            viewer = %viewer.uuid,
            entity_id = viewer.entity_id,
            name = %viewer.name,
            "Viewer connected"
        );

        Ok(viewer)
    }

    /// Get a viewer by uuid
    pub fn get(&self, uuid: Uuid) -> Option<Arc<Viewer>> {
        self.viewers.get(&uuid).map(|r| Arc::clone(r.value()))
    }

    /// Get a viewer by its player entity id
    pub fn get_by_entity(&self, entity_id: i32) -> Option<Arc<Viewer>> {
        self.by_entity.get(&entity_id).and_then(|uuid| self.get(*uuid))
    }

    /// Remove a viewer, marking it disconnected
    pub fn remove(&self, uuid: Uuid) -> Option<Arc<Viewer>> {
        let (_, viewer) = self.viewers.remove(&uuid)?;
        viewer.disconnect();
        self.by_entity.remove(&viewer.entity_id);
        debug!(viewer = %uuid, "Viewer removed");
        Some(viewer)
    }

    /// Get the count of connected viewers
    pub fn count(&self) -> usize {
        self.viewers.len()
    }

    /// Snapshot of every connected viewer
    pub fn viewers(&self) -> Vec<Arc<Viewer>> {
        self.viewers.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Remove every viewer
    pub fn disconnect_all(&self) {
        let uuids: Vec<Uuid> = self.viewers.iter().map(|r| *r.key()).collect();
        for uuid in uuids {
            self.remove(uuid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::adapter::select_adapter;

    fn viewer(entity_id: i32) -> Viewer {
        Viewer::new(
            Uuid::new_v4(),
            entity_id,
            "Alex",
            Arc::new(RecordingSink::new()),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let manager = ViewerManager::new();
        let alex = manager.register(viewer(10)).unwrap();

        assert_eq!(manager.count(), 1);
        assert_eq!(manager.get(alex.uuid).unwrap().entity_id, 10);
        assert_eq!(manager.get_by_entity(10).unwrap().uuid, alex.uuid);
        assert!(manager.get_by_entity(11).is_none());
    }

    #[test]
    fn test_duplicate_registration() {
        let manager = ViewerManager::new();
        let first = viewer(10);
        let duplicate = Viewer::new(first.uuid, 12, "Alex", Arc::new(RecordingSink::new()));
        manager.register(first).unwrap();
        assert!(matches!(
            manager.register(duplicate),
            Err(RigError::Network(NetworkError::AlreadyConnected(_)))
        ));
    }

    #[test]
    fn test_removed_viewer_rejects_packets() {
        let manager = ViewerManager::new();
        let alex = manager.register(viewer(10)).unwrap();
        let removed = manager.remove(alex.uuid).unwrap();

        assert!(!removed.is_connected());
        assert!(manager.get(alex.uuid).is_none());
        assert!(manager.get_by_entity(10).is_none());
        assert!(removed
            .send_bundle(vec![ClientboundPacket::SetHeldSlot { slot: 0 }])
            .is_err());
    }

    #[tokio::test]
    async fn test_encoding_sink() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EncodingSink::new(select_adapter(767).unwrap(), tx);

        sink.send(ClientboundPacket::SetHeldSlot { slot: 1 }).unwrap();
        sink.send_bundle(Vec::new()).unwrap();
        let bytes = rx.recv().await.unwrap();
        assert_eq!(bytes.len(), 3);
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(sink.send(ClientboundPacket::SetHeldSlot { slot: 1 }).is_err());
    }
}
