//! Packet bundles
//!
//! A bundle collects every message describing one visible change for one
//! viewer and flushes them together, so the client never renders a torn
//! frame. Bundles are write-once: adding after `send()` is a lifecycle bug
//! and panics, and a second `send()` is refused.

use crate::error::{BundleError, Result};
use crate::net::viewer::PacketSink;
use crate::protocol::packets::ClientboundPacket;

/// An ordered group of messages flushed as one unit
#[derive(Debug, Clone)]
pub struct PacketBundle {
    /// `None` until the first message arrives in a lazy bundle
    packets: Option<Vec<ClientboundPacket>>,
    max_items: usize,
    sent: bool,
}

impl PacketBundle {
    /// Create a bundle with its backing list allocated up front
    pub fn new(max_items: usize) -> Self {
        Self {
            packets: Some(Vec::new()),
            max_items: max_items.max(1),
            sent: false,
        }
    }

    /// Create a bundle that only allocates once something is added
    pub fn lazy(max_items: usize) -> Self {
        Self {
            packets: None,
            max_items: max_items.max(1),
            sent: false,
        }
    }

    /// Append a message.
    ///
    /// # Panics
    ///
    /// Panics if the bundle was already sent.
    pub fn add(&mut self, packet: ClientboundPacket) {
        if let Err(e) = self.try_add(packet) {
            panic!("{}", e);
        }
    }

    /// Append a message, reporting misuse instead of panicking
    pub fn try_add(&mut self, packet: ClientboundPacket) -> std::result::Result<(), BundleError> {
        if self.sent {
            return Err(BundleError::AlreadySent);
        }
        self.packets.get_or_insert_with(Vec::new).push(packet);
        Ok(())
    }

    /// Append several messages
    pub fn extend<I>(&mut self, packets: I)
    where
        I: IntoIterator<Item = ClientboundPacket>,
    {
        for packet in packets {
            self.add(packet);
        }
    }

    /// Messages in order
    pub fn packets(&self) -> &[ClientboundPacket] {
        self.packets.as_deref().unwrap_or(&[])
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.packets().len()
    }

    /// Whether nothing was added
    pub fn is_empty(&self) -> bool {
        self.packets().is_empty()
    }

    /// Whether the backing list exists yet
    pub fn is_allocated(&self) -> bool {
        self.packets.is_some()
    }

    /// Whether `send()` was called
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Summed weight of every message
    pub fn weight(&self) -> usize {
        self.packets()
            .iter()
            .map(ClientboundPacket::estimated_weight)
            .sum()
    }

    /// Partition into sub-bundles no heavier than the threshold.
    ///
    /// A single message heavier than the threshold travels alone.
    pub fn split(&self) -> Vec<Vec<ClientboundPacket>> {
        let mut chunks = Vec::new();
        let mut current = Vec::new();
        let mut weight = 0;

        for packet in self.packets() {
            let packet_weight = packet.estimated_weight();
            if !current.is_empty() && weight + packet_weight > self.max_items {
                chunks.push(std::mem::take(&mut current));
                weight = 0;
            }
            weight += packet_weight;
            current.push(packet.clone());
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        chunks
    }

    /// Flush to a viewer and seal the bundle. Returns the number of flushes.
    ///
    /// Fails with `BundleError::AlreadyFlushed` if the bundle was sent before;
    /// use `copy()` to deliver the same messages again.
    pub fn send(&mut self, sink: &dyn PacketSink) -> Result<usize> {
        if self.sent {
            return Err(BundleError::AlreadyFlushed.into());
        }
        self.sent = true;
        let chunks = self.split();
        let count = chunks.len();
        for chunk in chunks {
            sink.send_bundle(chunk)?;
        }
        Ok(count)
    }

    /// Independent unsent copy
    pub fn copy(&self) -> PacketBundle {
        Self {
            packets: self.packets.clone(),
            max_items: self.max_items,
            sent: false,
        }
    }
}
