//! Viewer channels
//!
//! One channel per connected viewer, installed at connect time. It sits on
//! the connection's I/O path and rewrites packets so the viewer sees models
//! instead of the entities behind them:
//! - real spawns schedule the tracker's proxy spawn
//! - removes tear the proxies down first
//! - metadata and equipment of hidden entities are masked
//! - passenger lists get the proxy ids spliced in front
//! - inventory input is swallowed while the viewer itself is a model
//!
//! Channels never take a tracker's core lock. Mutations go through the
//! tracker's concurrent viewer map or are queued on the scheduler.

use std::sync::Arc;

use tracing::trace;

use crate::config::RenderConfig;
use crate::net::viewer::Viewer;
use crate::protocol::packets::{
    ClientboundPacket, InteractAction, MetadataEntry, MetadataValue, ServerboundPacket,
    SHARED_FLAGS_INDEX,
};
use crate::render::mount::RiderInput;
use crate::render::registry::TrackerRegistry;
use crate::render::tracker::Tracker;
use crate::scheduler::Scheduler;

/// Damage applied for an attack on a hitbox
pub const HITBOX_ATTACK_DAMAGE: f32 = 1.0;

/// Outcome of an inbound rewrite
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InboundResult {
    /// Packet to hand on to the host, if any
    pub forward: Option<ServerboundPacket>,
    /// Packets to send straight back to the viewer
    pub reply: Vec<ClientboundPacket>,
}

impl InboundResult {
    fn forward(packet: ServerboundPacket) -> Self {
        Self {
            forward: Some(packet),
            reply: Vec::new(),
        }
    }

    fn swallow() -> Self {
        Self::default()
    }

    /// Whether the packet was consumed
    pub fn is_swallowed(&self) -> bool {
        self.forward.is_none()
    }
}

/// Per-connection packet rewrite stage
pub struct ViewerChannel {
    viewer: Arc<Viewer>,
    registry: Arc<TrackerRegistry>,
    scheduler: Arc<Scheduler>,
    hide_delay_ticks: u32,
    block_inventory: bool,
}

impl ViewerChannel {
    pub fn new(
        viewer: Arc<Viewer>,
        registry: Arc<TrackerRegistry>,
        scheduler: Arc<Scheduler>,
        config: &RenderConfig,
    ) -> Self {
        Self {
            viewer,
            registry,
            scheduler,
            hide_delay_ticks: config.hide_delay_ticks,
            block_inventory: config.block_inventory_while_hidden,
        }
    }

    pub fn viewer(&self) -> &Arc<Viewer> {
        &self.viewer
    }

    // ============ Outbound ============

    /// Rewrite a packet headed to the viewer. Returns what should actually go out.
    pub fn on_outbound(&self, packet: ClientboundPacket) -> Vec<ClientboundPacket> {
        match packet {
            ClientboundPacket::SpawnEntity { entity_id, .. } => {
                if let Some(tracker) = self.registry.by_entity(entity_id) {
                    let tagged = tracker
                        .source()
                        .map_or(false, |entity| entity.has_model_tag());
                    if tagged {
                        tracker.schedule_spawn(&self.viewer, self.hide_delay_ticks);
                    }
                }
                vec![packet]
            }
            ClientboundPacket::RemoveEntities { entity_ids } => {
                let mut out = Vec::new();
                for entity_id in &entity_ids {
                    if let Some(tracker) = self.registry.by_entity(*entity_id) {
                        out.extend(tracker.despawn_for(self.viewer.uuid));
                    }
                }
                out.push(ClientboundPacket::RemoveEntities { entity_ids });
                out
            }
            ClientboundPacket::EntityMetadata { entity_id, entries } => {
                let entries = match self.hiding(entity_id) {
                    Some(tracker) => self.mask_metadata(&tracker, entries),
                    None => entries,
                };
                vec![ClientboundPacket::EntityMetadata { entity_id, entries }]
            }
            ClientboundPacket::Equipment { entity_id, slots } => {
                let hides_equipment = self.hiding(entity_id).filter(|tracker| {
                    tracker
                        .effective_hide(self.viewer.uuid)
                        .map_or(false, |hide| hide.equipment)
                });
                let slots = match hides_equipment {
                    Some(tracker) => {
                        tracker.snapshot_equipment(self.viewer.uuid, &slots);
                        trace!(viewer = %self.viewer.uuid, entity_id, "Equipment blanked");
                        slots.into_iter().map(|(slot, _)| (slot, None)).collect()
                    }
                    None => slots,
                };
                vec![ClientboundPacket::Equipment { entity_id, slots }]
            }
            ClientboundPacket::SetPassengers {
                vehicle_id,
                passengers,
            } => {
                let passengers = match self.hiding(vehicle_id) {
                    Some(tracker) => {
                        let mut spliced = tracker.render_ids().to_vec();
                        spliced.extend(
                            passengers
                                .into_iter()
                                .filter(|id| !tracker.render_ids().contains(id)),
                        );
                        spliced
                    }
                    None => passengers,
                };
                vec![ClientboundPacket::SetPassengers {
                    vehicle_id,
                    passengers,
                }]
            }
            other => vec![other],
        }
    }

    /// Tracker of an entity that is shown to this viewer as a model
    fn hiding(&self, entity_id: i32) -> Option<Arc<Tracker>> {
        self.registry
            .by_entity(entity_id)
            .filter(|tracker| tracker.effective_hide(self.viewer.uuid).is_some())
    }

    fn mask_metadata(&self, tracker: &Tracker, entries: Vec<MetadataEntry>) -> Vec<MetadataEntry> {
        let hide = match tracker.effective_hide(self.viewer.uuid) {
            Some(hide) => hide,
            None => return entries,
        };
        entries
            .into_iter()
            .map(|entry| match entry.value {
                MetadataValue::Byte(flags) if entry.index == SHARED_FLAGS_INDEX => {
                    MetadataEntry::shared_flags(hide.mask_shared_flags(flags))
                }
                _ => entry,
            })
            .collect()
    }

    // ============ Inbound ============

    /// Rewrite a packet coming from the viewer
    pub fn on_inbound(&self, packet: ServerboundPacket) -> InboundResult {
        match packet {
            ServerboundPacket::HeldItemSlot { .. } => match self.own_model_blocking_inventory() {
                Some(tracker) => InboundResult {
                    forward: None,
                    reply: vec![ClientboundPacket::SetHeldSlot {
                        slot: tracker.held_slot() as i8,
                    }],
                },
                None => InboundResult::forward(packet),
            },
            ServerboundPacket::SwapHands => match self.own_model_blocking_inventory() {
                Some(_) => InboundResult::swallow(),
                None => InboundResult::forward(packet),
            },
            ServerboundPacket::Interact {
                entity_id, action, ..
            } if self.registry.is_hitbox(entity_id) => {
                let registry = self.registry.clone();
                let source = self.viewer.entity_id;
                self.scheduler.run_sync(move || {
                    if let Some(tracker) = registry.by_hitbox(entity_id) {
                        match action {
                            InteractAction::Attack => {
                                tracker.damage_hitbox(
                                    entity_id,
                                    Some(source),
                                    HITBOX_ATTACK_DAMAGE,
                                );
                            }
                            _ => {
                                tracker.interact_hitbox(entity_id, source);
                            }
                        }
                    }
                });
                InboundResult::swallow()
            }
            ServerboundPacket::PlayerInput {
                forward,
                strafe,
                jump,
                sneak,
            } => {
                let rider = self.viewer.entity_id;
                if self.registry.by_rider(rider).is_none() {
                    return InboundResult::forward(packet);
                }
                let input = RiderInput::new(forward, strafe, jump, sneak);
                let registry = self.registry.clone();
                self.scheduler.run_sync(move || {
                    if input.sneak && registry.dismount_by_rider(rider) {
                        return;
                    }
                    if let Some(tracker) = registry.by_rider(rider) {
                        tracker.set_rider_input(rider, input);
                    }
                });
                InboundResult::swallow()
            }
            other => InboundResult::forward(other),
        }
    }

    /// The viewer's own model, when it hides their inventory
    fn own_model_blocking_inventory(&self) -> Option<Arc<Tracker>> {
        if !self.block_inventory {
            return None;
        }
        self.registry
            .by_entity(self.viewer.entity_id)
            .filter(|tracker| tracker.is_active() && tracker.hide_options().equipment)
    }

    /// Tear the channel down with its connection
    pub fn on_disconnect(&self) -> usize {
        self.viewer.disconnect();
        self.registry.remove_viewer(&self.viewer)
    }
}

impl std::fmt::Debug for ViewerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerChannel")
            .field("viewer", &self.viewer.uuid)
            .field("block_inventory", &self.block_inventory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{BasicEntity, EntityHandle};
    use crate::model::{Skeleton, SkeletonBuilder, BoneSpec, VisualRef};
    use crate::net::viewer::RecordingSink;
    use crate::protocol::adapter::select_adapter;
    use crate::protocol::packets::{shared_flags, EquipmentSlot, ItemStack};
    use crate::render::tracker::TrackerSettings;
    use glam::Vec3;
    use uuid::Uuid;

    struct Fixture {
        registry: Arc<TrackerRegistry>,
        scheduler: Arc<Scheduler>,
        channel: ViewerChannel,
        entity: Arc<BasicEntity>,
        tracker: Arc<Tracker>,
    }

    fn skeleton() -> Arc<Skeleton> {
        Arc::new(
            SkeletonBuilder::new("knight")
                .bone(BoneSpec::new("body").visual(VisualRef::new("paper", 1)))
                .bone(BoneSpec::new("head").parent("body").visual(VisualRef::new("paper", 2)))
                .build()
                .unwrap(),
        )
    }

    fn fixture(viewer_entity: i32) -> Fixture {
        let registry = Arc::new(TrackerRegistry::new(
            select_adapter(767).unwrap(),
            TrackerSettings::default(),
        ));
        let scheduler = Arc::new(Scheduler::default());
        let entity = Arc::new(BasicEntity::new(20, Uuid::new_v4(), Vec3::ZERO));
        entity.set_model_tag(true);
        let tracker = registry.create_entity_tracker(skeleton(), entity.clone());
        let sink = Arc::new(RecordingSink::new());
        let viewer = Arc::new(Viewer::new(Uuid::new_v4(), viewer_entity, "alex", sink));
        let channel = ViewerChannel::new(
            viewer,
            registry.clone(),
            scheduler.clone(),
            &RenderConfig::default(),
        );
        Fixture {
            registry,
            scheduler,
            channel,
            entity,
            tracker,
        }
    }

    fn spawn_real(fixture: &Fixture) {
        fixture.channel.on_outbound(ClientboundPacket::SpawnEntity {
            entity_id: 20,
            uuid: fixture.entity.uuid(),
            kind: crate::protocol::packets::EntityKind::Other(1),
            position: Vec3::ZERO,
            pitch: 0.0,
            yaw: 0.0,
            data: 0,
        });
    }

    #[test]
    fn test_spawn_schedules_proxies() {
        let fixture = fixture(99);
        spawn_real(&fixture);
        let state = fixture
            .tracker
            .viewer_state(fixture.channel.viewer().uuid)
            .unwrap();
        assert_eq!(state.spawn_due, Some(1));
        assert!(!state.spawned);
    }

    #[test]
    fn test_untagged_spawn_is_plain() {
        let fixture = fixture(99);
        fixture.entity.set_model_tag(false);
        spawn_real(&fixture);
        assert_eq!(fixture.tracker.viewer_count(), 0);
    }

    #[test]
    fn test_metadata_is_masked() {
        let fixture = fixture(99);
        let untouched = fixture.channel.on_outbound(ClientboundPacket::EntityMetadata {
            entity_id: 20,
            entries: vec![MetadataEntry::shared_flags(shared_flags::ON_FIRE)],
        });
        assert_eq!(
            untouched,
            vec![ClientboundPacket::EntityMetadata {
                entity_id: 20,
                entries: vec![MetadataEntry::shared_flags(shared_flags::ON_FIRE)],
            }]
        );

        spawn_real(&fixture);
        let masked = fixture.channel.on_outbound(ClientboundPacket::EntityMetadata {
            entity_id: 20,
            entries: vec![MetadataEntry::shared_flags(shared_flags::ON_FIRE)],
        });
        assert_eq!(
            masked,
            vec![ClientboundPacket::EntityMetadata {
                entity_id: 20,
                entries: vec![MetadataEntry::shared_flags(shared_flags::INVISIBLE)],
            }]
        );
    }

    #[test]
    fn test_equipment_is_blanked() {
        let fixture = fixture(99);
        spawn_real(&fixture);
        let sword = ItemStack::new("diamond_sword");
        let out = fixture.channel.on_outbound(ClientboundPacket::Equipment {
            entity_id: 20,
            slots: vec![(EquipmentSlot::MainHand, Some(sword.clone()))],
        });
        assert_eq!(
            out,
            vec![ClientboundPacket::Equipment {
                entity_id: 20,
                slots: vec![(EquipmentSlot::MainHand, None)],
            }]
        );
        let state = fixture
            .tracker
            .viewer_state(fixture.channel.viewer().uuid)
            .unwrap();
        assert_eq!(state.last_equipment, vec![(EquipmentSlot::MainHand, Some(sword))]);
    }

    #[test]
    fn test_passengers_are_spliced() {
        let fixture = fixture(99);
        spawn_real(&fixture);
        let out = fixture.channel.on_outbound(ClientboundPacket::SetPassengers {
            vehicle_id: 20,
            passengers: vec![500, 501],
        });
        let mut expected = fixture.tracker.render_ids().to_vec();
        expected.extend([500, 501]);
        assert_eq!(
            out,
            vec![ClientboundPacket::SetPassengers {
                vehicle_id: 20,
                passengers: expected,
            }]
        );
    }

    #[test]
    fn test_remove_tears_down_first() {
        let fixture = fixture(99);
        fixture.tracker.show(fixture.channel.viewer());
        fixture.tracker.tick(&crate::render::tracker::TickContext {
            tick: 1,
            dt: 0.05,
            viewers: &[],
        });

        let out = fixture.channel.on_outbound(ClientboundPacket::RemoveEntities {
            entity_ids: vec![20],
        });
        assert_eq!(out.len(), 2);
        assert_eq!(
            out[0],
            ClientboundPacket::RemoveEntities {
                entity_ids: fixture.tracker.render_ids().to_vec(),
            }
        );
        assert_eq!(out[1], ClientboundPacket::RemoveEntities { entity_ids: vec![20] });
        assert_eq!(fixture.tracker.viewer_count(), 0);
    }

    #[test]
    fn test_held_slot_is_echoed_for_own_model() {
        // The viewer is the tracked entity
        let fixture = fixture(20);
        let result = fixture
            .channel
            .on_inbound(ServerboundPacket::HeldItemSlot { slot: 4 });
        assert!(result.is_swallowed());
        assert_eq!(result.reply, vec![ClientboundPacket::SetHeldSlot { slot: 0 }]);

        let result = fixture.channel.on_inbound(ServerboundPacket::SwapHands);
        assert!(result.is_swallowed());
    }

    #[test]
    fn test_inventory_passes_for_others() {
        let fixture = fixture(99);
        let result = fixture
            .channel
            .on_inbound(ServerboundPacket::HeldItemSlot { slot: 4 });
        assert_eq!(result.forward, Some(ServerboundPacket::HeldItemSlot { slot: 4 }));
        assert!(result.reply.is_empty());
    }

    #[test]
    fn test_attack_on_hitbox_is_routed() {
        let fixture = fixture(99);
        let skeleton = Arc::new(
            SkeletonBuilder::new("slime")
                .bone(
                    BoneSpec::new("body")
                        .visual(VisualRef::new("paper", 3))
                        .hitbox(crate::model::Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))),
                )
                .build()
                .unwrap(),
        );
        let owner = Arc::new(BasicEntity::new(30, Uuid::new_v4(), Vec3::ZERO));
        let tracker = fixture.registry.create_entity_tracker(skeleton, owner.clone());
        let hitbox = fixture
            .registry
            .create_hitbox(tracker.id(), "body", None)
            .unwrap();

        let result = fixture.channel.on_inbound(ServerboundPacket::Interact {
            entity_id: hitbox,
            action: InteractAction::Attack,
            sneaking: false,
        });
        assert!(result.is_swallowed());
        assert!(owner.damage_taken().is_empty());

        fixture.scheduler.tick(1);
        assert_eq!(owner.damage_taken(), vec![(Some(99), HITBOX_ATTACK_DAMAGE)]);
    }
}
