//! Converts dirty components into outbound packets, per viewer.
//!
//! Replication runs once per tick in two phases: first every dirty
//! entity's components are snapshotted into a staging area (dirty flags
//! are consumed exactly once, so a component written twice in a tick
//! ships once and every viewer sees the same bytes), then the staged
//! data is delivered to each viewer. Tracker membership is driven from
//! outside by spatial systems via [`enter`](Replicator::enter) and
//! [`leave`](Replicator::leave).

use std::sync::Arc;

use hearth_ecs::{ComponentTypeId, EntityId, EntityStore};
use hearth_net::Connection;
use hearth_protocol::packets::{
    ComponentBlob, EntityInitPacket, EntityRemovePacket, EntityUpdatePacket, LightCleanupPacket,
};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;
use uuid::Uuid;

struct Viewer {
    conn: Arc<Connection>,
    tracked: FxHashSet<EntityId>,
    entered: Vec<EntityId>,
    left: Vec<EntityId>,
}

pub struct Replicator {
    viewers: FxHashMap<Uuid, Viewer>,
    /// Component type whose removal needs a client-side lighting
    /// teardown packet.
    light_component: Option<ComponentTypeId>,
    staged: FxHashMap<EntityId, Vec<ComponentBlob>>,
}

impl Replicator {
    pub fn new(light_component: Option<ComponentTypeId>) -> Self {
        Self {
            viewers: FxHashMap::default(),
            light_component,
            staged: FxHashMap::default(),
        }
    }

    pub fn add_viewer(&mut self, conn: Arc<Connection>) {
        self.viewers.insert(
            conn.id(),
            Viewer {
                conn,
                tracked: FxHashSet::default(),
                entered: Vec::new(),
                left: Vec::new(),
            },
        );
    }

    pub fn remove_viewer(&mut self, id: Uuid) -> Option<Arc<Connection>> {
        self.viewers.remove(&id).map(|viewer| viewer.conn)
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.viewers
            .values()
            .map(|viewer| Arc::clone(&viewer.conn))
            .collect()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// The entity became observable to the viewer this tick.
    pub fn enter(&mut self, viewer: Uuid, entity: EntityId) {
        if let Some(viewer) = self.viewers.get_mut(&viewer) {
            if viewer.tracked.insert(entity) {
                viewer.entered.push(entity);
            }
        }
    }

    /// The entity left the viewer's observable set this tick.
    pub fn leave(&mut self, viewer: Uuid, entity: EntityId) {
        if let Some(viewer) = self.viewers.get_mut(&viewer) {
            if viewer.tracked.remove(&entity) {
                viewer.left.push(entity);
            }
        }
    }

    /// Runs the replication phases for one tick.
    pub fn run(&mut self, store: &EntityStore, tick: u64) {
        // Phase a: snapshot dirty state once, before any viewer is
        // served, so the flags read consistently across viewers.
        self.staged.clear();
        for entity in store.entities() {
            if store.any_dirty(entity) {
                let blobs = store.stage_dirty(entity, tick);
                if !blobs.is_empty() {
                    self.staged.insert(entity, blobs);
                }
            }
        }

        // Phase b: deliver.
        for viewer in self.viewers.values_mut() {
            for &entity in &viewer.left {
                send(
                    &viewer.conn,
                    &EntityRemovePacket {
                        entities: vec![entity.to_bits()],
                    },
                );

                let had_light = self
                    .light_component
                    .is_some_and(|light| store.has_by_type_id(entity, light));
                if had_light {
                    send(
                        &viewer.conn,
                        &LightCleanupPacket {
                            entity: entity.to_bits(),
                        },
                    );
                }
            }
            viewer.left.clear();

            for &entity in &viewer.entered {
                let components = store.stage_all(entity);
                send(
                    &viewer.conn,
                    &EntityInitPacket {
                        entity: entity.to_bits(),
                        components,
                    },
                );
            }

            for (&entity, blobs) in &self.staged {
                // Fresh entrants already got full state this tick.
                if !viewer.tracked.contains(&entity) || viewer.entered.contains(&entity) {
                    continue;
                }
                send(
                    &viewer.conn,
                    &EntityUpdatePacket {
                        entity: entity.to_bits(),
                        components: blobs.clone(),
                    },
                );
            }

            viewer.entered.clear();
        }

        // Phase c: staging is per tick.
        self.staged.clear();
    }
}

fn send<P>(conn: &Connection, pkt: &P)
where
    P: hearth_protocol::Packet + hearth_protocol::Encode + 'static,
{
    if let Err(e) = conn.send(pkt) {
        debug!("failed to replicate to {}: {e}", conn.peer_addr());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use hearth_ecs::{Component, ComponentRegistryBuilder, ReplicationPolicy};
    use hearth_net::{ConnectionSeed, StatsMode};
    use hearth_protocol::packets;
    use hearth_protocol::{
        Decode, Encode, FrameDecoder, NoopStats, Packet, PacketRegistry, RawFrame,
    };
    use tokio::io::AsyncReadExt;

    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Health(u32);

    impl Component for Health {
        const NAME: &'static str = "health";
    }

    impl Encode for Health {
        fn encode(&self, w: impl Write) -> anyhow::Result<()> {
            self.0.encode(w)
        }
    }

    impl Decode<'_> for Health {
        fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
            Ok(Self(u32::decode(r)?))
        }
    }

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Glow;

    impl Component for Glow {
        const NAME: &'static str = "glow";
    }

    impl Encode for Glow {
        fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl Decode<'_> for Glow {
        fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
            Ok(Self)
        }
    }

    struct TestViewer {
        conn_id: Uuid,
        stream: tokio::io::ReadHalf<tokio::io::DuplexStream>,
        dec: FrameDecoder,
        buf: bytes::BytesMut,
    }

    impl TestViewer {
        async fn next_frame(&mut self, registry: &PacketRegistry) -> RawFrame {
            loop {
                if let Some(frame) = self.dec.try_next_frame(registry, &NoopStats).unwrap() {
                    return frame;
                }
                self.buf.reserve(1024);
                let n = tokio::time::timeout(
                    std::time::Duration::from_secs(2),
                    self.stream.read_buf(&mut self.buf),
                )
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
                assert_ne!(n, 0, "connection closed early");
                self.dec.queue_bytes(self.buf.split());
            }
        }

        fn no_frame_buffered(&mut self, registry: &PacketRegistry) {
            assert!(self
                .dec
                .try_next_frame(registry, &NoopStats)
                .unwrap()
                .is_none());
        }
    }

    fn attach_viewer(replicator: &mut Replicator, registry: &Arc<PacketRegistry>) -> TestViewer {
        let (client, server) = tokio::io::duplex(1 << 16);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, _client_write) = tokio::io::split(client);

        let conn = Connection::spawn(
            server_read,
            server_write,
            "127.0.0.1:0".parse().unwrap(),
            ConnectionSeed {
                registry: Arc::clone(registry),
                stats: StatsMode::Noop,
                incoming_byte_limit: 1 << 20,
                outgoing_byte_limit: 1 << 20,
            },
        );
        let conn_id = conn.id();
        replicator.add_viewer(Arc::new(conn));

        TestViewer {
            conn_id,
            stream: client_read,
            dec: FrameDecoder::new(),
            buf: bytes::BytesMut::new(),
        }
    }

    #[tokio::test]
    async fn dirty_entities_ship_once_per_viewer_per_tick() {
        let registry = Arc::new(packets::core_registry().unwrap());

        let mut components = ComponentRegistryBuilder::new();
        components
            .register::<Health>(ReplicationPolicy::OnChange)
            .unwrap();
        let glow_id = components
            .register::<Glow>(ReplicationPolicy::OnChange)
            .unwrap();
        let mut store = hearth_ecs::EntityStore::new(components.build());

        let mut replicator = Replicator::new(Some(glow_id));
        let mut alice = attach_viewer(&mut replicator, &registry);
        let mut bob = attach_viewer(&mut replicator, &registry);

        let entity = store.spawn();
        store.insert(entity, Health(20)).unwrap();
        store.insert(entity, Glow).unwrap();

        replicator.enter(alice.conn_id, entity);
        replicator.enter(bob.conn_id, entity);

        // Tick 0: both viewers get full state, nothing else.
        replicator.run(&store, 0);
        for viewer in [&mut alice, &mut bob] {
            let frame = viewer.next_frame(&registry).await;
            let init = frame.decode::<packets::EntityInitPacket>().unwrap();
            assert_eq!(init.entity, entity.to_bits());
            assert_eq!(init.components.len(), 2);
        }

        // Two writes in one tick collapse into exactly one update for
        // each viewer.
        store.get_mut::<Health>(entity).unwrap().0 = 19;
        store.get_mut::<Health>(entity).unwrap().0 = 18;
        replicator.run(&store, 1);

        for viewer in [&mut alice, &mut bob] {
            let frame = viewer.next_frame(&registry).await;
            let update = frame.decode::<packets::EntityUpdatePacket>().unwrap();
            assert_eq!(update.entity, entity.to_bits());
            assert_eq!(update.components.len(), 1);

            let mut r = update.components[0].data.as_slice();
            assert_eq!(Health::decode(&mut r).unwrap(), Health(18));
        }

        // A clean tick ships nothing.
        replicator.run(&store, 2);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        for viewer in [&mut alice, &mut bob] {
            viewer.no_frame_buffered(&registry);
        }

        // Leaving emits a remove, then the light cleanup for the glow.
        replicator.leave(alice.conn_id, entity);
        replicator.run(&store, 3);

        let frame = alice.next_frame(&registry).await;
        let removed = frame.decode::<packets::EntityRemovePacket>().unwrap();
        assert_eq!(removed.entities, vec![entity.to_bits()]);

        let frame = alice.next_frame(&registry).await;
        let cleanup = frame.decode::<packets::LightCleanupPacket>().unwrap();
        assert_eq!(cleanup.entity, entity.to_bits());

        // Bob still tracks the entity and got nothing extra.
        bob.no_frame_buffered(&registry);
    }
}
