//! The entity store: slot table plus one column per registered component
//! type.
//!
//! All mutation happens on the owning world's tick thread. Other contexts
//! queue a [`CommandBuffer`](crate::command::CommandBuffer) instead; the
//! replication phase reads through shared references and consumes dirty
//! flags atomically.

use std::sync::Arc;

use bitvec::vec::BitVec;
use hearth_protocol::packets::ComponentBlob;

use crate::column::{AnyColumn, Column};
use crate::component::{Component, ComponentRegistry, ComponentTypeId, ReplicationPolicy};
use crate::entity::EntityId;
use crate::error::EcsError;
use crate::meta::MetaStore;

pub struct EntityStore {
    registry: Arc<ComponentRegistry>,
    generations: Vec<u32>,
    alive: BitVec,
    free: Vec<u32>,
    columns: Vec<Box<dyn AnyColumn>>,
    metas: Vec<Option<MetaStore>>,
}

impl EntityStore {
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        let columns = registry
            .infos()
            .iter()
            .map(|info| (info.new_column)())
            .collect();

        Self {
            registry,
            generations: Vec::new(),
            alive: BitVec::new(),
            free: Vec::new(),
            columns,
            metas: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn spawn(&mut self) -> EntityId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = self.generations.len() as u32;
                self.generations.push(0);
                self.alive.push(false);
                self.metas.push(None);
                index
            }
        };

        self.alive.set(index as usize, true);
        EntityId::new(index, self.generations[index as usize])
    }

    /// Removes the entity and every component it holds. The slot's
    /// generation is bumped so outstanding ids for it go stale.
    pub fn despawn(&mut self, id: EntityId) -> Result<(), EcsError> {
        if !self.contains(id) {
            return Err(EcsError::EntityGone);
        }

        let index = id.index();
        for column in &mut self.columns {
            column.clear_slot(index);
        }
        self.metas[index as usize] = None;

        self.alive.set(index as usize, false);
        self.generations[index as usize] = self.generations[index as usize].wrapping_add(1);
        self.free.push(index);

        Ok(())
    }

    pub fn contains(&self, id: EntityId) -> bool {
        let idx = id.index() as usize;
        self.alive.get(idx).map_or(false, |bit| *bit)
            && self.generations[idx] == id.generation()
    }

    pub fn len(&self) -> usize {
        self.alive.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.alive
            .iter_ones()
            .map(|idx| EntityId::new(idx as u32, self.generations[idx]))
    }

    pub fn insert<T: Component>(&mut self, id: EntityId, value: T) -> Result<Option<T>, EcsError> {
        if !self.contains(id) {
            return Err(EcsError::EntityGone);
        }
        Ok(self.typed_column_mut::<T>()?.insert(id.index(), value))
    }

    pub fn get<T: Component>(&self, id: EntityId) -> Option<&T> {
        if !self.contains(id) {
            return None;
        }
        self.typed_column::<T>().ok()?.get(id.index())
    }

    /// Mutable access marks the component dirty.
    pub fn get_mut<T: Component>(&mut self, id: EntityId) -> Option<&mut T> {
        if !self.contains(id) {
            return None;
        }
        let index = id.index();
        self.typed_column_mut::<T>().ok()?.get_mut(index)
    }

    pub fn remove<T: Component>(&mut self, id: EntityId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        let index = id.index();
        self.typed_column_mut::<T>().ok()?.remove(index)
    }

    pub fn has<T: Component>(&self, id: EntityId) -> bool {
        self.get::<T>(id).is_some()
    }

    pub fn has_by_type_id(&self, id: EntityId, type_id: ComponentTypeId) -> bool {
        self.contains(id)
            && self
                .columns
                .get(usize::from(type_id.0))
                .map_or(false, |column| column.has(id.index()))
    }

    pub fn is_dirty<T: Component>(&self, id: EntityId) -> bool {
        self.contains(id)
            && self
                .typed_column::<T>()
                .map_or(false, |column| column.is_dirty(id.index()))
    }

    /// Atomic test-and-clear of one component's dirty flag.
    pub fn consume_dirty<T: Component>(&self, id: EntityId) -> bool {
        self.contains(id)
            && self
                .typed_column::<T>()
                .map_or(false, |column| column.consume_dirty(id.index()))
    }

    /// Spawns an independent copy of `src` with clones of all its
    /// components. Clones carry no dirtiness from the source; they are
    /// fresh values no replicator has observed.
    pub fn clone_entity(&mut self, src: EntityId) -> Result<EntityId, EcsError> {
        if !self.contains(src) {
            return Err(EcsError::EntityGone);
        }

        let dst = self.spawn();
        let (src_idx, dst_idx) = (src.index(), dst.index());
        for column in &mut self.columns {
            column.clone_slot(src_idx, dst_idx);
        }

        Ok(dst)
    }

    /// Lazily creates the entity's meta store.
    pub fn meta_mut(&mut self, id: EntityId) -> Result<&mut MetaStore, EcsError> {
        if !self.contains(id) {
            return Err(EcsError::EntityGone);
        }
        Ok(self.metas[id.index() as usize].get_or_insert_with(MetaStore::new))
    }

    pub fn meta(&self, id: EntityId) -> Option<&MetaStore> {
        if !self.contains(id) {
            return None;
        }
        self.metas[id.index() as usize].as_ref()
    }

    /// Stages every replicatable component of `id` whose dirty flag (or
    /// periodic schedule) fires this tick, consuming the flags. Returns
    /// one blob per staged component.
    pub fn stage_dirty(&self, id: EntityId, tick: u64) -> Vec<ComponentBlob> {
        self.stage(id, |column, info, index| match info.policy {
            ReplicationPolicy::Never => false,
            ReplicationPolicy::OnChange => column.consume_dirty(index),
            ReplicationPolicy::Periodic(n) => {
                let periodic = tick % u64::from(n.max(1)) == 0;
                // Consume regardless so the flag does not linger.
                column.consume_dirty(index) || periodic
            }
        })
    }

    /// Stages every replicatable component of `id` regardless of
    /// dirtiness. Used for the full-state packet when an entity enters a
    /// viewer's tracker. Dirty flags are left alone.
    pub fn stage_all(&self, id: EntityId) -> Vec<ComponentBlob> {
        self.stage(id, |_, info, _| info.policy.replicates())
    }

    /// Whether any replicatable component of `id` is dirty, without
    /// consuming anything.
    pub fn any_dirty(&self, id: EntityId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let index = id.index();
        self.registry.infos().iter().any(|info| {
            info.policy.replicates() && self.columns[usize::from(info.type_id.0)].is_dirty(index)
        })
    }

    fn stage(
        &self,
        id: EntityId,
        mut want: impl FnMut(&dyn AnyColumn, &crate::component::ComponentInfo, u32) -> bool,
    ) -> Vec<ComponentBlob> {
        if !self.contains(id) {
            return Vec::new();
        }

        let index = id.index();
        let mut blobs = Vec::new();

        for info in self.registry.infos() {
            let column = &self.columns[usize::from(info.type_id.0)];
            if !column.has(index) || !want(column.as_ref(), info, index) {
                continue;
            }

            let mut data = Vec::new();
            match column.encode_slot(index, &mut data) {
                Ok(()) => blobs.push(ComponentBlob {
                    type_id: info.type_id.0,
                    data,
                }),
                Err(e) => {
                    tracing::warn!("failed to encode '{}' for {id:?}: {e:#}", info.name);
                }
            }
        }

        blobs
    }

    /// Encodes every component the entity holds, replication policy
    /// notwithstanding. Persistence only.
    pub(crate) fn raw_components(
        &self,
        id: EntityId,
    ) -> anyhow::Result<Vec<crate::persist::RawComponent>> {
        anyhow::ensure!(self.contains(id), "entity is gone");

        let index = id.index();
        let mut raw = Vec::new();

        for info in self.registry.infos() {
            let column = &self.columns[usize::from(info.type_id.0)];
            if !column.has(index) {
                continue;
            }

            let mut data = Vec::new();
            column.encode_slot(index, &mut data)?;
            raw.push(crate::persist::RawComponent {
                type_id: info.type_id.0,
                data,
            });
        }

        Ok(raw)
    }

    /// Decodes and attaches one persisted component.
    pub(crate) fn insert_raw(&mut self, id: EntityId, type_id: u16, data: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(self.contains(id), "entity is gone");

        let index = id.index();
        let column = self.column_by_type_id(ComponentTypeId(type_id))?;
        let mut r = data;
        column.decode_insert(index, &mut r)?;
        anyhow::ensure!(r.is_empty(), "{} trailing bytes in component {type_id}", r.len());
        Ok(())
    }

    pub(crate) fn column_by_type_id(
        &mut self,
        type_id: ComponentTypeId,
    ) -> Result<&mut Box<dyn AnyColumn>, EcsError> {
        self.columns
            .get_mut(usize::from(type_id.0))
            .ok_or(EcsError::UnknownComponent(type_id.0))
    }

    fn typed_column<T: Component>(&self) -> Result<&Column<T>, EcsError> {
        let type_id = self
            .registry
            .type_id_of::<T>()
            .ok_or(EcsError::UnknownComponent(u16::MAX))?;
        let column = &self.columns[usize::from(type_id.0)];
        Ok(column
            .as_any()
            .downcast_ref::<Column<T>>()
            .expect("column type mismatch"))
    }

    fn typed_column_mut<T: Component>(&mut self) -> Result<&mut Column<T>, EcsError> {
        let type_id = self
            .registry
            .type_id_of::<T>()
            .ok_or(EcsError::UnknownComponent(u16::MAX))?;
        let column = &mut self.columns[usize::from(type_id.0)];
        Ok(column
            .as_any_mut()
            .downcast_mut::<Column<T>>()
            .expect("column type mismatch"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use hearth_protocol::{Decode, Encode};

    use super::*;
    use crate::component::ComponentRegistryBuilder;

    #[derive(Clone, Copy, PartialEq, Debug)]
    pub(crate) struct Position {
        pub(crate) x: f32,
        pub(crate) y: f32,
        pub(crate) z: f32,
    }

    impl Component for Position {
        const NAME: &'static str = "position";
    }

    impl Encode for Position {
        fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
            self.x.encode(&mut w)?;
            self.y.encode(&mut w)?;
            self.z.encode(w)
        }
    }

    impl Decode<'_> for Position {
        fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
            Ok(Self {
                x: f32::decode(r)?,
                y: f32::decode(r)?,
                z: f32::decode(r)?,
            })
        }
    }

    #[derive(Clone, PartialEq, Debug)]
    pub(crate) struct Label(pub(crate) String);

    impl Component for Label {
        const NAME: &'static str = "label";
    }

    impl Encode for Label {
        fn encode(&self, w: impl Write) -> anyhow::Result<()> {
            self.0.encode(w)
        }
    }

    impl Decode<'_> for Label {
        fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
            Ok(Self(String::decode(r)?))
        }
    }

    pub(crate) fn test_store() -> EntityStore {
        let mut builder = ComponentRegistryBuilder::new();
        builder
            .register::<Position>(ReplicationPolicy::OnChange)
            .unwrap();
        builder.register::<Label>(ReplicationPolicy::Never).unwrap();
        EntityStore::new(builder.build())
    }

    #[test]
    fn stale_ids_fail_lookups_after_despawn() {
        let mut store = test_store();

        let id = store.spawn();
        store
            .insert(id, Position { x: 1.0, y: 2.0, z: 3.0 })
            .unwrap();
        store.despawn(id).unwrap();

        assert!(!store.contains(id));
        assert!(store.get::<Position>(id).is_none());
        assert!(matches!(store.despawn(id), Err(EcsError::EntityGone)));

        // The slot is reused under a new generation.
        let next = store.spawn();
        assert_eq!(next.index(), id.index());
        assert_ne!(next.generation(), id.generation());
        assert!(store.get::<Position>(next).is_none());
    }

    #[test]
    fn mutation_sets_dirty_and_consume_clears_it() {
        let mut store = test_store();
        let id = store.spawn();

        store
            .insert(id, Position { x: 0.0, y: 0.0, z: 0.0 })
            .unwrap();
        assert!(store.is_dirty::<Position>(id));
        assert!(store.consume_dirty::<Position>(id));
        assert!(!store.is_dirty::<Position>(id));

        store.get_mut::<Position>(id).unwrap().x = 5.0;
        assert!(store.is_dirty::<Position>(id));

        // Test-and-clear: the second consume sees nothing.
        assert!(store.consume_dirty::<Position>(id));
        assert!(!store.consume_dirty::<Position>(id));
    }

    #[test]
    fn staging_skips_non_replicated_components() {
        let mut store = test_store();
        let id = store.spawn();

        store
            .insert(id, Position { x: 1.0, y: 0.0, z: 0.0 })
            .unwrap();
        store.insert(id, Label("server-only".into())).unwrap();

        let blobs = store.stage_dirty(id, 0);
        assert_eq!(blobs.len(), 1);

        // Written twice within a tick, staged once.
        store.get_mut::<Position>(id).unwrap().x = 2.0;
        store.get_mut::<Position>(id).unwrap().x = 3.0;
        assert_eq!(store.stage_dirty(id, 1).len(), 1);
        assert!(store.stage_dirty(id, 2).is_empty());

        // Full staging ignores dirtiness but still gates on policy.
        assert_eq!(store.stage_all(id).len(), 1);
    }

    #[test]
    fn clone_entity_copies_values_not_identity() {
        let mut store = test_store();
        let src = store.spawn();
        store
            .insert(src, Position { x: 9.0, y: 9.0, z: 9.0 })
            .unwrap();
        store.insert(src, Label("prefab".into())).unwrap();

        let dst = store.clone_entity(src).unwrap();
        assert_ne!(src, dst);
        assert_eq!(store.get::<Position>(dst), store.get::<Position>(src));

        // Independent copies.
        store.get_mut::<Position>(dst).unwrap().x = 0.0;
        assert_eq!(store.get::<Position>(src).unwrap().x, 9.0);
    }
}
