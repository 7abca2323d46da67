//! Component types and their startup-time registry.

use std::any::TypeId;
use std::sync::Arc;

use hearth_protocol::{Decode, Encode};
use rustc_hash::FxHashMap;

use crate::column::{AnyColumn, Column};
use crate::error::EcsError;

/// A typed data record attachable to an entity.
///
/// `Clone` is required for spawn-from-prefab; the clone is an independent
/// value and carries no dirtiness (see [`EntityStore::clone_entity`]).
///
/// [`EntityStore::clone_entity`]: crate::store::EntityStore::clone_entity
pub trait Component: Clone + Send + Sync + 'static {
    /// Stable name used in diagnostics and asset-driven spawning.
    const NAME: &'static str;
}

/// How the replicator treats a component type.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReplicationPolicy {
    /// Server-private; never leaves the store.
    Never,
    /// Shipped when the dirty flag is consumed.
    OnChange,
    /// Shipped every `n` ticks regardless of dirtiness, and on dirtiness
    /// like `OnChange`.
    Periodic(u32),
}

impl ReplicationPolicy {
    pub(crate) fn replicates(self) -> bool {
        !matches!(self, Self::Never)
    }
}

/// Integer type id assigned at registration, stable for the process
/// lifetime and used on the wire and in persistence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ComponentTypeId(pub u16);

pub(crate) struct ComponentInfo {
    pub(crate) type_id: ComponentTypeId,
    pub(crate) name: &'static str,
    pub(crate) policy: ReplicationPolicy,
    /// Spawns an empty column for this type; the store calls it once.
    pub(crate) new_column: fn() -> Box<dyn AnyColumn>,
}

/// Startup-time component table. Registration is bulk and single-threaded;
/// the built registry is immutable behind an `Arc`.
#[derive(Default)]
pub struct ComponentRegistryBuilder {
    infos: Vec<ComponentInfo>,
    by_type: FxHashMap<TypeId, ComponentTypeId>,
}

impl ComponentRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, policy: ReplicationPolicy) -> Result<ComponentTypeId, EcsError>
    where
        T: Component + Encode + for<'a> Decode<'a>,
    {
        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(EcsError::DuplicateComponent(T::NAME));
        }

        let type_id = ComponentTypeId(self.infos.len() as u16);
        self.infos.push(ComponentInfo {
            type_id,
            name: T::NAME,
            policy,
            new_column: || Box::new(Column::<T>::default()),
        });
        self.by_type.insert(TypeId::of::<T>(), type_id);

        Ok(type_id)
    }

    pub fn build(self) -> Arc<ComponentRegistry> {
        Arc::new(ComponentRegistry {
            infos: self.infos,
            by_type: self.by_type,
        })
    }
}

pub struct ComponentRegistry {
    infos: Vec<ComponentInfo>,
    by_type: FxHashMap<TypeId, ComponentTypeId>,
}

impl ComponentRegistry {
    pub fn type_id_of<T: Component>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn policy(&self, type_id: ComponentTypeId) -> Option<ReplicationPolicy> {
        self.info(type_id).map(|info| info.policy)
    }

    pub fn name(&self, type_id: ComponentTypeId) -> Option<&'static str> {
        self.info(type_id).map(|info| info.name)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub(crate) fn info(&self, type_id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(usize::from(type_id.0))
    }

    pub(crate) fn infos(&self) -> &[ComponentInfo] {
        &self.infos
    }
}
