#![doc = include_str!("../README.md")]

mod column;
pub mod command;
pub mod component;
pub mod entity;
mod error;
pub mod meta;
pub mod persist;
pub mod store;

pub use crate::command::{CommandBuffer, CommandReport};
pub use crate::component::{
    Component, ComponentRegistry, ComponentRegistryBuilder, ComponentTypeId, ReplicationPolicy,
};
pub use crate::entity::EntityId;
pub use crate::error::EcsError;
pub use crate::meta::{MetaKeyId, MetaKind, MetaRegistry, MetaStore, MetaValue};
pub use crate::persist::{
    encode_entity, spawn_encoded, MigrationRegistry, RawComponent, ENTITY_FORMAT_VERSION,
};
pub use crate::store::EntityStore;
