//! Entity persistence with forward migration.
//!
//! Encoded form: format version varint, optional meta-store blob, then a
//! count of `(type_id varint, length varint, payload)` component records.
//! Loading an older version runs every registered migration step between
//! it and [`ENTITY_FORMAT_VERSION`], in ascending order, over the raw
//! component records before any decoding happens.

use std::collections::BTreeMap;

use hearth_protocol::VarUInt;

use crate::entity::EntityId;
use crate::error::EcsError;
use crate::meta::{MetaRegistry, MetaStore};
use crate::store::EntityStore;

/// Version written by this build.
pub const ENTITY_FORMAT_VERSION: u32 = 1;

/// One persisted component, not yet decoded.
#[derive(Clone, Debug)]
pub struct RawComponent {
    pub type_id: u16,
    pub data: Vec<u8>,
}

type Migration = Box<dyn Fn(&mut Vec<RawComponent>) -> anyhow::Result<()> + Send + Sync>;

/// Transforms applied to entities persisted by older builds. A step
/// registered for version `v` upgrades `v` to `v + 1`.
#[derive(Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, Migration>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, from_version: u32, step: F)
    where
        F: Fn(&mut Vec<RawComponent>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.steps.insert(from_version, Box::new(step));
    }

    fn migrate(&self, from_version: u32, raw: &mut Vec<RawComponent>) -> anyhow::Result<()> {
        for version in from_version..ENTITY_FORMAT_VERSION {
            if let Some(step) = self.steps.get(&version) {
                step(raw)?;
            }
        }
        Ok(())
    }
}

/// Serializes an entity with all its components and meta store.
pub fn encode_entity(store: &EntityStore, id: EntityId) -> anyhow::Result<Vec<u8>> {
    let raw = store.raw_components(id)?;

    let mut out = Vec::new();
    put_var(&mut out, ENTITY_FORMAT_VERSION);

    match store.meta(id) {
        Some(meta) => {
            out.push(1);
            let bytes = meta.encode();
            put_var(&mut out, bytes.len() as u32);
            out.extend_from_slice(&bytes);
        }
        None => out.push(0),
    }

    put_var(&mut out, raw.len() as u32);
    for component in &raw {
        put_var(&mut out, u32::from(component.type_id));
        put_var(&mut out, component.data.len() as u32);
        out.extend_from_slice(&component.data);
    }

    Ok(out)
}

/// Spawns an entity from its persisted form, migrating older versions.
pub fn spawn_encoded(
    store: &mut EntityStore,
    meta_registry: &MetaRegistry,
    migrations: &MigrationRegistry,
    bytes: &[u8],
) -> anyhow::Result<EntityId> {
    let mut r = bytes;

    let version = VarUInt::read(&mut r)?;
    if version > ENTITY_FORMAT_VERSION {
        return Err(EcsError::UnsupportedFormatVersion(version).into());
    }

    let meta = match *r.first().ok_or_else(|| anyhow::anyhow!("truncated entity"))? {
        0 => {
            r = &r[1..];
            None
        }
        1 => {
            r = &r[1..];
            let len = VarUInt::read(&mut r)? as usize;
            anyhow::ensure!(len <= r.len(), "meta blob length {len} exceeds input");
            let (blob, rest) = r.split_at(len);
            r = rest;
            Some(MetaStore::decode(blob, meta_registry)?)
        }
        n => anyhow::bail!("invalid meta presence byte {n}"),
    };

    let count = VarUInt::read(&mut r)? as usize;
    let mut raw = Vec::with_capacity(count.min(r.len()));
    for _ in 0..count {
        let type_id = VarUInt::read(&mut r)?;
        let len = VarUInt::read(&mut r)? as usize;
        anyhow::ensure!(len <= r.len(), "component length {len} exceeds input");
        let (data, rest) = r.split_at(len);
        r = rest;
        raw.push(RawComponent {
            type_id: u16::try_from(type_id)?,
            data: data.to_vec(),
        });
    }
    anyhow::ensure!(r.is_empty(), "{} trailing bytes after entity", r.len());

    migrations.migrate(version, &mut raw)?;

    let id = store.spawn();
    for component in &raw {
        if let Err(e) = store.insert_raw(id, component.type_id, &component.data) {
            // Roll the partial spawn back before surfacing the error.
            let _ = store.despawn(id);
            return Err(e);
        }
    }

    if let Some(meta) = meta {
        *store.meta_mut(id)? = meta;
    }

    Ok(id)
}

fn put_var(out: &mut Vec<u8>, mut x: u32) {
    loop {
        let byte = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
