//! Per-entity typed key-value store.
//!
//! Keys are registered with integer ids in a [`MetaRegistry`]. Decoded
//! values live in a sparse array indexed by key id; entries under ids this
//! build has never registered are preserved byte-for-byte in a side
//! buffer, so data written by a newer server version round-trips
//! losslessly through an older one.

use std::sync::atomic::{AtomicBool, Ordering};

use hearth_protocol::VarUInt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::EcsError;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MetaKeyId(pub u16);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MetaKind {
    Bool,
    I64,
    F64,
    Str,
    Bytes,
}

impl MetaKind {
    fn tag(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::I64 => 1,
            Self::F64 => 2,
            Self::Str => 3,
            Self::Bytes => 4,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum MetaValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl MetaValue {
    pub fn kind(&self) -> MetaKind {
        match self {
            Self::Bool(_) => MetaKind::Bool,
            Self::I64(_) => MetaKind::I64,
            Self::F64(_) => MetaKind::F64,
            Self::Str(_) => MetaKind::Str,
            Self::Bytes(_) => MetaKind::Bytes,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Self::Bool(v) => out.push(u8::from(*v)),
            Self::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Str(v) => out.extend_from_slice(v.as_bytes()),
            Self::Bytes(v) => out.extend_from_slice(v),
        }
    }

    fn decode_payload(kind: u8, payload: &[u8]) -> Option<Self> {
        Some(match kind {
            0 => Self::Bool(*payload.first()? != 0),
            1 => Self::I64(i64::from_le_bytes(payload.try_into().ok()?)),
            2 => Self::F64(f64::from_le_bytes(payload.try_into().ok()?)),
            3 => Self::Str(std::str::from_utf8(payload).ok()?.to_owned()),
            4 => Self::Bytes(payload.to_vec()),
            _ => return None,
        })
    }
}

struct MetaKeyInfo {
    name: &'static str,
    kind: MetaKind,
}

/// Startup-time key table, shared by every meta store in the process.
#[derive(Default)]
pub struct MetaRegistry {
    keys: Vec<MetaKeyInfo>,
    by_name: FxHashMap<&'static str, MetaKeyId>,
}

impl MetaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, kind: MetaKind) -> Result<MetaKeyId, EcsError> {
        if self.by_name.contains_key(name) {
            return Err(EcsError::DuplicateMetaKey(name));
        }

        let id = MetaKeyId(self.keys.len() as u16);
        self.keys.push(MetaKeyInfo { name, kind });
        self.by_name.insert(name, id);
        Ok(id)
    }

    pub fn key(&self, name: &str) -> Option<MetaKeyId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: MetaKeyId) -> Option<&'static str> {
        self.keys.get(usize::from(id.0)).map(|info| info.name)
    }

    fn kind(&self, id: MetaKeyId) -> Option<MetaKind> {
        self.keys.get(usize::from(id.0)).map(|info| info.kind)
    }
}

/// One entry this build cannot interpret, kept verbatim.
#[derive(Clone, Debug)]
struct UnknownEntry {
    id: u32,
    kind: u8,
    payload: Vec<u8>,
}

/// Wire form of an entry: `id` varint, `kind` byte, `len` varint, then
/// `len` payload bytes. The length prefix is what makes entries of future
/// kinds skippable.
pub struct MetaStore {
    values: Vec<Option<MetaValue>>,
    unknown: Vec<UnknownEntry>,
    /// Set by every write; guards the cached snapshot below.
    dirty: AtomicBool,
    snapshot: Mutex<Vec<u8>>,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            unknown: Vec::new(),
            dirty: AtomicBool::new(true),
            snapshot: Mutex::new(Vec::new()),
        }
    }

    /// Typed write; marks the whole store dirty.
    pub fn set(
        &mut self,
        registry: &MetaRegistry,
        key: MetaKeyId,
        value: MetaValue,
    ) -> Result<(), EcsError> {
        let expected = registry
            .kind(key)
            .ok_or(EcsError::UnknownComponent(key.0))?;
        if expected != value.kind() {
            return Err(EcsError::MetaKindMismatch {
                id: key.0,
                requested: value.kind(),
                actual: expected,
            });
        }

        let idx = usize::from(key.0);
        if self.values.len() <= idx {
            self.values.resize_with(idx + 1, || None);
        }
        self.values[idx] = Some(value);
        self.dirty.store(true, Ordering::Release);

        Ok(())
    }

    /// Reads are direct and never touch the dirty flag.
    pub fn get(&self, key: MetaKeyId) -> Option<&MetaValue> {
        self.values.get(usize::from(key.0))?.as_ref()
    }

    pub fn remove(&mut self, key: MetaKeyId) -> Option<MetaValue> {
        let old = self.values.get_mut(usize::from(key.0))?.take();
        if old.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        old
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Atomic test-and-clear.
    pub fn consume_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Serializes the store. Clean stores return the cached snapshot, so
    /// a decode immediately followed by an encode reproduces the input
    /// bytes exactly, unknown entries included.
    pub fn encode(&self) -> Vec<u8> {
        if !self.is_dirty() {
            let snapshot = self.snapshot.lock();
            if !snapshot.is_empty() {
                return snapshot.clone();
            }
        }

        let mut out = Vec::new();
        let count = self.values.iter().flatten().count() + self.unknown.len();
        put_var(&mut out, count as u32);

        for (idx, value) in self.values.iter().enumerate() {
            let Some(value) = value else { continue };

            let mut payload = Vec::new();
            value.encode_payload(&mut payload);

            write_entry(&mut out, idx as u32, value.kind().tag(), &payload);
        }

        for entry in &self.unknown {
            write_entry(&mut out, entry.id, entry.kind, &entry.payload);
        }

        *self.snapshot.lock() = out.clone();
        self.dirty.store(false, Ordering::Release);

        out
    }

    /// Deserializes a store. Entries under unregistered ids, or under
    /// registered ids whose kind this build does not understand, go to
    /// the verbatim side buffer.
    pub fn decode(bytes: &[u8], registry: &MetaRegistry) -> anyhow::Result<Self> {
        let mut r = bytes;
        let count = VarUInt::read(&mut r)?;

        let mut store = Self::new();

        for _ in 0..count {
            let id = VarUInt::read(&mut r)?;
            let kind = *r.first().ok_or_else(|| anyhow::anyhow!("truncated meta entry"))?;
            r = &r[1..];
            let len = VarUInt::read(&mut r)? as usize;
            anyhow::ensure!(len <= r.len(), "meta entry length {len} exceeds input");
            let (payload, rest) = r.split_at(len);
            r = rest;

            let key = MetaKeyId(id.min(u32::from(u16::MAX)) as u16);
            let known = id <= u32::from(u16::MAX)
                && registry.kind(key).map(MetaKind::tag) == Some(kind);

            let decoded = if known {
                MetaValue::decode_payload(kind, payload)
            } else {
                None
            };

            match decoded {
                Some(value) => {
                    let idx = usize::from(key.0);
                    if store.values.len() <= idx {
                        store.values.resize_with(idx + 1, || None);
                    }
                    store.values[idx] = Some(value);
                }
                None => store.unknown.push(UnknownEntry {
                    id,
                    kind,
                    payload: payload.to_vec(),
                }),
            }
        }

        anyhow::ensure!(r.is_empty(), "{} trailing bytes after meta store", r.len());

        *store.snapshot.lock() = bytes.to_vec();
        store.dirty.store(false, Ordering::Release);

        Ok(store)
    }
}

fn write_entry(out: &mut Vec<u8>, id: u32, kind: u8, payload: &[u8]) {
    put_var(out, id);
    out.push(kind);
    put_var(out, payload.len() as u32);
    out.extend_from_slice(payload);
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
