//! Per-type component storage.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};

use bitvec::vec::BitVec;
use hearth_protocol::{Decode, Encode};

use crate::component::Component;

/// One component type's storage: a sparse vector of values indexed by
/// slot, an occupancy bitset, and a dirty flag per slot.
///
/// Dirty flags are atomic so the replication phase can consume them
/// through a shared reference while the rest of the store stays borrowed.
pub(crate) struct Column<T> {
    values: Vec<Option<T>>,
    occupied: BitVec,
    dirty: Vec<AtomicBool>,
}

impl<T> Default for Column<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            occupied: BitVec::new(),
            dirty: Vec::new(),
        }
    }
}

impl<T: Component> Column<T> {
    pub(crate) fn get(&self, slot: u32) -> Option<&T> {
        self.values.get(slot as usize)?.as_ref()
    }

    /// Mutable access marks the slot dirty; every mutator path goes
    /// through here.
    pub(crate) fn get_mut(&mut self, slot: u32) -> Option<&mut T> {
        let value = self.values.get_mut(slot as usize)?.as_mut()?;
        self.dirty[slot as usize].store(true, Ordering::Release);
        Some(value)
    }

    pub(crate) fn insert(&mut self, slot: u32, value: T) -> Option<T> {
        self.grow_for(slot);

        let idx = slot as usize;
        let old = self.values[idx].replace(value);
        self.occupied.set(idx, true);
        self.dirty[idx].store(true, Ordering::Release);
        old
    }

    pub(crate) fn remove(&mut self, slot: u32) -> Option<T> {
        let idx = slot as usize;
        let old = self.values.get_mut(idx)?.take();
        if old.is_some() {
            self.occupied.set(idx, false);
            self.dirty[idx].store(false, Ordering::Release);
        }
        old
    }

    /// Atomic test-and-clear of the slot's dirty flag.
    pub(crate) fn consume_dirty(&self, slot: u32) -> bool {
        self.dirty
            .get(slot as usize)
            .map_or(false, |flag| flag.swap(false, Ordering::AcqRel))
    }

    pub(crate) fn is_dirty(&self, slot: u32) -> bool {
        self.dirty
            .get(slot as usize)
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    }

    fn grow_for(&mut self, slot: u32) {
        let needed = slot as usize + 1;
        if self.values.len() < needed {
            self.values.resize_with(needed, || None);
            self.occupied.resize(needed, false);
            self.dirty.resize_with(needed, AtomicBool::default);
        }
    }
}

/// Type-erased view the store keeps one of per registered component type.
pub(crate) trait AnyColumn: Send + Sync {
    fn has(&self, slot: u32) -> bool;

    /// Atomic test-and-clear of the slot's dirty flag.
    fn consume_dirty(&self, slot: u32) -> bool;

    fn is_dirty(&self, slot: u32) -> bool;

    /// Drops the slot's value on despawn. Returns whether one was present.
    fn clear_slot(&mut self, slot: u32) -> bool;

    /// Clones `src`'s value into `dst` on the same column. The clone is a
    /// fresh value: `dst` starts dirty like any insert, regardless of
    /// `src`'s flag.
    fn clone_slot(&mut self, src: u32, dst: u32) -> bool;

    fn encode_slot(&self, slot: u32, out: &mut Vec<u8>) -> anyhow::Result<()>;

    fn decode_insert(&mut self, slot: u32, r: &mut &[u8]) -> anyhow::Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> AnyColumn for Column<T>
where
    T: Component + Encode + for<'a> Decode<'a>,
{
    fn has(&self, slot: u32) -> bool {
        self.occupied
            .get(slot as usize)
            .map_or(false, |bit| *bit)
    }

    fn consume_dirty(&self, slot: u32) -> bool {
        Column::consume_dirty(self, slot)
    }

    fn is_dirty(&self, slot: u32) -> bool {
        Column::is_dirty(self, slot)
    }

    fn clear_slot(&mut self, slot: u32) -> bool {
        self.remove(slot).is_some()
    }

    fn clone_slot(&mut self, src: u32, dst: u32) -> bool {
        let Some(value) = self.get(src).cloned() else {
            return false;
        };
        self.insert(dst, value);
        true
    }

    fn encode_slot(&self, slot: u32, out: &mut Vec<u8>) -> anyhow::Result<()> {
        match self.get(slot) {
            Some(value) => value.encode(out),
            None => anyhow::bail!("slot {slot} holds no '{}' component", T::NAME),
        }
    }

    fn decode_insert(&mut self, slot: u32, r: &mut &[u8]) -> anyhow::Result<()> {
        let value = T::decode(r)?;
        self.insert(slot, value);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
