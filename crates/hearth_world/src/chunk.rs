//! Chunk sections and the grid that owns them.
//!
//! Each 16³ section carries two parallel cell arrays: block ids and fluid
//! cells. The fluid cell packs a level and a fluid id into one `u16` so
//! the whole fluid state of a section is a flat array.

use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

use crate::pos::{local_index, BlockPos, SectionPos};

pub const SECTION_DIM: i32 = 16;
pub const SECTION_VOLUME: usize = 4096;

/// The largest level a fluid cell can hold. A cell at this level acts as
/// a source for the default (infinite) fluid behavior.
pub const MAX_FLUID_LEVEL: u8 = 7;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct BlockId(pub u16);

impl BlockId {
    pub const AIR: Self = Self(0);

    pub fn is_air(self) -> bool {
        self == Self::AIR
    }
}

/// A fluid level (low 3 bits, `0..=7`) tagged with a fluid id (high 13
/// bits). The all-zero cell is empty.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct FluidCell(u16);

impl FluidCell {
    pub const EMPTY: Self = Self(0);

    pub fn new(fluid: crate::fluid::FluidId, level: u8) -> Self {
        if level == 0 {
            return Self::EMPTY;
        }
        Self(fluid.0 << 3 | u16::from(level.min(MAX_FLUID_LEVEL)))
    }

    pub fn level(self) -> u8 {
        (self.0 & 0b111) as u8
    }

    pub fn fluid(self) -> crate::fluid::FluidId {
        crate::fluid::FluidId(self.0 >> 3)
    }

    pub fn is_empty(self) -> bool {
        self.level() == 0
    }

    pub fn with_level(self, level: u8) -> Self {
        Self::new(self.fluid(), level)
    }
}

impl std::fmt::Debug for FluidCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            write!(f, "FluidCell::EMPTY")
        } else {
            write!(f, "FluidCell({}@{})", self.fluid().0, self.level())
        }
    }
}

/// One 16³ piece of the world.
pub struct Section {
    blocks: Box<[BlockId]>,
    fluids: Box<[FluidCell]>,
}

impl Default for Section {
    fn default() -> Self {
        Self {
            blocks: vec![BlockId::AIR; SECTION_VOLUME].into_boxed_slice(),
            fluids: vec![FluidCell::EMPTY; SECTION_VOLUME].into_boxed_slice(),
        }
    }
}

impl Section {
    pub fn block(&self, pos: BlockPos) -> BlockId {
        self.blocks[local_index(pos)]
    }

    pub fn set_block(&mut self, pos: BlockPos, block: BlockId) {
        self.blocks[local_index(pos)] = block;
    }

    pub fn fluid(&self, pos: BlockPos) -> FluidCell {
        self.fluids[local_index(pos)]
    }

    pub fn set_fluid(&mut self, pos: BlockPos, cell: FluidCell) {
        self.fluids[local_index(pos)] = cell;
    }
}

/// All loaded sections of one world.
#[derive(Default)]
pub struct ChunkGrid {
    sections: FxHashMap<SectionPos, Box<Section>>,
}

impl ChunkGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads an empty section, returning a reference for population.
    /// Loading over an existing section resets it to empty, so a
    /// re-delivered chunk starts from a clean slate.
    pub fn load_section(&mut self, pos: SectionPos) -> &mut Section {
        match self.sections.entry(pos) {
            Entry::Occupied(entry) => {
                let section = entry.into_mut();
                **section = Section::default();
                section
            }
            Entry::Vacant(entry) => entry.insert(Box::default()),
        }
    }

    pub fn unload_section(&mut self, pos: SectionPos) -> Option<Box<Section>> {
        self.sections.remove(&pos)
    }

    pub fn is_loaded(&self, pos: SectionPos) -> bool {
        self.sections.contains_key(&pos)
    }

    pub fn section(&self, pos: SectionPos) -> Option<&Section> {
        self.sections.get(&pos).map(Box::as_ref)
    }

    pub fn section_mut(&mut self, pos: SectionPos) -> Option<&mut Section> {
        self.sections.get_mut(&pos).map(Box::as_mut)
    }

    /// Checks a section out of the grid. Pairs with
    /// [`put_section`](Self::put_section); the cached accessor holds one
    /// section this way while it works.
    pub(crate) fn take_section(&mut self, pos: SectionPos) -> Option<Box<Section>> {
        self.sections.remove(&pos)
    }

    pub(crate) fn put_section(&mut self, pos: SectionPos, section: Box<Section>) {
        self.sections.insert(pos, section);
    }

    pub fn loaded_sections(&self) -> impl Iterator<Item = SectionPos> + '_ {
        self.sections.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluid::FluidId;

    #[test]
    fn fluid_cell_packing() {
        let cell = FluidCell::new(FluidId(3), 5);
        assert_eq!(cell.fluid(), FluidId(3));
        assert_eq!(cell.level(), 5);
        assert!(!cell.is_empty());

        assert!(FluidCell::new(FluidId(3), 0).is_empty());
        assert_eq!(FluidCell::new(FluidId(1), 200).level(), MAX_FLUID_LEVEL);
        assert_eq!(FluidCell::EMPTY.level(), 0);
    }

    #[test]
    fn reloading_a_section_resets_it() {
        let mut grid = ChunkGrid::new();
        let pos = BlockPos::new(1, 2, 3);
        let section_pos = SectionPos::containing(pos);

        grid.load_section(section_pos)
            .set_block(pos, BlockId(42));
        assert_eq!(grid.section(section_pos).unwrap().block(pos), BlockId(42));

        // A second load over the same position starts from empty.
        let section = grid.load_section(section_pos);
        assert_eq!(section.block(pos), BlockId::AIR);
        assert_eq!(grid.len(), 1);
    }

    #[test]
    fn sections_store_blocks_and_fluids_independently() {
        let mut grid = ChunkGrid::new();
        let pos = BlockPos::new(17, 2, -3);
        let section_pos = SectionPos::containing(pos);

        let section = grid.load_section(section_pos);
        section.set_block(pos, BlockId(42));
        section.set_fluid(pos, FluidCell::new(FluidId(1), 7));

        let section = grid.section(section_pos).unwrap();
        assert_eq!(section.block(pos), BlockId(42));
        assert_eq!(section.fluid(pos).level(), 7);
        assert_eq!(section.block(pos.up()), BlockId::AIR);
    }
}
