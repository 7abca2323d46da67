//! Read/write access to the grid across section borders.

use thiserror::Error;

use crate::chunk::{BlockId, ChunkGrid, FluidCell, Section};
use crate::pos::{BlockPos, SectionPos};

/// The addressed cell lies in a section that is not loaded. Callers at
/// the fluid-ticker layer treat this as "try again when the chunk
/// arrives", never as a failure.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Error)]
#[error("chunk not loaded")]
pub struct ChunkNotLoaded;

/// Cell access spanning section borders.
pub trait Accessor {
    fn block(&mut self, pos: BlockPos) -> Result<BlockId, ChunkNotLoaded>;

    fn fluid(&mut self, pos: BlockPos) -> Result<FluidCell, ChunkNotLoaded>;

    fn set_block(&mut self, pos: BlockPos, block: BlockId) -> Result<(), ChunkNotLoaded>;

    fn set_fluid(&mut self, pos: BlockPos, cell: FluidCell) -> Result<(), ChunkNotLoaded>;

    fn is_loaded(&mut self, pos: BlockPos) -> bool {
        self.block(pos).is_ok()
    }
}

/// Plain accessor: one map lookup per operation.
pub struct GridAccessor<'a> {
    grid: &'a mut ChunkGrid,
}

impl<'a> GridAccessor<'a> {
    pub fn new(grid: &'a mut ChunkGrid) -> Self {
        Self { grid }
    }
}

impl Accessor for GridAccessor<'_> {
    fn block(&mut self, pos: BlockPos) -> Result<BlockId, ChunkNotLoaded> {
        self.grid
            .section(SectionPos::containing(pos))
            .map(|section| section.block(pos))
            .ok_or(ChunkNotLoaded)
    }

    fn fluid(&mut self, pos: BlockPos) -> Result<FluidCell, ChunkNotLoaded> {
        self.grid
            .section(SectionPos::containing(pos))
            .map(|section| section.fluid(pos))
            .ok_or(ChunkNotLoaded)
    }

    fn set_block(&mut self, pos: BlockPos, block: BlockId) -> Result<(), ChunkNotLoaded> {
        self.grid
            .section_mut(SectionPos::containing(pos))
            .map(|section| section.set_block(pos, block))
            .ok_or(ChunkNotLoaded)
    }

    fn set_fluid(&mut self, pos: BlockPos, cell: FluidCell) -> Result<(), ChunkNotLoaded> {
        self.grid
            .section_mut(SectionPos::containing(pos))
            .map(|section| section.set_fluid(pos, cell))
            .ok_or(ChunkNotLoaded)
    }
}

/// Accessor that keeps the last section it touched checked out of the
/// grid, amortizing the map lookup for the tight neighborhood scans of
/// the fluid ticker. One lives per tick thread for the duration of a
/// system run; drop puts the checked-out section back.
pub struct CachedAccessor<'a> {
    grid: &'a mut ChunkGrid,
    cache: Option<(SectionPos, Box<Section>)>,
}

impl<'a> CachedAccessor<'a> {
    pub fn new(grid: &'a mut ChunkGrid) -> Self {
        Self { grid, cache: None }
    }

    fn section_for(&mut self, pos: BlockPos) -> Result<&mut Section, ChunkNotLoaded> {
        let section_pos = SectionPos::containing(pos);

        let stale = match &self.cache {
            Some((cached_pos, _)) => *cached_pos != section_pos,
            None => true,
        };
        if stale {
            self.flush();
            let section = self.grid.take_section(section_pos).ok_or(ChunkNotLoaded)?;
            self.cache = Some((section_pos, section));
        }

        match &mut self.cache {
            Some((_, section)) => Ok(section),
            // The cache was filled just above; this arm is never taken.
            None => Err(ChunkNotLoaded),
        }
    }

    fn flush(&mut self) {
        if let Some((pos, section)) = self.cache.take() {
            self.grid.put_section(pos, section);
        }
    }
}

impl Drop for CachedAccessor<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

impl Accessor for CachedAccessor<'_> {
    fn block(&mut self, pos: BlockPos) -> Result<BlockId, ChunkNotLoaded> {
        Ok(self.section_for(pos)?.block(pos))
    }

    fn fluid(&mut self, pos: BlockPos) -> Result<FluidCell, ChunkNotLoaded> {
        Ok(self.section_for(pos)?.fluid(pos))
    }

    fn set_block(&mut self, pos: BlockPos, block: BlockId) -> Result<(), ChunkNotLoaded> {
        self.section_for(pos)?.set_block(pos, block);
        Ok(())
    }

    fn set_fluid(&mut self, pos: BlockPos, cell: FluidCell) -> Result<(), ChunkNotLoaded> {
        self.section_for(pos)?.set_fluid(pos, cell);
        Ok(())
    }
}
