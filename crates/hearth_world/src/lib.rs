#![doc = include_str!("../README.md")]

pub mod accessor;
pub mod chunk;
pub mod fluid;
pub mod pos;
pub mod scheduler;

pub use crate::accessor::{Accessor, CachedAccessor, ChunkNotLoaded, GridAccessor};
pub use crate::chunk::{BlockId, ChunkGrid, FluidCell, Section, MAX_FLUID_LEVEL, SECTION_DIM};
pub use crate::fluid::{
    BlockTickStrategy, CollisionRule, FluidBehavior, FluidConfig, FluidEvent, FluidId, FluidSim,
};
pub use crate::pos::{BlockPos, SectionPos};
pub use crate::scheduler::TickScheduler;
