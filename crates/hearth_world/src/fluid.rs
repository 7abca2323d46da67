//! The fluid cellular automaton.
//!
//! A fluid is a data-driven strategy record; the ticker itself holds
//! nothing but immutable configuration. All mutable state lives in the
//! grid, and every write wakes the 26 surrounding cells through the
//! scheduler.

use rustc_hash::FxHashMap;

use crate::accessor::Accessor;
use crate::chunk::{BlockId, FluidCell, MAX_FLUID_LEVEL};
use crate::pos::{BlockPos, SectionPos};
use crate::scheduler::TickScheduler;

/// Integer id a fluid asset was interned to at load time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FluidId(pub u16);

/// What happens when this fluid flows into a cell holding another fluid.
#[derive(Clone, Copy, Debug)]
pub struct CollisionRule {
    /// Block placed where the two fluids met, usually something solid.
    pub block_to_place: BlockId,
    /// Fluid left in the cell after the collision; `None` clears it.
    pub place_fluid: Option<FluidId>,
    /// Interned index of the sound event to play at the site.
    pub sound: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FluidBehavior {
    /// Infinite-source: spreading does not deplete the donor cell.
    Default,
    /// Conserving: every level granted is taken from the donor.
    Finite,
}

#[derive(Clone, Debug)]
pub struct FluidConfig {
    pub id: FluidId,
    /// Ticks between updates of any one cell of this fluid.
    pub flow_rate: u32,
    /// Whether an unfed cell loses level instead of persisting.
    pub can_demote: bool,
    /// Collision rules keyed by the other fluid's id.
    pub collisions: FxHashMap<u16, CollisionRule>,
    /// A block this fluid rests on without demoting.
    pub supported_by: Option<BlockId>,
    pub behavior: FluidBehavior,
}

/// What the scheduler should do with the cell after a tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockTickStrategy {
    /// Re-tick after this many ticks.
    Sleep(u32),
    /// Re-tick next tick; used while a column is actively falling.
    Retick,
    /// A required neighbor's chunk is missing; park the cell until that
    /// section loads. Nothing was written.
    WaitForChunks { missing: SectionPos },
    /// The cell reached equilibrium; drop it until a neighbor wakes it.
    Dead,
}

/// Side effects a tick produced beyond grid writes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FluidEvent {
    Collision { pos: BlockPos, sound: u32 },
}

/// Cardinal offsets in tie-break order: smallest `(dx, dz)` first.
const CARDINALS: [(i32, i32); 4] = [(-1, 0), (0, -1), (0, 1), (1, 0)];

pub struct FluidSim {
    configs: FxHashMap<u16, FluidConfig>,
}

impl FluidSim {
    pub fn new(configs: impl IntoIterator<Item = FluidConfig>) -> Self {
        Self {
            configs: configs.into_iter().map(|c| (c.id.0, c)).collect(),
        }
    }

    pub fn config(&self, id: FluidId) -> Option<&FluidConfig> {
        self.configs.get(&id.0)
    }

    /// Runs the update rule for one scheduled cell.
    ///
    /// Reads the cell, its six face neighbors, and the eight diagonal
    /// cells below before writing anything; if any of those lie in an
    /// unloaded section the tick backs off with `WaitForChunks` and no
    /// partial update.
    pub fn tick_cell(
        &self,
        acc: &mut dyn Accessor,
        scheduler: &mut TickScheduler,
        events: &mut Vec<FluidEvent>,
        pos: BlockPos,
        tick: u64,
    ) -> BlockTickStrategy {
        let cell = match acc.fluid(pos) {
            Ok(cell) => cell,
            Err(_) => {
                return BlockTickStrategy::WaitForChunks {
                    missing: SectionPos::containing(pos),
                }
            }
        };

        if cell.is_empty() {
            return BlockTickStrategy::Dead;
        }

        let Some(config) = self.config(cell.fluid()) else {
            return BlockTickStrategy::Dead;
        };
        let rate = config.flow_rate.max(1);

        // Cells stagger their updates by coordinate hash so one woken
        // region does not tick in lockstep.
        let phase = (pos.x ^ pos.y ^ pos.z).rem_euclid(rate as i32) as u64;
        let current = tick % u64::from(rate);
        if current != phase {
            let wait = (phase + u64::from(rate) - current) % u64::from(rate);
            return BlockTickStrategy::Sleep(wait as u32);
        }

        // Gather the whole required neighborhood up front.
        if let Some(missing) = self.first_unloaded_neighbor(acc, pos) {
            return BlockTickStrategy::WaitForChunks { missing };
        }

        // Unloaded cases are handled above; reads cannot fail from here on.
        if !self.is_alive(acc, pos, cell, config) && config.can_demote {
            let demoted = if cell.level() > 1 {
                cell.with_level(cell.level() - 1)
            } else {
                FluidCell::EMPTY
            };
            let _ = acc.set_fluid(pos, demoted);
            scheduler.wake_surrounding(tick, pos);

            return if demoted.is_empty() {
                BlockTickStrategy::Dead
            } else {
                BlockTickStrategy::Sleep(rate)
            };
        }

        // Gravity first.
        if let Some(strategy) = self.try_flow_down(acc, scheduler, events, pos, cell, config, tick)
        {
            return strategy;
        }

        // Then sideways.
        if self.try_spread(acc, scheduler, events, pos, cell, config, tick) {
            return BlockTickStrategy::Sleep(rate);
        }

        BlockTickStrategy::Dead
    }

    fn first_unloaded_neighbor(
        &self,
        acc: &mut dyn Accessor,
        pos: BlockPos,
    ) -> Option<SectionPos> {
        // Six faces plus the eight diagonals of the cell below.
        const REQUIRED: [(i32, i32, i32); 14] = [
            (1, 0, 0),
            (-1, 0, 0),
            (0, 0, 1),
            (0, 0, -1),
            (0, 1, 0),
            (0, -1, 0),
            (-1, -1, -1),
            (-1, -1, 0),
            (-1, -1, 1),
            (0, -1, -1),
            (0, -1, 1),
            (1, -1, -1),
            (1, -1, 0),
            (1, -1, 1),
        ];

        REQUIRED
            .iter()
            .map(|&(dx, dy, dz)| pos.offset(dx, dy, dz))
            .find(|&p| !acc.is_loaded(p))
            .map(SectionPos::containing)
    }

    /// A cell is alive while something feeds it: it is a full-level
    /// source, the cell above carries the same fluid, a higher cardinal
    /// neighbor does, or it rests on its supporting block.
    fn is_alive(
        &self,
        acc: &mut dyn Accessor,
        pos: BlockPos,
        cell: FluidCell,
        config: &FluidConfig,
    ) -> bool {
        if cell.level() == MAX_FLUID_LEVEL {
            return true;
        }

        if let Ok(above) = acc.fluid(pos.up()) {
            if !above.is_empty() && above.fluid() == cell.fluid() {
                return true;
            }
        }

        for (dx, dz) in CARDINALS {
            if let Ok(side) = acc.fluid(pos.offset(dx, 0, dz)) {
                if side.fluid() == cell.fluid() && side.level() > cell.level() {
                    return true;
                }
            }
        }

        if let Some(support) = config.supported_by {
            if acc.block(pos.down()) == Ok(support) {
                return true;
            }
        }

        false
    }

    fn try_flow_down(
        &self,
        acc: &mut dyn Accessor,
        scheduler: &mut TickScheduler,
        events: &mut Vec<FluidEvent>,
        pos: BlockPos,
        cell: FluidCell,
        config: &FluidConfig,
        tick: u64,
    ) -> Option<BlockTickStrategy> {
        let below = pos.down();
        let below_block = acc.block(below).ok()?;
        if !below_block.is_air() {
            return None;
        }

        let below_fluid = acc.fluid(below).ok()?;

        if !below_fluid.is_empty() && below_fluid.fluid() != cell.fluid() {
            // Falling onto a foreign fluid.
            return self
                .collide(acc, scheduler, events, below, below_fluid, config, tick)
                .then_some(BlockTickStrategy::Sleep(config.flow_rate.max(1)));
        }

        let room = MAX_FLUID_LEVEL - below_fluid.level();
        if room == 0 {
            return None;
        }

        let transfer = cell.level().min(room);
        let _ = acc.set_fluid(
            below,
            FluidCell::new(cell.fluid(), below_fluid.level() + transfer),
        );

        if config.behavior == FluidBehavior::Finite {
            let remaining = cell.level() - transfer;
            let _ = acc.set_fluid(pos, cell.with_level(remaining));
        }

        scheduler.wake_surrounding(tick, pos);
        scheduler.wake_surrounding(tick, below);

        Some(BlockTickStrategy::Retick)
    }

    fn try_spread(
        &self,
        acc: &mut dyn Accessor,
        scheduler: &mut TickScheduler,
        events: &mut Vec<FluidEvent>,
        pos: BlockPos,
        cell: FluidCell,
        config: &FluidConfig,
        tick: u64,
    ) -> bool {
        let mut spread_to = Vec::new();
        let mut collided = false;

        for (dx, dz) in CARDINALS {
            let target = pos.offset(dx, 0, dz);
            let Ok(block) = acc.block(target) else { continue };
            if !block.is_air() {
                continue;
            }
            let Ok(fluid) = acc.fluid(target) else { continue };

            if !fluid.is_empty() && fluid.fluid() != cell.fluid() {
                collided |= self.collide(acc, scheduler, events, target, fluid, config, tick);
                continue;
            }

            // A grant leaves the receiver at least one level below the
            // donor, so streams thin out and terminate.
            if fluid.level() + 1 < cell.level() {
                spread_to.push((target, fluid));
            }
        }

        if spread_to.is_empty() {
            return collided;
        }

        // Prefer targets whose own downward path leads to a drop; the
        // two-step lookahead keeps streams running toward edges instead
        // of pooling. Ties fall back to (dx, dz) order, which CARDINALS
        // already encodes.
        let with_drop: Vec<_> = spread_to
            .iter()
            .copied()
            .filter(|&(target, _)| self.leads_to_drop(acc, target, cell))
            .collect();
        let chosen = if with_drop.is_empty() {
            spread_to
        } else {
            with_drop
        };

        let mut donor_level = cell.level();
        let mut wrote = false;

        for (target, fluid) in chosen {
            if config.behavior == FluidBehavior::Finite && donor_level <= 1 {
                break;
            }

            let _ = acc.set_fluid(target, FluidCell::new(cell.fluid(), fluid.level() + 1));
            scheduler.wake_surrounding(tick, target);
            wrote = true;

            if config.behavior == FluidBehavior::Finite {
                donor_level -= 1;
            }
        }

        if wrote {
            if config.behavior == FluidBehavior::Finite && donor_level != cell.level() {
                let _ = acc.set_fluid(pos, cell.with_level(donor_level));
            }
            scheduler.wake_surrounding(tick, pos);
        }

        wrote || collided
    }

    /// Two-step lookahead: does flowing into `target` let the fluid fall
    /// on the next hop?
    fn leads_to_drop(&self, acc: &mut dyn Accessor, target: BlockPos, cell: FluidCell) -> bool {
        let under = target.down();
        let Ok(block) = acc.block(under) else {
            return false;
        };
        if !block.is_air() {
            return false;
        }

        match acc.fluid(under) {
            Ok(fluid) => {
                fluid.is_empty()
                    || (fluid.fluid() == cell.fluid() && fluid.level() < MAX_FLUID_LEVEL)
            }
            Err(_) => false,
        }
    }

    /// Applies the collision rule for flowing into `other`, if one is
    /// declared. Returns whether the grid changed.
    fn collide(
        &self,
        acc: &mut dyn Accessor,
        scheduler: &mut TickScheduler,
        events: &mut Vec<FluidEvent>,
        at: BlockPos,
        other: FluidCell,
        config: &FluidConfig,
        tick: u64,
    ) -> bool {
        let Some(rule) = config.collisions.get(&other.fluid().0) else {
            return false;
        };

        let _ = acc.set_block(at, rule.block_to_place);
        let replacement = rule
            .place_fluid
            .map(|fluid| FluidCell::new(fluid, other.level()))
            .unwrap_or(FluidCell::EMPTY);
        let _ = acc.set_fluid(at, replacement);

        events.push(FluidEvent::Collision {
            pos: at,
            sound: rule.sound,
        });
        scheduler.wake_surrounding(tick, at);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::CachedAccessor;
    use crate::chunk::ChunkGrid;

    const WATER: FluidId = FluidId(1);
    const LAVA: FluidId = FluidId(2);
    const STONE: BlockId = BlockId(7);

    fn water_config() -> FluidConfig {
        FluidConfig {
            id: WATER,
            flow_rate: 5,
            can_demote: true,
            collisions: FxHashMap::default(),
            supported_by: None,
            behavior: FluidBehavior::Default,
        }
    }

    fn lava_config() -> FluidConfig {
        FluidConfig {
            id: LAVA,
            flow_rate: 10,
            can_demote: false,
            collisions: FxHashMap::default(),
            supported_by: None,
            behavior: FluidBehavior::Default,
        }
    }

    /// Drives the scheduler through `0..=ticks`, applying each strategy.
    fn run(grid: &mut ChunkGrid, sim: &FluidSim, sched: &mut TickScheduler, ticks: u64) {
        let mut events = Vec::new();
        run_collecting(grid, sim, sched, ticks, &mut events);
    }

    fn run_collecting(
        grid: &mut ChunkGrid,
        sim: &FluidSim,
        sched: &mut TickScheduler,
        ticks: u64,
        events: &mut Vec<FluidEvent>,
    ) {
        for tick in 0..=ticks {
            while let Some(pos) = sched.pop_due(tick) {
                let mut acc = CachedAccessor::new(grid);
                match sim.tick_cell(&mut acc, sched, events, pos, tick) {
                    BlockTickStrategy::Sleep(n) => sched.schedule(tick + u64::from(n.max(1)), pos),
                    BlockTickStrategy::Retick => sched.schedule(tick + 1, pos),
                    BlockTickStrategy::WaitForChunks { missing } => sched.park(missing, pos),
                    BlockTickStrategy::Dead => {}
                }
            }
        }
    }

    /// A 3×3×3 air pocket with solid floor and walls, based at `base`.
    fn build_basin(grid: &mut ChunkGrid, base: BlockPos) {
        let section = grid.load_section(SectionPos::new(0, 0, 0));
        for x in -1..=3 {
            for z in -1..=3 {
                for y in -1..=3 {
                    let interior =
                        (0..3).contains(&x) && (0..3).contains(&z) && (0..3).contains(&y);
                    if !interior {
                        section.set_block(base.offset(x, y, z), STONE);
                    }
                }
            }
        }
    }

    fn fluid_at(grid: &ChunkGrid, pos: BlockPos) -> FluidCell {
        grid.section(SectionPos::containing(pos))
            .map(|section| section.fluid(pos))
            .unwrap_or(FluidCell::EMPTY)
    }

    /// Water from a source at the top center of a basin reaches the floor
    /// at full level, then spreads to all four floor corners.
    #[test]
    fn source_fills_basin_floor() {
        let mut grid = ChunkGrid::new();
        let base = BlockPos::new(8, 8, 8);
        build_basin(&mut grid, base);

        let source = base.offset(1, 2, 1);
        grid.section_mut(SectionPos::new(0, 0, 0))
            .unwrap()
            .set_fluid(source, FluidCell::new(WATER, MAX_FLUID_LEVEL));

        let sim = FluidSim::new([water_config()]);
        let mut sched = TickScheduler::new();
        sched.schedule(0, source);

        run(&mut grid, &sim, &mut sched, 5);

        // Gravity won: full-level water one cell below the source.
        assert_eq!(
            fluid_at(&grid, base.offset(1, 1, 1)),
            FluidCell::new(WATER, MAX_FLUID_LEVEL)
        );

        run(&mut grid, &sim, &mut sched, 20);

        for corner in [
            base.offset(0, 0, 0),
            base.offset(2, 0, 0),
            base.offset(0, 0, 2),
            base.offset(2, 0, 2),
        ] {
            let cell = fluid_at(&grid, corner);
            assert_eq!(cell.fluid(), WATER, "no water at corner {corner:?}");
            assert!(cell.level() >= 1);
        }
    }

    /// Water flowing into adjacent lava turns the lava cell to stone and
    /// leaves the water cell alone.
    #[test]
    fn water_lava_collision_places_stone() {
        let mut grid = ChunkGrid::new();
        grid.load_section(SectionPos::new(0, 0, 0));

        let water_pos = BlockPos::new(9, 8, 9);
        let lava_pos = BlockPos::new(10, 8, 9);

        let section = grid.section_mut(SectionPos::new(0, 0, 0)).unwrap();
        for x in 0..16 {
            for z in 0..16 {
                section.set_block(BlockPos::new(x, 7, z), STONE);
            }
        }
        section.set_fluid(water_pos, FluidCell::new(WATER, MAX_FLUID_LEVEL));
        section.set_fluid(lava_pos, FluidCell::new(LAVA, MAX_FLUID_LEVEL));

        let mut water = water_config();
        water.collisions.insert(
            LAVA.0,
            CollisionRule {
                block_to_place: STONE,
                place_fluid: None,
                sound: 3,
            },
        );
        let sim = FluidSim::new([water, lava_config()]);

        let mut sched = TickScheduler::new();
        sched.schedule(0, water_pos);

        let mut events = Vec::new();
        run_collecting(&mut grid, &sim, &mut sched, 8, &mut events);

        let section = grid.section(SectionPos::new(0, 0, 0)).unwrap();
        assert_eq!(section.block(lava_pos), STONE);
        assert!(section.fluid(lava_pos).is_empty());
        assert_eq!(
            section.fluid(water_pos),
            FluidCell::new(WATER, MAX_FLUID_LEVEL)
        );
        assert!(events.contains(&FluidEvent::Collision {
            pos: lava_pos,
            sound: 3,
        }));
    }

    /// A border cell whose neighborhood crosses into an unloaded section
    /// backs off without touching the grid.
    #[test]
    fn unloaded_neighbor_means_wait_for_chunks() {
        let mut grid = ChunkGrid::new();
        grid.load_section(SectionPos::new(0, 0, 0));

        let pos = BlockPos::new(0, 5, 5);
        grid.section_mut(SectionPos::new(0, 0, 0))
            .unwrap()
            .set_fluid(pos, FluidCell::new(WATER, MAX_FLUID_LEVEL));

        let sim = FluidSim::new([water_config()]);
        let mut sched = TickScheduler::new();
        let mut events = Vec::new();

        let mut acc = CachedAccessor::new(&mut grid);
        let strategy = sim.tick_cell(&mut acc, &mut sched, &mut events, pos, 0);
        drop(acc);

        assert_eq!(
            strategy,
            BlockTickStrategy::WaitForChunks {
                missing: SectionPos::new(-1, 0, 0)
            }
        );
        assert_eq!(fluid_at(&grid, pos), FluidCell::new(WATER, MAX_FLUID_LEVEL));
        assert_eq!(fluid_at(&grid, pos.down()), FluidCell::EMPTY);
    }

    /// An unfed, demotable cell decays level by level and dies.
    #[test]
    fn unfed_water_demotes_to_empty() {
        let mut grid = ChunkGrid::new();
        let base = BlockPos::new(8, 8, 8);
        build_basin(&mut grid, base);

        let pos = base.offset(1, 0, 1);
        grid.section_mut(SectionPos::new(0, 0, 0))
            .unwrap()
            .set_fluid(pos, FluidCell::new(WATER, 3));

        let sim = FluidSim::new([water_config()]);
        let mut sched = TickScheduler::new();
        sched.schedule(0, pos);

        run(&mut grid, &sim, &mut sched, 40);
        assert!(fluid_at(&grid, pos).is_empty());
    }

    /// Finite fluids pay for every level they give away.
    #[test]
    fn finite_fluid_depletes_when_spreading() {
        let mut grid = ChunkGrid::new();
        let base = BlockPos::new(8, 8, 8);
        build_basin(&mut grid, base);

        let mut slime = water_config();
        slime.behavior = FluidBehavior::Finite;
        slime.can_demote = false;

        let pos = base.offset(1, 0, 1);
        grid.section_mut(SectionPos::new(0, 0, 0))
            .unwrap()
            .set_fluid(pos, FluidCell::new(WATER, 3));

        let sim = FluidSim::new([slime]);
        let mut sched = TickScheduler::new();
        sched.schedule(0, pos);

        run(&mut grid, &sim, &mut sched, 10);

        let total: u32 = (0..3)
            .flat_map(|x| (0..3).map(move |z| (x, z)))
            .map(|(x, z)| u32::from(fluid_at(&grid, base.offset(x, 0, z)).level()))
            .sum();
        assert_eq!(total, 3, "finite fluid conserved its total level");
    }
}

