//! One world, one tick thread.
//!
//! Everything that mutates a world's entity store, chunk grid, or fluid
//! state runs on that world's dedicated thread. Other threads talk to it
//! only through [`WorldHandle`]: queued tasks, command buffers, attached
//! connections. Within a tick the order is fixed: drain the inbox and
//! inbound packets, apply the command buffer, run systems in declared
//! order, replicate, then sleep out the tick budget.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hearth_ecs::{CommandBuffer, EntityStore};
use hearth_net::{Connection, ReceivedFrame};
use hearth_protocol::packets::{PingPacket, PongPacket};
use hearth_protocol::Packet;
use hearth_world::{BlockTickStrategy, CachedAccessor, ChunkGrid, FluidEvent, FluidSim, TickScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::{CommandError, CommandExec};
use crate::replicate::Replicator;

/// A system runs once per tick against the world state, in the order
/// systems were declared.
pub trait System: Send {
    fn name(&self) -> &'static str;

    fn run(&mut self, state: &mut WorldState);
}

/// Mutable state owned by the tick thread.
pub struct WorldState {
    pub name: Arc<str>,
    pub tick: u64,
    pub store: EntityStore,
    pub grid: ChunkGrid,
    pub scheduler: TickScheduler,
    pub fluids: FluidSim,
    /// Side effects collected from this tick's fluid updates.
    pub fluid_events: Vec<FluidEvent>,
    pub replicator: Replicator,
    /// Mutations queued during this tick, applied at the next tick start.
    pub commands: CommandBuffer,
    /// Host hook for inbound packets the core does not consume itself.
    pub on_packet: Option<PacketHandler>,
}

pub type PacketHandler =
    Box<dyn FnMut(&mut InboundCx<'_>, &Arc<Connection>, &ReceivedFrame) + Send>;

/// What a packet handler may touch while the connection list is
/// borrowed.
pub struct InboundCx<'a> {
    pub name: &'a Arc<str>,
    pub tick: u64,
    pub store: &'a EntityStore,
    pub commands: &'a mut CommandBuffer,
}

/// Runs scheduled fluid cell updates. Declared by default as the first
/// system of every world.
pub struct FluidSystem;

impl System for FluidSystem {
    fn name(&self) -> &'static str {
        "fluids"
    }

    fn run(&mut self, state: &mut WorldState) {
        let tick = state.tick;

        while let Some(pos) = state.scheduler.pop_due(tick) {
            let mut acc = CachedAccessor::new(&mut state.grid);
            let strategy = state.fluids.tick_cell(
                &mut acc,
                &mut state.scheduler,
                &mut state.fluid_events,
                pos,
                tick,
            );

            match strategy {
                BlockTickStrategy::Sleep(n) => {
                    state.scheduler.schedule(tick + u64::from(n.max(1)), pos);
                }
                BlockTickStrategy::Retick => state.scheduler.schedule(tick + 1, pos),
                BlockTickStrategy::WaitForChunks { missing } => {
                    state.scheduler.park(missing, pos);
                }
                BlockTickStrategy::Dead => {}
            }
        }
    }
}

pub(crate) enum WorldMsg {
    Task(Box<dyn FnOnce(&mut WorldState) + Send>),
    Commands(CommandBuffer),
    Attach(Connection),
    Execute {
        exec: CommandExec,
        ack: flume::Sender<Result<String, CommandError>>,
    },
    Shutdown,
}

/// Cheap cloneable address of a world's tick thread.
#[derive(Clone)]
pub struct WorldHandle {
    name: Arc<str>,
    tx: flume::Sender<WorldMsg>,
}

impl WorldHandle {
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Queues a task for the next tick. Completion is invisible; use the
    /// command pump for acknowledged execution.
    pub fn schedule(
        &self,
        task: impl FnOnce(&mut WorldState) + Send + 'static,
    ) -> Result<(), CommandError> {
        self.tx
            .send(WorldMsg::Task(Box::new(task)))
            .map_err(|_| CommandError::Shutdown)
    }

    /// Queues a command buffer for application at the next tick start.
    pub fn submit(&self, buffer: CommandBuffer) -> Result<(), CommandError> {
        self.tx
            .send(WorldMsg::Commands(buffer))
            .map_err(|_| CommandError::Shutdown)
    }

    /// Hands a freshly accepted connection to this world.
    pub fn attach(&self, conn: Connection) -> Result<(), CommandError> {
        self.tx
            .send(WorldMsg::Attach(conn))
            .map_err(|_| CommandError::Shutdown)
    }

    pub(crate) fn execute(
        &self,
        exec: CommandExec,
        ack: flume::Sender<Result<String, CommandError>>,
    ) -> Result<(), CommandError> {
        self.tx
            .send(WorldMsg::Execute { exec, ack })
            .map_err(|_| CommandError::Shutdown)
    }

    /// Asks the tick thread to drain and exit.
    pub fn stop(&self) {
        let _ = self.tx.send(WorldMsg::Shutdown);
    }
}

/// Everything needed to start a world.
pub struct WorldSeed {
    pub name: String,
    pub tick_rate: u32,
    pub store: EntityStore,
    pub grid: ChunkGrid,
    pub fluids: FluidSim,
    pub systems: Vec<Box<dyn System>>,
    pub replicator: Replicator,
    pub on_packet: Option<PacketHandler>,
}

/// Spawns the tick thread. The handle outlives the thread; sends after
/// shutdown fail with [`CommandError::Shutdown`].
pub fn spawn_world(
    seed: WorldSeed,
) -> std::io::Result<(WorldHandle, std::thread::JoinHandle<()>)> {
    let name: Arc<str> = seed.name.clone().into();
    let (tx, rx) = flume::unbounded();

    let handle = WorldHandle {
        name: Arc::clone(&name),
        tx,
    };

    let thread = std::thread::Builder::new()
        .name(format!("world-{name}"))
        .spawn(move || run_world(name, seed, rx))?;

    Ok((handle, thread))
}

fn run_world(name: Arc<str>, seed: WorldSeed, rx: flume::Receiver<WorldMsg>) {
    let mut systems = seed.systems;
    let mut state = WorldState {
        name: Arc::clone(&name),
        tick: 0,
        store: seed.store,
        grid: seed.grid,
        scheduler: TickScheduler::new(),
        fluids: seed.fluids,
        fluid_events: Vec::new(),
        replicator: seed.replicator,
        commands: CommandBuffer::new(),
        on_packet: seed.on_packet,
    };

    let tick_duration = Duration::from_secs(1) / seed.tick_rate.max(1);
    let mut next_tick = Instant::now();

    info!(world = %name, tick_rate = seed.tick_rate, "world started");

    loop {
        // Inbox first: tasks, buffers, attachments, and acknowledged
        // command executions, in arrival order.
        for msg in rx.try_iter() {
            match msg {
                WorldMsg::Task(task) => task(&mut state),
                WorldMsg::Commands(buffer) => {
                    let report = buffer.apply(&mut state.store);
                    if report.stale > 0 {
                        debug!(world = %name, stale = report.stale, "skipped stale commands");
                    }
                }
                WorldMsg::Attach(conn) => {
                    info!(world = %name, peer = %conn.peer_addr(), "connection attached");
                    state.replicator.add_viewer(Arc::new(conn));
                }
                WorldMsg::Execute { exec, ack } => {
                    let result = exec(&mut state);
                    // Completion is signaled at execution, not enqueue.
                    let _ = ack.send(result);
                }
                WorldMsg::Shutdown => {
                    info!(world = %name, "world stopping");
                    return;
                }
            }
        }

        pump_connections(&mut state);

        // Apply what this tick's dispatch queued, in insertion order.
        let buffer = std::mem::take(&mut state.commands);
        buffer.apply(&mut state.store);

        for system in &mut systems {
            system.run(&mut state);
        }
        state.fluid_events.clear();

        // Replication is a split borrow: the replicator consumes dirty
        // flags through shared references into the store.
        let WorldState {
            ref mut replicator,
            ref store,
            tick,
            ..
        } = state;
        replicator.run(store, tick);

        state.tick += 1;

        next_tick += tick_duration;
        let now = Instant::now();
        if next_tick > now {
            // Waking for inbox traffic is unnecessary: everything queued
            // is applied at the next tick boundary anyway.
            std::thread::park_timeout(next_tick - now);
        } else if now.duration_since(next_tick) > tick_duration * 10 {
            warn!(world = %name, "tick thread is running behind");
            next_tick = now;
        }
    }
}

/// Drains inbound frames from every attached connection. Per-connection
/// arrival order is preserved; the core answers keepalives itself and
/// defers everything else to the host handler.
fn pump_connections(state: &mut WorldState) {
    let connections = state.replicator.connections();
    let mut gone: Vec<Uuid> = Vec::new();

    for conn in &connections {
        loop {
            match conn.try_recv() {
                Ok(Some(received)) => handle_frame(state, conn, &received),
                Ok(None) => break,
                Err(_) => {
                    gone.push(conn.id());
                    break;
                }
            }
        }
    }

    for id in gone {
        if let Some(conn) = state.replicator.remove_viewer(id) {
            info!(world = %state.name, peer = %conn.peer_addr(), "connection detached");
        }
    }
}

fn handle_frame(state: &mut WorldState, conn: &Arc<Connection>, received: &ReceivedFrame) {
    if received.frame.id == PingPacket::ID {
        match received.frame.decode::<PingPacket>() {
            Ok(ping) => {
                if let Err(e) = conn.send(&PongPacket { nonce: ping.nonce }) {
                    debug!("failed to answer ping: {e}");
                }
            }
            Err(e) => warn!(client = %conn.peer_addr(), "bad ping: {e}"),
        }
        return;
    }

    let mut handler = state.on_packet.take();
    if let Some(callback) = handler.as_mut() {
        let mut cx = InboundCx {
            name: &state.name,
            tick: state.tick,
            store: &state.store,
            commands: &mut state.commands,
        };
        callback(&mut cx, conn, received);
    } else {
        debug!(
            packet = received.frame.name,
            "inbound packet with no handler"
        );
    }
    state.on_packet = handler;
}
