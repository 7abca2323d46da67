//! Deferred store mutation.
//!
//! Contexts other than the owning tick thread (network decode, command
//! execution) never touch the store directly. They record operations into
//! a `CommandBuffer`, which the world applies at a fixed point in the
//! tick, after inbound dispatch and before systems run, so no iterator
//! is ever invalidated. Commit order is insertion order.

use tracing::debug;

use crate::component::Component;
use crate::entity::EntityId;
use crate::store::EntityStore;

enum Command {
    Spawn(Vec<Box<dyn InsertOp>>),
    Despawn(EntityId),
    Insert(EntityId, Box<dyn InsertOp>),
    Remove(EntityId, fn(&mut EntityStore, EntityId)),
}

/// A component value waiting to be attached. The value moves with the
/// buffer across threads; no shared mutable state is captured.
trait InsertOp: Send {
    fn insert(self: Box<Self>, store: &mut EntityStore, id: EntityId);
    fn name(&self) -> &'static str;
}

struct TypedInsert<T: Component>(T);

impl<T: Component> InsertOp for TypedInsert<T> {
    fn insert(self: Box<Self>, store: &mut EntityStore, id: EntityId) {
        if let Err(e) = store.insert(id, self.0) {
            debug!("dropping '{}' insert for {id:?}: {e}", T::NAME);
        }
    }

    fn name(&self) -> &'static str {
        T::NAME
    }
}

/// What a buffer application did. `stale` counts operations that targeted
/// entities despawned between enqueue and commit; those are skipped, never
/// a crash.
#[derive(Default, Debug)]
pub struct CommandReport {
    pub spawned: Vec<EntityId>,
    pub stale: usize,
}

#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queues a spawn. Component values for the new entity are attached
    /// with [`with`](SpawnBuilder::with) before the builder drops.
    pub fn spawn(&mut self) -> SpawnBuilder<'_> {
        self.commands.push(Command::Spawn(Vec::new()));
        SpawnBuilder { buffer: self }
    }

    pub fn despawn(&mut self, id: EntityId) {
        self.commands.push(Command::Despawn(id));
    }

    pub fn insert<T: Component>(&mut self, id: EntityId, value: T) {
        self.commands
            .push(Command::Insert(id, Box::new(TypedInsert(value))));
    }

    pub fn remove<T: Component>(&mut self, id: EntityId) {
        self.commands.push(Command::Remove(id, |store, id| {
            store.remove::<T>(id);
        }));
    }

    /// Applies all queued operations in insertion order.
    pub fn apply(self, store: &mut EntityStore) -> CommandReport {
        let mut report = CommandReport::default();

        for command in self.commands {
            match command {
                Command::Spawn(ops) => {
                    let id = store.spawn();
                    for op in ops {
                        op.insert(store, id);
                    }
                    report.spawned.push(id);
                }
                Command::Despawn(id) => {
                    if store.despawn(id).is_err() {
                        report.stale += 1;
                    }
                }
                Command::Insert(id, op) => {
                    if store.contains(id) {
                        op.insert(store, id);
                    } else {
                        debug!("dropping stale '{}' insert for {id:?}", op.name());
                        report.stale += 1;
                    }
                }
                Command::Remove(id, remove) => {
                    if store.contains(id) {
                        remove(store, id);
                    } else {
                        report.stale += 1;
                    }
                }
            }
        }

        report
    }
}

pub struct SpawnBuilder<'a> {
    buffer: &'a mut CommandBuffer,
}

impl SpawnBuilder<'_> {
    pub fn with<T: Component>(self, value: T) -> Self {
        let Some(Command::Spawn(ops)) = self.buffer.commands.last_mut() else {
            unreachable!("spawn builder outlived its command");
        };
        ops.push(Box::new(TypedInsert(value)));
        self
    }
}
