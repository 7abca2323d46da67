//! Deferred command execution.
//!
//! Commands arrive on network worker threads but must run on the tick
//! thread of the world that owns their target. The pump resolves the
//! target world on the calling thread, enqueues the execution, and hands
//! back a future that completes when the command *executes*, not when
//! it is enqueued. Cross-world referral is the same two steps again: a
//! resolve on the current thread, then a re-enqueue onto the other
//! world's queue; no closure over shared mutable state ever crosses.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::world::{WorldHandle, WorldState};

/// Operation-level command failures. These travel back to the sender as
/// replies; the connection stays open.
#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum CommandError {
    /// The target entity was despawned between enqueue and execution.
    #[error("entity is gone")]
    EntityGone,

    /// The named world is not loaded.
    #[error("world '{0}' is not loaded")]
    WorldMismatch(String),

    /// Surfaced to the sender only.
    #[error("permission denied")]
    PermissionDenied,

    #[error("server is shutting down")]
    Shutdown,

    #[error("{0}")]
    Failed(String),
}

/// The executable form of a command, produced by the host's parser. Runs
/// on the owning world's tick thread; the `Ok` string is the reply text.
pub type CommandExec = Box<dyn FnOnce(&mut WorldState) -> Result<String, CommandError> + Send>;

/// Completion handle for a submitted command.
pub struct AckFuture {
    rx: flume::Receiver<Result<String, CommandError>>,
}

impl AckFuture {
    /// Blocks until the command executed. Worlds going down complete
    /// pending futures with [`CommandError::Shutdown`].
    pub fn wait(self) -> Result<String, CommandError> {
        self.rx.recv().map_err(|_| CommandError::Shutdown)?
    }

    pub async fn wait_async(self) -> Result<String, CommandError> {
        self.rx
            .recv_async()
            .await
            .map_err(|_| CommandError::Shutdown)?
    }

    fn completed(result: Result<String, CommandError>) -> Self {
        let (tx, rx) = flume::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }
}

#[derive(Default)]
pub struct CommandPump {
    worlds: RwLock<FxHashMap<String, WorldHandle>>,
    shutdown: AtomicBool,
}

impl CommandPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_world(&self, handle: WorldHandle) {
        self.worlds
            .write()
            .insert(handle.name().to_string(), handle);
    }

    pub fn world(&self, name: &str) -> Option<WorldHandle> {
        self.worlds.read().get(name).cloned()
    }

    /// Resolves the target world and enqueues `exec` onto its tick
    /// thread.
    pub fn submit(&self, world: &str, exec: CommandExec) -> AckFuture {
        if self.shutdown.load(Ordering::Acquire) {
            return AckFuture::completed(Err(CommandError::Shutdown));
        }

        let Some(handle) = self.world(world) else {
            return AckFuture::completed(Err(CommandError::WorldMismatch(world.to_owned())));
        };

        let (tx, rx) = flume::bounded(1);
        if handle.execute(exec, tx).is_err() {
            return AckFuture::completed(Err(CommandError::Shutdown));
        }

        AckFuture { rx }
    }

    /// Cross-world referral: the first hop resolved `target_world` (for
    /// example from the impersonated player in a sudo-style command);
    /// the second hop is an ordinary submit onto that world's queue.
    pub fn refer(&self, target_world: &str, exec: CommandExec) -> AckFuture {
        self.submit(target_world, exec)
    }

    /// After shutdown every submission completes with
    /// [`CommandError::Shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}
