#![doc = include_str!("../README.md")]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// How long a path's size must hold still before its event is emitted.
pub const STABILIZE_WINDOW: Duration = Duration::from_millis(200);

/// Grace period for the scheduler thread to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A stabilized filesystem event, emitted on the watcher's scheduler
/// thread. Consumers must not block that thread and must not mutate
/// shared state directly; enqueue a task for the owning world's tick
/// instead.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WatchEvent {
    Create(PathBuf),
    Modify(PathBuf),
    Delete(PathBuf),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch path")]
    Watch(#[from] notify::Error),

    #[error("failed to spawn the scheduler thread")]
    Spawn(#[from] std::io::Error),

    #[error("watcher is shut down")]
    ShutDown,
}

/// One path's pending stabilization timer.
struct Pending {
    deadline: Instant,
    /// File size captured when the timer (re)started; a mismatch at the
    /// deadline means the write is still in progress.
    size: Option<u64>,
    /// Whether this cycle began with a create, so the eventual emission
    /// keeps the right flavor across debounce resets.
    created: bool,
}

#[derive(Default)]
struct SchedulerState {
    pending: FxHashMap<PathBuf, Pending>,
    /// Deletes skip stabilization; the file is already gone.
    deletes: Vec<PathBuf>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
}

/// Watches directories recursively and debounces the OS event stream.
///
/// Two threads do the work: the OS-blocking reader owned by [`notify`],
/// and one scheduler thread owned here that fires stabilization timers
/// and performs all event emission. Dropping without
/// [`shutdown`](Self::shutdown) leaks the OS handles until process exit.
pub struct PathWatcher {
    watcher: Option<RecommendedWatcher>,
    shared: Arc<Shared>,
    scheduler: Option<JoinHandle<()>>,
    /// Paths registered, kept for diagnostics and idempotent re-adds.
    registered: Mutex<Vec<PathBuf>>,
}

impl PathWatcher {
    /// Starts the watcher threads. `consumer` runs on the scheduler
    /// thread for every stabilized event.
    pub fn new(consumer: impl Fn(WatchEvent) + Send + 'static) -> Result<Self, WatchError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::default()),
            wake: Condvar::new(),
        });

        let watcher = {
            let shared = Arc::clone(&shared);
            notify::recommended_watcher(move |result: Result<notify::Event, notify::Error>| {
                match result {
                    Ok(event) => handle_os_event(&shared, &event),
                    Err(e) => warn!("watch backend error: {e}"),
                }
            })?
        };

        let scheduler = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("hearth-watch-scheduler".into())
                .spawn(move || run_scheduler(&shared, consumer))?
        };

        Ok(Self {
            watcher: Some(watcher),
            shared,
            scheduler: Some(scheduler),
            registered: Mutex::new(Vec::new()),
        })
    }

    /// Recursively watches `path`. The platform's native tree-watch is
    /// used where one exists; elsewhere the backend registers each
    /// subdirectory and picks up new ones as they appear.
    pub fn add_path(&mut self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        let path = path.as_ref();
        let mut registered = self.registered.lock();
        if registered.iter().any(|p| p == path) {
            return Ok(());
        }

        let watcher = self.watcher.as_mut().ok_or(WatchError::ShutDown)?;
        watcher.watch(path, RecursiveMode::Recursive)?;
        registered.push(path.to_owned());
        debug!("watching {}", path.display());

        Ok(())
    }

    /// Cancels all timers, releases the OS watch handles, and joins the
    /// scheduler thread within a bounded grace period.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.pending.clear();
            state.deletes.clear();
        }
        self.wake_scheduler();

        // Dropping the backend releases its OS handles and reader thread.
        self.watcher = None;

        if let Some(handle) = self.scheduler.take() {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("watch scheduler did not stop within the shutdown grace period");
            }
        }
    }

    fn wake_scheduler(&self) {
        self.shared.wake.notify_all();
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        if self.scheduler.is_some() {
            self.shutdown();
        }
    }
}

/// Runs on notify's reader thread: classify and enqueue, never emit.
fn handle_os_event(shared: &Shared, event: &notify::Event) {
    use notify::EventKind;

    let is_remove = matches!(event.kind, EventKind::Remove(_));
    let is_create = matches!(event.kind, EventKind::Create(_));
    if matches!(event.kind, EventKind::Access(_)) {
        return;
    }

    let mut state = shared.state.lock();
    if state.shutdown {
        return;
    }

    for path in &event.paths {
        if is_remove && !path.exists() {
            // Nothing to stabilize; the timer for this path, if any, is
            // cancelled by the removal.
            state.pending.remove(path);
            state.deletes.push(path.clone());
            continue;
        }

        let size = fs::metadata(path).ok().map(|m| m.len());
        let created = is_create
            || state
                .pending
                .get(path)
                .is_some_and(|pending| pending.created);

        // Restarting the timer is the debounce: bursty writes keep
        // pushing the deadline out.
        state.pending.insert(
            path.clone(),
            Pending {
                deadline: Instant::now() + STABILIZE_WINDOW,
                size,
                created,
            },
        );
    }

    drop(state);
    shared.wake.notify_all();
}

fn run_scheduler(shared: &Shared, consumer: impl Fn(WatchEvent)) {
    let mut due = Vec::new();

    loop {
        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }

        let now = Instant::now();

        let deletes = std::mem::take(&mut state.deletes);

        due.clear();
        state.pending.retain(|path, pending| {
            if pending.deadline <= now {
                due.push((path.clone(), pending.size, pending.created));
                false
            } else {
                true
            }
        });

        let next_deadline = state.pending.values().map(|p| p.deadline).min();

        // Emission happens outside the lock so a slow consumer cannot
        // stall the OS reader thread.
        drop(state);

        for path in deletes {
            consumer(WatchEvent::Delete(path));
        }

        for (path, size_then, created) in due.drain(..) {
            let size_now = fs::metadata(&path).ok().map(|m| m.len());

            if size_now != size_then {
                // Still being written; the next OS event starts a fresh
                // stabilization cycle.
                debug!("abandoning unstable write to {}", path.display());
                continue;
            }

            if size_now.is_none() {
                // Disappeared between deadline and check; the remove
                // event will handle it.
                continue;
            }

            consumer(if created {
                WatchEvent::Create(path)
            } else {
                WatchEvent::Modify(path)
            });
        }

        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        if state.deletes.is_empty() && state.pending.is_empty() {
            shared.wake.wait(&mut state);
        } else if let Some(deadline) = next_deadline {
            let now = Instant::now();
            if deadline > now {
                shared.wake.wait_for(&mut state, deadline - now);
            }
        }
    }
}
