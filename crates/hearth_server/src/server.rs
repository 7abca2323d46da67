//! Server lifecycle: bind, run, shutdown.

use std::sync::Arc;
use std::time::Duration;

use hearth_asset::{AssetRegistry, AssetRegistryBuilder, DirectorySource};
use hearth_ecs::ComponentRegistry;
use hearth_net::{AuthManager, Connection, Listener};
use hearth_protocol::registry::PacketRegistryBuilder;
use hearth_protocol::{packets, PacketRegistry};
use hearth_watch::{PathWatcher, WatchEvent};
use hearth_world::{ChunkGrid, FluidSim};
use tracing::{info, warn};

use crate::command::CommandPump;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::replicate::Replicator;
use crate::world::{spawn_world, FluidSystem, System, WorldHandle, WorldSeed};

/// Pieces the host contributes to a server: its component registry, its
/// asset kinds, extra systems per world, and the authentication seam.
pub struct HostSeed {
    pub components: Arc<ComponentRegistry>,
    pub assets: AssetRegistryBuilder,
    pub auth: Arc<dyn AuthManager>,
    /// Extra systems appended after the core fluid system, per world, in
    /// declared order.
    pub systems: Box<dyn FnMut(&str) -> Vec<Box<dyn System>> + Send>,
    /// Fluid configuration per world, typically derived from assets.
    pub fluids: Box<dyn FnMut(&str, &AssetRegistry) -> FluidSim + Send>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

/// A bound, running server.
pub struct Server {
    runtime: Option<tokio::runtime::Runtime>,
    listener: Option<Listener>,
    worlds: Vec<(WorldHandle, std::thread::JoinHandle<()>)>,
    pump: Arc<CommandPump>,
    watcher: Option<PathWatcher>,
    asset_events: flume::Receiver<WatchEvent>,
    assets: Arc<AssetRegistry>,
    packet_registry: Arc<PacketRegistry>,
    dispatch_task: Option<tokio::task::JoinHandle<()>>,
}

impl Server {
    /// Brings a server up: assets load and seal, worlds spawn, the
    /// transport binds, and accepted connections start flowing to the
    /// first configured world.
    ///
    /// Failures map onto CLI exit codes through
    /// [`ServerError::exit_code`].
    pub fn bind(config: ServerConfig, mut host: HostSeed) -> Result<Self, ServerError> {
        if config.worlds.is_empty() {
            return Err(ServerError::Config("at least one world is required".into()));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads())
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        // Assets first; a broken asset set must never reach "bound".
        let source = DirectorySource::new(&config.asset_root);
        let assets = Arc::new(host.assets.load(&source)?);

        let packet_registry = Arc::new(build_packet_registry(&config)?);

        // One tick thread per configured world.
        let pump = Arc::new(CommandPump::new());
        let mut worlds = Vec::with_capacity(config.worlds.len());
        for name in &config.worlds {
            let mut systems: Vec<Box<dyn System>> = vec![Box::new(FluidSystem)];
            systems.extend((host.systems)(name));

            let (handle, thread) = spawn_world(WorldSeed {
                name: name.clone(),
                tick_rate: config.tick_rate,
                store: hearth_ecs::EntityStore::new(Arc::clone(&host.components)),
                grid: ChunkGrid::new(),
                fluids: (host.fluids)(name, &assets),
                systems,
                replicator: Replicator::new(None),
                on_packet: None,
            })
            .map_err(ServerError::Runtime)?;

            pump.register_world(handle.clone());
            worlds.push((handle, thread));
        }

        // Transport last; exit codes distinguish socket binds from
        // TLS/certificate problems.
        let listener = runtime
            .block_on(Listener::bind(
                config.net_config(),
                Arc::clone(&packet_registry),
                Arc::clone(&host.auth),
            ))
            .map_err(ServerError::from_net)?;

        info!(
            addr = %listener.local_addr(),
            transport = ?listener.kind(),
            "server bound"
        );

        // Accepted connections attach to the first world; the host moves
        // players between worlds afterwards via the command pump.
        let dispatch_task = {
            let incoming = listener.incoming().clone();
            let default_world = worlds[0].0.clone();
            runtime.spawn(async move {
                while let Ok(conn) = incoming.recv_async().await {
                    route_connection(&default_world, conn);
                }
            })
        };

        // Asset hot reload: stabilized events surface on a channel the
        // host drains, since reloading is per typed asset kind.
        let (watcher, asset_events) = if config.watch_assets {
            let (tx, rx) = flume::unbounded();
            let mut watcher = PathWatcher::new(move |event| {
                let _ = tx.send(event);
            })?;
            watcher.add_path(&config.asset_root)?;
            (Some(watcher), rx)
        } else {
            (None, flume::unbounded().1)
        };

        Ok(Self {
            runtime: Some(runtime),
            listener: Some(listener),
            worlds,
            pump,
            watcher,
            asset_events,
            assets,
            packet_registry,
            dispatch_task: Some(dispatch_task),
        })
    }

    pub fn assets(&self) -> &Arc<AssetRegistry> {
        &self.assets
    }

    pub fn packet_registry(&self) -> &Arc<PacketRegistry> {
        &self.packet_registry
    }

    pub fn pump(&self) -> &Arc<CommandPump> {
        &self.pump
    }

    pub fn world(&self, name: &str) -> Option<WorldHandle> {
        self.pump.world(name)
    }

    /// Stabilized asset file events, for the host's reload driver.
    pub fn asset_events(&self) -> &flume::Receiver<WatchEvent> {
        &self.asset_events
    }

    /// Address actually bound, useful when the config asked for port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().map(Listener::local_addr)
    }

    /// Graceful stop: no new connections, pending commands complete with
    /// a shutdown error, tick threads drain and join within `grace`.
    pub fn shutdown(mut self, grace: Duration) {
        info!("server shutting down");
        self.pump.shutdown();

        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }

        if let (Some(runtime), Some(listener)) = (self.runtime.as_ref(), self.listener.take()) {
            if runtime
                .block_on(async { tokio::time::timeout(grace, listener.shutdown()).await })
                .is_err()
            {
                warn!("transport did not drain within the grace period");
            }
        }

        for (handle, _) in &self.worlds {
            handle.stop();
        }
        for (handle, thread) in self.worlds.drain(..) {
            if thread.join().is_err() {
                warn!(world = %handle.name(), "world thread panicked during shutdown");
            }
        }

        if let Some(mut watcher) = self.watcher.take() {
            watcher.shutdown();
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(grace);
        }
    }
}

fn route_connection(world: &WorldHandle, conn: Connection) {
    let peer = conn.peer_addr();
    if world.attach(conn).is_err() {
        warn!(%peer, "dropping connection: world is gone");
    }
}

/// Core packets with the configured uniform compression threshold.
fn build_packet_registry(config: &ServerConfig) -> Result<PacketRegistry, ServerError> {
    let mut builder = PacketRegistryBuilder::new();
    packets::register_core_packets_with(&mut builder, config.compression_threshold)?;
    Ok(builder.build())
}
