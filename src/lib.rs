//! A framework for building block-world multiplayer game servers.
//!
//! The facade crate: re-exports the member crates under short names and
//! hosts the cross-crate integration tests.

pub use hearth_asset as asset;
pub use hearth_ecs as ecs;
pub use hearth_net as net;
pub use hearth_protocol as protocol;
pub use hearth_server as server;
pub use hearth_watch as watch;
pub use hearth_world as world;

/// Most commonly used items, ready for glob import.
pub mod prelude {
    pub use hearth_asset::{Asset, AssetRegistry, AssetRegistryBuilder, Ident};
    pub use hearth_ecs::{
        CommandBuffer, Component, ComponentRegistryBuilder, EntityId, EntityStore,
        ReplicationPolicy,
    };
    pub use hearth_net::{AuthManager, Connection, Listener, TransportKind};
    pub use hearth_protocol::{
        Decode, Encode, FrameDecoder, FrameEncoder, Packet, PacketRegistry, ProtocolError, VarUInt,
    };
    pub use hearth_server::{CommandPump, Server, ServerConfig, WorldHandle, WorldState};
    pub use hearth_watch::{PathWatcher, WatchEvent};
    pub use hearth_world::{
        Accessor, BlockId, BlockPos, ChunkGrid, FluidCell, FluidSim, SectionPos,
    };
}
