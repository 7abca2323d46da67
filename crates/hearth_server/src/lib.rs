#![doc = include_str!("../README.md")]

pub mod command;
pub mod config;
mod error;
pub mod replicate;
mod server;
pub mod world;

pub use crate::command::{AckFuture, CommandError, CommandExec, CommandPump};
pub use crate::config::{ServerConfig, StatsChoice, Transport};
pub use crate::error::ServerError;
pub use crate::replicate::Replicator;
pub use crate::server::{HostSeed, Server};
pub use crate::world::{
    spawn_world, FluidSystem, InboundCx, System, WorldHandle, WorldSeed, WorldState,
};
