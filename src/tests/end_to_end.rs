//! Full-stack scenarios: a bound server, a live connection, a ticking
//! world.

use std::sync::Arc;
use std::time::Duration;

use hearth_ecs::{Component, ComponentRegistryBuilder, ReplicationPolicy};
use hearth_net::{AllowAllAuth, Connection, ConnectionSeed, StatsMode};
use hearth_protocol::packets::{EntityInitPacket, PingPacket, PongPacket};
use hearth_protocol::{Decode, Encode, Packet};
use hearth_server::{HostSeed, Server, ServerConfig, Transport};
use hearth_world::FluidSim;

#[derive(Clone, Copy, PartialEq, Debug)]
struct Health(u32);

impl Component for Health {
    const NAME: &'static str = "health";
}

impl Encode for Health {
    fn encode(&self, w: impl std::io::Write) -> anyhow::Result<()> {
        self.0.encode(w)
    }
}

impl Decode<'_> for Health {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self(u32::decode(r)?))
    }
}

fn bind_test_server(asset_root: &std::path::Path) -> Server {
    let mut components = ComponentRegistryBuilder::new();
    components
        .register::<Health>(ReplicationPolicy::OnChange)
        .unwrap();

    let config = ServerConfig {
        transport: Transport::Tcp,
        address: "127.0.0.1:0".parse().unwrap(),
        tick_rate: 100,
        asset_root: asset_root.to_owned(),
        ..ServerConfig::default()
    };

    Server::bind(
        config,
        HostSeed {
            components: components.build(),
            assets: hearth_asset::AssetRegistryBuilder::new(),
            auth: Arc::new(AllowAllAuth::new()),
            systems: Box::new(|_| vec![]),
            fluids: Box::new(|_, _| FluidSim::new([])),
        },
    )
    .unwrap()
}

fn connect(server: &Server, runtime: &tokio::runtime::Runtime) -> Connection {
    runtime.block_on(async {
        let stream = tokio::net::TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();
        let peer = stream.peer_addr().unwrap();
        let (reader, writer) = stream.into_split();
        Connection::spawn(
            reader,
            writer,
            peer,
            ConnectionSeed {
                registry: Arc::clone(server.packet_registry()),
                stats: StatsMode::Atomic,
                incoming_byte_limit: 1 << 20,
                outgoing_byte_limit: 1 << 20,
            },
        )
    })
}

fn recv_frame(
    runtime: &tokio::runtime::Runtime,
    conn: &Connection,
) -> hearth_net::ReceivedFrame {
    runtime.block_on(async {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = conn.try_recv().unwrap() {
                    return frame;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for a frame")
    })
}

/// A ping travels client → world tick thread → client as a pong, and
/// both ends account for it.
#[test]
fn ping_round_trips_through_the_tick_thread() {
    let assets = tempfile::tempdir().unwrap();
    let server = bind_test_server(assets.path());
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let client = connect(&server, &runtime);
    client.send(&PingPacket { nonce: 77 }).unwrap();

    let frame = recv_frame(&runtime, &client);
    assert_eq!(frame.frame.decode::<PongPacket>().unwrap().nonce, 77);

    let sent = client.stats_snapshot(PingPacket::ID);
    assert_eq!(sent.sent_count, 1);
    let got = client.stats_snapshot(PongPacket::ID);
    assert_eq!(got.received_count, 1);

    server.shutdown(Duration::from_secs(2));
}

/// Commands execute on the tick thread; the ack completes at execution;
/// a spawned entity entering the client's tracker replicates its full
/// state.
#[test]
fn command_spawn_replicates_to_the_viewer() {
    let assets = tempfile::tempdir().unwrap();
    let server = bind_test_server(assets.path());
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let client = connect(&server, &runtime);

    // Let the attach land on the world's inbox.
    std::thread::sleep(Duration::from_millis(100));

    let world_name = "hearth:overworld";
    let reply = server
        .pump()
        .submit(
            world_name,
            Box::new(|state| {
                let id = state.store.spawn();
                state.store.insert(id, Health(20)).map_err(|e| {
                    hearth_server::CommandError::Failed(e.to_string())
                })?;

                // Membership changes arrive as tracker events; here the
                // "spatial system" is the command itself.
                for conn in state.replicator.connections() {
                    let viewer = conn.id();
                    state.replicator.enter(viewer, id);
                }

                Ok(id.to_bits().to_string())
            }),
        )
        .wait()
        .unwrap();
    let spawned: u64 = reply.parse().unwrap();

    let frame = recv_frame(&runtime, &client);
    let init = frame.frame.decode::<EntityInitPacket>().unwrap();
    assert_eq!(init.entity, spawned);
    assert_eq!(init.components.len(), 1);
    let mut r = init.components[0].data.as_slice();
    assert_eq!(Health::decode(&mut r).unwrap(), Health(20));

    server.shutdown(Duration::from_secs(2));
}

/// Commands against a world that is not loaded come back as a reply
/// error, not a dropped connection.
#[test]
fn unloaded_world_is_an_operation_level_error() {
    let assets = tempfile::tempdir().unwrap();
    let server = bind_test_server(assets.path());

    let result = server
        .pump()
        .submit("hearth:the_end", Box::new(|_| Ok(String::new())))
        .wait();

    assert!(matches!(
        result,
        Err(hearth_server::CommandError::WorldMismatch(name)) if name == "hearth:the_end"
    ));

    server.shutdown(Duration::from_secs(2));
}

/// Exit codes for CLI embedders: a bind conflict reports 1.
#[test]
fn bind_conflict_maps_to_exit_code_one() {
    let assets = tempfile::tempdir().unwrap();
    let server = bind_test_server(assets.path());

    let mut components = ComponentRegistryBuilder::new();
    components
        .register::<Health>(ReplicationPolicy::OnChange)
        .unwrap();

    let config = ServerConfig {
        transport: Transport::Tcp,
        address: server.local_addr().unwrap(),
        asset_root: assets.path().to_owned(),
        ..ServerConfig::default()
    };

    let err = Server::bind(
        config,
        HostSeed {
            components: components.build(),
            assets: hearth_asset::AssetRegistryBuilder::new(),
            auth: Arc::new(AllowAllAuth::new()),
            systems: Box::new(|_| vec![]),
            fluids: Box::new(|_, _| FluidSim::new([])),
        },
    )
    .unwrap_err();

    assert_eq!(err.exit_code(), 1);

    server.shutdown(Duration::from_secs(2));
}
