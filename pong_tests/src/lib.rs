//! Shared harness for the integration tests: a relay running in the
//! background and clients driven tick by tick from the test body.

use std::time::Duration;

use pong_client::client::{GameClient, TickReport};
use pong_client::input::InputState;
use pong_server::server::{bind_ephemeral, GameServer};
use pong_shared::{
    config::GameConfig,
    math::Vec3,
    physics::{PhysicsConfig, SimplePhysics},
};
use tokio::task::JoinHandle;

pub const TICK_HZ: u32 = 50;

/// Installs a test-friendly subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Starts a relay that accepts `peers` clients, then steps for `ticks` ticks.
/// The task hands the relay back so tests can inspect it afterwards.
pub async fn start_relay(
    peers: usize,
    ticks: u32,
) -> anyhow::Result<(JoinHandle<anyhow::Result<GameServer>>, GameConfig)> {
    let (mut server, cfg) = bind_ephemeral(TICK_HZ).await?;
    let handle = tokio::spawn(async move {
        for _ in 0..peers {
            server.accept_one().await?;
        }
        server.run_for_ticks(ticks).await?;
        Ok(server)
    });
    Ok((handle, cfg))
}

/// Connects, waits for the initial spawns and announces ready. Bodies stay
/// where they are put: no gravity, so tests can place them by hand.
pub async fn connect_ready(cfg: &GameConfig) -> anyhow::Result<GameClient> {
    let mut client = GameClient::connect(cfg).await?;
    client.set_physics(Box::new(SimplePhysics::new(PhysicsConfig {
        gravity: Vec3::ZERO,
        ..Default::default()
    })));
    client.wait_reliable(Duration::from_millis(100)).await;
    client.send_ready().await?;
    Ok(client)
}

/// One client tick: control messages, queued snapshots, then simulation.
pub async fn pump(client: &mut GameClient, input: InputState) -> anyhow::Result<TickReport> {
    client.poll_reliable();
    client.drain_snapshots();
    client.tick(input).await
}

/// Ticks every client with no input for `ticks` ticks in real time.
pub async fn run_idle(clients: &mut [&mut GameClient], ticks: u32) -> anyhow::Result<()> {
    let dt = Duration::from_secs_f32(1.0 / TICK_HZ as f32);
    for _ in 0..ticks {
        for client in clients.iter_mut() {
            pump(client, InputState::default()).await?;
        }
        tokio::time::sleep(dt).await;
    }
    Ok(())
}
