//! Full socket-based integration tests: relay plus two clients.

use std::time::Duration;

use anyhow::Context;
use pong_client::input::InputState;
use pong_server::server::{bind_ephemeral, BALL_SPAWN};
use pong_shared::anim::AnimValue;
use pong_shared::math::Vec3;
use pong_shared::net::{decode_from_bytes, encode_to_bytes, NetMsg, PROTOCOL_VERSION};
use pong_shared::snapshot::Snapshot;
use pong_shared::world::{BodyKind, EntityId, NetworkedBody, PeerId};
use pong_tests::{connect_ready, init_tracing, pump, run_idle, start_relay, TICK_HZ};
use tokio::net::UdpSocket;

fn place(client: &mut pong_client::GameClient, id: EntityId, position: Vec3) {
    let body = client.world.get_mut(id).expect("body spawned");
    body.set_position(position);
    body.set_velocity(Vec3::ZERO);
}

fn position_of(client: &pong_client::GameClient, id: EntityId) -> Vec3 {
    client.world.get(id).expect("body spawned").position()
}

/// Sends a snapshot to the relay in `from`'s name from a socket of our own.
async fn send_as(
    socket: &UdpSocket,
    relay: &str,
    from: PeerId,
    snapshot: Snapshot,
) -> anyhow::Result<()> {
    let payload = encode_to_bytes(&NetMsg::Snapshot { from, snapshot })?;
    socket.send_to(&payload, relay).await?;
    Ok(())
}

/// Unit-style test: protocol messages roundtrip correctly.
#[test]
fn protocol_messages_roundtrip() -> anyhow::Result<()> {
    let hello = NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&hello)?)?, hello);

    let welcome = NetMsg::Welcome {
        peer_id: PeerId(1),
        server_time: 3.25,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&welcome)?)?, welcome);

    let snap = NetMsg::Snapshot {
        from: PeerId(2),
        snapshot: Snapshot::new(EntityId(0), 1.5, Vec3::new(0.1, 1.0, -0.2), Vec3::Y),
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&snap)?)?, snap);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_client_handshake_and_spawns() -> anyhow::Result<()> {
    init_tracing();
    let (relay, cfg) = start_relay(1, 30).await?;

    let mut client = connect_ready(&cfg).await?;
    assert_eq!(client.peer_id, PeerId(1));
    run_idle(&mut [&mut client], 10).await?;

    let ball = client.ball().context("ball spawned")?;
    assert!(client.owns(ball), "first peer simulates the ball");
    let avatar = client.local_avatar().context("avatar spawned")?;
    assert_eq!(client.world.get(avatar).map(|b| b.kind), Some(BodyKind::Avatar));
    assert!(client.sync.get(avatar).map(|s| s.is_authority()).unwrap_or(false));

    let server = relay.await??;
    assert!(server.is_ready(PeerId(1)));
    assert_eq!(server.owner_of(server.ball()), Some(PeerId(1)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_ball_follows_owner() -> anyhow::Result<()> {
    init_tracing();
    let (relay, cfg) = start_relay(2, 150).await?;

    let mut a = connect_ready(&cfg).await?;
    let mut b = connect_ready(&cfg).await?;
    run_idle(&mut [&mut a, &mut b], 10).await?;

    let ball = a.ball().context("ball spawned")?;
    assert!(a.owns(ball));
    assert!(!b.owns(ball));

    let moved = Vec3::new(0.4, 1.2, 0.3);
    place(&mut a, ball, moved);
    run_idle(&mut [&mut a, &mut b], 40).await?;

    assert_eq!(position_of(&a, ball), moved);
    let remote = position_of(&b, ball);
    assert!(
        remote.distance(moved) < 0.05,
        "remote ball at {remote:?}, owner at {moved:?}"
    );
    let stats = b
        .sync
        .get(ball)
        .and_then(|s| s.reader())
        .map(|r| r.stats())
        .context("reader present")?;
    assert!(stats.accepted > 0);
    assert_eq!(stats.teleports, 0);

    relay.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ownership_transfer_reverses_replication() -> anyhow::Result<()> {
    init_tracing();
    let (relay, cfg) = start_relay(2, 150).await?;

    let mut a = connect_ready(&cfg).await?;
    let mut b = connect_ready(&cfg).await?;
    run_idle(&mut [&mut a, &mut b], 10).await?;

    let ball = b.ball().context("ball spawned")?;
    b.request_ownership(ball).await?;
    run_idle(&mut [&mut a, &mut b], 15).await?;

    assert!(b.owns(ball));
    assert!(!a.owns(ball));
    assert!(b.sync.get(ball).map(|s| s.is_authority()).unwrap_or(false));
    assert!(a.sync.get(ball).and_then(|s| s.reader()).is_some());

    let moved = Vec3::new(-0.3, 0.8, 0.5);
    place(&mut b, ball, moved);
    run_idle(&mut [&mut a, &mut b], 40).await?;

    let remote = position_of(&a, ball);
    assert!(
        remote.distance(moved) < 0.05,
        "previous owner's copy at {remote:?}, new owner at {moved:?}"
    );

    let server = relay.await??;
    assert_eq!(server.owner_of(ball), Some(b.peer_id));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn avatar_motion_and_animation_replicate() -> anyhow::Result<()> {
    init_tracing();
    let (relay, cfg) = start_relay(2, 150).await?;

    let mut a = connect_ready(&cfg).await?;
    let mut b = connect_ready(&cfg).await?;
    run_idle(&mut [&mut a, &mut b], 10).await?;

    let avatar = a.local_avatar().context("avatar spawned")?;
    let start = position_of(&b, avatar);

    let walk = InputState {
        forward: 1.0,
        ..Default::default()
    };
    let dt = Duration::from_secs_f32(1.0 / TICK_HZ as f32);
    for _ in 0..25 {
        pump(&mut a, walk).await?;
        pump(&mut b, InputState::default()).await?;
        tokio::time::sleep(dt).await;
    }

    let remote = b.world.get(avatar).context("remote avatar")?;
    assert!(
        remote.position().z > start.z + 0.5,
        "remote avatar did not walk: {:?} -> {:?}",
        start,
        remote.position()
    );
    match remote.anim.get("Speed") {
        Some(AnimValue::Float(speed)) => assert!(speed > 1.0, "speed {speed}"),
        other => panic!("Speed not replicated: {other:?}"),
    }

    relay.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn departing_owner_hands_ball_on() -> anyhow::Result<()> {
    init_tracing();
    let (relay, cfg) = start_relay(2, 100).await?;

    let mut a = connect_ready(&cfg).await?;
    let mut b = connect_ready(&cfg).await?;
    run_idle(&mut [&mut a, &mut b], 10).await?;

    let ball = b.ball().context("ball spawned")?;
    let a_avatar = a.local_avatar().context("avatar spawned")?;
    assert!(a.owns(ball));
    drop(a);

    run_idle(&mut [&mut b], 25).await?;
    assert!(b.owns(ball), "ball should pass to the remaining peer");
    assert!(b.world.get(a_avatar).is_none(), "departed avatar deleted");
    assert!(b.sync.get(a_avatar).is_none());

    let server = relay.await??;
    assert_eq!(server.peer_count(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn console_reset_puts_ball_back_everywhere() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, cfg) = bind_ephemeral(TICK_HZ).await?;
    let (console_tx, console_rx) = tokio::sync::mpsc::channel(4);
    server.set_console_input(console_rx);
    let relay = tokio::spawn(async move {
        server.accept_one().await?;
        server.accept_one().await?;
        server.run_for_ticks(150).await?;
        Ok::<_, anyhow::Error>(server)
    });

    let mut a = connect_ready(&cfg).await?;
    let mut b = connect_ready(&cfg).await?;
    run_idle(&mut [&mut a, &mut b], 10).await?;

    let ball = a.ball().context("ball spawned")?;
    place(&mut a, ball, Vec3::new(0.5, 1.5, 0.5));
    run_idle(&mut [&mut a, &mut b], 20).await?;

    console_tx.send("reset".to_string()).await?;
    // Snapshots already in flight may land after the reset; give the remote
    // copy time to settle on the new ones.
    run_idle(&mut [&mut a, &mut b], 40).await?;

    assert_eq!(position_of(&a, ball), BALL_SPAWN);
    let remote = position_of(&b, ball);
    assert!(remote.distance(BALL_SPAWN) < 0.02, "remote ball at {remote:?}");

    relay.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn previous_owner_snapshots_are_not_relayed() -> anyhow::Result<()> {
    init_tracing();
    let (relay, cfg) = start_relay(3, 150).await?;

    let mut a = connect_ready(&cfg).await?;
    let mut b = connect_ready(&cfg).await?;
    let mut c = connect_ready(&cfg).await?;
    run_idle(&mut [&mut a, &mut b, &mut c], 10).await?;

    let ball = c.ball().context("ball spawned")?;
    assert!(a.owns(ball));
    b.request_ownership(ball).await?;
    run_idle(&mut [&mut a, &mut b, &mut c], 15).await?;
    assert!(b.owns(ball));

    // `a` keeps streaming the ball after the grant, stamped far in the future
    // so a single relayed copy would outrank everything `b` sends.
    let stale = UdpSocket::bind("127.0.0.1:0").await?;
    let ghost = Vec3::new(1.0, 1.0, 1.0);
    let moved = Vec3::new(-0.3, 0.8, 0.5);
    place(&mut b, ball, moved);
    for _ in 0..40 {
        let snapshot = Snapshot::new(ball, 1.0e6, ghost, Vec3::ZERO);
        send_as(&stale, &cfg.server_addr, a.peer_id, snapshot).await?;
        run_idle(&mut [&mut a, &mut b, &mut c], 1).await?;
    }

    for (name, client) in [("a", &a), ("c", &c)] {
        let remote = position_of(client, ball);
        assert!(
            remote.distance(moved) < 0.05,
            "{name}'s copy at {remote:?}, new owner at {moved:?}"
        );
    }

    let server = relay.await??;
    assert_eq!(server.owner_of(ball), Some(b.peer_id));
    let counts = server.relay_counts(a.peer_id).context("a connected")?;
    assert!(counts.refused > 0, "{counts:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_snapshots_do_not_redirect_fan_out() -> anyhow::Result<()> {
    init_tracing();
    let (relay, cfg) = start_relay(2, 100).await?;

    let mut a = connect_ready(&cfg).await?;
    let mut b = connect_ready(&cfg).await?;
    run_idle(&mut [&mut a, &mut b], 10).await?;

    let b_avatar = b.local_avatar().context("avatar spawned")?;
    let rogue = UdpSocket::bind("127.0.0.1:0").await?;
    // In `a`'s name: one for a body nobody has, one for a body `b` owns.
    for entity in [EntityId(99), b_avatar] {
        let snapshot = Snapshot::new(entity, 1.0e6, Vec3::ZERO, Vec3::ZERO);
        send_as(&rogue, &cfg.server_addr, a.peer_id, snapshot).await?;
    }
    run_idle(&mut [&mut a, &mut b], 5).await?;

    // `a` must still be hearing `b`'s avatar.
    let moved = Vec3::new(0.3, 0.0, 1.2);
    place(&mut b, b_avatar, moved);
    run_idle(&mut [&mut a, &mut b], 40).await?;
    let remote = position_of(&a, b_avatar);
    assert!(
        remote.distance(moved) < 0.15,
        "a's copy of b's avatar at {remote:?}, owner at {moved:?}"
    );

    let mut buf = [0u8; 2048];
    let leaked = tokio::time::timeout(Duration::from_millis(50), rogue.recv_from(&mut buf)).await;
    assert!(leaked.is_err(), "relay sent snapshots to the rogue socket");

    let server = relay.await??;
    assert_ne!(server.peer_udp_addr(a.peer_id), Some(rogue.local_addr()?));
    let counts = server.relay_counts(a.peer_id).context("a connected")?;
    assert!(counts.refused >= 2, "{counts:?}");
    assert!(counts.delivered > 0, "{counts:?}");
    Ok(())
}
