//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake, spawns, ownership, resets)
//! - An unreliable datagram socket (snapshots)
//! - The local world of networked bodies
//! - One synchronizer per body: owned bodies are sampled and published,
//!   remote bodies are corrected toward the newest snapshot

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use pong_shared::{
    clock::{Clock, SessionClock},
    config::GameConfig,
    math::Vec3,
    net::{
        EntitySpawn, NetMsg, ReliableConn, ReliableWriter, UdpUplink, UnreliableConn,
        PROTOCOL_VERSION,
    },
    physics::{PhysicsBackend, SimplePhysics},
    snapshot::Snapshot,
    sync::{Correction, SnapshotTransport, SyncRegistry},
    world::{Body, BodyKind, EntityId, NetworkedBody, PeerId, Pose, RigidBody, World},
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::input::{apply_input, InputState};

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected to any relay.
    Disconnected,
    /// Handshake done, not yet receiving snapshots.
    Connected,
    /// Announced ready; simulating and replicating.
    Ready,
}

/// What one client tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u32,
    pub corrections: Vec<(EntityId, Correction)>,
    pub sent: usize,
}

/// High-level game client.
pub struct GameClient {
    pub peer_id: PeerId,
    pub state: ClientState,
    pub world: World,
    pub sync: SyncRegistry,
    pub clock: SessionClock,

    cfg: GameConfig,
    physics: Box<dyn PhysicsBackend>,
    reliable: ReliableWriter,
    reliable_rx: mpsc::UnboundedReceiver<((), Option<NetMsg>)>,
    reliable_task: JoinHandle<()>,
    uplink: UdpUplink,
    tick: u32,

    /// Server messages to display.
    pub server_messages: Vec<String>,
}

impl GameClient {
    /// Connects to a relay, performs the handshake and aligns the session clock.
    pub async fn connect(cfg: &GameConfig) -> anyhow::Result<Self> {
        cfg.validate().context("invalid config")?;
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, "Connecting to relay");

        // Bind UDP first so we can tell the relay where to send snapshots.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        let mut clock = SessionClock::new();
        let sent_local = clock.local();
        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let welcome = reliable.recv().await?;
        let received_local = clock.local();
        let peer_id = match welcome {
            NetMsg::Welcome {
                peer_id,
                server_time,
            } => {
                clock.align(sent_local, received_local, server_time);
                peer_id
            }
            NetMsg::Disconnect { reason } => anyhow::bail!("relay refused connection: {reason}"),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        info!(peer_id = ?peer_id, clock_offset = clock.offset(), "Connected to relay");

        let (reader, writer) = reliable.into_split();
        let (tx, reliable_rx) = mpsc::unbounded_channel();
        let reliable_task = reader.forward((), tx);

        Ok(Self {
            peer_id,
            state: ClientState::Connected,
            world: World::default(),
            sync: SyncRegistry::new(peer_id, cfg),
            clock,
            cfg: cfg.clone(),
            physics: Box::new(SimplePhysics::default()),
            reliable: writer,
            reliable_rx,
            reliable_task,
            uplink: UdpUplink::new(unreliable, peer_id),
            tick: 0,
            server_messages: Vec::new(),
        })
    }

    /// Replaces the physics stepper.
    pub fn set_physics(&mut self, physics: Box<dyn PhysicsBackend>) {
        self.physics = physics;
    }

    pub fn config(&self) -> &GameConfig {
        &self.cfg
    }

    /// Drains control messages received since the last call.
    pub fn poll_reliable(&mut self) {
        while let Ok(((), msg)) = self.reliable_rx.try_recv() {
            match msg {
                Some(msg) => self.handle_reliable_message(msg),
                None => {
                    warn!("Reliable connection lost");
                    self.state = ClientState::Disconnected;
                }
            }
        }
    }

    /// Waits until a control message arrives or `timeout` passes, then drains.
    pub async fn wait_reliable(&mut self, timeout: Duration) {
        if let Ok(Some(((), msg))) = tokio::time::timeout(timeout, self.reliable_rx.recv()).await {
            match msg {
                Some(msg) => self.handle_reliable_message(msg),
                None => self.state = ClientState::Disconnected,
            }
        }
        self.poll_reliable();
    }

    fn handle_reliable_message(&mut self, msg: NetMsg) {
        match msg {
            NetMsg::EntitySpawn(spawn) => self.spawn_entity(spawn),
            NetMsg::EntityDelete { id } => {
                debug!(entity = ?id, "Entity removed");
                self.world.remove(id);
                self.sync.untrack(id);
            }
            NetMsg::OwnershipChanged { id, owner } => {
                if let Some(body) = self.world.get_mut(id) {
                    body.owner = owner;
                }
                self.sync.set_owner(id, owner);
            }
            NetMsg::ResetEntity { id, position } => {
                if let Some(body) = self.world.get_mut(id) {
                    let rotation = body.pose().rotation;
                    body.set_pose(Pose { position, rotation });
                    body.set_velocity(Vec3::ZERO);
                }
                self.sync.reset(id);
                info!(entity = ?id, ?position, "Entity reset");
            }
            NetMsg::ServerPrint { message } => {
                info!(message = %message, "Server message");
                self.server_messages.push(message);
            }
            NetMsg::Disconnect { reason } => {
                info!(reason = %reason, "Disconnected from relay");
                self.state = ClientState::Disconnected;
            }
            other => {
                debug!(?other, "Unhandled reliable message");
            }
        }
    }

    fn spawn_entity(&mut self, spawn: EntitySpawn) {
        let mut rigid = RigidBody::at(spawn.position);
        if spawn.kind == BodyKind::Avatar {
            rigid.kinematic = true;
            rigid.radius = 0.0;
        }
        debug!(entity = ?spawn.id, kind = ?spawn.kind, owner = ?spawn.owner, "Entity spawned");
        self.world
            .insert(spawn.id, Body::new(spawn.kind, spawn.owner, rigid));
        self.sync.track(spawn.id, spawn.kind, spawn.owner);
    }

    /// Tells the relay to start forwarding snapshots to us.
    pub async fn send_ready(&mut self) -> anyhow::Result<()> {
        self.reliable
            .send(&NetMsg::ClientReady {
                peer_id: self.peer_id,
            })
            .await?;
        self.state = ClientState::Ready;
        info!("Sent ready signal to relay");
        Ok(())
    }

    /// Asks the relay for authority over a body.
    pub async fn request_ownership(&mut self, id: EntityId) -> anyhow::Result<()> {
        self.reliable.send(&NetMsg::OwnershipRequest { id }).await
    }

    /// Paddle contact: sets the ball's velocity locally and claims it, so the
    /// hit is simulated here and replicated from now on.
    pub async fn hit_ball(&mut self, velocity: Vec3) -> anyhow::Result<()> {
        let Some(id) = self.ball() else {
            anyhow::bail!("no ball spawned");
        };
        if let Some(body) = self.world.get_mut(id) {
            body.set_velocity(velocity);
        }
        if !self.owns(id) {
            self.request_ownership(id).await?;
        }
        Ok(())
    }

    pub fn ball(&self) -> Option<EntityId> {
        self.world.find(BodyKind::Ball, None)
    }

    pub fn local_avatar(&self) -> Option<EntityId> {
        self.world.find(BodyKind::Avatar, Some(self.peer_id))
    }

    pub fn owns(&self, id: EntityId) -> bool {
        self.world
            .get(id)
            .map(|b| b.is_owned_by(self.peer_id))
            .unwrap_or(false)
    }

    /// Advances one fixed tick: input, correction of remote bodies, physics,
    /// then snapshot publishing for owned bodies.
    pub async fn tick(&mut self, input: InputState) -> anyhow::Result<TickReport> {
        let dt = self.cfg.tick_dt();

        if let Some(id) = self.local_avatar() {
            if let Some(avatar) = self.world.get_mut(id) {
                apply_input(avatar, input, dt);
            }
        }

        let now = self.clock.now();
        let corrections = self.sync.advance(&mut self.world, dt, now);
        self.physics.step(&mut self.world, dt);

        let outbound = self.sync.collect_outbound(&self.world, self.clock.now());
        let mut sent = 0;
        for snapshot in &outbound {
            match self.uplink.broadcast_snapshot(snapshot).await {
                Ok(()) => sent += 1,
                Err(e) => debug!(entity = ?snapshot.entity, error = %e, "Snapshot send failed"),
            }
        }

        let report = TickReport {
            tick: self.tick,
            corrections,
            sent,
        };
        self.tick += 1;
        Ok(report)
    }

    /// Waits briefly for snapshots, then drains everything queued.
    pub async fn recv_snapshot(&mut self) -> anyhow::Result<usize> {
        let mut delivered = 0;
        if let Some(msg) = self
            .uplink
            .conn()
            .recv_timeout(Duration::from_millis(20))
            .await?
        {
            delivered += self.handle_datagram(msg);
        }
        delivered += self.drain_snapshots();
        Ok(delivered)
    }

    /// Hands every queued snapshot to its synchronizer without waiting.
    pub fn drain_snapshots(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            match self.uplink.conn().try_recv() {
                Ok(Some(msg)) => delivered += self.handle_datagram(msg),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Dropping bad datagram");
                }
            }
        }
        delivered
    }

    fn handle_datagram(&mut self, msg: NetMsg) -> usize {
        match msg {
            NetMsg::Snapshot { from, snapshot } if from != self.peer_id => {
                usize::from(self.deliver(snapshot))
            }
            other => {
                debug!(?other, "Unexpected UDP message");
                0
            }
        }
    }

    /// Delivers a snapshot as if it had arrived from the network.
    pub fn deliver(&mut self, snapshot: Snapshot) -> bool {
        self.sync.deliver(snapshot)
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => Ok(self.status_lines()),
            "take" => {
                let Some(id) = tokens.get(1).and_then(|t| t.parse().ok()).map(EntityId) else {
                    return Ok(vec!["Usage: take <entity>".to_string()]);
                };
                self.request_ownership(id).await?;
                Ok(vec![format!("Requested ownership of {:?}", id)])
            }
            "serve" => {
                self.hit_ball(Vec3::new(0.0, 2.0, 3.0)).await?;
                Ok(vec!["Served".to_string()])
            }
            "disconnect" => {
                self.state = ClientState::Disconnected;
                Ok(vec!["Disconnected".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {}", other)]),
        }
    }

    fn status_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.push(format!("State: {:?}", self.state));
        out.push(format!("Peer ID: {:?}", self.peer_id));
        out.push(format!("Tick: {}", self.tick));
        out.push(format!("Clock offset: {:.4}s", self.clock.offset()));
        for (id, body) in self.world.iter() {
            let mut line = format!(
                "  {:?} {:?} owner={:?} pos=({:.2}, {:.2}, {:.2})",
                id,
                body.kind,
                body.owner,
                body.rigid.pose.position.x,
                body.rigid.pose.position.y,
                body.rigid.pose.position.z
            );
            if let Some(stats) = self.sync.get(id).and_then(|s| s.reader()).map(|r| r.stats()) {
                line.push_str(&format!(
                    " accepted={} stale={} teleports={}",
                    stats.accepted, stats.stale, stats.teleports
                ));
            }
            out.push(line);
        }
        out
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reliable_task.abort();
    }
}
