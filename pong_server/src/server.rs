//! Relay implementation.
//!
//! The relay does not simulate. Each body is simulated by its owning peer,
//! which publishes snapshots; the relay:
//! - Keeps the authoritative session clock (reported in `Welcome`)
//! - Assigns peer ids, spawns one avatar per peer and a single shared ball
//! - Grants ownership requests and broadcasts the change
//! - Fans snapshots out to every other ready peer, dropping those whose
//!   sender no longer owns the body
//! - Resets the ball on request (console `reset`)
//!
//! Control traffic (handshake, spawns, ownership, resets) goes over TCP;
//! snapshots go over UDP.

use anyhow::Context;
use pong_shared::{
    clock::{Clock, SessionClock},
    config::GameConfig,
    math::Vec3,
    net::{
        EntitySpawn, NetMsg, ReliableConn, ReliableListener, ReliableWriter, PROTOCOL_VERSION,
    },
    snapshot::Snapshot,
    world::{Body, BodyKind, EntityId, NetworkedBody, PeerId, RigidBody, World},
};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Where the ball goes at session start and on reset.
pub const BALL_SPAWN: Vec3 = Vec3::new(0.0, 1.0, 0.0);

/// Avatars alternate between the two ends of the table.
fn avatar_spawn(peer: PeerId) -> Vec3 {
    let side = if peer.0 % 2 == 1 { -1.5 } else { 1.5 };
    Vec3::new(0.0, 0.0, side)
}

/// Per-peer snapshot traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCounts {
    /// Snapshots from this peer that were fanned out.
    pub accepted: u64,
    /// Snapshots from this peer dropped: not the owner, unknown entity, or
    /// wrong source address.
    pub refused: u64,
    /// Snapshots sent to this peer.
    pub delivered: u64,
}

/// Connected peer state.
struct PeerState {
    reliable: ReliableWriter,
    reader_task: JoinHandle<()>,
    /// Address of the TCP handshake. Snapshots must come from the same host.
    host: IpAddr,
    udp_peer: SocketAddr,
    /// Whether the peer wants snapshots.
    ready: bool,
    avatar: EntityId,
    counts: RelayCounts,
}

/// Relay run state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    Running,
    /// `quit` was issued; the main loop should exit.
    Stopping,
}

/// Session relay.
pub struct GameServer {
    pub cfg: GameConfig,
    clock: SessionClock,
    world: World,
    ball: EntityId,
    peers: BTreeMap<PeerId, PeerState>,

    tcp: ReliableListener,
    udp: UdpSocket,

    reliable_tx: mpsc::UnboundedSender<(PeerId, Option<NetMsg>)>,
    reliable_rx: mpsc::UnboundedReceiver<(PeerId, Option<NetMsg>)>,
    /// Peers whose reliable stream failed; removed at the end of the step.
    dropped: Vec<(PeerId, String)>,

    next_peer: u32,
    next_entity: u64,
    tick: u32,
    state: ServerState,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Binds TCP and UDP on `cfg.server_addr`.
    pub async fn new(cfg: GameConfig) -> anyhow::Result<Self> {
        cfg.validate().context("invalid config")?;
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        // Port 0 resolves on the TCP side; UDP shares the resolved port.
        let udp_addr = SocketAddr::new(addr.ip(), tcp.local_addr()?.port());
        let udp = UdpSocket::bind(udp_addr).await.context("udp bind")?;
        let mut cfg = cfg;
        cfg.server_addr = tcp.local_addr()?.to_string();
        Ok(Self::with_sockets(cfg, tcp, udp))
    }

    fn with_sockets(cfg: GameConfig, tcp: ReliableListener, udp: UdpSocket) -> Self {
        let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
        let mut world = World::default();
        let ball = EntityId(0);
        world.insert(ball, Body::new(BodyKind::Ball, None, RigidBody::at(BALL_SPAWN)));

        Self {
            cfg,
            clock: SessionClock::new(),
            world,
            ball,
            peers: BTreeMap::new(),
            tcp,
            udp,
            reliable_tx,
            reliable_rx,
            dropped: Vec::new(),
            next_peer: 1,
            next_entity: 1,
            tick: 0,
            state: ServerState::Running,
            console_rx: None,
        }
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Seconds since the session started.
    pub fn session_time(&self) -> f64 {
        self.clock.now()
    }

    pub fn tick(&self) -> u32 {
        self.tick
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn ball(&self) -> EntityId {
        self.ball
    }

    pub fn owner_of(&self, id: EntityId) -> Option<PeerId> {
        self.world.get(id).and_then(|b| b.owner)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_ready(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).map(|p| p.ready).unwrap_or(false)
    }

    /// Where snapshots for `peer` are sent.
    pub fn peer_udp_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(&peer).map(|p| p.udp_peer)
    }

    pub fn relay_counts(&self, peer: PeerId) -> Option<RelayCounts> {
        self.peers.get(&peer).map(|p| p.counts)
    }

    /// Accepts exactly one peer and completes its handshake.
    pub async fn accept_one(&mut self) -> anyhow::Result<PeerId> {
        let (conn, addr) = self.tcp.accept().await?;
        self.handle_new_connection(conn, addr).await
    }

    /// Accepts a peer if one connects within `timeout`.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Option<PeerId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, addr))) => self.handle_new_connection(conn, addr).await.map(Some),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn handle_new_connection(
        &mut self,
        mut conn: ReliableConn,
        addr: SocketAddr,
    ) -> anyhow::Result<PeerId> {
        match conn.recv().await? {
            NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {}
            NetMsg::Hello { protocol } => {
                let reason = format!("protocol {protocol} unsupported, relay speaks {PROTOCOL_VERSION}");
                conn.send(&NetMsg::Disconnect {
                    reason: reason.clone(),
                })
                .await?;
                anyhow::bail!(reason);
            }
            other => anyhow::bail!("unexpected handshake msg: {other:?}"),
        }
        let client_udp_port = match conn.recv().await? {
            NetMsg::UdpHello { client_udp_port } => client_udp_port,
            other => anyhow::bail!("expected UdpHello, got {other:?}"),
        };

        let peer_id = PeerId(self.next_peer);
        self.next_peer += 1;
        conn.send(&NetMsg::Welcome {
            peer_id,
            server_time: self.clock.now(),
        })
        .await?;

        // The first peer to arrive simulates the ball.
        let ball_claimed = self.owner_of(self.ball).is_none();
        let avatar = EntityId(self.next_entity);
        let position = avatar_spawn(peer_id);

        // Everything already in the session, then the new avatar. The world
        // is only touched once the peer has taken all of it.
        let mut spawns: Vec<EntitySpawn> = self
            .world
            .iter()
            .map(|(id, body)| spawn_packet(id, body))
            .collect();
        for spawn in spawns.iter_mut() {
            if ball_claimed && spawn.id == self.ball {
                spawn.owner = Some(peer_id);
            }
        }
        spawns.push(EntitySpawn {
            id: avatar,
            kind: BodyKind::Avatar,
            owner: Some(peer_id),
            position,
        });
        for spawn in &spawns {
            conn.send(&NetMsg::EntitySpawn(spawn.clone())).await?;
        }

        self.next_entity += 1;
        if ball_claimed {
            if let Some(ball) = self.world.get_mut(self.ball) {
                ball.owner = Some(peer_id);
            }
        }
        self.world.insert(
            avatar,
            Body::new(BodyKind::Avatar, Some(peer_id), RigidBody::at(position)),
        );

        let (reader, writer) = conn.into_split();
        let reader_task = reader.forward(peer_id, self.reliable_tx.clone());
        let udp_peer = SocketAddr::new(addr.ip(), client_udp_port);
        self.peers.insert(
            peer_id,
            PeerState {
                reliable: writer,
                reader_task,
                host: addr.ip(),
                udp_peer,
                ready: false,
                avatar,
                counts: RelayCounts::default(),
            },
        );

        let spawn = NetMsg::EntitySpawn(EntitySpawn {
            id: avatar,
            kind: BodyKind::Avatar,
            owner: Some(peer_id),
            position,
        });
        self.broadcast(&spawn, Some(peer_id)).await;
        if ball_claimed {
            let changed = NetMsg::OwnershipChanged {
                id: self.ball,
                owner: Some(peer_id),
            };
            self.broadcast(&changed, Some(peer_id)).await;
        }
        self.process_drops().await;

        info!(peer_id = ?peer_id, %udp_peer, avatar = ?avatar, "Peer connected");
        Ok(peer_id)
    }

    /// Runs the relay for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(self.cfg.tick_dt());
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one relay step: console, control messages, snapshot fan-out.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands().await?;
        self.poll_reliable().await;
        self.relay_snapshots().await?;
        self.process_drops().await;
        self.tick += 1;
        Ok(())
    }

    async fn process_console_commands(&mut self) -> anyhow::Result<()> {
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line).await? {
                println!("{}", out);
            }
        }
        Ok(())
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => Ok(self.status_lines()),
            "reset" => {
                self.reset_ball().await;
                Ok(vec!["Ball reset".to_string()])
            }
            "say" => {
                let message = tokens[1..].join(" ");
                self.broadcast(&NetMsg::ServerPrint { message }, None).await;
                self.process_drops().await;
                Ok(Vec::new())
            }
            "kick" => {
                let Some(peer) = tokens.get(1).and_then(|t| t.parse().ok()).map(PeerId) else {
                    return Ok(vec!["Usage: kick <peer>".to_string()]);
                };
                if !self.peers.contains_key(&peer) {
                    return Ok(vec![format!("No such peer: {:?}", peer)]);
                }
                self.send_to(
                    peer,
                    &NetMsg::Disconnect {
                        reason: "kicked".to_string(),
                    },
                )
                .await;
                self.dropped.push((peer, "kicked".to_string()));
                self.process_drops().await;
                Ok(vec![format!("Kicked {:?}", peer)])
            }
            "quit" | "exit" => {
                info!("Relay shutting down");
                self.state = ServerState::Stopping;
                Ok(Vec::new())
            }
            other => Ok(vec![format!("Unknown command: {}", other)]),
        }
    }

    fn status_lines(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.push(format!("Relay state: {:?}", self.state));
        out.push(format!("Tick: {}", self.tick));
        out.push(format!("Session time: {:.3}s", self.clock.now()));
        out.push(format!(
            "Ball: {:?} owner={:?}",
            self.ball,
            self.owner_of(self.ball)
        ));
        out.push(format!("Peers: {}", self.peers.len()));
        for (id, peer) in &self.peers {
            out.push(format!(
                "  {:?}: udp={} ready={} avatar={:?} accepted={} refused={} delivered={}",
                id,
                peer.udp_peer,
                peer.ready,
                peer.avatar,
                peer.counts.accepted,
                peer.counts.refused,
                peer.counts.delivered
            ));
        }
        out
    }

    /// Puts the ball back at its spawn point on every peer.
    pub async fn reset_ball(&mut self) {
        if let Some(ball) = self.world.get_mut(self.ball) {
            ball.set_position(BALL_SPAWN);
            ball.set_velocity(Vec3::ZERO);
        }
        let msg = NetMsg::ResetEntity {
            id: self.ball,
            position: BALL_SPAWN,
        };
        self.broadcast(&msg, None).await;
        self.process_drops().await;
        info!(entity = ?self.ball, "Ball reset");
    }

    async fn poll_reliable(&mut self) {
        while let Ok((peer, msg)) = self.reliable_rx.try_recv() {
            match msg {
                Some(msg) => self.handle_reliable_message(peer, msg).await,
                None => self.dropped.push((peer, "connection closed".to_string())),
            }
        }
    }

    async fn handle_reliable_message(&mut self, peer: PeerId, msg: NetMsg) {
        match msg {
            NetMsg::ClientReady { peer_id } => {
                if peer_id != peer {
                    warn!(peer = ?peer, claimed = ?peer_id, "ClientReady for another peer");
                }
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.ready = true;
                    info!(peer_id = ?peer, "Peer ready");
                }
            }
            NetMsg::OwnershipRequest { id } => self.grant_ownership(peer, id).await,
            NetMsg::Disconnect { reason } => self.dropped.push((peer, reason)),
            other => debug!(peer = ?peer, ?other, "Unexpected reliable message"),
        }
    }

    async fn grant_ownership(&mut self, peer: PeerId, id: EntityId) {
        let Some(body) = self.world.get_mut(id) else {
            debug!(peer = ?peer, entity = ?id, "Ownership request for unknown entity");
            return;
        };
        let previous = body.owner;
        body.owner = Some(peer);
        info!(entity = ?id, from = ?previous, to = ?peer, "Ownership granted");
        let msg = NetMsg::OwnershipChanged {
            id,
            owner: Some(peer),
        };
        self.broadcast(&msg, None).await;
    }

    async fn relay_snapshots(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, src)) => match serde_json::from_slice::<NetMsg>(&buf[..n]) {
                    Ok(NetMsg::Snapshot { from, snapshot }) => {
                        self.relay_one(src, from, &buf[..n], &snapshot).await;
                    }
                    Ok(other) => debug!(%src, ?other, "Unexpected UDP message"),
                    Err(e) => debug!(%src, error = %e, "Dropping bad datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    async fn relay_one(
        &mut self,
        src: SocketAddr,
        from: PeerId,
        payload: &[u8],
        snapshot: &Snapshot,
    ) {
        let Some(sender) = self.peers.get_mut(&from) else {
            warn!(%src, from = ?from, "Snapshot from unknown peer");
            return;
        };

        // In-flight snapshots from a previous owner are expected right after
        // a transfer; they must not reach the other peers.
        let accepted = if src.ip() != sender.host {
            warn!(%src, from = ?from, host = %sender.host, "Snapshot from another host");
            false
        } else {
            match self.world.get_mut(snapshot.entity) {
                Some(body) if body.owner == Some(from) => {
                    body.set_position(snapshot.position);
                    body.set_velocity(snapshot.velocity);
                    true
                }
                Some(body) => {
                    debug!(entity = ?snapshot.entity, from = ?from, owner = ?body.owner, "Dropping snapshot from non-owner");
                    false
                }
                None => {
                    debug!(entity = ?snapshot.entity, from = ?from, "Snapshot for unknown entity");
                    false
                }
            }
        };
        if !accepted {
            sender.counts.refused += 1;
            return;
        }
        sender.counts.accepted += 1;
        // Follows the owner's UDP port if it rebinds.
        sender.udp_peer = src;

        for (id, peer) in self.peers.iter_mut() {
            if *id == from || !peer.ready {
                continue;
            }
            match self.udp.send_to(payload, peer.udp_peer).await {
                Ok(_) => peer.counts.delivered += 1,
                Err(e) => debug!(peer = ?id, error = %e, "Snapshot send failed"),
            }
        }
    }

    async fn send_to(&mut self, peer: PeerId, msg: &NetMsg) {
        let Some(p) = self.peers.get_mut(&peer) else {
            return;
        };
        if let Err(e) = p.reliable.send(msg).await {
            self.dropped.push((peer, format!("send failed: {e}")));
        }
    }

    /// Sends `msg` to every peer except `except`. Failed peers are queued for
    /// removal.
    async fn broadcast(&mut self, msg: &NetMsg, except: Option<PeerId>) {
        for (id, peer) in self.peers.iter_mut() {
            if Some(*id) == except {
                continue;
            }
            if let Err(e) = peer.reliable.send(msg).await {
                self.dropped.push((*id, format!("send failed: {e}")));
            }
        }
    }

    async fn process_drops(&mut self) {
        while let Some((peer, reason)) = self.dropped.pop() {
            self.remove_peer(peer, &reason).await;
        }
    }

    /// Removes a peer, deletes its avatar and hands the ball on if it held it.
    async fn remove_peer(&mut self, peer: PeerId, reason: &str) {
        let Some(state) = self.peers.remove(&peer) else {
            return;
        };
        state.reader_task.abort();
        info!(peer_id = ?peer, reason = %reason, "Peer disconnected");

        self.world.remove(state.avatar);
        self.broadcast(&NetMsg::EntityDelete { id: state.avatar }, None)
            .await;

        for id in self.world.owned_by(peer) {
            let heir = self.peers.keys().next().copied();
            if let Some(body) = self.world.get_mut(id) {
                body.owner = heir;
            }
            info!(entity = ?id, owner = ?heir, "Ownership reassigned");
            self.broadcast(&NetMsg::OwnershipChanged { id, owner: heir }, None)
                .await;
        }
    }
}

fn spawn_packet(id: EntityId, body: &Body) -> EntitySpawn {
    EntitySpawn {
        id,
        kind: body.kind,
        owner: body.owner,
        position: body.position(),
    }
}

/// Helper for tests: bind to an ephemeral port on localhost.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, GameConfig)> {
    let cfg = GameConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        snapshot_hz: tick_hz.min(GameConfig::default().snapshot_hz),
        ..Default::default()
    };
    let server = GameServer::new(cfg).await?;
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}
