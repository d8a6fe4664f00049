//! Networking primitives.
//!
//! Goals:
//! - Provide a simple reliable (TCP) and unreliable (UDP) channel.
//! - Provide the session and snapshot message types used by client/relay.
//! - Keep serialization explicit and versionable.
//!
//! Snapshots travel over UDP and may be lost or reordered; everything that
//! changes session structure (spawns, ownership, resets) travels over TCP.

use anyhow::Context;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tracing::debug;

use crate::{
    math::Vec3,
    snapshot::Snapshot,
    sync::SnapshotTransport,
    world::{BodyKind, EntityId, PeerId},
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single reliable frame.
const MAX_FRAME_LEN: usize = 1 << 20;

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    /// Client announces its UDP port to the relay.
    UdpHello {
        client_udp_port: u16,
    },
    /// Relay assigns a peer id and reports its session clock.
    Welcome {
        peer_id: PeerId,
        server_time: f64,
    },
    /// Client is ready to receive snapshots.
    ClientReady {
        peer_id: PeerId,
    },

    // ─── Entity lifecycle ───
    EntitySpawn(EntitySpawn),
    EntityDelete {
        id: EntityId,
    },
    /// Place a body back at a spawn point (e.g. ball reset after a point).
    ResetEntity {
        id: EntityId,
        position: Vec3,
    },

    // ─── Ownership ───
    /// Client -> relay: take authority over a body.
    OwnershipRequest {
        id: EntityId,
    },
    /// Relay -> clients: authority moved.
    OwnershipChanged {
        id: EntityId,
        owner: Option<PeerId>,
    },

    // ─── Replication ───
    /// Owner -> relay -> other peers.
    Snapshot {
        from: PeerId,
        snapshot: Snapshot,
    },

    // ─── Console ───
    ServerPrint {
        message: String,
    },

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

/// Entity spawn packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpawn {
    pub id: EntityId,
    pub kind: BodyKind,
    pub owner: Option<PeerId>,
    pub position: Vec3,
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned halves once the handshake is done.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { read }, ReliableWriter { write })
    }
}

/// Receiving half of a reliable connection.
#[derive(Debug)]
pub struct ReliableReader {
    read: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.read).await
    }

    /// Forwards frames into `tx` tagged with `tag` until the connection ends.
    /// The end of the stream is reported as `(tag, None)`.
    pub fn forward<T>(mut self, tag: T, tx: mpsc::UnboundedSender<(T, Option<NetMsg>)>) -> JoinHandle<()>
    where
        T: Clone + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                match self.recv().await {
                    Ok(msg) => {
                        if tx.send((tag.clone(), Some(msg))).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "Reliable stream closed");
                        let _ = tx.send((tag, None));
                        return;
                    }
                }
            }
        })
    }
}

/// Sending half of a reliable connection.
#[derive(Debug)]
pub struct ReliableWriter {
    write: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.write, msg).await
    }
}

async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, msg: &NetMsg) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame too large: {len} bytes");
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    pub async fn recv(&self) -> anyhow::Result<NetMsg> {
        let mut buf = vec![0u8; 64 * 1024];
        let n = self.socket.recv(&mut buf).await.context("udp recv")?;
        let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
        Ok(msg)
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    /// Receives a datagram if one is already queued.
    pub fn try_recv(&self) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match self.socket.try_recv(&mut buf) {
            Ok(n) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("udp recv"),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Snapshot uplink from a client to the relay.
#[derive(Debug)]
pub struct UdpUplink {
    conn: UnreliableConn,
    from: PeerId,
}

impl UdpUplink {
    pub fn new(conn: UnreliableConn, from: PeerId) -> Self {
        Self { conn, from }
    }

    pub fn conn(&self) -> &UnreliableConn {
        &self.conn
    }
}

#[async_trait]
impl SnapshotTransport for UdpUplink {
    async fn broadcast_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.conn
            .send(&NetMsg::Snapshot {
                from: self.from,
                snapshot: snapshot.clone(),
            })
            .await
    }
}

/// In-process transport, for tests and local simulation.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl ChannelTransport {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Snapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SnapshotTransport for ChannelTransport {
    async fn broadcast_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.tx
            .send(snapshot.clone())
            .map_err(|_| anyhow::anyhow!("snapshot channel closed"))
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}
