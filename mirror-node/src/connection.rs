//! One TCP connection: a read task that decodes frames into events, and writes serialized
//! under a per-connection lock so frames from concurrent senders never interleave.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mirror_core::wire::{self, FrameDecodeError, HEADER_LEN};
use mirror_core::{ConnectionId, Direction, Fingerprint, Packet, PacketType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Payloads are read in steps of this size.
const READ_STEP: usize = 64 * 1024;

/// Everything the network layer reports to the node, in order per connection.
#[derive(Debug)]
pub enum NetEvent {
    /// An inbound socket was accepted.
    Incoming(Arc<Connection>),
    /// An outbound dial succeeded. Carries the peer it was made for, if any.
    Outgoing {
        conn: Arc<Connection>,
        dialed_for: Option<Fingerprint>,
    },
    Received {
        conn: ConnectionId,
        packet_type: PacketType,
        payload: Vec<u8>,
    },
    /// Fired exactly once per connection, after its last `Received`.
    Disconnected(ConnectionId),
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    direction: Direction,
    remote: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    cancel: CancellationToken,
    events: mpsc::Sender<NetEvent>,
}

impl Connection {
    /// Take ownership of `stream`. Nothing is read until `spawn_reader` is called with the
    /// returned read half.
    pub(crate) fn open(
        id: ConnectionId,
        direction: Direction,
        stream: TcpStream,
        events: mpsc::Sender<NetEvent>,
    ) -> (Arc<Self>, OwnedReadHalf) {
        let remote = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Self {
            id,
            direction,
            remote,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            events,
        });
        (conn, reader)
    }

    pub(crate) fn spawn_reader(self: &Arc<Self>, reader: OwnedReadHalf) {
        tokio::spawn(read_loop(self.clone(), reader));
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been disposed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// Write one frame. A write failure disposes the connection and is returned.
    pub async fn send(&self, packet_type: PacketType, payload: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        let header = wire::encode_header(packet_type as u8, payload.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let result = tokio::select! {
            r = self.write_frame(&header, payload) => r,
            _ = self.cancel.cancelled() => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )),
        };
        if let Err(e) = &result {
            tracing::debug!(conn = self.id, "send failed: {}", e);
            self.dispose();
        }
        result
    }

    async fn write_frame(&self, header: &[u8; HEADER_LEN], payload: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(header).await?;
        w.write_all(payload).await?;
        w.flush().await
    }

    pub async fn send_packet(&self, packet: &Packet) -> io::Result<()> {
        self.send(packet.packet_type(), &packet.encode_payload())
            .await
    }

    /// Close the connection. Idempotent; the read task publishes `Disconnected` as it exits.
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),
}

async fn read_loop(conn: Arc<Connection>, mut reader: OwnedReadHalf) {
    let result = tokio::select! {
        r = read_frames(&conn, &mut reader) => r,
        _ = conn.cancel.cancelled() => Ok(()),
    };
    if let Err(e) = result {
        tracing::debug!(conn = conn.id, remote = %conn.remote, "read loop ended: {}", e);
    }
    conn.dispose();
    let _ = conn.writer.lock().await.shutdown().await;
    let _ = conn.events.send(NetEvent::Disconnected(conn.id)).await;
}

async fn read_frames(conn: &Connection, reader: &mut OwnedReadHalf) -> Result<(), ReadError> {
    let mut header = [0u8; HEADER_LEN];
    loop {
        reader.read_exact(&mut header).await?;
        let (type_byte, len) = wire::decode_header(&header)?;
        let payload = read_payload(reader, len).await?;
        match PacketType::try_from(type_byte) {
            Ok(packet_type) => {
                let event = NetEvent::Received {
                    conn: conn.id,
                    packet_type,
                    payload,
                };
                // Waits for the node to catch up; TCP flow control pushes back on the sender.
                if conn.events.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Err(e) => tracing::warn!(conn = conn.id, "skipping frame: {}", e),
        }
    }
}

/// Read exactly `len` bytes in bounded steps; the buffer only grows as data arrives.
async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(len.min(READ_STEP));
    while buf.len() < len {
        let start = buf.len();
        let step = (len - start).min(READ_STEP);
        buf.resize(start + step, 0);
        reader.read_exact(&mut buf[start..]).await?;
    }
    Ok(buf)
}
