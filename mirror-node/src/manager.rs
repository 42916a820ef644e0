//! Connection manager: accept loop, outbound dials, and lifecycle bookkeeping for both sets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirror_core::{ConnectionId, Direction, Fingerprint};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, NetEvent};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
/// Events buffered ahead of the node before connection readers wait.
const EVENT_BACKLOG: usize = 64;

type ConnectionSet = Mutex<HashMap<ConnectionId, Arc<Connection>>>;

pub struct ConnectionManager {
    inbound: ConnectionSet,
    outbound: ConnectionSet,
    next_id: AtomicU64,
    events: mpsc::Sender<NetEvent>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    /// New manager plus the receiver every connection's events are published to.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<NetEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BACKLOG);
        let manager = Arc::new(Self {
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            cancel: CancellationToken::new(),
        });
        (manager, rx)
    }

    /// Bind `port` on all interfaces and accept until shutdown. Returns the bound address.
    pub async fn listen(self: &Arc<Self>, port: u16) -> std::io::Result<SocketAddr> {
        self.listen_on(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    pub async fn listen_on(self: &Arc<Self>, bind: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?;
        tracing::info!("listening on {}", local);
        tokio::spawn(self.clone().accept_loop(listener));
        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = self.cancel.cancelled() => break,
            };
            match accepted {
                Ok((stream, from)) => {
                    let conn = self.register(stream, Direction::Inbound, None).await;
                    tracing::debug!(conn = conn.id(), %from, "accepted");
                }
                Err(e) => {
                    tracing::warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        tracing::debug!("accept loop stopped");
    }

    /// One outbound dial. None on timeout, refusal, or after shutdown: the peer is unreachable for now.
    /// `dialed_for` is handed back in the `Outgoing` event.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        dialed_for: Option<Fingerprint>,
    ) -> Option<Arc<Connection>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let dial = tokio::time::timeout(timeout, TcpStream::connect(addr));
        let stream = tokio::select! {
            r = dial => r,
            _ = self.cancel.cancelled() => return None,
        };
        match stream {
            Ok(Ok(stream)) => Some(self.register(stream, Direction::Outbound, dialed_for).await),
            Ok(Err(e)) => {
                tracing::debug!(%addr, "connect failed: {}", e);
                None
            }
            Err(_) => {
                tracing::debug!(%addr, "connect timed out");
                None
            }
        }
    }

    async fn register(
        &self,
        stream: TcpStream,
        direction: Direction,
        dialed_for: Option<Fingerprint>,
    ) -> Arc<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (conn, reader) = Connection::open(id, direction, stream, self.events.clone());
        crate::lock(self.set(direction)).insert(id, conn.clone());
        let opened = match direction {
            Direction::Inbound => NetEvent::Incoming(conn.clone()),
            Direction::Outbound => NetEvent::Outgoing {
                conn: conn.clone(),
                dialed_for,
            },
        };
        // Announced before the reader starts, so it precedes every event from this connection.
        let _ = self.events.send(opened).await;
        conn.spawn_reader(reader);
        if self.cancel.is_cancelled() {
            // Raced with shutdown.
            self.forget(id);
            conn.dispose();
        }
        conn
    }

    fn set(&self, direction: Direction) -> &ConnectionSet {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        [&self.inbound, &self.outbound]
            .iter()
            .find_map(|set| crate::lock(set).get(&id).cloned())
    }

    /// Drop a closed connection from bookkeeping.
    pub fn forget(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        [&self.inbound, &self.outbound]
            .iter()
            .find_map(|set| crate::lock(set).remove(&id))
    }

    /// (inbound, outbound) tracked connections.
    pub fn counts(&self) -> (usize, usize) {
        (crate::lock(&self.inbound).len(), crate::lock(&self.outbound).len())
    }

    /// Stop accepting and dispose every tracked connection exactly once.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut all: Vec<Arc<Connection>> = Vec::new();
        for set in [&self.inbound, &self.outbound] {
            all.extend(crate::lock(set).drain().map(|(_, c)| c));
        }
        tracing::info!("disposing {} connections", all.len());
        for conn in all {
            conn.dispose();
        }
    }
}
