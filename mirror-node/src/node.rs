//! Node driver: owns the link table and runs the network, reconnect, liveness, publish and
//! heartbeat loops around one shared context.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mirror_core::protocol::PacketError;
use mirror_core::snapshot::SnapshotError;
use mirror_core::{
    ConnectionId, ContentHash, Direction, Fingerprint, LinkAction, LinkTable, Packet, PacketType,
    PeerIdentity, PeerStatus, StateChange, StateSnapshot,
};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapters, PresenceProbe};
use crate::cache::ContentCache;
use crate::config::{Config, ConfigError};
use crate::connection::{Connection, NetEvent};
use crate::discovery::{self, DiscoveryError, RendezvousClient, ServerStatus};
use crate::host::HostHandle;
use crate::manager::ConnectionManager;
use crate::transfer::{PeerProgress, TransferError, TransferQueue, TransferSettings};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("listen: {0}")]
    Listen(#[source] io::Error),
    #[error(transparent)]
    Rendezvous(#[from] DiscoveryError),
}

/// Why a received frame was dropped.
#[derive(Debug, thiserror::Error)]
enum FrameError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("connection is not bound to a peer")]
    Unbound,
}

/// Outcome of fetching the files a snapshot refers to.
enum Fetched {
    All,
    /// Some file could not be fetched; the snapshot must not be applied yet.
    Missing,
    /// The session ended while fetching.
    Ended,
}

type KnownPeer = (Fingerprint, PeerIdentity);

/// Shared services, built once at startup and handed to every component that needs them.
pub struct Context {
    pub config: Config,
    pub local: PeerIdentity,
    pub fingerprint: Fingerprint,
    pub cache: Arc<ContentCache>,
    pub transfers: Arc<TransferQueue>,
    pub connections: Arc<ConnectionManager>,
    pub host: HostHandle,
    pub adapters: Arc<Adapters>,
    pub presence: Arc<dyn PresenceProbe>,
    pub rendezvous: Option<Arc<RendezvousClient>>,
}

/// The live connection of a bound peer and what runs on its behalf.
struct Session {
    conn: ConnectionId,
    cancel: CancellationToken,
    /// Latest snapshot received; the apply loop only ever sees the newest.
    snapshots: watch::Sender<Option<StateSnapshot>>,
}

struct Shared {
    ctx: Arc<Context>,
    links: Mutex<LinkTable>,
    sessions: Mutex<HashMap<Fingerprint, Session>>,
    /// Peers with a configured address skip rendezvous lookup.
    static_addresses: HashMap<Fingerprint, String>,
    /// Newly bound connections waiting for our current snapshot.
    fresh: mpsc::UnboundedSender<ConnectionId>,
    cancel: CancellationToken,
}

pub struct Node {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Build the context from `config`, start listening and spawn every loop.
    pub async fn start(
        config: Config,
        host: HostHandle,
        adapters: Adapters,
        presence: Arc<dyn PresenceProbe>,
    ) -> Result<Node, NodeError> {
        config.validate()?;
        let local = config.local_identity();
        let fingerprint = local.fingerprint(&config.secret);
        let cache = Arc::new(ContentCache::open(&config.cache_dir));
        if !cache.is_valid() {
            tracing::warn!("cache unavailable, file-bearing state will not be served or fetched");
        }
        let transfers = Arc::new(TransferQueue::new(
            TransferSettings::from(&config),
            cache.clone(),
        ));
        let (connections, events) = ConnectionManager::new();
        let rendezvous = if config.rendezvous.is_empty() {
            None
        } else {
            Some(Arc::new(RendezvousClient::new(
                &config.rendezvous,
                config.connect_timeout(),
            )?))
        };

        let mut links = LinkTable::new(fingerprint.clone());
        let mut static_addresses = HashMap::new();
        for peer in &config.peers {
            let fp = links.add_peer(peer.identity(), &config.secret);
            if let Some(addr) = &peer.address {
                static_addresses.insert(fp, addr.clone());
            }
        }

        let local_addr = connections
            .listen(config.listen_port)
            .await
            .map_err(NodeError::Listen)?;
        tracing::info!(me = %local, fingerprint = fingerprint.short(), peers = config.peers.len(), "node started");

        let ctx = Arc::new(Context {
            config,
            local,
            fingerprint,
            cache,
            transfers,
            connections,
            host,
            adapters: Arc::new(adapters),
            presence,
            rendezvous,
        });
        let (fresh, fresh_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            ctx: ctx.clone(),
            links: Mutex::new(links),
            sessions: Mutex::new(HashMap::new()),
            static_addresses,
            fresh,
            cancel: CancellationToken::new(),
        });

        let mut tasks = vec![
            tokio::spawn(shared.clone().event_loop(events)),
            tokio::spawn(shared.clone().reconnect_loop()),
            tokio::spawn(shared.clone().liveness_loop()),
            tokio::spawn(shared.clone().publish_loop(fresh_rx)),
        ];
        if let Some(client) = &ctx.rendezvous {
            tasks.push(tokio::spawn(discovery::run_heartbeat(
                client.clone(),
                ctx.fingerprint.as_str().to_string(),
                local_addr.port(),
                ctx.config.heartbeat_interval(),
                shared.cancel.child_token(),
            )));
        }
        Ok(Node {
            shared,
            local_addr,
            tasks,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.shared.ctx
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.shared.ctx.fingerprint
    }

    pub fn statuses(&self) -> Vec<(PeerIdentity, PeerStatus)> {
        crate::lock(&self.shared.links).statuses()
    }

    pub fn status(&self, peer: &PeerIdentity) -> Option<PeerStatus> {
        let fp = peer.fingerprint(&self.shared.ctx.config.secret);
        crate::lock(&self.shared.links).status(&fp)
    }

    pub fn progress(&self, peer: &PeerIdentity) -> PeerProgress {
        let fp = peer.fingerprint(&self.shared.ctx.config.secret);
        self.shared.ctx.transfers.progress().snapshot(&fp)
    }

    pub fn rendezvous_statuses(&self) -> Vec<ServerStatus> {
        self.shared
            .ctx
            .rendezvous
            .as_ref()
            .map(|r| r.statuses())
            .unwrap_or_default()
    }

    /// Stop every loop and dispose every connection.
    pub async fn shutdown(self) {
        tracing::info!("node shutting down");
        self.shared.cancel.cancel();
        self.shared.ctx.connections.shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl Shared {
    async fn event_loop(self: Arc<Self>, mut events: mpsc::Receiver<NetEvent>) {
        loop {
            let event = tokio::select! {
                e = events.recv() => e,
                _ = self.cancel.cancelled() => break,
            };
            let Some(event) = event else { break };
            self.handle_event(event).await;
        }
        tracing::debug!("event loop stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: NetEvent) {
        match event {
            NetEvent::Incoming(conn) => {
                tracing::debug!(conn = conn.id(), remote = %conn.remote(), "incoming connection");
                let actions =
                    crate::lock(&self.links).on_connected(conn.id(), Direction::Inbound, None);
                self.watch_handshake(conn.id());
                self.perform(actions).await;
            }
            NetEvent::Outgoing { conn, dialed_for } => {
                let actions = crate::lock(&self.links).on_connected(
                    conn.id(),
                    Direction::Outbound,
                    dialed_for.as_ref(),
                );
                self.watch_handshake(conn.id());
                self.perform(actions).await;
            }
            NetEvent::Received {
                conn,
                packet_type,
                payload,
            } => match self.on_frame(conn, packet_type, &payload).await {
                Ok(()) => {}
                Err(FrameError::Unbound) => {
                    tracing::debug!(conn, ?packet_type, "frame on unbound connection dropped")
                }
                Err(e) => tracing::warn!(conn, ?packet_type, "frame dropped: {}", e),
            },
            NetEvent::Disconnected(conn) => {
                self.ctx.connections.forget(conn);
                self.ctx.transfers.on_connection_closed(conn);
                let actions = crate::lock(&self.links).on_disconnected(conn);
                self.perform(actions).await;
            }
        }
    }

    async fn on_frame(
        self: &Arc<Self>,
        conn: ConnectionId,
        packet_type: PacketType,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        match Packet::decode(packet_type, payload)? {
            Packet::Identify(peer) => {
                let actions = crate::lock(&self.links).on_identify(conn, &peer);
                self.perform(actions).await;
            }
            Packet::StateSnapshot(bytes) => {
                let peer = self.bound_peer(conn)?;
                let snapshot = StateSnapshot::decode(&bytes)?;
                let sessions = crate::lock(&self.sessions);
                if let Some(session) = sessions.get(&peer).filter(|s| s.conn == conn) {
                    let _ = session.snapshots.send(Some(snapshot));
                }
            }
            Packet::FileRequest { slot, hash } => {
                let peer = self.bound_peer(conn)?;
                self.serve(peer, conn, slot, hash);
            }
            Packet::FileChunk { slot, data } => {
                self.bound_peer(conn)?;
                self.ctx.transfers.deliver(conn, slot, data).await;
            }
        }
        Ok(())
    }

    fn bound_peer(&self, conn: ConnectionId) -> Result<Fingerprint, FrameError> {
        crate::lock(&self.links)
            .peer_for(conn)
            .cloned()
            .ok_or(FrameError::Unbound)
    }

    async fn perform(self: &Arc<Self>, actions: Vec<LinkAction>) {
        for action in actions {
            match action {
                LinkAction::SendIdentify(conn) => self.send_identify(conn).await,
                LinkAction::Close(conn) => {
                    if let Some(c) = self.ctx.connections.get(conn) {
                        c.dispose();
                    }
                }
                LinkAction::Bound { peer, conn } => self.on_bound(peer, conn),
                LinkAction::Unbound { peer, conn, clear } => self.on_unbound(peer, conn, clear),
            }
        }
    }

    async fn send_identify(&self, conn: ConnectionId) {
        let Some(c) = self.ctx.connections.get(conn) else {
            return;
        };
        let identify = Packet::Identify(self.ctx.fingerprint.clone());
        let timeout = self.ctx.config.handshake_timeout();
        match tokio::time::timeout(timeout, c.send_packet(&identify)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(conn, "identify not sent: {}", e),
            Err(_) => {
                tracing::warn!(conn, "identify send timed out");
                c.dispose();
            }
        }
    }

    /// Dispose `conn` if it has not identified within the handshake timeout.
    fn watch_handshake(self: &Arc<Self>, conn: ConnectionId) {
        let shared = self.clone();
        let timeout = self.ctx.config.handshake_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {}
                _ = shared.cancel.cancelled() => return,
            }
            let actions = crate::lock(&shared.links).handshake_timed_out(conn);
            if !actions.is_empty() {
                tracing::debug!(conn, "handshake timed out");
                shared.perform(actions).await;
            }
        });
    }

    fn identity_of(&self, peer: &Fingerprint) -> Option<PeerIdentity> {
        crate::lock(&self.links)
            .link(peer)
            .map(|l| l.identity().clone())
    }

    fn on_bound(self: &Arc<Self>, peer: Fingerprint, conn_id: ConnectionId) {
        let (Some(conn), Some(identity)) =
            (self.ctx.connections.get(conn_id), self.identity_of(&peer))
        else {
            // Already gone; its Disconnected event unbinds the link.
            return;
        };
        let cancel = self.cancel.child_token();
        let (tx, rx) = watch::channel(None);
        let previous = crate::lock(&self.sessions).insert(
            peer.clone(),
            Session {
                conn: conn_id,
                cancel: cancel.clone(),
                snapshots: tx,
            },
        );
        if let Some(old) = previous {
            old.cancel.cancel();
        }
        tokio::spawn(self.clone().apply_loop(peer, identity, conn, rx, cancel));
        let _ = self.fresh.send(conn_id);
    }

    fn on_unbound(&self, peer: Fingerprint, conn: ConnectionId, clear: Vec<StateChange>) {
        {
            let mut sessions = crate::lock(&self.sessions);
            if sessions.get(&peer).is_some_and(|s| s.conn == conn) {
                if let Some(session) = sessions.remove(&peer) {
                    session.cancel.cancel();
                }
            }
        }
        if clear.is_empty() {
            return;
        }
        let Some(identity) = self.identity_of(&peer) else {
            return;
        };
        let adapters = self.ctx.adapters.clone();
        if let Err(e) = self.ctx.host.post(move || {
            adapters.apply(&identity, &clear);
        }) {
            tracing::warn!("clearing state: {}", e);
        }
    }

    /// Answer a file request from `peer` under that peer's session.
    fn serve(&self, peer: Fingerprint, conn: ConnectionId, slot: u8, hash: ContentHash) {
        let cancel = match crate::lock(&self.sessions).get(&peer) {
            Some(s) if s.conn == conn => s.cancel.clone(),
            _ => return,
        };
        let Some(conn) = self.ctx.connections.get(conn) else {
            return;
        };
        let transfers = self.ctx.transfers.clone();
        tokio::spawn(async move {
            if let Err(e) = transfers.upload(&peer, &conn, slot, &hash, &cancel).await {
                tracing::debug!(hash = hash.as_str(), "upload ended: {}", e);
            }
        });
    }

    /// Apply `peer`'s newest snapshot, fetching referenced files first. Snapshots that arrive
    /// while files download are superseded. A snapshot with missing files is withheld and
    /// fetched again after the reconnect interval, or as soon as a newer one arrives.
    async fn apply_loop(
        self: Arc<Self>,
        peer: Fingerprint,
        identity: PeerIdentity,
        conn: Arc<Connection>,
        mut rx: watch::Receiver<Option<StateSnapshot>>,
        cancel: CancellationToken,
    ) {
        let retry_after = self.ctx.config.reconnect_interval();
        let mut withheld = false;
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(retry_after), if withheld => {}
                _ = cancel.cancelled() => break,
            }
            let Some(snapshot) = rx.borrow_and_update().clone() else {
                continue;
            };
            match self.fetch_files(&peer, &conn, &snapshot, &cancel).await {
                Fetched::All => withheld = false,
                Fetched::Missing => {
                    tracing::info!(peer = %identity, "state withheld until its files arrive");
                    withheld = true;
                    continue;
                }
                Fetched::Ended => break,
            }
            let Some(changes) = crate::lock(&self.links).stage_snapshot(&peer, snapshot) else {
                break;
            };
            if changes.is_empty() {
                continue;
            }
            tracing::debug!(peer = %identity, changes = changes.len(), "applying state");
            let adapters = self.ctx.adapters.clone();
            let who = identity.clone();
            if let Err(e) = self
                .ctx
                .host
                .run(move || adapters.apply(&who, &changes))
                .await
            {
                tracing::warn!(peer = %identity, "applying state: {}", e);
            }
        }
        tracing::debug!(peer = %identity, "apply loop stopped");
    }

    /// Download every file `snapshot` references that is not cached yet.
    async fn fetch_files(
        &self,
        peer: &Fingerprint,
        conn: &Arc<Connection>,
        snapshot: &StateSnapshot,
        cancel: &CancellationToken,
    ) -> Fetched {
        let mut downloads = JoinSet::new();
        for (hash, size) in &snapshot.files {
            if self.ctx.cache.contains(hash) {
                continue;
            }
            let (transfers, peer, conn) = (self.ctx.transfers.clone(), peer.clone(), conn.clone());
            let (hash, size, cancel) = (hash.clone(), *size, cancel.clone());
            downloads.spawn(async move {
                let result = transfers
                    .download(&peer, &conn, &hash, Some(size), &cancel)
                    .await;
                (hash, result)
            });
        }
        let mut outcome = Fetched::All;
        while let Some(joined) = downloads.join_next().await {
            match joined {
                Ok((_, Ok(_))) => {}
                Ok((_, Err(TransferError::Cancelled | TransferError::Disconnected))) => {
                    outcome = Fetched::Ended;
                }
                Ok((hash, Err(e))) => {
                    tracing::warn!(hash = hash.as_str(), "file not fetched: {}", e);
                    if !matches!(outcome, Fetched::Ended) {
                        outcome = Fetched::Missing;
                    }
                }
                Err(e) => {
                    tracing::warn!("download task failed: {}", e);
                    if !matches!(outcome, Fetched::Ended) {
                        outcome = Fetched::Missing;
                    }
                }
            }
        }
        if cancel.is_cancelled() {
            Fetched::Ended
        } else {
            outcome
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut tick = interval(self.ctx.config.reconnect_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            let due = crate::lock(&self.links).peers_to_dial();
            if due.is_empty() {
                continue;
            }
            let Some((present, absent)) = self.split_by_presence(due).await else {
                continue;
            };
            for (_, identity) in &absent {
                tracing::trace!(peer = %identity, "not dialing absent peer");
            }
            for (peer, identity) in present {
                if crate::lock(&self.links).begin_connecting(&peer) {
                    tokio::spawn(self.clone().dial(peer, identity));
                }
            }
        }
    }

    async fn dial(self: Arc<Self>, peer: Fingerprint, identity: PeerIdentity) {
        let timeout = self.ctx.config.connect_timeout();
        for addr in self.candidates(&peer).await {
            // The Outgoing event moves the link on to AwaitingIdentity.
            if let Some(conn) = self
                .ctx
                .connections
                .connect(addr, timeout, Some(peer.clone()))
                .await
            {
                tracing::debug!(conn = conn.id(), %addr, peer = %identity, "dialed");
                return;
            }
        }
        tracing::debug!(peer = %identity, "peer unreachable");
        crate::lock(&self.links).connect_failed(&peer);
    }

    async fn candidates(&self, peer: &Fingerprint) -> Vec<SocketAddr> {
        if let Some(addr) = self.static_addresses.get(peer) {
            return match tokio::net::lookup_host(addr.as_str()).await {
                Ok(found) => found.collect(),
                Err(e) => {
                    tracing::warn!(%addr, "bad peer address: {}", e);
                    Vec::new()
                }
            };
        }
        let Some(rendezvous) = &self.ctx.rendezvous else {
            return Vec::new();
        };
        tokio::select! {
            found = rendezvous.resolve(peer.as_str()) => found.map(|e| e.candidates()).unwrap_or_default(),
            _ = self.cancel.cancelled() => Vec::new(),
        }
    }

    async fn liveness_loop(self: Arc<Self>) {
        let period = self.ctx.config.liveness_interval();
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.cancel.cancelled() => break,
            }
            let bound: Vec<KnownPeer> = crate::lock(&self.links)
                .bound_peers()
                .into_iter()
                .map(|(fp, identity, _)| (fp, identity))
                .collect();
            if bound.is_empty() {
                continue;
            }
            let Some((_, absent)) = self.split_by_presence(bound).await else {
                continue;
            };
            for (peer, identity) in absent {
                tracing::info!(peer = %identity, "peer no longer present");
                let actions = crate::lock(&self.links).liveness_failed(&peer);
                self.perform(actions).await;
            }
        }
    }

    /// Ask the host which of `peers` are present: `(present, absent)`. None if the host failed.
    async fn split_by_presence(&self, peers: Vec<KnownPeer>) -> Option<(Vec<KnownPeer>, Vec<KnownPeer>)> {
        let presence = self.ctx.presence.clone();
        let split = self
            .ctx
            .host
            .run(move || {
                peers
                    .into_iter()
                    .partition::<Vec<_>, _>(|(_, identity)| presence.is_present(identity))
            })
            .await;
        match split {
            Ok(split) => Some(split),
            Err(e) => {
                tracing::warn!("presence check: {}", e);
                None
            }
        }
    }

    /// Capture local state on the host thread and encode it.
    async fn capture(&self) -> Option<Vec<u8>> {
        let adapters = self.ctx.adapters.clone();
        let snapshot = match self.ctx.host.run(move || adapters.capture()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("capturing state: {}", e);
                return None;
            }
        };
        match snapshot.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("encoding state: {}", e);
                None
            }
        }
    }

    /// All snapshot sends go through here, so each peer sees them in capture order.
    async fn publish_loop(self: Arc<Self>, mut fresh: mpsc::UnboundedReceiver<ConnectionId>) {
        let mut tick = interval(self.ctx.config.publish_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut published: Option<Vec<u8>> = None;
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let Some(bytes) = self.capture().await else { continue };
                    if published.as_ref() == Some(&bytes) {
                        continue;
                    }
                    let bound = crate::lock(&self.links).bound_peers();
                    for (_, _, conn) in bound {
                        self.send_snapshot(conn, &bytes).await;
                    }
                    published = Some(bytes);
                }
                Some(conn) = fresh.recv() => {
                    if published.is_none() {
                        published = self.capture().await;
                    }
                    if let Some(bytes) = &published {
                        self.send_snapshot(conn, bytes).await;
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn send_snapshot(&self, conn: ConnectionId, bytes: &[u8]) {
        let Some(c) = self.ctx.connections.get(conn) else {
            return;
        };
        let timeout = self.ctx.config.handshake_timeout();
        match tokio::time::timeout(timeout, c.send(PacketType::StateSnapshot, bytes)).await {
            Ok(Ok(())) => tracing::trace!(conn, bytes = bytes.len(), "snapshot sent"),
            Ok(Err(e)) => tracing::debug!(conn, "snapshot not sent: {}", e),
            Err(_) => tracing::warn!(conn, "snapshot send timed out"),
        }
    }
}
