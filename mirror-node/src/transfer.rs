//! Transfer engine: downloads and uploads of cached content, multiplexed over a connection by
//! slot index. Each direction has its own process-wide concurrency cap.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirror_core::chunk::{classify, ChunkEvent, SlotAllocator, DEFAULT_CHUNK_SIZE};
use mirror_core::integrity::ContentHasher;
use mirror_core::{
    ConnectionId, ContentHash, Fingerprint, Packet, PacketType, RetryPolicy, TransferKind,
    TransferPhase, TransferRecord,
};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, ContentCache};
use crate::config::Config;
use crate::connection::Connection;

/// Chunks buffered per download before the connection's reader waits.
const ROUTE_BACKLOG: usize = 8;

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Cap on active downloads, and separately on active uploads.
    pub max_concurrent: usize,
    pub chunk_size: usize,
    /// Pause between upload chunks so other frames get a turn on the connection.
    pub chunk_delay: Duration,
    /// Shared-read open retries for a cache entry that is busy.
    pub read_retries: u32,
    pub read_retry_delay: Duration,
    /// A download with no chunk for this long is retried.
    pub chunk_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(1),
            read_retries: 3,
            read_retry_delay: Duration::from_millis(100),
            chunk_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for TransferSettings {
    fn from(c: &Config) -> Self {
        Self {
            max_concurrent: c.transfer_cap(),
            chunk_size: c.chunk_size.max(1),
            chunk_delay: Duration::from_millis(c.chunk_delay_millis),
            chunk_timeout: Duration::from_secs(c.chunk_timeout_secs.max(1)),
            retry: RetryPolicy {
                max_attempts: c.max_attempts.max(1),
                backoff: Duration::from_secs(c.retry_backoff_secs),
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connection closed")]
    Disconnected,
    #[error("cancelled")]
    Cancelled,
    #[error("no free slot on connection {0}")]
    NoSlot(ConnectionId),
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Why a download attempt has to be repeated.
enum Retry {
    Mismatch(ContentHash),
    Stalled,
    Oversize { limit: u64 },
}

impl fmt::Display for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retry::Mismatch(got) => write!(f, "hash mismatch, received {}", got),
            Retry::Stalled => f.write_str("no chunk before timeout"),
            Retry::Oversize { limit } => write!(f, "peer sent more than {} bytes", limit),
        }
    }
}

/// Chunk handlers for one connection.
#[derive(Default)]
struct ConnRoutes {
    slots: SlotAllocator,
    handlers: HashMap<u8, mpsc::Sender<Vec<u8>>>,
}

/// Permits and counters for one direction.
struct Lane {
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Lane {
    fn new(cap: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(cap.max(1))),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, TransferError> {
        tokio::select! {
            p = self.permits.clone().acquire_owned() => p.map_err(|_| TransferError::Cancelled),
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    }

    fn activate(&self) -> ActiveGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ActiveGuard { lane: self }
    }
}

pub struct TransferQueue {
    settings: TransferSettings,
    cache: Arc<ContentCache>,
    downloads: Lane,
    uploads: Lane,
    routes: Mutex<HashMap<ConnectionId, ConnRoutes>>,
    progress: Arc<ProgressBoard>,
    scratch: AtomicU64,
}

impl TransferQueue {
    pub fn new(settings: TransferSettings, cache: Arc<ContentCache>) -> Self {
        Self {
            downloads: Lane::new(settings.max_concurrent),
            uploads: Lane::new(settings.max_concurrent),
            settings,
            cache,
            routes: Mutex::new(HashMap::new()),
            progress: Arc::new(ProgressBoard::default()),
            scratch: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn progress(&self) -> &Arc<ProgressBoard> {
        &self.progress
    }

    fn lane(&self, kind: TransferKind) -> &Lane {
        match kind {
            TransferKind::Download => &self.downloads,
            TransferKind::Upload => &self.uploads,
        }
    }

    /// Transfers of `kind` currently moving bytes.
    pub fn active(&self, kind: TransferKind) -> usize {
        self.lane(kind).active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously active transfers of `kind` seen so far.
    pub fn active_peak(&self, kind: TransferKind) -> usize {
        self.lane(kind).peak.load(Ordering::SeqCst)
    }

    /// Registered chunk handlers across all connections.
    pub fn open_routes(&self) -> usize {
        crate::lock(&self.routes)
            .values()
            .map(|r| r.handlers.len())
            .sum()
    }

    /// Hand a received chunk to the download waiting on `slot`, waiting while its backlog is
    /// full. False if nobody is waiting on the slot.
    pub async fn deliver(&self, conn: ConnectionId, slot: u8, data: Vec<u8>) -> bool {
        let tx = crate::lock(&self.routes)
            .get(&conn)
            .and_then(|r| r.handlers.get(&slot))
            .cloned();
        let Some(tx) = tx else {
            tracing::debug!(conn, slot, "chunk for unknown slot dropped");
            return false;
        };
        tx.send(data).await.is_ok()
    }

    /// Drop every route on `conn`; downloads waiting on it fail with `Disconnected`.
    pub fn on_connection_closed(&self, conn: ConnectionId) {
        if let Some(routes) = crate::lock(&self.routes).remove(&conn) {
            if !routes.handlers.is_empty() {
                tracing::debug!(conn, dropped = routes.handlers.len(), "routes dropped");
            }
        }
    }

    fn open_route(&self, conn: &Connection) -> Result<Route<'_>, TransferError> {
        let mut routes = crate::lock(&self.routes);
        // Checked under the lock: a close after this point will find and drop the handler.
        if conn.is_closed() {
            return Err(TransferError::Disconnected);
        }
        let entry = routes.entry(conn.id()).or_default();
        let slot = entry
            .slots
            .allocate()
            .ok_or(TransferError::NoSlot(conn.id()))?;
        let (tx, rx) = mpsc::channel(ROUTE_BACKLOG);
        entry.handlers.insert(slot, tx);
        Ok(Route {
            queue: self,
            conn: conn.id(),
            slot,
            rx,
        })
    }

    /// Fetch `hash` from `peer` over `conn` into the cache. Returns the cached path.
    /// With a known `size`, a peer that sends more than that fails the attempt.
    pub async fn download(
        &self,
        peer: &Fingerprint,
        conn: &Arc<Connection>,
        hash: &ContentHash,
        size: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TransferError> {
        if !self.cache.is_valid() {
            return Err(CacheError::Unavailable(self.cache.root().to_path_buf()).into());
        }
        if self.cache.contains(hash) {
            return Ok(self.cache.get(hash));
        }
        let record = self
            .progress
            .start(peer, TransferRecord::new(TransferKind::Download, hash.clone(), size));
        loop {
            let permit = match self.downloads.acquire(cancel).await {
                Ok(p) => p,
                Err(e) => return Err(record.fail(e)),
            };
            record.advance(TransferPhase::Active);
            let outcome = {
                let _active = self.downloads.activate();
                self.attempt(conn, hash, size, &record, cancel).await
            };
            drop(permit);
            let reason = match outcome {
                Ok(Ok(path)) => {
                    record.advance(TransferPhase::Completed);
                    tracing::debug!(hash = hash.as_str(), peer = peer.short(), "download complete");
                    return Ok(path);
                }
                Ok(Err(reason)) => reason,
                Err(e) => return Err(record.fail(e)),
            };
            let attempt = record.attempt();
            if !self.settings.retry.allows_retry(attempt) {
                tracing::warn!(hash = hash.as_str(), attempt, "download failed: {}", reason);
                return Err(record.fail(TransferError::Exhausted { attempts: attempt }));
            }
            tracing::debug!(hash = hash.as_str(), attempt, "download retry scheduled: {}", reason);
            record.advance(TransferPhase::RetryScheduled);
            record.reset_progress();
            tokio::select! {
                _ = tokio::time::sleep(self.settings.retry.backoff) => {}
                _ = cancel.cancelled() => return Err(record.fail(TransferError::Cancelled)),
            }
            record.advance(TransferPhase::Waiting);
        }
    }

    /// One request/receive/verify round. The partial file never outlives a failed attempt.
    async fn attempt(
        &self,
        conn: &Connection,
        hash: &ContentHash,
        size: Option<u64>,
        record: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> Result<Result<PathBuf, Retry>, TransferError> {
        let mut route = self.open_route(conn)?;
        let tag = format!("dl{}", self.scratch.fetch_add(1, Ordering::Relaxed));
        let partial = self.cache.partial_path(hash, &tag);
        let received = self
            .receive(conn, hash, size, &mut route, &partial, record, cancel)
            .await;
        drop(route);
        let committed = match received {
            Ok(Ok(())) => self.cache.commit(&partial, hash).await.map_err(Into::into),
            Ok(Err(retry)) => {
                let _ = fs::remove_file(&partial).await;
                return Ok(Err(retry));
            }
            Err(e) => Err(e),
        };
        match committed {
            Ok(_) => Ok(Ok(self.cache.get(hash))),
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn receive(
        &self,
        conn: &Connection,
        hash: &ContentHash,
        size: Option<u64>,
        route: &mut Route<'_>,
        partial: &Path,
        record: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> Result<Result<(), Retry>, TransferError> {
        let mut file = File::create(partial).await?;
        let request = Packet::FileRequest {
            slot: route.slot,
            hash: hash.clone(),
        };
        conn.send_packet(&request)
            .await
            .map_err(|_| TransferError::Disconnected)?;
        let mut hasher = ContentHasher::new();
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                c = route.rx.recv() => c,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(self.settings.chunk_timeout) => return Ok(Err(Retry::Stalled)),
            };
            let Some(chunk) = chunk else {
                return Err(TransferError::Disconnected);
            };
            match classify(&chunk) {
                ChunkEvent::Data(bytes) => {
                    written += bytes.len() as u64;
                    if let Some(limit) = size.filter(|limit| written > *limit) {
                        return Ok(Err(Retry::Oversize { limit }));
                    }
                    file.write_all(bytes).await?;
                    hasher.update(bytes);
                    record.add_bytes(bytes.len() as u64);
                }
                ChunkEvent::End => break,
            }
        }
        file.flush().await?;
        drop(file);
        let got = hasher.finish();
        if got != *hash {
            return Ok(Err(Retry::Mismatch(got)));
        }
        Ok(Ok(()))
    }

    /// Serve `hash` to `peer` on `slot`. A missing entry or unusable cache sends only the
    /// terminator. Returns the bytes sent.
    pub async fn upload(
        &self,
        peer: &Fingerprint,
        conn: &Arc<Connection>,
        slot: u8,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let record = self
            .progress
            .start(peer, TransferRecord::new(TransferKind::Upload, hash.clone(), None));
        let permit = match self.uploads.acquire(cancel).await {
            Ok(p) => p,
            Err(e) => return Err(record.fail(e)),
        };
        record.advance(TransferPhase::Active);
        let sent = {
            let _active = self.uploads.activate();
            self.stream(conn, slot, hash, &record, cancel).await
        };
        drop(permit);
        match sent {
            Ok(n) => {
                record.advance(TransferPhase::Completed);
                tracing::debug!(hash = hash.as_str(), peer = peer.short(), bytes = n, "upload complete");
                Ok(n)
            }
            Err(e) => Err(record.fail(e)),
        }
    }

    async fn stream(
        &self,
        conn: &Connection,
        slot: u8,
        hash: &ContentHash,
        record: &ProgressHandle,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let opened = self
            .cache
            .open_shared(hash, self.settings.read_retries, self.settings.read_retry_delay)
            .await;
        let mut sent = 0u64;
        match opened {
            Ok(Some((mut file, len))) => {
                record.set_total(len);
                // Byte 0 is the slot; file data is read in behind it.
                let mut buf = vec![0u8; 1 + self.settings.chunk_size];
                buf[0] = slot;
                loop {
                    if cancel.is_cancelled() {
                        return Err(TransferError::Cancelled);
                    }
                    let n = file.read(&mut buf[1..]).await?;
                    if n == 0 {
                        break;
                    }
                    self.send_chunk(conn, &buf[..1 + n]).await?;
                    sent += n as u64;
                    record.add_bytes(n as u64);
                    if !self.settings.chunk_delay.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(self.settings.chunk_delay) => {}
                            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        }
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(hash = hash.as_str(), "requested file not cached");
            }
            Err(e) => {
                tracing::warn!(hash = hash.as_str(), "cannot read cached file: {}", e);
            }
        }
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.send_chunk(conn, &[slot]).await?;
        Ok(sent)
    }

    /// A started frame is always written whole; cancellation is checked between chunks.
    async fn send_chunk(&self, conn: &Connection, payload: &[u8]) -> Result<(), TransferError> {
        conn.send(PacketType::FileChunk, payload)
            .await
            .map_err(|_| TransferError::Disconnected)
    }
}

/// Registered chunk handler for one slot. Dropping it unregisters the handler and frees the slot.
struct Route<'a> {
    queue: &'a TransferQueue,
    conn: ConnectionId,
    slot: u8,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Drop for Route<'_> {
    fn drop(&mut self) {
        let mut routes = crate::lock(&self.queue.routes);
        if let Some(entry) = routes.get_mut(&self.conn) {
            entry.handlers.remove(&self.slot);
            entry.slots.release(self.slot);
        }
    }
}

struct ActiveGuard<'a> {
    lane: &'a Lane,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.lane.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressTotals {
    pub transfers: usize,
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerProgress {
    pub uploads: ProgressTotals,
    pub downloads: ProgressTotals,
}

/// Per-peer view of every live transfer.
#[derive(Default)]
pub struct ProgressBoard {
    entries: Mutex<HashMap<u64, (Fingerprint, TransferRecord)>>,
    next: AtomicU64,
}

impl ProgressBoard {
    fn start(self: &Arc<Self>, peer: &Fingerprint, record: TransferRecord) -> ProgressHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        crate::lock(&self.entries).insert(id, (peer.clone(), record));
        ProgressHandle {
            board: self.clone(),
            id,
        }
    }

    /// Live transfers with `peer`.
    pub fn records(&self, peer: &Fingerprint) -> Vec<TransferRecord> {
        crate::lock(&self.entries)
            .values()
            .filter(|(p, _)| p == peer)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn snapshot(&self, peer: &Fingerprint) -> PeerProgress {
        let mut out = PeerProgress::default();
        for (p, r) in crate::lock(&self.entries).values() {
            if p != peer {
                continue;
            }
            let totals = match r.kind {
                TransferKind::Upload => &mut out.uploads,
                TransferKind::Download => &mut out.downloads,
            };
            totals.transfers += 1;
            totals.current += r.transferred;
            totals.total += r.total.unwrap_or(0);
        }
        out
    }
}

/// A transfer's entry on the board; removed on drop.
struct ProgressHandle {
    board: Arc<ProgressBoard>,
    id: u64,
}

impl ProgressHandle {
    fn update<R>(&self, f: impl FnOnce(&mut TransferRecord) -> R) -> Option<R> {
        crate::lock(&self.board.entries)
            .get_mut(&self.id)
            .map(|(_, r)| f(r))
    }

    fn advance(&self, next: TransferPhase) {
        if let Some(Err(e)) = self.update(|r| r.advance(next)) {
            tracing::warn!("{}", e);
        }
    }

    fn fail(&self, e: TransferError) -> TransferError {
        self.advance(TransferPhase::Failed);
        e
    }

    fn attempt(&self) -> u32 {
        self.update(|r| r.attempt).unwrap_or(1)
    }

    fn add_bytes(&self, n: u64) {
        self.update(|r| r.add_bytes(n));
    }

    fn reset_progress(&self) {
        self.update(|r| r.reset_progress());
    }

    fn set_total(&self, total: u64) {
        self.update(|r| r.total = Some(total));
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        crate::lock(&self.board.entries).remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NetEvent;
    use crate::manager::ConnectionManager;
    use mirror_core::integrity::hash_bytes;
    use tempfile::TempDir;

    struct Side {
        queue: Arc<TransferQueue>,
        conn: Arc<Connection>,
        manager: Arc<ConnectionManager>,
        _dir: TempDir,
    }

    fn peer() -> Fingerprint {
        Fingerprint::derive("peer", "world", "secret")
    }

    fn fast(max_attempts: u32) -> TransferSettings {
        TransferSettings {
            chunk_delay: Duration::ZERO,
            chunk_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts,
                backoff: Duration::from_millis(20),
            },
            ..TransferSettings::default()
        }
    }

    /// Routes file frames the way the node does: requests start uploads, chunks go to
    /// their route, a disconnect drops the connection's routes.
    fn pump(queue: Arc<TransferQueue>, conn: Arc<Connection>, mut rx: mpsc::Receiver<NetEvent>) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    NetEvent::Received {
                        packet_type,
                        payload,
                        ..
                    } => match Packet::decode(packet_type, &payload) {
                        Ok(Packet::FileRequest { slot, hash }) => {
                            let (q, c) = (queue.clone(), conn.clone());
                            tokio::spawn(async move {
                                let _ = q
                                    .upload(&peer(), &c, slot, &hash, &CancellationToken::new())
                                    .await;
                            });
                        }
                        Ok(Packet::FileChunk { slot, data }) => {
                            queue.deliver(conn.id(), slot, data).await;
                        }
                        _ => {}
                    },
                    NetEvent::Disconnected(id) => queue.on_connection_closed(id),
                    NetEvent::Incoming(_) | NetEvent::Outgoing { .. } => {}
                }
            }
        });
    }

    async fn linked(a: TransferSettings, b: TransferSettings) -> (Side, Side) {
        let (mb, mut rx_b) = ConnectionManager::new();
        let addr = mb.listen_on("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let (ma, rx_a) = ConnectionManager::new();
        let conn_a = ma.connect(addr, Duration::from_secs(2), None).await.unwrap();
        let conn_b = match rx_b.recv().await.unwrap() {
            NetEvent::Incoming(c) => c,
            other => panic!("unexpected {other:?}"),
        };
        let mut sides = Vec::new();
        for (settings, manager, conn, rx) in [(a, ma, conn_a, rx_a), (b, mb, conn_b, rx_b)] {
            let dir = tempfile::tempdir().unwrap();
            let cache = Arc::new(ContentCache::open(dir.path()));
            let queue = Arc::new(TransferQueue::new(settings, cache));
            pump(queue.clone(), conn.clone(), rx);
            sides.push(Side {
                queue,
                conn,
                manager,
                _dir: dir,
            });
        }
        let b = sides.pop().unwrap();
        let a = sides.pop().unwrap();
        (a, b)
    }

    fn partials(side: &Side) -> usize {
        std::fs::read_dir(side.queue.cache().root().join(".partial"))
            .unwrap()
            .count()
    }

    #[tokio::test]
    async fn cached_file_downloads_and_completes() {
        let (a, b) = linked(fast(3), fast(3)).await;
        let hash = hash_bytes(b"test");
        b.queue.cache().put(&hash, b"test").await.unwrap();
        let path = a
            .queue
            .download(&peer(), &a.conn, &hash, Some(4), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"test");
        assert!(a.queue.cache().contains(&hash));
        assert_eq!(a.queue.open_routes(), 0);
        assert_eq!(partials(&a), 0);
        assert_eq!(a.queue.progress().snapshot(&peer()), PeerProgress::default());
    }

    #[tokio::test]
    async fn missing_file_schedules_retry_not_completion() {
        let (a, _b) = linked(fast(2), fast(2)).await;
        let hash = hash_bytes(b"test");
        let err = a
            .queue
            .download(&peer(), &a.conn, &hash, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Exhausted { attempts: 2 }));
        assert!(!a.queue.cache().contains(&hash));
        assert_eq!(partials(&a), 0);
    }

    #[tokio::test]
    async fn retry_picks_up_file_cached_meanwhile() {
        let mut slow_retry = fast(3);
        slow_retry.retry.backoff = Duration::from_millis(300);
        let (a, b) = linked(slow_retry, fast(3)).await;
        let hash = hash_bytes(b"late arrival");
        let queue = a.queue.clone();
        let conn = a.conn.clone();
        let h = hash.clone();
        let download = tokio::spawn(async move {
            queue
                .download(&peer(), &conn, &h, None, &CancellationToken::new())
                .await
        });
        // Wait for the first attempt to come back empty.
        loop {
            let records = a.queue.progress().records(&peer());
            if records
                .iter()
                .any(|r| r.phase() == TransferPhase::RetryScheduled)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        b.queue.cache().put(&hash, b"late arrival").await.unwrap();
        let path = download.await.unwrap().unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"late arrival");
    }

    #[tokio::test]
    async fn hash_mismatch_is_deleted_and_retried() {
        let (a, b) = linked(fast(2), fast(2)).await;
        let hash = hash_bytes(b"expected");
        // Stale entry: right name, wrong bytes.
        std::fs::write(b.queue.cache().get(&hash), b"corrupted").unwrap();
        let err = a
            .queue
            .download(&peer(), &a.conn, &hash, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Exhausted { attempts: 2 }));
        assert!(!a.queue.cache().contains(&hash));
        assert_eq!(partials(&a), 0);
    }

    #[tokio::test]
    async fn concurrency_cap_holds() {
        let mut capped = fast(3);
        capped.max_concurrent = 2;
        let mut slow = fast(3);
        slow.chunk_size = 1024;
        slow.chunk_delay = Duration::from_millis(2);
        let (a, b) = linked(capped, slow).await;
        let mut hashes = Vec::new();
        for i in 0..6u8 {
            let data = vec![i; 16 * 1024];
            let hash = hash_bytes(&data);
            b.queue.cache().put(&hash, &data).await.unwrap();
            hashes.push(hash);
        }
        let mut tasks = Vec::new();
        for hash in hashes {
            let (queue, conn) = (a.queue.clone(), a.conn.clone());
            tasks.push(tokio::spawn(async move {
                queue
                    .download(&peer(), &conn, &hash, None, &CancellationToken::new())
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(a.queue.active_peak(TransferKind::Download) <= 2);
        assert!(a.queue.active_peak(TransferKind::Download) >= 1);
        assert_eq!(a.queue.active(TransferKind::Download), 0);
        assert!(b.queue.active_peak(TransferKind::Upload) <= 4);
        assert_eq!(a.queue.cache().usage().await.unwrap().files, 6);
    }

    #[tokio::test]
    async fn cancelled_download_deletes_partial() {
        let mut slow = fast(3);
        slow.chunk_size = 512;
        slow.chunk_delay = Duration::from_millis(20);
        let (a, b) = linked(fast(3), slow).await;
        let data = vec![7u8; 64 * 1024];
        let hash = hash_bytes(&data);
        b.queue.cache().put(&hash, &data).await.unwrap();
        let cancel = CancellationToken::new();
        let (queue, conn, h, c) = (a.queue.clone(), a.conn.clone(), hash.clone(), cancel.clone());
        let download =
            tokio::spawn(async move { queue.download(&peer(), &conn, &h, None, &c).await });
        loop {
            if a.queue.progress().snapshot(&peer()).downloads.current > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let err = download.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(partials(&a), 0);
        assert_eq!(a.queue.open_routes(), 0);
        assert!(!a.queue.cache().contains(&hash));
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_download() {
        let mut slow = fast(3);
        slow.chunk_size = 512;
        slow.chunk_delay = Duration::from_millis(20);
        let (a, b) = linked(fast(3), slow).await;
        let data = vec![1u8; 64 * 1024];
        let hash = hash_bytes(&data);
        b.queue.cache().put(&hash, &data).await.unwrap();
        let (queue, conn, h) = (a.queue.clone(), a.conn.clone(), hash.clone());
        let download = tokio::spawn(async move {
            queue
                .download(&peer(), &conn, &h, None, &CancellationToken::new())
                .await
        });
        loop {
            if a.queue.progress().snapshot(&peer()).downloads.current > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        b.manager.shutdown();
        let err = download.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Disconnected));
        assert_eq!(partials(&a), 0);
        assert_eq!(a.queue.open_routes(), 0);
    }

    #[tokio::test]
    async fn late_chunk_for_unknown_slot_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TransferQueue::new(fast(1), Arc::new(ContentCache::open(dir.path())));
        assert!(!queue.deliver(9, 3, b"stray".to_vec()).await);
    }

    #[tokio::test]
    async fn peers_downloading_from_each_other_both_finish() {
        let mut settings = fast(1);
        settings.max_concurrent = 2;
        settings.chunk_timeout = Duration::from_secs(1);
        let (a, b) = linked(settings.clone(), settings).await;
        let mut tasks = Vec::new();
        for i in 0..2u8 {
            for (n, (owner, fetcher)) in [(&a, &b), (&b, &a)].into_iter().enumerate() {
                // Distinct content per owner, so neither side already has what it fetches.
                let data = vec![i * 2 + n as u8; 8 * 1024];
                let hash = hash_bytes(&data);
                owner.queue.cache().put(&hash, &data).await.unwrap();
                let (queue, conn) = (fetcher.queue.clone(), fetcher.conn.clone());
                tasks.push(tokio::spawn(async move {
                    queue
                        .download(&peer(), &conn, &hash, Some(data.len() as u64), &CancellationToken::new())
                        .await
                }));
            }
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        for side in [&a, &b] {
            assert_eq!(side.queue.cache().usage().await.unwrap().files, 4);
            assert!(side.queue.active_peak(TransferKind::Download) <= 2);
            assert!(side.queue.active_peak(TransferKind::Upload) <= 2);
        }
    }

    #[tokio::test]
    async fn cancelled_upload_leaves_connection_usable() {
        let mut slow = fast(3);
        slow.chunk_size = 512;
        slow.chunk_delay = Duration::from_millis(5);
        let (a, b) = linked(fast(3), slow).await;
        let big = vec![5u8; 64 * 1024];
        let big_hash = hash_bytes(&big);
        b.queue.cache().put(&big_hash, &big).await.unwrap();
        let cancel = CancellationToken::new();
        // Nobody on `a` waits on slot 200, so its chunks are dropped there.
        let (queue, conn, c) = (b.queue.clone(), b.conn.clone(), cancel.clone());
        let upload =
            tokio::spawn(async move { queue.upload(&peer(), &conn, 200, &big_hash, &c).await });
        loop {
            if b.queue.progress().snapshot(&peer()).uploads.current > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cancel.cancel();
        assert!(matches!(
            upload.await.unwrap(),
            Err(TransferError::Cancelled)
        ));

        // Frames after the cancelled upload still decode on the other side.
        let small = hash_bytes(b"after");
        b.queue.cache().put(&small, b"after").await.unwrap();
        let path = a
            .queue
            .download(&peer(), &a.conn, &small, Some(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"after");
        assert!(!a.conn.is_closed() && !b.conn.is_closed());
    }

    #[tokio::test]
    async fn download_larger_than_announced_is_abandoned() {
        let (a, b) = linked(fast(2), fast(2)).await;
        let data = vec![3u8; 4096];
        let hash = hash_bytes(&data);
        b.queue.cache().put(&hash, &data).await.unwrap();
        let err = a
            .queue
            .download(&peer(), &a.conn, &hash, Some(100), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Exhausted { attempts: 2 }));
        assert!(!a.queue.cache().contains(&hash));
        assert_eq!(partials(&a), 0);
        assert_eq!(a.queue.open_routes(), 0);
    }
}
