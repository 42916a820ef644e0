//! Host-driven peer links: the node passes connection events in and performs the actions
//! that come back. Each known peer has one `PeerLink`, keyed by fingerprint; connections are
//! only ever referred to by id, so a connection knows nothing about the link it is bound to.

use std::collections::HashMap;

use crate::identity::{Fingerprint, PeerIdentity};
use crate::snapshot::{StateChange, StateSnapshot};

/// Process-unique connection id assigned by the connection manager.
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// `Unbound -> Connecting -> AwaitingIdentity -> Bound -> Unbound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unbound,
    Connecting,
    AwaitingIdentity,
    Bound,
}

/// User-visible peer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Searching,
    Connecting,
    Connected,
    Offline,
    Failed,
}

/// Action for the node to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Send our `Identify` on this connection.
    SendIdentify(ConnectionId),
    /// Dispose this connection.
    Close(ConnectionId),
    /// `conn` is now the live connection for `peer`.
    Bound {
        peer: Fingerprint,
        conn: ConnectionId,
    },
    /// `peer` lost its connection; `clear` undoes the state applied from it.
    Unbound {
        peer: Fingerprint,
        conn: ConnectionId,
        clear: Vec<StateChange>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Unreachable,
    Rejected,
}

/// Per-peer state.
#[derive(Debug)]
pub struct PeerLink {
    identity: PeerIdentity,
    state: LinkState,
    bound: Option<(ConnectionId, Direction)>,
    /// Our outbound dial still waiting for the peer's `Identify`.
    dialing: Option<ConnectionId>,
    last_applied: Option<StateSnapshot>,
    failure: Option<Failure>,
}

impl PeerLink {
    fn new(identity: PeerIdentity) -> Self {
        Self {
            identity,
            state: LinkState::Unbound,
            bound: None,
            dialing: None,
            last_applied: None,
            failure: None,
        }
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn status(&self) -> PeerStatus {
        match (self.state, self.failure) {
            (LinkState::Bound, _) => PeerStatus::Connected,
            (LinkState::Connecting | LinkState::AwaitingIdentity, _) => PeerStatus::Connecting,
            (LinkState::Unbound, None) => PeerStatus::Searching,
            (LinkState::Unbound, Some(Failure::Unreachable)) => PeerStatus::Offline,
            (LinkState::Unbound, Some(Failure::Rejected)) => PeerStatus::Failed,
        }
    }

    /// State after losing the bound connection or an outbound attempt.
    fn settle(&mut self) {
        self.state = if self.bound.is_some() {
            LinkState::Bound
        } else if self.dialing.is_some() {
            LinkState::AwaitingIdentity
        } else {
            LinkState::Unbound
        };
    }
}

#[derive(Debug)]
struct Pending {
    direction: Direction,
    dialed_for: Option<Fingerprint>,
}

/// Every peer link plus the connections that have not identified yet.
pub struct LinkTable {
    local: Fingerprint,
    links: HashMap<Fingerprint, PeerLink>,
    pending: HashMap<ConnectionId, Pending>,
    bound: HashMap<ConnectionId, Fingerprint>,
}

impl LinkTable {
    pub fn new(local: Fingerprint) -> Self {
        Self {
            local,
            links: HashMap::new(),
            pending: HashMap::new(),
            bound: HashMap::new(),
        }
    }

    /// Register a trusted peer. Returns its fingerprint under `secret`.
    pub fn add_peer(&mut self, identity: PeerIdentity, secret: &str) -> Fingerprint {
        let fp = identity.fingerprint(secret);
        self.links
            .entry(fp.clone())
            .or_insert_with(|| PeerLink::new(identity));
        fp
    }

    pub fn link(&self, peer: &Fingerprint) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    /// Peers with no connection and no attempt in flight.
    pub fn peers_to_dial(&self) -> Vec<(Fingerprint, PeerIdentity)> {
        self.links
            .iter()
            .filter(|(_, l)| l.state == LinkState::Unbound)
            .map(|(fp, l)| (fp.clone(), l.identity.clone()))
            .collect()
    }

    /// Enter `Connecting`. Returns false if the peer is unknown or not `Unbound`.
    pub fn begin_connecting(&mut self, peer: &Fingerprint) -> bool {
        match self.links.get_mut(peer) {
            Some(link) if link.state == LinkState::Unbound => {
                link.state = LinkState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// The dial (or address lookup) for `peer` produced no connection.
    pub fn connect_failed(&mut self, peer: &Fingerprint) {
        if let Some(link) = self.links.get_mut(peer) {
            if link.state == LinkState::Connecting {
                link.state = LinkState::Unbound;
                link.failure = Some(Failure::Unreachable);
            }
        }
    }

    /// A connection became available. Outbound dials name the peer they were made for.
    pub fn on_connected(
        &mut self,
        conn: ConnectionId,
        direction: Direction,
        dialed_for: Option<&Fingerprint>,
    ) -> Vec<LinkAction> {
        if let Some(peer) = dialed_for {
            if let Some(link) = self.links.get_mut(peer) {
                if link.dialing.is_none() {
                    link.dialing = Some(conn);
                }
                if link.state == LinkState::Connecting {
                    link.state = LinkState::AwaitingIdentity;
                }
            }
        }
        self.pending.insert(
            conn,
            Pending {
                direction,
                dialed_for: dialed_for.cloned(),
            },
        );
        vec![LinkAction::SendIdentify(conn)]
    }

    /// The peer on `conn` identified itself.
    pub fn on_identify(&mut self, conn: ConnectionId, peer: &Fingerprint) -> Vec<LinkAction> {
        let Some(pending) = self.pending.remove(&conn) else {
            // Repeated Identify on a bound connection, or a connection we already dropped.
            return vec![];
        };
        let mut actions = Vec::new();
        if let Some(target) = &pending.dialed_for {
            if let Some(link) = self.links.get_mut(target) {
                if link.dialing == Some(conn) {
                    link.dialing = None;
                    if target != peer {
                        link.failure = Some(Failure::Rejected);
                    }
                    link.settle();
                }
            }
        }
        if *peer == self.local || pending.dialed_for.as_ref().is_some_and(|t| t != peer) {
            actions.push(LinkAction::Close(conn));
            return actions;
        }
        let canonical = self.canonical_direction(peer);
        let Some(link) = self.links.get_mut(peer) else {
            tracing::debug!(conn, peer = peer.short(), "identify from unknown peer");
            actions.push(LinkAction::Close(conn));
            return actions;
        };
        match link.bound {
            None => {
                link.bound = Some((conn, pending.direction));
                link.state = LinkState::Bound;
                link.failure = None;
                self.bound.insert(conn, peer.clone());
                tracing::info!(conn, peer = %link.identity, direction = ?pending.direction, "peer bound");
                actions.push(LinkAction::Bound {
                    peer: peer.clone(),
                    conn,
                });
            }
            Some((current, current_dir))
                if pending.direction == canonical && current_dir != canonical =>
            {
                link.bound = Some((conn, pending.direction));
                self.bound.remove(&current);
                self.bound.insert(conn, peer.clone());
                tracing::info!(
                    conn,
                    replaced = current,
                    peer = %link.identity,
                    "peer rebound to canonical connection"
                );
                actions.push(LinkAction::Close(current));
                actions.push(LinkAction::Bound {
                    peer: peer.clone(),
                    conn,
                });
            }
            Some(_) => actions.push(LinkAction::Close(conn)),
        }
        actions
    }

    /// The canonical socket of a pair is the one dialed by the smaller fingerprint.
    fn canonical_direction(&self, peer: &Fingerprint) -> Direction {
        if self.local < *peer {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }

    /// A connection closed.
    pub fn on_disconnected(&mut self, conn: ConnectionId) -> Vec<LinkAction> {
        if let Some(pending) = self.pending.remove(&conn) {
            if let Some(target) = pending.dialed_for {
                if let Some(link) = self.links.get_mut(&target) {
                    if link.dialing == Some(conn) {
                        link.dialing = None;
                        if link.bound.is_none() {
                            link.failure = Some(Failure::Unreachable);
                        }
                        link.settle();
                    }
                }
            }
            return vec![];
        }
        match self.bound.remove(&conn) {
            Some(peer) => self.unbind(&peer, conn, None),
            None => vec![],
        }
    }

    /// The connection did not identify in time.
    pub fn handshake_timed_out(&mut self, conn: ConnectionId) -> Vec<LinkAction> {
        if !self.pending.contains_key(&conn) {
            return vec![];
        }
        let mut actions = self.on_disconnected(conn);
        actions.push(LinkAction::Close(conn));
        actions
    }

    /// The host says this peer is no longer present: tear the link down regardless of socket health.
    pub fn liveness_failed(&mut self, peer: &Fingerprint) -> Vec<LinkAction> {
        let Some(conn) = self.bound_connection(peer) else {
            return vec![];
        };
        self.bound.remove(&conn);
        let mut actions = vec![LinkAction::Close(conn)];
        actions.extend(self.unbind(peer, conn, Some(Failure::Rejected)));
        actions
    }

    fn unbind(
        &mut self,
        peer: &Fingerprint,
        conn: ConnectionId,
        failure: Option<Failure>,
    ) -> Vec<LinkAction> {
        let Some(link) = self.links.get_mut(peer) else {
            return vec![];
        };
        link.bound = None;
        link.failure = failure;
        link.settle();
        let clear = link
            .last_applied
            .take()
            .map(|s| s.clearing())
            .unwrap_or_default();
        tracing::info!(conn, peer = %link.identity, "peer unbound");
        vec![LinkAction::Unbound {
            peer: peer.clone(),
            conn,
            clear,
        }]
    }

    /// Peer bound to `conn`, if any.
    pub fn peer_for(&self, conn: ConnectionId) -> Option<&Fingerprint> {
        self.bound.get(&conn)
    }

    pub fn bound_connection(&self, peer: &Fingerprint) -> Option<ConnectionId> {
        self.links
            .get(peer)
            .and_then(|l| l.bound.map(|(conn, _)| conn))
    }

    pub fn bound_peers(&self) -> Vec<(Fingerprint, PeerIdentity, ConnectionId)> {
        self.links
            .iter()
            .filter_map(|(fp, l)| {
                l.bound
                    .map(|(conn, _)| (fp.clone(), l.identity.clone(), conn))
            })
            .collect()
    }

    /// Record a snapshot received from `peer` and return what has to be applied.
    /// None if the peer is not bound.
    pub fn stage_snapshot(
        &mut self,
        peer: &Fingerprint,
        snapshot: StateSnapshot,
    ) -> Option<Vec<StateChange>> {
        let link = self.links.get_mut(peer)?;
        if link.state != LinkState::Bound {
            return None;
        }
        let changes = snapshot.diff(link.last_applied.as_ref());
        link.last_applied = Some(snapshot);
        Some(changes)
    }

    pub fn status(&self, peer: &Fingerprint) -> Option<PeerStatus> {
        self.links.get(peer).map(PeerLink::status)
    }

    pub fn statuses(&self) -> Vec<(PeerIdentity, PeerStatus)> {
        let mut out: Vec<_> = self
            .links
            .values()
            .map(|l| (l.identity.clone(), l.status()))
            .collect();
        out.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        out
    }
}
