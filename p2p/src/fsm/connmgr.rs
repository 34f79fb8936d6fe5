//! Outbound connection manager.
//!
//! Decides who to dial and when: maintains the outbound, added-node and
//! feeler budgets, drains the one-shot queue, retries user-added nodes with
//! backoff, and keeps outbound connections spread over distinct network
//! groups.
use std::collections::VecDeque;
use std::fmt;
use std::net;

use log::*;

use ferrite_net::{Link, LocalDuration, LocalTime};

use ferrite_common::collections::HashMap;

use crate::store::Store;
use crate::wire::NetAddress;

use super::addrmgr::{self, AddressManager};
use super::banmgr::{self, BanManager};
use super::output::{Connect, Disconnect, Wakeup, Wire};
use super::peermgr::{self, PeerManager};
use super::{ConnKind, DisconnectReason, PeerId};

/// Hard ceiling on the number of automatic outbound connections.
pub const MAX_OUTBOUND_CONNECTIONS: usize = 64;
/// Default number of outbound connections to maintain.
pub const TARGET_OUTBOUND_PEERS: usize = 8;
/// Maximum number of added-node connections.
pub const MAX_ADDNODE_CONNECTIONS: usize = 8;

/// Run one feeler probe per this interval.
pub const FEELER_INTERVAL: LocalDuration = LocalDuration::from_secs(120);
/// Time to wait for a dial to complete.
pub const CONNECTION_TIMEOUT: LocalDuration = LocalDuration::from_secs(6);
/// Don't re-attempt a given address more often than this.
pub const ATTEMPT_INTERVAL: LocalDuration = LocalDuration::from_mins(10);
/// Time between maintenance passes.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);

/// Initial retry delay for added nodes.
const ADDNODE_RETRY_MIN: LocalDuration = LocalDuration::from_secs(60);
/// Retry delay ceiling for added nodes.
const ADDNODE_RETRY_MAX: LocalDuration = LocalDuration::from_mins(30);

/// How many draws from the address manager to try before giving up on a
/// maintenance pass.
const SELECT_TRIES: usize = 100;

/// An event originating in the connection manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer is being dialed.
    Dialing(PeerId, ConnKind),
    /// A connection request is waiting for a free outbound slot.
    Queued(PeerId),
    /// The address book has no usable addresses left.
    AddressBookExhausted,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Dialing(addr, kind) => write!(f, "dialing {} ({})", addr, kind),
            Event::Queued(addr) => write!(f, "{} queued for a free outbound slot", addr),
            Event::AddressBookExhausted => {
                write!(f, "address book exhausted when attempting to connect")
            }
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of outbound connections to maintain.
    pub target_outbound: usize,
    /// If non-empty, connect to these peers only.
    pub connect: Vec<net::SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_outbound: TARGET_OUTBOUND_PEERS,
            connect: Vec::new(),
        }
    }
}

/// A counting budget for a kind of connection slot.
#[derive(Debug)]
struct Slots {
    limit: usize,
    used: usize,
}

impl Slots {
    fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    fn available(&self) -> bool {
        self.used < self.limit
    }

    fn acquire(&mut self) {
        debug_assert!(self.used < self.limit);
        self.used += 1;
    }

    fn release(&mut self) {
        debug_assert!(self.used > 0);
        self.used = self.used.saturating_sub(1);
    }
}

/// A user-added node, retried with backoff for as long as it is listed.
#[derive(Debug)]
struct AddedNode {
    name: String,
    addrs: Vec<net::SocketAddr>,
    next_attempt: LocalTime,
    backoff: LocalDuration,
    peer: Option<PeerId>,
}

/// Manages outbound connections.
#[derive(Debug)]
pub struct ConnectionManager<U> {
    /// Configuration.
    pub config: Config,
    outbound: Slots,
    addnode: Slots,
    feeler_active: bool,
    last_feeler: Option<LocalTime>,
    /// Dials in flight, with the time they started.
    dialing: HashMap<PeerId, (ConnKind, LocalTime)>,
    /// Established connections holding a slot grant.
    connected: HashMap<PeerId, ConnKind>,
    /// Connection requests waiting for a free slot.
    pending: VecDeque<PeerId>,
    /// Addresses to connect to exactly once.
    one_shots: VecDeque<PeerId>,
    added_nodes: Vec<AddedNode>,
    /// When each address was last dialed.
    last_attempt: HashMap<net::SocketAddr, LocalTime>,
    rng: fastrand::Rng,
    upstream: U,
}

impl<U: Connect + Disconnect + Wakeup + Wire<Event>> ConnectionManager<U> {
    /// Create a new connection manager. The outbound budget is clamped to
    /// [`MAX_OUTBOUND_CONNECTIONS`].
    pub fn new(mut config: Config, rng: fastrand::Rng, upstream: U) -> Self {
        config.target_outbound = config.target_outbound.min(MAX_OUTBOUND_CONNECTIONS);

        Self {
            outbound: Slots::new(config.target_outbound),
            addnode: Slots::new(MAX_ADDNODE_CONNECTIONS),
            config,
            feeler_active: false,
            last_feeler: None,
            dialing: HashMap::with_hasher(rng.clone().into()),
            connected: HashMap::with_hasher(rng.clone().into()),
            pending: VecDeque::new(),
            one_shots: VecDeque::new(),
            added_nodes: Vec::new(),
            last_attempt: HashMap::with_hasher(rng.clone().into()),
            rng,
            upstream,
        }
    }

    /// Initialize the manager: schedule the first maintenance pass.
    pub fn initialize(&mut self, now: LocalTime) {
        self.last_feeler = Some(now);
        self.upstream.wakeup(IDLE_TIMEOUT);
    }

    /// Request an outbound connection, honoring the outbound budget. If no
    /// slot is free, the request is queued until one frees up.
    pub fn connect(&mut self, addr: PeerId, now: LocalTime) {
        if self.is_dialing(&addr) || self.connected.contains_key(&addr) {
            return;
        }
        if self.outbound.available() {
            self.dial(addr, ConnKind::Manual, now);
        } else {
            self.upstream.event(Event::Queued(addr));
            self.pending.push_back(addr);
        }
    }

    /// Queue an address for a one-shot connection.
    pub fn add_one_shot(&mut self, addr: PeerId) {
        self.one_shots.push_back(addr);
    }

    /// Add a node to the added-node list. Returns `false` if the name is
    /// already listed.
    pub fn add_node(&mut self, name: String, addrs: Vec<net::SocketAddr>, now: LocalTime) -> bool {
        if self.added_nodes.iter().any(|n| n.name == name) {
            return false;
        }
        self.added_nodes.push(AddedNode {
            name,
            addrs,
            next_attempt: now,
            backoff: ADDNODE_RETRY_MIN,
            peer: None,
        });
        self.upstream.wakeup(LocalDuration::from_secs(1));

        true
    }

    /// Remove a node from the added-node list. Returns the connected peer
    /// to disconnect, if there is one.
    pub fn remove_node(&mut self, name: &str) -> Option<Option<PeerId>> {
        let ix = self.added_nodes.iter().position(|n| n.name == name)?;
        let node = self.added_nodes.remove(ix);

        Some(node.peer)
    }

    /// Whether we are currently dialing the given address.
    pub fn is_dialing(&self, addr: &PeerId) -> bool {
        self.dialing.contains_key(addr)
    }

    /// Called when a connection is established. Returns what kind of
    /// connection it is.
    pub fn peer_connected(&mut self, addr: PeerId, link: Link) -> ConnKind {
        if link.is_inbound() {
            return ConnKind::Inbound;
        }
        let kind = self
            .dialing
            .remove(&addr)
            .map(|(kind, _)| kind)
            .unwrap_or(ConnKind::Outbound);

        self.connected.insert(addr, kind);
        kind
    }

    /// Called when a peer completes its handshake.
    pub fn peer_negotiated(&mut self, addr: &PeerId) {
        for node in self.added_nodes.iter_mut() {
            if node.addrs.contains(addr) {
                node.peer = Some(*addr);
                node.backoff = ADDNODE_RETRY_MIN;
            }
        }
    }

    /// Called when a peer disconnected, or a dial failed. Releases the slot
    /// grant held by the connection and pumps the pending queue.
    pub fn peer_disconnected(&mut self, addr: &PeerId, now: LocalTime) {
        let kind = self
            .dialing
            .remove(addr)
            .map(|(kind, _)| kind)
            .or_else(|| self.connected.remove(addr));

        match kind {
            Some(ConnKind::Feeler) => {
                self.feeler_active = false;
            }
            Some(ConnKind::AddedNode) => {
                self.addnode.release();

                for node in self.added_nodes.iter_mut() {
                    if node.addrs.contains(addr) {
                        node.peer = None;
                        node.next_attempt = now + node.backoff;
                        node.backoff = (node.backoff * 2).min(ADDNODE_RETRY_MAX);
                    }
                }
            }
            Some(ConnKind::Outbound) | Some(ConnKind::Manual) | Some(ConnKind::OneShot) => {
                self.outbound.release();

                while self.outbound.available() {
                    match self.pending.pop_front() {
                        Some(next) if !self.connected.contains_key(&next) => {
                            self.dial(next, ConnKind::Manual, now);
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }
            }
            Some(ConnKind::Inbound) | None => {}
        }
    }

    /// Called when a timer rings: expire stuck dials, retry added nodes and
    /// run a maintenance pass.
    pub fn received_wake<P, Q, A, B, C>(
        &mut self,
        addrs: &mut AddressManager<P, A>,
        peers: &PeerManager<B>,
        bans: &BanManager<Q, C>,
        now: LocalTime,
    ) where
        P: Store,
        Q: Store,
        A: Wire<addrmgr::Event> + Wakeup,
        B: Wire<peermgr::Event> + Wakeup + Disconnect,
        C: Wire<banmgr::Event> + Wakeup,
    {
        // Give up on dials that have been in flight for too long.
        let stuck: Vec<PeerId> = self
            .dialing
            .iter()
            .filter(|(_, (_, since))| now - *since >= CONNECTION_TIMEOUT)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stuck {
            self.upstream
                .disconnect(addr, DisconnectReason::PeerTimeout("connect"));
        }

        // Added nodes that are due for a retry.
        let due: Vec<(String, Vec<net::SocketAddr>)> = self
            .added_nodes
            .iter()
            .filter(|n| n.peer.is_none() && n.next_attempt <= now)
            .map(|n| (n.name.clone(), n.addrs.clone()))
            .collect();

        for (name, node_addrs) in due {
            if !self.addnode.available() {
                break;
            }
            let already = node_addrs
                .iter()
                .any(|a| self.is_dialing(a) || self.connected.contains_key(a));
            if already {
                continue;
            }
            if let Some(addr) = node_addrs.first() {
                debug!(target: "p2p", "Retrying added node {} at {}", name, addr);
                self.dial(*addr, ConnKind::AddedNode, now);
            }
        }

        self.maintain(addrs, peers, bans, now);
        self.upstream.wakeup(IDLE_TIMEOUT);
    }

    /// The maintenance pass: drain one-shots, run feelers and fill free
    /// outbound slots from the address manager.
    pub fn maintain<P, Q, A, B, C>(
        &mut self,
        addrs: &mut AddressManager<P, A>,
        peers: &PeerManager<B>,
        bans: &BanManager<Q, C>,
        now: LocalTime,
    ) where
        P: Store,
        Q: Store,
        A: Wire<addrmgr::Event> + Wakeup,
        B: Wire<peermgr::Event> + Wakeup + Disconnect,
        C: Wire<banmgr::Event> + Wakeup,
    {
        // One-shots are drained first; each address is attempted exactly
        // once.
        while self.outbound.available() {
            match self.one_shots.pop_front() {
                Some(addr) if !peers.is_connected(&addr) && !self.is_dialing(&addr) => {
                    self.dial(addr, ConnKind::OneShot, now);
                }
                Some(_) => continue,
                None => break,
            }
        }

        // With `connect`, the peer set is pinned to the given addresses.
        if !self.config.connect.is_empty() {
            let targets = self.config.connect.clone();
            for addr in targets {
                if self.outbound.available()
                    && !peers.is_connected(&addr)
                    && !self.is_dialing(&addr)
                    && !self.connected.contains_key(&addr)
                {
                    self.dial(addr, ConnKind::Manual, now);
                }
            }
            return;
        }

        // Periodically probe an untried address with a short-lived feeler
        // connection, to validate entries in the new table.
        if !self.feeler_active
            && now - self.last_feeler.unwrap_or_default() >= FEELER_INTERVAL
        {
            if let Some(addr) = self.select(addrs, peers, bans, true, now) {
                self.last_feeler = Some(now);
                self.feeler_active = true;
                self.dial(addr, ConnKind::Feeler, now);
            }
        }

        // Fill free outbound slots.
        while self.outbound.available() {
            match self.select(addrs, peers, bans, false, now) {
                Some(addr) => self.dial(addr, ConnKind::Outbound, now),
                None => {
                    if !addrs.is_empty() {
                        self.upstream.event(Event::AddressBookExhausted);
                    }
                    break;
                }
            }
        }
    }

    /// Draw a dialable address from the address manager: not banned, not
    /// connected, not recently attempted, and not in a network group we
    /// already have an outbound peer in (feelers exempt).
    fn select<P, Q, A, B, C>(
        &mut self,
        addrs: &mut AddressManager<P, A>,
        peers: &PeerManager<B>,
        bans: &BanManager<Q, C>,
        feeler: bool,
        now: LocalTime,
    ) -> Option<PeerId>
    where
        P: Store,
        Q: Store,
        A: Wire<addrmgr::Event> + Wakeup,
        B: Wire<peermgr::Event> + Wakeup + Disconnect,
        C: Wire<banmgr::Event> + Wakeup,
    {
        let groups = peers.outbound_groups();

        for _ in 0..SELECT_TRIES {
            let (address, _source) = addrs.select(feeler, now)?;
            let sock_addr = address.socket_addr();
            let ip = address.service.ip;

            if bans.is_banned(&ip, now) {
                continue;
            }
            if peers.is_connected(&sock_addr)
                || self.is_dialing(&sock_addr)
                || self.connected.contains_key(&sock_addr)
            {
                continue;
            }
            if now - self.last_attempt.get(&sock_addr).copied().unwrap_or_default()
                < ATTEMPT_INTERVAL
            {
                continue;
            }
            // At most one outbound peer per network group. Feelers are
            // exempt, both as candidates and as already-dialing entries.
            if !feeler {
                let group = ip.group();

                if groups.contains(&group) {
                    continue;
                }
                if self.dialing.iter().any(|(a, (kind, _))| {
                    !kind.is_feeler() && NetAddress(a.ip()).group() == group
                }) {
                    continue;
                }
            }
            return Some(sock_addr);
        }
        None
    }

    fn dial(&mut self, addr: PeerId, kind: ConnKind, now: LocalTime) {
        if !kind.is_feeler() {
            match kind {
                ConnKind::AddedNode => self.addnode.acquire(),
                _ => self.outbound.acquire(),
            }
        }
        self.dialing.insert(addr, (kind, now));
        self.last_attempt.insert(addr, now);
        self.upstream.event(Event::Dialing(addr, kind));
        self.upstream.connect(addr, CONNECTION_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::{test, Io, Outbox};
    use crate::store::Memory;
    use crate::wire::Address;
    use ferrite_common::services::ServiceFlags;

    type Addrs = AddressManager<Memory, Outbox>;
    type Peers = PeerManager<Outbox>;
    type Bans = BanManager<Memory, Outbox>;

    fn setup(target_outbound: usize) -> (ConnectionManager<Outbox>, Addrs, Peers, Bans, Outbox) {
        let outbox = Outbox::new(0xF9BE_B4D9);
        let rng = fastrand::Rng::with_seed(41);

        let connmgr = ConnectionManager::new(
            Config {
                target_outbound,
                connect: Vec::new(),
            },
            rng.clone(),
            outbox.clone(),
        );
        let addrs = AddressManager::new(Memory::default(), rng.clone(), outbox.clone());
        let peers = PeerManager::new(
            peermgr::Config {
                protocol_version: 70012,
                min_protocol_version: 70001,
                services: ServiceFlags::NETWORK,
                required_services: ServiceFlags::NETWORK,
                user_agent: "/test:0.1.0/",
                max_inbound: 8,
                whitelist: Default::default(),
                relay: true,
                height: 0,
            },
            rng.clone(),
            outbox.clone(),
        );
        let bans = BanManager::new(Memory::default(), rng, outbox.clone());

        (connmgr, addrs, peers, bans, outbox)
    }

    fn connects(outbox: &mut Outbox) -> Vec<PeerId> {
        outbox
            .drain()
            .into_iter()
            .filter_map(|io| match io {
                Io::Connect(addr) => Some(addr),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_slot_exhaustion_queues_requests() {
        let (mut connmgr, _addrs, _peers, _bans, mut outbox) = setup(2);
        let now = LocalTime::from_secs(1_700_000_000);

        let a: PeerId = ([11, 11, 11, 11], 9333).into();
        let b: PeerId = ([22, 22, 22, 22], 9333).into();
        let c: PeerId = ([33, 33, 33, 33], 9333).into();

        connmgr.connect(a, now);
        connmgr.connect(b, now);
        connmgr.connect(c, now);

        // Only two dials go out; the third waits on the budget.
        assert_eq!(connects(&mut outbox), vec![a, b]);

        connmgr.peer_connected(a, Link::Outbound);
        connmgr.peer_connected(b, Link::Outbound);

        // A slot frees up; the queued request proceeds.
        connmgr.peer_disconnected(&a, now);
        assert_eq!(connects(&mut outbox), vec![c]);
    }

    #[test]
    fn test_outbound_budget_is_never_exceeded() {
        let (mut connmgr, mut addrs, peers, bans, mut outbox) = setup(4);
        let now = LocalTime::from_secs(1_700_000_000);
        let seen = now.as_secs() as u32;

        addrs.initialize(now);
        for i in 0..32u8 {
            addrs.add(
                Address::new(&([50 + i, i, 1, 1], 9333).into(), ServiceFlags::NETWORK),
                seen,
                addrmgr::Source::Dns,
                LocalDuration::from_secs(0),
                now,
            );
        }
        outbox.drain();

        connmgr.initialize(now);
        connmgr.maintain(&mut addrs, &peers, &bans, now);

        assert_eq!(connects(&mut outbox).len(), 4);

        // Another pass doesn't dial more while the slots are taken.
        connmgr.maintain(&mut addrs, &peers, &bans, now);
        assert!(connects(&mut outbox).is_empty());
    }

    #[test]
    fn test_one_outbound_peer_per_group() {
        let (mut connmgr, mut addrs, peers, bans, mut outbox) = setup(8);
        let now = LocalTime::from_secs(1_700_000_000);
        let seen = now.as_secs() as u32;

        addrs.initialize(now);
        // Four addresses, all in 60.1.0.0/16.
        for i in 0..4u8 {
            addrs.add(
                Address::new(&([60, 1, i, 1], 9333).into(), ServiceFlags::NETWORK),
                seen,
                addrmgr::Source::Dns,
                LocalDuration::from_secs(0),
                now,
            );
        }
        connmgr.initialize(now);
        outbox.drain();

        connmgr.maintain(&mut addrs, &peers, &bans, now);

        assert_eq!(
            connects(&mut outbox).len(),
            1,
            "only one dial per network group"
        );
    }

    #[test]
    fn test_feeler_cadence() {
        let (mut connmgr, mut addrs, peers, bans, mut outbox) = setup(1);
        let now = LocalTime::from_secs(1_700_000_000);
        let seen = now.as_secs() as u32;

        addrs.initialize(now);
        for i in 0..4u8 {
            addrs.add(
                Address::new(&([50 + i, 1, 1, 1], 9333).into(), ServiceFlags::NETWORK),
                seen,
                addrmgr::Source::Dns,
                LocalDuration::from_secs(0),
                now,
            );
        }
        connmgr.initialize(now);
        connmgr.maintain(&mut addrs, &peers, &bans, now);
        outbox.drain();

        // No feeler before the interval has passed.
        let feelers = |outbox: &mut Outbox| {
            test::events(outbox)
                .into_iter()
                .filter(|e| {
                    matches!(
                        e,
                        crate::fsm::Event::Connection(Event::Dialing(_, ConnKind::Feeler))
                    )
                })
                .count()
        };

        connmgr.maintain(&mut addrs, &peers, &bans, now + LocalDuration::from_secs(30));
        assert_eq!(feelers(&mut outbox), 0);

        let later = now + FEELER_INTERVAL + LocalDuration::from_secs(1);
        connmgr.maintain(&mut addrs, &peers, &bans, later);
        assert_eq!(feelers(&mut outbox), 1, "one feeler per interval");

        // While the feeler is active, no second one starts.
        connmgr.maintain(&mut addrs, &peers, &bans, later + FEELER_INTERVAL);
        assert_eq!(feelers(&mut outbox), 0);
    }

    #[test]
    fn test_attempt_rate_limit() {
        let (mut connmgr, mut addrs, peers, bans, mut outbox) = setup(1);
        let now = LocalTime::from_secs(1_700_000_000);
        let seen = now.as_secs() as u32;

        addrs.initialize(now);
        addrs.add(
            Address::new(&([50, 1, 1, 1], 9333).into(), ServiceFlags::NETWORK),
            seen,
            addrmgr::Source::Dns,
            LocalDuration::from_secs(0),
            now,
        );
        connmgr.initialize(now);
        // Keep the feeler timer out of the picture.
        connmgr.last_feeler = Some(now + LocalDuration::from_mins(60));
        outbox.drain();

        connmgr.maintain(&mut addrs, &peers, &bans, now);
        assert_eq!(connects(&mut outbox).len(), 1);

        // The dial fails; the slot frees, but the address was attempted
        // less than ten minutes ago.
        connmgr.peer_disconnected(&([50, 1, 1, 1], 9333).into(), now);
        connmgr.maintain(&mut addrs, &peers, &bans, now + LocalDuration::from_secs(30));
        assert!(connects(&mut outbox).is_empty());

        // After the interval, it may be tried again.
        connmgr.maintain(&mut addrs, &peers, &bans, now + ATTEMPT_INTERVAL);
        assert_eq!(connects(&mut outbox).len(), 1);
    }

    #[test]
    fn test_added_node_backoff() {
        let (mut connmgr, mut addrs, peers, bans, mut outbox) = setup(1);
        let now = LocalTime::from_secs(1_700_000_000);
        let addr: PeerId = ([70, 1, 1, 1], 9333).into();

        addrs.initialize(now);
        connmgr.initialize(now);
        outbox.drain();

        assert!(connmgr.add_node("node.example.com".to_owned(), vec![addr], now));
        assert!(!connmgr.add_node("node.example.com".to_owned(), vec![addr], now));

        connmgr.received_wake(&mut addrs, &peers, &bans, now);
        assert_eq!(connects(&mut outbox), vec![addr]);

        // The dial fails; the next attempt is pushed out by the backoff.
        connmgr.peer_connected(addr, Link::Outbound);
        connmgr.peer_disconnected(&addr, now);

        connmgr.received_wake(&mut addrs, &peers, &bans, now + LocalDuration::from_secs(30));
        assert!(connects(&mut outbox).is_empty());

        connmgr.received_wake(&mut addrs, &peers, &bans, now + LocalDuration::from_secs(61));
        assert_eq!(connects(&mut outbox), vec![addr]);
    }
}
