//! Peer manager. Handles peer negotiation (handshake), misbehavior
//! accounting and the inbound connection budget.
//!
//! The steps for an *outbound* handshake are:
//!
//!   1. Send `version` message.
//!   2. Expect `version` message from remote.
//!   3. Send `verack` message.
//!   4. Expect `verack` message from remote.
//!
//! The steps for an *inbound* handshake are:
//!
//!   1. Expect `version` message from remote.
//!   2. Send `version` message.
//!   3. Send `verack` message.
//!   4. Expect `verack` message from remote.
//!
//! A peer is *fully connected* only once both directions have acknowledged.
use std::fmt;
use std::net;

use log::*;

use ferrite_net::{Link, LocalDuration, LocalTime};

use ferrite_common::collections::{HashMap, HashSet};
use ferrite_common::services::ServiceFlags;

use crate::message::VersionMessage;
use crate::wire::{Address, NetAddress, Service};

use super::output::{Disconnect, Wakeup, Wire};
use super::{ConnKind, DisconnectReason, PeerId, Socket};

/// Time to wait for response during peer handshake before disconnecting the
/// peer.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);
/// Misbehavior score at which a peer is disconnected and banned.
pub const MISBEHAVIOR_THRESHOLD: u32 = 100;

/// Number of most-recently-connected inbound peers protected from eviction.
const EVICTION_PROTECT_RECENT: usize = 4;
/// Number of lowest-latency inbound peers protected from eviction.
const EVICTION_PROTECT_LATENCY: usize = 4;
/// Number of network groups protected from eviction.
const EVICTION_PROTECT_GROUPS: usize = 4;

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A new peer connection was established.
    Connected(PeerId, Link),
    /// The `version` message was received from a peer.
    VersionReceived {
        /// The peer's id.
        addr: PeerId,
        /// The version message.
        msg: VersionMessage,
    },
    /// A peer has completed its handshake and is fully connected.
    Negotiated {
        /// The peer's id.
        addr: PeerId,
        /// Link direction.
        link: Link,
        /// Services offered by the peer.
        services: ServiceFlags,
        /// The peer's starting height.
        height: i32,
        /// The peer's user agent.
        user_agent: String,
    },
    /// A peer was disconnected.
    Disconnected(PeerId),
    /// A peer misbehaved.
    Misbehaved {
        /// The peer's id.
        addr: PeerId,
        /// Accumulated misbehavior score.
        score: u32,
        /// What the peer did.
        reason: &'static str,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(addr, link) => write!(f, "{}: peer connected ({:?})", addr, link),
            Self::VersionReceived { addr, msg } => write!(
                f,
                "{}: peer version = {}, height = {}, agent = {}, services = {}",
                addr, msg.version, msg.start_height, msg.user_agent, msg.services
            ),
            Self::Negotiated { addr, services, .. } => {
                write!(f, "{}: peer negotiated with services {}", addr, services)
            }
            Self::Disconnected(addr) => write!(f, "disconnected from {}", addr),
            Self::Misbehaved { addr, score, reason } => {
                write!(f, "{}: misbehaved: {} (score {})", addr, reason, score)
            }
        }
    }
}

/// Peer whitelist: addresses and user agents exempt from bans, service
/// requirements and eviction.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    /// Whitelisted addresses.
    pub addr: std::collections::HashSet<net::IpAddr>,
    /// Whitelisted user agents.
    pub user_agent: std::collections::HashSet<String>,
}

impl Whitelist {
    fn contains(&self, addr: &net::IpAddr, user_agent: &str) -> bool {
        self.addr.contains(addr) || self.user_agent.contains(user_agent)
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version advertised.
    pub protocol_version: u32,
    /// Minimum peer protocol version accepted.
    pub min_protocol_version: u32,
    /// Services we offer.
    pub services: ServiceFlags,
    /// Services required of outbound peers.
    pub required_services: ServiceFlags,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Maximum number of inbound connections.
    pub max_inbound: usize,
    /// Peer whitelist.
    pub whitelist: Whitelist,
    /// Whether we want inventory relayed to us.
    pub relay: bool,
    /// Our best chain height, advertised in `version`.
    pub height: i32,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Waiting for the remote's `version`.
    AwaitingVersion { since: LocalTime },
    /// Waiting for the remote's `verack`.
    AwaitingVerack { since: LocalTime },
    /// Fully connected.
    Negotiated { since: LocalTime },
}

/// What a peer told us in its `version` message.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Protocol version.
    pub version: u32,
    /// Services offered.
    pub services: ServiceFlags,
    /// Starting chain height.
    pub height: i32,
    /// User agent.
    pub user_agent: String,
    /// Whether the peer wants inventory relayed.
    pub relay: bool,
    /// The peer's handshake nonce.
    pub nonce: u64,
    /// Clock offset between the peer and us, in seconds.
    pub time_offset: i64,
}

/// An established connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Reference-counted connection handle.
    pub socket: Socket,
    /// Our address, as bound for this connection.
    pub local_addr: net::SocketAddr,
    /// Link direction.
    pub link: Link,
    /// What kind of connection this is.
    pub kind: ConnKind,
    /// Connected since this time.
    pub since: LocalTime,
}

/// A connected peer.
#[derive(Debug)]
pub struct Peer {
    /// Connection information.
    pub conn: Connection,
    /// Negotiated version information, after `version` is received.
    pub info: Option<VersionInfo>,
    /// Accumulated misbehavior score.
    pub misbehavior: u32,
    /// Last time we received anything from this peer.
    pub last_active: LocalTime,
    /// Whether the peer is whitelisted.
    pub whitelisted: bool,
    state: HandshakeState,
}

impl Peer {
    /// Whether the handshake completed in both directions.
    pub fn is_negotiated(&self) -> bool {
        matches!(self.state, HandshakeState::Negotiated { .. })
    }
}

/// Manages peers and peer negotiation.
#[derive(Debug)]
pub struct PeerManager<U> {
    /// Peer manager configuration.
    pub config: Config,
    /// Nonce included in our `version` messages. Generated once per
    /// process, used to detect connections to self.
    local_nonce: u64,
    peers: HashMap<PeerId, Peer>,
    /// Addresses of ours, with a score per discovery channel. The best one
    /// is advertised in `version` messages.
    local_addrs: HashMap<Service, u8>,
    rng: fastrand::Rng,
    upstream: U,
}

impl<U: Wire<Event> + Wakeup + Disconnect> PeerManager<U> {
    /// Create a new peer manager.
    pub fn new(config: Config, rng: fastrand::Rng, upstream: U) -> Self {
        let local_nonce = rng.u64(..);

        Self {
            config,
            local_nonce,
            peers: HashMap::with_hasher(rng.clone().into()),
            local_addrs: HashMap::with_hasher(rng.clone().into()),
            rng,
            upstream,
        }
    }

    /// The nonce carried in our `version` messages.
    pub fn local_nonce(&self) -> u64 {
        self.local_nonce
    }

    /// Record one of our own addresses, eg. from `-externalip` or as
    /// reported by a peer. Higher scores take precedence when advertising.
    pub fn record_local_addr(&mut self, service: Service, score: u8) {
        let entry = self.local_addrs.entry(service).or_insert(score);
        *entry = (*entry).max(score);
    }

    /// Whitelist an address.
    pub fn whitelist(&mut self, addr: net::IpAddr) -> bool {
        self.config.whitelist.addr.insert(addr)
    }

    /// Iterate over all peers.
    pub fn peers(&self) -> impl Iterator<Item = (&PeerId, &Peer)> {
        self.peers.iter()
    }

    /// Iterate over negotiated peers with the given link.
    pub fn negotiated(&self, link: Link) -> impl Iterator<Item = (&PeerId, &Peer)> + Clone {
        self.peers
            .iter()
            .filter(move |(_, p)| p.is_negotiated() && p.conn.link == link)
    }

    /// Whether the given peer is connected.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers.contains_key(addr)
    }

    /// Look up a peer.
    pub fn get(&self, addr: &PeerId) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Number of inbound connections.
    pub fn inbound_count(&self) -> usize {
        self.peers
            .values()
            .filter(|p| p.conn.link.is_inbound())
            .count()
    }

    /// Network groups of our outbound peers. Used to diversify dialing.
    pub fn outbound_groups(&self) -> HashSet<Vec<u8>> {
        let mut groups = HashSet::with_hasher(self.rng.clone().into());

        for (addr, peer) in self.peers.iter() {
            if peer.conn.link.is_outbound() && !peer.conn.kind.is_feeler() {
                groups.insert(NetAddress(addr.ip()).group());
            }
        }
        groups
    }

    /// Called when a new connection is established.
    ///
    /// For inbound connections beyond the budget, the eviction policy picks
    /// a victim among existing inbound peers; if it finds none, the new
    /// connection is refused. `latency` reports a peer's known round-trip
    /// latency.
    pub fn peer_connected(
        &mut self,
        addr: PeerId,
        local_addr: net::SocketAddr,
        link: Link,
        kind: ConnKind,
        now: LocalTime,
        latency: impl Fn(&PeerId) -> Option<LocalDuration>,
    ) {
        debug_assert!(!self.peers.contains_key(&addr));

        self.upstream.event(Event::Connected(addr, link));

        if link.is_inbound() && self.inbound_count() >= self.config.max_inbound {
            match self.evict_inbound(now, latency) {
                Some(victim) => {
                    debug!(target: "p2p", "{}: evicted for inbound slot", victim);
                    self.disconnect(victim, DisconnectReason::ConnectionLimit);
                }
                None => {
                    self.disconnect_new(addr, DisconnectReason::ConnectionLimit);
                    return;
                }
            }
        }

        let whitelisted = self.config.whitelist.contains(&addr.ip(), "");
        self.peers.insert(
            addr,
            Peer {
                conn: Connection {
                    socket: Socket::new(addr),
                    local_addr,
                    link,
                    kind,
                    since: now,
                },
                info: None,
                misbehavior: 0,
                last_active: now,
                whitelisted,
                state: HandshakeState::AwaitingVersion { since: now },
            },
        );

        if link.is_outbound() {
            let version = self.version(addr, local_addr, now);
            self.upstream.version(addr, version);
        }
        self.upstream.wakeup(HANDSHAKE_TIMEOUT);
    }

    /// Called when a peer's connection was closed. Returns the connection
    /// record, so that slot grants can be released.
    pub fn peer_disconnected(&mut self, addr: &PeerId) -> Option<Connection> {
        let peer = self.peers.remove(addr)?;

        self.upstream.event(Event::Disconnected(*addr));

        Some(peer.conn)
    }

    /// Called when a `version` message is received.
    pub fn received_version(&mut self, addr: &PeerId, msg: VersionMessage, now: LocalTime) {
        let peer = match self.peers.get_mut(addr) {
            Some(peer) => peer,
            None => return,
        };
        peer.last_active = now;

        match peer.state {
            HandshakeState::AwaitingVersion { .. } => {}
            _ => {
                self.misbehaving(addr, 1, "duplicate `version` message");
                return;
            }
        }

        let VersionMessage {
            version,
            services,
            timestamp,
            receiver,
            nonce,
            user_agent,
            start_height,
            relay,
            ..
        } = msg.clone();

        self.upstream.event(Event::VersionReceived {
            addr: *addr,
            msg: msg.clone(),
        });

        let conn = peer.conn.clone();
        let whitelisted =
            peer.whitelisted || self.config.whitelist.contains(&addr.ip(), &user_agent);

        // Connecting to ourselves: our own nonce came back.
        if nonce == self.local_nonce {
            return self.disconnect(*addr, DisconnectReason::SelfConnection);
        }
        if version < self.config.min_protocol_version {
            return self.disconnect(*addr, DisconnectReason::PeerProtocolVersion(version));
        }
        // Outbound peers that don't offer the services we need are of no
        // use to us.
        if conn.link.is_outbound()
            && !conn.kind.is_feeler()
            && !services.has(self.config.required_services)
            && !whitelisted
        {
            return self.disconnect(*addr, DisconnectReason::PeerServices(services));
        }

        // Remember how the network sees us.
        let seen_by_peer = receiver.service;
        if seen_by_peer.ip.is_routable() {
            self.record_local_addr(seen_by_peer, 1);
        }

        if let Some(peer) = self.peers.get_mut(addr) {
            peer.info = Some(VersionInfo {
                version,
                services,
                height: start_height,
                user_agent,
                relay,
                nonce,
                time_offset: timestamp - now.as_secs() as i64,
            });
            peer.whitelisted = whitelisted;
            peer.state = HandshakeState::AwaitingVerack { since: now };
        }

        match conn.link {
            Link::Outbound => {
                self.upstream.verack(*addr).wakeup(HANDSHAKE_TIMEOUT);
            }
            Link::Inbound => {
                let version = self.version(*addr, conn.local_addr, now);
                self.upstream
                    .version(*addr, version)
                    .verack(*addr)
                    .wakeup(HANDSHAKE_TIMEOUT);
            }
        }
    }

    /// Called when a `verack` message is received. On success, returns the
    /// now-negotiated peer's connection and version information.
    pub fn received_verack(
        &mut self,
        addr: &PeerId,
        now: LocalTime,
    ) -> Option<(Connection, VersionInfo)> {
        let peer = self.peers.get_mut(addr)?;

        match peer.state {
            HandshakeState::AwaitingVerack { .. } => {
                peer.state = HandshakeState::Negotiated { since: now };
                peer.last_active = now;

                let info = peer.info.clone()?;
                let conn = peer.conn.clone();

                self.upstream.event(Event::Negotiated {
                    addr: *addr,
                    link: conn.link,
                    services: info.services,
                    height: info.height,
                    user_agent: info.user_agent.clone(),
                });

                Some((conn, info))
            }
            _ => {
                self.misbehaving(addr, 2, "unexpected `verack` message");
                None
            }
        }
    }

    /// Note that a peer sent us something.
    pub fn peer_active(&mut self, addr: &PeerId, now: LocalTime) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.last_active = now;
        }
    }

    /// Increase a peer's misbehavior score. Returns `true` when the
    /// threshold is crossed, in which case the caller is expected to
    /// disconnect and ban the peer. Whitelisted peers are never banned.
    pub fn misbehaving(&mut self, addr: &PeerId, score: u32, reason: &'static str) -> bool {
        let peer = match self.peers.get_mut(addr) {
            Some(peer) => peer,
            None => return false,
        };
        peer.misbehavior += score;
        let total = peer.misbehavior;
        let whitelisted = peer.whitelisted;

        warn!(target: "p2p", "{}: misbehaved: {} (score {})", addr, reason, total);
        self.upstream.event(Event::Misbehaved {
            addr: *addr,
            score: total,
            reason,
        });

        total >= MISBEHAVIOR_THRESHOLD && !whitelisted
    }

    /// Ask for a peer to be disconnected.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        if self.peers.contains_key(&addr) {
            self.upstream.disconnect(addr, reason);
        }
    }

    /// Refuse a connection we haven't registered.
    fn disconnect_new(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.upstream.disconnect(addr, reason);
    }

    /// Called when a timer rings: expire handshakes that take too long.
    pub fn received_wake(&mut self, now: LocalTime) {
        let mut timed_out = Vec::new();

        for (addr, peer) in self.peers.iter() {
            let since = match peer.state {
                HandshakeState::AwaitingVersion { since } => since,
                HandshakeState::AwaitingVerack { since } => since,
                HandshakeState::Negotiated { .. } => continue,
            };
            if now - since >= HANDSHAKE_TIMEOUT {
                timed_out.push(*addr);
            }
        }
        for addr in timed_out {
            self.disconnect(addr, DisconnectReason::PeerTimeout("handshake"));
        }
    }

    /// Construct a `version` message for the given peer.
    pub fn version(
        &self,
        addr: net::SocketAddr,
        local_addr: net::SocketAddr,
        now: LocalTime,
    ) -> VersionMessage {
        VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp: now.as_secs() as i64,
            receiver: Address::new(&addr, ServiceFlags::NONE),
            sender: self.best_local_addr(local_addr),
            nonce: self.local_nonce,
            user_agent: self.config.user_agent.to_owned(),
            start_height: self.config.height,
            relay: self.config.relay,
        }
    }

    /// Our best advertisable address: the highest-scored local address, or
    /// the bind address if we don't know any better.
    fn best_local_addr(&self, local_addr: net::SocketAddr) -> Address {
        self.local_addrs
            .iter()
            .max_by_key(|(_, score)| **score)
            .map(|(service, _)| Address {
                services: self.config.services,
                service: *service,
            })
            .unwrap_or_else(|| Address::new(&local_addr, self.config.services))
    }

    /// Pick an inbound peer to make room for a new one.
    ///
    /// Protects the most recently connected peers, the lowest-latency
    /// peers, and one peer from each of several network groups; evicts from
    /// the largest remaining group, preferring the longest-idle peer.
    fn evict_inbound(
        &self,
        _now: LocalTime,
        latency: impl Fn(&PeerId) -> Option<LocalDuration>,
    ) -> Option<PeerId> {
        let mut candidates: Vec<(&PeerId, &Peer)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.conn.link.is_inbound() && !p.whitelisted)
            .collect();

        // Most recently connected are protected.
        candidates.sort_by_key(|(_, p)| p.conn.since);
        for _ in 0..EVICTION_PROTECT_RECENT {
            candidates.pop();
        }

        // Lowest latency peers are protected.
        candidates.sort_by_key(|(addr, _)| {
            std::cmp::Reverse(latency(addr).unwrap_or(LocalDuration::MAX))
        });
        for _ in 0..EVICTION_PROTECT_LATENCY {
            candidates.pop();
        }

        // Protect the most recent peer of several distinct network groups.
        let mut groups: HashMap<Vec<u8>, Vec<(&PeerId, &Peer)>> =
            HashMap::with_hasher(self.rng.clone().into());
        for (addr, peer) in candidates {
            groups
                .entry(NetAddress(addr.ip()).group())
                .or_default()
                .push((addr, peer));
        }
        let mut protected = 0;
        for members in groups.values_mut() {
            if protected >= EVICTION_PROTECT_GROUPS {
                break;
            }
            members.sort_by_key(|(_, p)| p.conn.since);
            members.pop();
            protected += 1;
        }

        // Evict the longest-idle peer of the largest remaining group.
        groups
            .values()
            .max_by_key(|members| members.len())
            .and_then(|members| members.iter().min_by_key(|(_, p)| p.last_active))
            .map(|(addr, _)| **addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            protocol_version: 70012,
            min_protocol_version: 70001,
            services: ServiceFlags::NETWORK,
            required_services: ServiceFlags::NETWORK,
            user_agent: "/test:0.1.0/",
            max_inbound: 8,
            whitelist: Whitelist::default(),
            relay: true,
            height: 0,
        }
    }

    fn manager(seed: u64) -> PeerManager<()> {
        PeerManager::new(config(), fastrand::Rng::with_seed(seed), ())
    }

    fn no_latency(_: &PeerId) -> Option<LocalDuration> {
        None
    }

    fn version(nonce: u64) -> VersionMessage {
        VersionMessage {
            version: 70012,
            services: ServiceFlags::NETWORK,
            timestamp: 1_700_000_000,
            receiver: Address::new(&([99, 99, 99, 99], 9333).into(), ServiceFlags::NONE),
            sender: Address::new(&([88, 88, 88, 88], 9333).into(), ServiceFlags::NETWORK),
            nonce,
            user_agent: "/other:1.0/".to_owned(),
            start_height: 42,
            relay: true,
        }
    }

    #[test]
    fn test_outbound_handshake() {
        let mut peermgr = manager(1);
        let now = LocalTime::from_secs(1_700_000_000);
        let addr: PeerId = ([55, 55, 55, 55], 9333).into();
        let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

        peermgr.peer_connected(addr, local, Link::Outbound, ConnKind::Outbound, now, no_latency);
        assert!(!peermgr.get(&addr).unwrap().is_negotiated());

        peermgr.received_version(&addr, version(12345), now);
        assert!(peermgr.received_verack(&addr, now).is_some());
        assert!(peermgr.get(&addr).unwrap().is_negotiated());
    }

    #[test]
    fn test_self_connection_detected() {
        let mut peermgr = manager(2);
        let now = LocalTime::from_secs(1_700_000_000);
        let addr: PeerId = ([55, 55, 55, 55], 9333).into();
        let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

        peermgr.peer_connected(addr, local, Link::Outbound, ConnKind::Outbound, now, no_latency);

        // Our own nonce comes back at us.
        let nonce = peermgr.local_nonce();
        peermgr.received_version(&addr, version(nonce), now);

        // The handshake never completes.
        assert!(peermgr.received_verack(&addr, now).is_none());
    }

    #[test]
    fn test_misbehavior_threshold() {
        let mut peermgr = manager(3);
        let now = LocalTime::from_secs(1_700_000_000);
        let addr: PeerId = ([55, 55, 55, 55], 9333).into();
        let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

        peermgr.peer_connected(addr, local, Link::Inbound, ConnKind::Inbound, now, no_latency);

        for i in 1..10 {
            assert!(
                !peermgr.misbehaving(&addr, 10, "malformed message"),
                "{} strikes aren't enough",
                i
            );
        }
        assert!(
            peermgr.misbehaving(&addr, 10, "malformed message"),
            "the tenth strike crosses the threshold"
        );
    }

    #[test]
    fn test_whitelisted_never_banned() {
        let mut peermgr = manager(4);
        let now = LocalTime::from_secs(1_700_000_000);
        let addr: PeerId = ([55, 55, 55, 55], 9333).into();
        let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

        peermgr.whitelist(addr.ip());
        peermgr.peer_connected(addr, local, Link::Inbound, ConnKind::Inbound, now, no_latency);

        assert!(!peermgr.misbehaving(&addr, 1000, "malformed message"));
    }

    #[test]
    fn test_eviction_prefers_largest_group() {
        let mut peermgr = manager(5);
        peermgr.config.max_inbound = 16;

        let mut now = LocalTime::from_secs(1_700_000_000);
        let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

        // Ten peers from 77.1.0.0/16, and three spread across other groups,
        // connected later.
        let mut crowd = Vec::new();
        for i in 0..10u8 {
            let addr: PeerId = ([77, 1, i, 1], 9333).into();
            peermgr.peer_connected(addr, local, Link::Inbound, ConnKind::Inbound, now, no_latency);
            crowd.push(addr);
            now.elapse(LocalDuration::from_secs(10));
        }
        for i in 0..3u8 {
            let addr: PeerId = ([10 + i, 2, 3, 4], 9333).into();
            peermgr.peer_connected(addr, local, Link::Inbound, ConnKind::Inbound, now, no_latency);
            now.elapse(LocalDuration::from_secs(10));
        }
        assert_eq!(peermgr.inbound_count(), 13);

        let victim = peermgr.evict_inbound(now, no_latency).unwrap();
        assert!(
            crowd.contains(&victim),
            "the victim comes from the crowded /16"
        );
    }
}
