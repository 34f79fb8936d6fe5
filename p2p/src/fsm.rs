//! The ferrite protocol state machine.
//!
//! Composes the sub-managers (addresses, bans, peers, connections,
//! inventory, pings) into one [`StateMachine`] drivable by a reactor. All
//! protocol state lives here; the reactor owns the sockets.
use log::*;

pub mod addrmgr;
pub mod banmgr;
pub mod connmgr;
pub mod event;
pub mod invmgr;
pub mod output;
pub mod peermgr;
pub mod pingmgr;

#[cfg(test)]
mod tests;

use std::fmt;
use std::net;
use std::sync::Arc;

use crossbeam_channel as chan;

use ferrite_net::{Link, LocalDuration, LocalTime};

use ferrite_common::collections::HashMap;
use ferrite_common::network::Network;
use ferrite_common::services::ServiceFlags;

use crate::message::{
    CommandString, NetworkMessage, RawMessage, MAX_ADDR_ADDRESSES, MAX_INV_ENTRIES,
};
use crate::store::Store;
use crate::stream::{self, Decoder};
use crate::wire::{Inventory, NetAddress, Service, Subnet};

use addrmgr::AddressManager;
use banmgr::BanManager;
use connmgr::ConnectionManager;
use invmgr::InventoryManager;
use output::{Disconnect as _, FlowControl as _, Outbox, Wakeup as _, Wire as _};
use peermgr::PeerManager;
use pingmgr::PingManager;

pub use event::Event;
pub use peermgr::Whitelist;

/// Identifies a peer.
pub type PeerId = net::SocketAddr;

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = 70012;
/// Minimum supported peer protocol version.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;
/// User agent included in `version` messages.
pub const USER_AGENT: &str = "/ferrite:0.1.0/";
/// Default maximum number of peer connections, inbound and outbound.
pub const DEFAULT_MAX_PEER_CONNECTIONS: usize = 125;
/// Default number of queued receive bytes beyond which reads from a peer
/// are paused.
pub const DEFAULT_RECEIVE_FLOOD_SIZE: usize = 5000 * 1000;

/// Discount applied to last-seen times advertised by third parties.
const ADDR_TIME_PENALTY: LocalDuration = LocalDuration::from_mins(120);
/// Time before a tracked request expires.
const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_secs(60);
/// Initial capacity of per-peer stream decoders.
const DECODER_CAPACITY: usize = 1024 * 192;

/// Reference counted connection handle.
///
/// Sub-managers hold clones of a peer's socket for as long as they hold
/// state about the peer; the count tells how many hands are still on the
/// connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Socket {
    /// Socket address.
    pub addr: net::SocketAddr,
    /// Reference counter.
    refs: Arc<()>,
}

impl Socket {
    /// Create a new virtual socket.
    pub fn new(addr: impl Into<net::SocketAddr>) -> Self {
        Self {
            addr: addr.into(),
            refs: Arc::new(()),
        }
    }

    /// Get the number of references to this virtual socket.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.refs)
    }
}

/// What kind of connection a peer is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnKind {
    /// The peer connected to us.
    Inbound,
    /// An automatic outbound connection, from the address manager.
    Outbound,
    /// An outbound connection requested explicitly.
    Manual,
    /// Connected to once, to drain its address list.
    OneShot,
    /// A short-lived probe validating an address manager entry.
    Feeler,
    /// A user-added node, retried for as long as it is listed.
    AddedNode,
}

impl ConnKind {
    /// Whether this is a feeler probe.
    pub fn is_feeler(&self) -> bool {
        matches!(self, Self::Feeler)
    }

    /// Whether this is a one-shot connection.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::OneShot)
    }
}

impl fmt::Display for ConnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => write!(f, "inbound"),
            Self::Outbound => write!(f, "outbound"),
            Self::Manual => write!(f, "manual"),
            Self::OneShot => write!(f, "one-shot"),
            Self::Feeler => write!(f, "feeler"),
            Self::AddedNode => write!(f, "added node"),
        }
    }
}

/// Reason a peer is disconnected by the protocol.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer misbehaved.
    PeerMisbehaving(&'static str),
    /// Peer protocol version is too old.
    PeerProtocolVersion(u32),
    /// Peer doesn't offer the services we require.
    PeerServices(ServiceFlags),
    /// Peer sent a message with the wrong network magic.
    PeerMagic(u32),
    /// Peer sent a message larger than the protocol allows.
    MessageOversize(usize),
    /// Peer took too long.
    PeerTimeout(&'static str),
    /// Connection to self was detected.
    SelfConnection,
    /// Connection limit reached.
    ConnectionLimit,
    /// The peer's address is banned.
    PeerBanned,
    /// A feeler probe ran its course.
    FeelerDone,
    /// A one-shot connection served its purpose.
    OneShotDone,
    /// Disconnected on external request.
    Command,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::PeerProtocolVersion(version) => {
                write!(f, "peer protocol version {} is too old", version)
            }
            Self::PeerServices(services) => {
                write!(f, "peer doesn't offer required services: {}", services)
            }
            Self::PeerMagic(magic) => write!(f, "invalid message magic: {:#x}", magic),
            Self::MessageOversize(size) => write!(f, "message of {} bytes is too large", size),
            Self::PeerTimeout(what) => write!(f, "peer timed out: {}", what),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "connection limit reached"),
            Self::PeerBanned => write!(f, "peer address is banned"),
            Self::FeelerDone => write!(f, "feeler probe complete"),
            Self::OneShotDone => write!(f, "one-shot connection complete"),
            Self::Command => write!(f, "received external command"),
        }
    }
}

/// Protocol configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The network to run on.
    pub network: Network,
    /// Number of outbound connections to maintain.
    pub target_outbound: usize,
    /// Maximum total number of connections.
    pub max_connections: usize,
    /// Connect only to these peers.
    pub connect: Vec<net::SocketAddr>,
    /// Services we offer.
    pub services: ServiceFlags,
    /// Services required of outbound peers.
    pub required_services: ServiceFlags,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Whether we want inventory relayed to us.
    pub relay: bool,
    /// Our best chain height.
    pub height: i32,
    /// Peer whitelist.
    pub whitelist: Whitelist,
    /// Our externally reachable addresses, eg. from `-externalip`.
    pub external_addresses: Vec<net::SocketAddr>,
    /// Receive buffer size beyond which reads from a peer are paused.
    pub receive_flood_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            target_outbound: connmgr::TARGET_OUTBOUND_PEERS,
            max_connections: DEFAULT_MAX_PEER_CONNECTIONS,
            connect: Vec::new(),
            services: ServiceFlags::NETWORK,
            required_services: ServiceFlags::NETWORK,
            user_agent: USER_AGENT,
            relay: true,
            height: 0,
            whitelist: Whitelist::default(),
            external_addresses: Vec::new(),
            receive_flood_size: DEFAULT_RECEIVE_FLOOD_SIZE,
        }
    }
}

impl Config {
    /// The inbound budget: whatever the connection limit leaves after the
    /// outbound, added-node and feeler budgets.
    pub fn max_inbound(&self) -> usize {
        self.max_connections
            .saturating_sub(self.target_outbound + connmgr::MAX_ADDNODE_CONNECTIONS + 1)
    }
}

/// A command or request that can be sent to the protocol.
#[derive(Debug)]
pub enum Command {
    /// Connect to a peer.
    Connect(net::SocketAddr),
    /// Disconnect from a peer.
    Disconnect(PeerId),
    /// Send a framed message to a peer.
    Message(PeerId, CommandString, Vec<u8>),
    /// Send a framed message to all negotiated peers.
    Broadcast(CommandString, Vec<u8>),
    /// Send a tracked request. The reply payload is delivered on the
    /// channel; if no reply arrives in time, the channel is dropped.
    Request(PeerId, CommandString, Vec<u8>, chan::Sender<Vec<u8>>),
    /// Schedule an inventory request to a peer.
    AskFor(PeerId, Inventory),
    /// Announce an inventory to all relaying peers.
    RelayInventory(Inventory),
    /// Ban a subnet.
    Ban(Subnet, Option<LocalDuration>),
    /// Lift a ban.
    Unban(Subnet),
    /// Snapshot the ban list.
    Banned(chan::Sender<Vec<(Subnet, LocalTime)>>),
    /// Add a node to the added-node list.
    AddNode(String, Vec<net::SocketAddr>),
    /// Remove a node from the added-node list.
    RemoveNode(String),
    /// Queue a one-shot connection.
    AddOneShot(net::SocketAddr),
    /// Import peer addresses, eg. from DNS seeds.
    ImportAddresses(Vec<net::SocketAddr>),
    /// Update the chain height advertised in handshakes.
    SetHeight(i32),
    /// Snapshot the connected peers.
    GetPeers(chan::Sender<Vec<PeerSnapshot>>),
    /// Snapshot networking statistics.
    GetStats(chan::Sender<Stats>),
}

/// Point-in-time information about a connected peer.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// The peer's address.
    pub addr: PeerId,
    /// Link direction.
    pub link: Link,
    /// Connection kind.
    pub kind: ConnKind,
    /// Whether the handshake completed.
    pub negotiated: bool,
    /// Services offered.
    pub services: ServiceFlags,
    /// The peer's start height.
    pub height: i32,
    /// The peer's user agent.
    pub user_agent: String,
    /// Connected since.
    pub since: LocalTime,
    /// Last time the peer sent us anything.
    pub last_active: LocalTime,
    /// Accumulated misbehavior score.
    pub misbehavior: u32,
    /// Average round-trip latency, if measured.
    pub latency: Option<LocalDuration>,
}

/// Network statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Total bytes received.
    pub bytes_recv: u64,
    /// Total bytes queued for sending.
    pub bytes_sent: u64,
    /// Number of connected peers.
    pub peers: usize,
}

/// Per-peer stream state: the frame decoder and receive flood accounting.
#[derive(Debug)]
struct PeerStream {
    decoder: Decoder,
    /// Bytes received since the last tick.
    window: usize,
    /// Whether reads are currently paused.
    paused: bool,
}

/// A request awaiting its reply.
#[derive(Debug)]
struct PendingRequest {
    addr: PeerId,
    deadline: LocalTime,
    reply: chan::Sender<Vec<u8>>,
}

/// An instance of the ferrite network protocol.
#[derive(Debug)]
pub struct StateMachine<P: Store, Q: Store> {
    /// Protocol configuration.
    pub config: Config,
    /// Peer address manager.
    pub addrmgr: AddressManager<P, Outbox>,
    /// Ban manager.
    pub banmgr: BanManager<Q, Outbox>,
    /// Peer manager.
    pub peermgr: PeerManager<Outbox>,
    /// Connection manager.
    pub connmgr: ConnectionManager<Outbox>,
    /// Inventory manager.
    pub invmgr: InventoryManager<Outbox>,
    /// Ping manager.
    pub pingmgr: PingManager<Outbox>,

    streams: HashMap<PeerId, PeerStream>,
    requests: HashMap<[u8; 32], PendingRequest>,
    bytes_recv: u64,
    clock: LocalTime,
    rng: fastrand::Rng,
    outbox: Outbox,
}

impl<P: Store, Q: Store> StateMachine<P, Q> {
    /// Construct a new protocol state machine.
    pub fn new(config: Config, peer_store: P, ban_store: Q, rng: fastrand::Rng) -> Self {
        let outbox = Outbox::new(config.network.magic());

        let addrmgr = AddressManager::new(peer_store, rng.clone(), outbox.clone());
        let banmgr = BanManager::new(ban_store, rng.clone(), outbox.clone());
        let peermgr = PeerManager::new(
            peermgr::Config {
                protocol_version: PROTOCOL_VERSION,
                min_protocol_version: MIN_PROTOCOL_VERSION,
                services: config.services,
                required_services: config.required_services,
                user_agent: config.user_agent,
                max_inbound: config.max_inbound(),
                whitelist: config.whitelist.clone(),
                relay: config.relay,
                height: config.height,
            },
            rng.clone(),
            outbox.clone(),
        );
        let connmgr = ConnectionManager::new(
            connmgr::Config {
                target_outbound: config.target_outbound,
                connect: config.connect.clone(),
            },
            rng.clone(),
            outbox.clone(),
        );
        let invmgr = InventoryManager::new(rng.clone(), outbox.clone());
        let pingmgr = PingManager::new(rng.clone(), outbox.clone());

        Self {
            streams: HashMap::with_hasher(rng.clone().into()),
            requests: HashMap::with_hasher(rng.clone().into()),
            bytes_recv: 0,
            clock: LocalTime::default(),
            config,
            addrmgr,
            banmgr,
            peermgr,
            connmgr,
            invmgr,
            pingmgr,
            rng,
            outbox,
        }
    }

    /// Raise a peer's misbehavior score; disconnect and ban when the
    /// threshold is crossed.
    fn misbehaving(&mut self, addr: &PeerId, score: u32, reason: &'static str) {
        if self.peermgr.misbehaving(addr, score, reason) {
            self.banmgr.ban_peer(NetAddress(addr.ip()), self.clock);
            self.peermgr
                .disconnect(*addr, DisconnectReason::PeerMisbehaving(reason));
        }
    }

    /// Handle a complete framed message from a peer.
    fn received_message(&mut self, addr: &PeerId, raw: RawMessage) {
        let now = self.clock;

        self.peermgr.peer_active(addr, now);

        let msg = match NetworkMessage::from_raw(raw) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(target: "p2p", "{}: malformed message: {}", addr, err);
                self.misbehaving(addr, 10, "malformed message payload");
                return;
            }
        };
        trace!(target: "p2p", "{}: received `{}`", addr, msg.command());

        match msg {
            NetworkMessage::Version(version) => {
                self.peermgr.received_version(addr, version, now);
            }
            NetworkMessage::Verack => {
                if let Some((conn, info)) = self.peermgr.received_verack(addr, now) {
                    self.pingmgr.peer_negotiated(*addr, now);
                    self.invmgr.peer_negotiated(
                        *addr,
                        conn.socket.clone(),
                        conn.link,
                        info.relay,
                        now,
                    );
                    self.invmgr.add_address_known(addr, Service::from(*addr));
                    self.addrmgr
                        .peer_negotiated(addr, info.services, conn.link, now);
                    self.connmgr.peer_negotiated(addr);

                    match conn.kind {
                        ConnKind::Feeler => {
                            // The probe did its job: the address manager has
                            // marked the address good.
                            self.peermgr
                                .disconnect(*addr, DisconnectReason::FeelerDone);
                        }
                        ConnKind::OneShot => {
                            <output::Outbox as output::Wire<Event>>::get_addr(
                                &mut self.outbox,
                                *addr,
                            );
                        }
                        _ => {}
                    }
                }
            }
            NetworkMessage::Ping(nonce) => {
                self.pingmgr.received_ping(*addr, nonce);
            }
            NetworkMessage::Pong(nonce) => {
                self.pingmgr.received_pong(*addr, nonce, now);
            }
            NetworkMessage::GetAddr => {
                for entry in self.addrmgr.addresses(MAX_ADDR_ADDRESSES) {
                    self.invmgr.push_address(addr, entry);
                }
            }
            NetworkMessage::Addr(addrs) => {
                if addrs.len() > MAX_ADDR_ADDRESSES {
                    self.misbehaving(addr, 20, "oversized `addr` message");
                    return;
                }
                for (_, address) in addrs.iter() {
                    self.invmgr.add_address_known(addr, address.service);
                }
                self.addrmgr.add_many(
                    addrs.iter().copied(),
                    addrmgr::Source::Peer(NetAddress(addr.ip())),
                    ADDR_TIME_PENALTY,
                    now,
                );
                // Small unsolicited batches are gossiped onward.
                if addrs.len() <= 10 {
                    self.invmgr.relay_addresses(&addrs, *addr);
                }
                let one_shot = self
                    .peermgr
                    .get(addr)
                    .map_or(false, |p| p.conn.kind.is_one_shot());
                if one_shot {
                    self.peermgr
                        .disconnect(*addr, DisconnectReason::OneShotDone);
                }
            }
            NetworkMessage::Inv(items) => {
                if items.len() > MAX_INV_ENTRIES {
                    self.misbehaving(addr, 20, "oversized `inv` message");
                    return;
                }
                self.invmgr.received_inv(*addr, items);
            }
            NetworkMessage::GetData(items) => {
                if items.len() > MAX_INV_ENTRIES {
                    self.misbehaving(addr, 20, "oversized `getdata` message");
                    return;
                }
                self.invmgr.received_getdata(*addr, items);
            }
            NetworkMessage::Unknown { command, payload } => {
                // Replies to tracked requests carry the request id as a
                // payload prefix.
                if payload.len() >= 32 {
                    let mut id = [0u8; 32];
                    id.copy_from_slice(&payload[..32]);

                    if let Some(request) = self.requests.get(&id) {
                        if request.addr == *addr {
                            let request = self.requests.remove(&id).expect("entry exists");
                            request.reply.send(payload[32..].to_vec()).ok();
                            return;
                        }
                    }
                }
                self.outbox.push(ferrite_net::Io::Event(Event::Message {
                    from: *addr,
                    command,
                    payload,
                }));
            }
        }
    }
}

impl<P: Store, Q: Store> Iterator for StateMachine<P, Q> {
    type Item = output::Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<P: Store, Q: Store> ferrite_net::StateMachine for StateMachine<P, Q> {
    type Event = Event;
    type Command = Command;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.clock = time;

        self.addrmgr.initialize(time);
        self.banmgr.initialize(time);
        self.connmgr.initialize(time);

        let external = self.config.external_addresses.clone();
        for addr in external {
            self.peermgr.record_local_addr(Service::from(addr), 4);
        }
        self.connmgr
            .maintain(&mut self.addrmgr, &self.peermgr, &self.banmgr, time);
    }

    fn received_bytes(&mut self, addr: &PeerId, bytes: &[u8]) {
        self.bytes_recv += bytes.len() as u64;

        let flood_size = self.config.receive_flood_size;
        let stream = match self.streams.get_mut(addr) {
            Some(stream) => stream,
            None => return,
        };
        stream.decoder.input(bytes);
        stream.window += bytes.len();

        // Pause reads from peers that out-pace us; reads resume on the next
        // tick, once the queued messages have been delivered.
        if stream.window > flood_size && !stream.paused {
            stream.paused = true;
            self.outbox.pause_read(*addr);
        }

        let mut msgs = Vec::new();
        let mut penalties = 0;
        let mut fatal = None;

        loop {
            match stream.decoder.decode_next() {
                Ok(Some(msg)) => msgs.push(msg),
                Ok(None) => break,
                Err(err) if err.is_recoverable() => {
                    debug!(target: "p2p", "{}: dropped message: {}", addr, err);
                    penalties += 1;
                }
                Err(err) => {
                    fatal = Some(err);
                    break;
                }
            }
        }
        for msg in msgs {
            self.received_message(addr, msg);
        }
        for _ in 0..penalties {
            self.misbehaving(addr, 1, "invalid message checksum");
        }
        if let Some(err) = fatal {
            let reason = match err {
                stream::Error::InvalidMagic { actual, .. } => DisconnectReason::PeerMagic(actual),
                stream::Error::MessageOversize(size) => DisconnectReason::MessageOversize(size),
                _ => DisconnectReason::PeerMisbehaving("undecodable message header"),
            };
            self.peermgr.disconnect(*addr, reason);
        }
    }

    fn attempted(&mut self, addr: &PeerId) {
        // The attempt counts as a failure until the handshake completes.
        self.addrmgr.attempt(addr, true, self.clock);
    }

    fn connected(&mut self, addr: PeerId, local_addr: &net::SocketAddr, link: Link) {
        let now = self.clock;

        if link.is_inbound() && self.banmgr.is_banned(&NetAddress(addr.ip()), now) {
            debug!(target: "p2p", "{}: rejecting banned peer", addr);
            self.outbox.disconnect(addr, DisconnectReason::PeerBanned);
            return;
        }

        self.streams.insert(
            addr,
            PeerStream {
                decoder: Decoder::new(self.config.network.magic(), DECODER_CAPACITY),
                window: 0,
                paused: false,
            },
        );

        let kind = self.connmgr.peer_connected(addr, link);
        let pingmgr = &self.pingmgr;

        self.peermgr
            .peer_connected(addr, *local_addr, link, kind, now, |a| pingmgr.latency(a));
    }

    fn disconnected(
        &mut self,
        addr: &PeerId,
        reason: ferrite_net::DisconnectReason<DisconnectReason>,
    ) {
        let now = self.clock;

        debug!(target: "p2p", "{}: disconnected: {}", addr, reason);

        self.streams.remove(addr);
        self.requests.retain(|_, request| request.addr != *addr);

        self.connmgr.peer_disconnected(addr, now);
        self.peermgr.peer_disconnected(addr);
        self.pingmgr.peer_disconnected(addr);
        self.invmgr.peer_disconnected(addr);

        // An outbound slot may have freed up.
        self.connmgr
            .maintain(&mut self.addrmgr, &self.peermgr, &self.banmgr, now);
    }

    fn command(&mut self, cmd: Command) {
        let now = self.clock;

        debug!(target: "p2p", "received command: {:?}", cmd);

        match cmd {
            Command::Connect(addr) => {
                self.connmgr.connect(addr, now);
            }
            Command::Disconnect(addr) => {
                self.peermgr.disconnect(addr, DisconnectReason::Command);
            }
            Command::Message(addr, command, payload) => {
                if self.peermgr.is_connected(&addr) {
                    <output::Outbox as output::Wire<Event>>::raw(
                        &mut self.outbox,
                        addr,
                        command,
                        payload,
                    );
                }
            }
            Command::Broadcast(command, payload) => {
                let peers: Vec<PeerId> = self
                    .peermgr
                    .peers()
                    .filter(|(_, p)| p.is_negotiated())
                    .map(|(addr, _)| *addr)
                    .collect();

                for addr in peers {
                    <output::Outbox as output::Wire<Event>>::raw(
                        &mut self.outbox,
                        addr,
                        command,
                        payload.clone(),
                    );
                }
            }
            Command::Request(addr, command, payload, reply) => {
                if !self.peermgr.is_connected(&addr) {
                    return; // Dropping the sender signals the failure.
                }
                let mut id = [0u8; 32];
                for byte in id.iter_mut() {
                    *byte = self.rng.u8(..);
                }
                let mut framed = id.to_vec();
                framed.extend_from_slice(&payload);

                self.requests.insert(
                    id,
                    PendingRequest {
                        addr,
                        deadline: now + REQUEST_TIMEOUT,
                        reply,
                    },
                );
                <output::Outbox as output::Wire<Event>>::raw(
                    &mut self.outbox,
                    addr,
                    command,
                    framed,
                );
                self.outbox.wakeup(REQUEST_TIMEOUT);
            }
            Command::AskFor(addr, inv) => {
                self.invmgr.ask_for(&addr, inv, now);
            }
            Command::RelayInventory(inv) => {
                self.invmgr.broadcast_inventory(inv);
            }
            Command::Ban(subnet, offset) => {
                self.banmgr.ban(subnet, offset, now);

                let covered: Vec<PeerId> = self
                    .peermgr
                    .peers()
                    .filter(|(addr, _)| subnet.contains(&NetAddress(addr.ip())))
                    .map(|(addr, _)| *addr)
                    .collect();
                for addr in covered {
                    self.peermgr.disconnect(addr, DisconnectReason::PeerBanned);
                }
            }
            Command::Unban(subnet) => {
                self.banmgr.unban(&subnet);
            }
            Command::Banned(reply) => {
                let entries = self
                    .banmgr
                    .entries()
                    .map(|(subnet, until)| (*subnet, *until))
                    .collect();
                reply.send(entries).ok();
            }
            Command::AddNode(name, addrs) => {
                self.connmgr.add_node(name, addrs, now);
            }
            Command::RemoveNode(name) => {
                if let Some(Some(peer)) = self.connmgr.remove_node(&name) {
                    self.peermgr.disconnect(peer, DisconnectReason::Command);
                }
            }
            Command::AddOneShot(addr) => {
                self.connmgr.add_one_shot(addr);
                self.connmgr
                    .maintain(&mut self.addrmgr, &self.peermgr, &self.banmgr, now);
            }
            Command::ImportAddresses(addrs) => {
                let entries = addrs.into_iter().map(|a| {
                    (
                        now.as_secs() as u32,
                        crate::wire::Address::new(&a, ServiceFlags::NONE),
                    )
                });
                self.addrmgr.add_many(
                    entries,
                    addrmgr::Source::Imported,
                    LocalDuration::from_secs(0),
                    now,
                );
                self.connmgr
                    .maintain(&mut self.addrmgr, &self.peermgr, &self.banmgr, now);
            }
            Command::SetHeight(height) => {
                self.peermgr.config.height = height;
            }
            Command::GetPeers(reply) => {
                let peers = self
                    .peermgr
                    .peers()
                    .map(|(addr, peer)| PeerSnapshot {
                        addr: *addr,
                        link: peer.conn.link,
                        kind: peer.conn.kind,
                        negotiated: peer.is_negotiated(),
                        services: peer.info.as_ref().map_or(ServiceFlags::NONE, |i| i.services),
                        height: peer.info.as_ref().map_or(0, |i| i.height),
                        user_agent: peer
                            .info
                            .as_ref()
                            .map_or(String::new(), |i| i.user_agent.clone()),
                        since: peer.conn.since,
                        last_active: peer.last_active,
                        misbehavior: peer.misbehavior,
                        latency: self.pingmgr.latency(addr),
                    })
                    .collect();
                reply.send(peers).ok();
            }
            Command::GetStats(reply) => {
                let stats = Stats {
                    bytes_recv: self.bytes_recv,
                    bytes_sent: self.outbox.sent_bytes(),
                    peers: self.peermgr.peers().count(),
                };
                reply.send(stats).ok();
            }
        }
    }

    fn tick(&mut self, local_time: LocalTime) {
        if local_time > self.clock {
            self.clock = local_time;
        }

        // Queued receive windows reset every tick; paused peers get their
        // reads back.
        let mut resumed = Vec::new();
        for (addr, stream) in self.streams.iter_mut() {
            stream.window = 0;
            if stream.paused {
                stream.paused = false;
                resumed.push(*addr);
            }
        }
        for addr in resumed {
            self.outbox.resume_read(addr);
        }
    }

    fn wake(&mut self) {
        let now = self.clock;

        self.addrmgr.received_wake(now);
        self.banmgr.received_wake(now);
        self.peermgr.received_wake(now);
        self.pingmgr.received_wake(now);
        self.invmgr.received_wake(now);
        self.connmgr
            .received_wake(&mut self.addrmgr, &self.peermgr, &self.banmgr, now);

        // Expire tracked requests; dropping the sender tells the caller.
        self.requests.retain(|_, request| request.deadline > now);
    }
}

/// Persistent state is written out when the protocol winds down.
impl<P: Store, Q: Store> Drop for StateMachine<P, Q> {
    fn drop(&mut self) {
        self.addrmgr.flush(self.clock);
        self.banmgr.flush(self.clock);
    }
}
