//! Node process and control handle.
use std::env;
use std::fs;
use std::net;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::thread;
use std::time;

use crossbeam_channel as chan;

use ferrite_common::network::Network;
use ferrite_net::{Reactor as _, Waker as _};
use ferrite_net_poll::reactor::{Reactor, Waker};
use ferrite_p2p::fsm::{self, Command, Event, PeerSnapshot, Stats};
use ferrite_p2p::message::CommandString;
use ferrite_p2p::wire::{Inventory, Subnet};
use ferrite_p2p::{LocalDuration, LocalTime};

use crate::error::Error;
use crate::store::FileStore;

/// File descriptors held in reserve for things that are not peer
/// connections: the block store, databases, logs.
pub const MIN_CORE_FILEDESCRIPTORS: usize = 150;

/// Re-seed at most once per this interval when the address book runs dry.
const RESEED_INTERVAL: time::Duration = time::Duration::from_secs(60);

/// Node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The network to run on.
    pub network: Network,
    /// Addresses to listen on for inbound peer connections. Empty disables
    /// listening.
    pub listen: Vec<net::SocketAddr>,
    /// Connect to these peers only.
    pub connect: Vec<net::SocketAddr>,
    /// Nodes to keep connected to.
    pub added_nodes: Vec<String>,
    /// Nodes to fetch an address batch from, once.
    pub seed_nodes: Vec<String>,
    /// Whether to query the DNS seeds when the address book is empty.
    pub dns_seeds: bool,
    /// Number of outbound connections to maintain.
    pub target_outbound: usize,
    /// Maximum total number of connections.
    pub max_connections: usize,
    /// Per-connection receive buffer limit, in bytes.
    pub max_receive_buffer: usize,
    /// Per-connection send buffer limit, in bytes.
    pub max_send_buffer: usize,
    /// Externally reachable addresses to advertise.
    pub external_addresses: Vec<net::SocketAddr>,
    /// Node home directory, where runtime data is stored.
    pub root: PathBuf,
    /// Timeout for handle requests.
    pub timeout: time::Duration,
}

impl Default for Config {
    fn default() -> Self {
        let network = Network::default();

        Self {
            listen: vec![(net::Ipv4Addr::UNSPECIFIED, network.port()).into()],
            network,
            connect: Vec::new(),
            added_nodes: Vec::new(),
            seed_nodes: Vec::new(),
            dns_seeds: true,
            target_outbound: fsm::Config::default().target_outbound,
            max_connections: fsm::DEFAULT_MAX_PEER_CONNECTIONS,
            max_receive_buffer: fsm::DEFAULT_RECEIVE_FLOOD_SIZE,
            max_send_buffer: ferrite_net_poll::reactor::DEFAULT_MAX_SEND_BUFFER,
            external_addresses: Vec::new(),
            root: PathBuf::from(env::var("HOME").unwrap_or_default()),
            timeout: time::Duration::from_secs(60),
        }
    }
}

/// The node's event publisher: forwards protocol events to every
/// subscriber.
struct Publisher {
    subscribers: Vec<chan::Sender<Event>>,
}

impl ferrite_net::Publisher<Event> for Publisher {
    fn publish(&mut self, event: Event) {
        for subscriber in self.subscribers.iter() {
            subscriber.send(event.clone()).ok();
        }
    }
}

/// A node process.
pub struct Node {
    /// Node configuration.
    pub config: Config,

    commands: chan::Receiver<Command>,
    handle: chan::Sender<Command>,
    events: chan::Receiver<Event>,
    events_pub: chan::Sender<Event>,
    shutdown: chan::Sender<()>,
    listening: chan::Receiver<net::SocketAddr>,
    reactor: Reactor,
}

impl Node {
    /// Create a new node.
    pub fn new(config: Config) -> Result<Self, Error> {
        let (handle, commands) = chan::unbounded::<Command>();
        let (events_pub, events) = chan::unbounded::<Event>();
        let (shutdown, shutdown_recv) = chan::unbounded::<()>();
        let (listening_send, listening) = chan::unbounded::<net::SocketAddr>();

        let mut reactor = Reactor::new(shutdown_recv, listening_send)?;
        reactor.max_send_buffer = config.max_send_buffer;

        Ok(Self {
            config,
            commands,
            handle,
            events,
            events_pub,
            shutdown,
            listening,
            reactor,
        })
    }

    /// Create a handle for controlling the node. Handles are cheap to clone
    /// and usable from any thread.
    pub fn handle(&self) -> Handle {
        Handle {
            commands: self.handle.clone(),
            waker: self.reactor.waker(),
            shutdown: self.shutdown.clone(),
            network: self.config.network,
            timeout: self.config.timeout,
        }
    }

    /// Protocol events, including messages for the external dispatcher.
    pub fn events(&self) -> chan::Receiver<Event> {
        self.events.clone()
    }

    /// Receives the bound listener addresses once the node is running.
    pub fn listening(&self) -> chan::Receiver<net::SocketAddr> {
        self.listening.clone()
    }

    /// Run the node. This function is meant to be run in its own thread and
    /// blocks until the node is shut down.
    pub fn run(mut self) -> Result<(), Error> {
        let network = self.config.network;
        let dir = self.config.root.join(".ferrite").join(network.as_str());

        fs::create_dir_all(&dir)?;

        let max_connections = self.descriptor_budget();
        let mut peer_store = FileStore::new(dir.join("peers.dat"));
        let ban_store = FileStore::new(dir.join("banlist.dat"));

        // Bootstrap the address book when it is cold.
        let cold_start = ferrite_p2p::store::Store::get(&mut peer_store)?.is_none();
        if self.config.dns_seeds && self.config.connect.is_empty() && cold_start {
            log::info!("Address book is cold; querying DNS seeds..");

            let seeds = self::resolve_seeds(network);
            if seeds.is_empty() {
                if self.config.seed_nodes.is_empty()
                    && self.config.added_nodes.is_empty()
                    && self.config.listen.is_empty()
                {
                    return Err(Error::SeedsUnresolved);
                }
                log::warn!("No DNS seeds resolved; waiting for inbound peers");
            } else {
                log::info!("{} seed address(es) resolved", seeds.len());
                self.handle.send(Command::ImportAddresses(seeds))?;
            }
        }
        for host in self.config.seed_nodes.clone() {
            match self::resolve(&host, network.port()) {
                Ok(addrs) => {
                    for addr in addrs.into_iter().take(1) {
                        self.handle.send(Command::AddOneShot(addr))?;
                    }
                }
                Err(err) => log::warn!("Seed node `{}` did not resolve: {}", host, err),
            }
        }
        for host in self.config.added_nodes.clone() {
            match self::resolve(&host, network.port()) {
                Ok(addrs) => {
                    self.handle.send(Command::AddNode(host, addrs))?;
                }
                Err(err) => log::warn!("Added node `{}` did not resolve: {}", host, err),
            }
        }
        self.reactor.waker().wake()?;

        // A separate thread re-seeds the address book if the dialer ever
        // runs out of candidates.
        let (reseed_send, reseed_recv) = chan::unbounded::<Event>();
        if self.config.dns_seeds {
            let commands = self.handle.clone();
            let waker = self.reactor.waker();

            thread::spawn(move || self::reseeder(reseed_recv, commands, waker, network));
        }

        let publisher = Publisher {
            subscribers: vec![self.events_pub.clone(), reseed_send],
        };

        let machine = fsm::StateMachine::new(
            fsm::Config {
                network,
                target_outbound: self.config.target_outbound,
                max_connections,
                connect: self.config.connect.clone(),
                external_addresses: self.config.external_addresses.clone(),
                receive_flood_size: self.config.max_receive_buffer,
                ..fsm::Config::default()
            },
            peer_store,
            ban_store,
            fastrand::Rng::new(),
        );

        let listen = self.config.listen.clone();

        self.reactor
            .run(&listen, machine, publisher, self.commands)?;

        log::info!("Node stopped");

        Ok(())
    }

    /// The connection budget must fit within the file descriptor limit,
    /// with [`MIN_CORE_FILEDESCRIPTORS`] held in reserve.
    fn descriptor_budget(&self) -> usize {
        let configured = self.config.max_connections;
        let reserved = MIN_CORE_FILEDESCRIPTORS + self.config.listen.len() + 16;

        match self::file_descriptor_limit() {
            Some(limit) if limit < configured + reserved => {
                let clamped = limit.saturating_sub(reserved);
                log::warn!(
                    "File descriptor limit {} is too low for {} connections; reducing to {}",
                    limit,
                    configured,
                    clamped
                );
                clamped
            }
            _ => configured,
        }
    }
}

/// Controls a running node from other threads.
#[derive(Clone)]
pub struct Handle {
    commands: chan::Sender<Command>,
    waker: Waker,
    shutdown: chan::Sender<()>,
    network: Network,
    timeout: time::Duration,
}

impl Handle {
    /// Send a command to the node and wake its reactor.
    pub fn command(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command)?;
        self.waker.wake()?;

        Ok(())
    }

    /// Connect to the given peer.
    pub fn connect(&self, addr: net::SocketAddr) -> Result<(), Error> {
        self.command(Command::Connect(addr))
    }

    /// Disconnect from the given peer.
    pub fn disconnect(&self, addr: net::SocketAddr) -> Result<(), Error> {
        self.command(Command::Disconnect(addr))
    }

    /// Ban a subnet for the given duration, or the default of 24 hours.
    pub fn ban(&self, subnet: Subnet, duration: Option<LocalDuration>) -> Result<(), Error> {
        self.command(Command::Ban(subnet, duration))
    }

    /// Lift a ban.
    pub fn unban(&self, subnet: Subnet) -> Result<(), Error> {
        self.command(Command::Unban(subnet))
    }

    /// Snapshot the ban list.
    pub fn banned(&self) -> Result<Vec<(Subnet, LocalTime)>, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Banned(transmit))?;

        Ok(receive.recv_timeout(self.timeout)?)
    }

    /// Add a node to keep connected to. The host is resolved here, on the
    /// calling thread.
    pub fn add_node(&self, host: &str) -> Result<(), Error> {
        let addrs = self::resolve(host, self.network.port())?;

        self.command(Command::AddNode(host.to_owned(), addrs))
    }

    /// Remove a previously added node.
    pub fn remove_node(&self, host: &str) -> Result<(), Error> {
        self.command(Command::RemoveNode(host.to_owned()))
    }

    /// Queue a one-shot connection to the given host.
    pub fn add_one_shot(&self, host: &str) -> Result<(), Error> {
        let addrs = self::resolve(host, self.network.port())?;

        for addr in addrs.into_iter().take(1) {
            self.command(Command::AddOneShot(addr))?;
        }
        Ok(())
    }

    /// Send a framed message to a peer.
    pub fn message(
        &self,
        addr: net::SocketAddr,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.command(Command::Message(addr, command, payload))
    }

    /// Send a framed message to all negotiated peers.
    pub fn broadcast(&self, command: CommandString, payload: Vec<u8>) -> Result<(), Error> {
        self.command(Command::Broadcast(command, payload))
    }

    /// Send a tracked request to a peer and wait for the reply payload.
    pub fn request(
        &self,
        addr: net::SocketAddr,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Request(addr, command, payload, transmit))?;

        Ok(receive.recv_timeout(self.timeout)?)
    }

    /// Schedule an inventory request to a peer.
    pub fn ask_for(&self, addr: net::SocketAddr, inv: Inventory) -> Result<(), Error> {
        self.command(Command::AskFor(addr, inv))
    }

    /// Announce an inventory to the network.
    pub fn relay_inventory(&self, inv: Inventory) -> Result<(), Error> {
        self.command(Command::RelayInventory(inv))
    }

    /// Update the chain height advertised to peers.
    pub fn set_height(&self, height: i32) -> Result<(), Error> {
        self.command(Command::SetHeight(height))
    }

    /// Snapshot the connected peers.
    pub fn peers(&self) -> Result<Vec<PeerSnapshot>, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetPeers(transmit))?;

        Ok(receive.recv_timeout(self.timeout)?)
    }

    /// Snapshot network statistics.
    pub fn stats(&self) -> Result<Stats, Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetStats(transmit))?;

        Ok(receive.recv_timeout(self.timeout)?)
    }

    /// Shut the node down. `Node::run` returns once the reactor has wound
    /// down and persistent state is flushed.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.shutdown.send(()).ok();
        self.waker.wake()?;

        Ok(())
    }
}

/// Watches for address book exhaustion and re-seeds from DNS, at most once
/// per [`RESEED_INTERVAL`]. Runs until the node's event stream closes.
fn reseeder(
    events: chan::Receiver<Event>,
    commands: chan::Sender<Command>,
    waker: Waker,
    network: Network,
) {
    let mut last_seeded: Option<time::Instant> = None;

    for event in events.iter() {
        let starved = matches!(
            event,
            Event::Connection(fsm::connmgr::Event::AddressBookExhausted)
        );
        if !starved {
            continue;
        }
        if let Some(last) = last_seeded {
            if last.elapsed() < RESEED_INTERVAL {
                continue;
            }
        }
        last_seeded = Some(time::Instant::now());

        log::info!("Address book exhausted; querying DNS seeds..");
        let seeds = self::resolve_seeds(network);

        if !seeds.is_empty() && commands.send(Command::ImportAddresses(seeds)).is_ok() {
            waker.wake().ok();
        }
    }
}

/// Resolve the network's DNS seeds. Failures are logged and skipped.
fn resolve_seeds(network: Network) -> Vec<net::SocketAddr> {
    let port = network.port();
    let mut addrs = Vec::new();

    for seed in network.seeds() {
        match (*seed, port).to_socket_addrs() {
            Ok(resolved) => addrs.extend(resolved),
            Err(err) => log::warn!("DNS seed `{}` did not resolve: {}", seed, err),
        }
    }
    addrs
}

/// Resolve a host, with the network port as the default.
fn resolve(host: &str, default_port: u16) -> Result<Vec<net::SocketAddr>, Error> {
    let addrs: Vec<net::SocketAddr> = if let Ok(addr) = host.parse::<net::SocketAddr>() {
        vec![addr]
    } else if host.contains(':') {
        host.to_socket_addrs()?.collect()
    } else {
        (host, default_port).to_socket_addrs()?.collect()
    };

    Ok(addrs)
}

/// The soft limit on open file descriptors, if it can be determined.
#[cfg(unix)]
fn file_descriptor_limit() -> Option<usize> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: `getrlimit` writes into the struct we hand it and has no
    // other effects.
    let result = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };

    (result == 0).then(|| limit.rlim_cur as usize)
}

#[cfg(not(unix))]
fn file_descriptor_limit() -> Option<usize> {
    None
}
