//! Poll-based reactor. This is a single-threaded reactor using a `poll` loop.
use crossbeam_channel as chan;

use ferrite_net::error::Error;
use ferrite_net::event::Publisher;
use ferrite_net::time::{LocalDuration, LocalTime};
use ferrite_net::{DisconnectReason, Io, Link, StateMachine};

use log::*;

use std::collections::{HashMap, HashSet};
use std::io;
use std::net;
use std::sync::Arc;
use std::time::SystemTime;

use crate::socket::Socket;
use crate::time::TimeoutManager;

/// Maximum amount of time to wait for i/o.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_mins(60);
/// Socket read buffer size. Reads are bounded to this many bytes per pass.
const READ_BUFFER_SIZE: usize = 1024 * 192;
/// Default maximum number of bytes queued on a single peer's send queue
/// before the peer is disconnected.
pub const DEFAULT_MAX_SEND_BUFFER: usize = 1000 * 1000;

#[derive(Debug, PartialEq, Eq, Clone)]
enum Source {
    Peer(net::SocketAddr),
    Listener(net::SocketAddr),
    Waker,
}

/// A single-threaded non-blocking reactor.
pub struct Reactor {
    peers: HashMap<net::SocketAddr, Socket<net::TcpStream>>,
    connecting: HashSet<net::SocketAddr>,
    sources: popol::Sources<Source>,
    waker: Waker,
    timeouts: TimeoutManager<()>,
    shutdown: chan::Receiver<()>,
    listening: chan::Sender<net::SocketAddr>,
    /// Peers whose send queue exceeds this size are disconnected.
    pub max_send_buffer: usize,
}

/// Reactor waker handle.
#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl ferrite_net::Waker for Waker {
    fn wake(&self) -> io::Result<()> {
        popol::Waker::wake(&self.0)
    }
}

impl Reactor {
    /// Register a peer with the reactor.
    fn register_peer(&mut self, addr: net::SocketAddr, stream: net::TcpStream, link: Link) {
        self.sources
            .register(Source::Peer(addr), &stream, popol::interest::ALL);
        self.peers.insert(addr, Socket::from(stream, addr, link));
    }

    /// Unregister a peer from the reactor.
    fn unregister_peer<S>(
        &mut self,
        addr: net::SocketAddr,
        reason: DisconnectReason<S::DisconnectReason>,
        machine: &mut S,
    ) where
        S: StateMachine,
    {
        self.connecting.remove(&addr);
        self.sources.unregister(&Source::Peer(addr));
        self.peers.remove(&addr);

        machine.disconnected(&addr, reason);
    }
}

impl ferrite_net::Reactor for Reactor {
    type Waker = Waker;

    /// Construct a new reactor, given a shutdown channel and a channel on
    /// which bound listener addresses are delivered.
    fn new(
        shutdown: chan::Receiver<()>,
        listening: chan::Sender<net::SocketAddr>,
    ) -> Result<Self, io::Error> {
        let peers = HashMap::new();

        let mut sources = popol::Sources::new();
        let waker = Waker(Arc::new(popol::Waker::new(&mut sources, Source::Waker)?));
        let timeouts = TimeoutManager::new();
        let connecting = HashSet::new();

        Ok(Self {
            peers,
            connecting,
            sources,
            waker,
            timeouts,
            shutdown,
            listening,
            max_send_buffer: DEFAULT_MAX_SEND_BUFFER,
        })
    }

    /// Run the given state machine with the reactor.
    fn run<S, E>(
        &mut self,
        listen_addrs: &[net::SocketAddr],
        mut machine: S,
        mut publisher: E,
        commands: chan::Receiver<S::Command>,
    ) -> Result<(), Error>
    where
        S: StateMachine,
        E: Publisher<S::Event>,
    {
        let mut listeners = HashMap::new();

        for addr in listen_addrs {
            let listener = self::listen(addr)?;
            let local_addr = listener.local_addr()?;

            self.sources
                .register(Source::Listener(local_addr), &listener, popol::interest::READ);
            self.listening.send(local_addr).ok();

            info!("Listening on {}", local_addr);

            listeners.insert(local_addr, listener);
        }

        info!("Initializing protocol..");

        let local_time = SystemTime::now().into();
        machine.initialize(local_time);

        self.process(&mut machine, &mut publisher, local_time);

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = popol::Events::new();
        // Timeouts populated by `TimeoutManager::wake`.
        let mut timeouts = Vec::with_capacity(32);

        loop {
            let timeout = self
                .timeouts
                .next(SystemTime::now().into())
                .unwrap_or(WAIT_TIMEOUT)
                .into();

            trace!(
                "Polling {} source(s) and {} timeout(s), waking up in {:?}..",
                self.sources.len(),
                self.timeouts.len(),
                timeout
            );

            let result = self.sources.wait_timeout(&mut events, timeout); // Blocking.
            let local_time = SystemTime::now().into();

            machine.tick(local_time);

            match result {
                Ok(()) => {
                    trace!("Woke up with {} source(s) ready", events.len());

                    for (source, ev) in events.iter() {
                        match source {
                            Source::Peer(addr) => {
                                if ev.errored || ev.hangup {
                                    // Let the subsequent read fail.
                                    trace!("{}: Socket error triggered: {:?}", addr, ev);
                                }
                                if ev.invalid {
                                    // File descriptor was closed and is invalid.
                                    // Nb. This shouldn't happen. It means the source wasn't
                                    // properly unregistered, or there is a duplicate source.
                                    error!("{}: Socket is invalid, removing", addr);

                                    self.sources.unregister(&Source::Peer(*addr));
                                    continue;
                                }

                                if ev.writable {
                                    self.handle_writable(addr, source, &mut machine);
                                }
                                if ev.readable {
                                    self.handle_readable(addr, &mut machine);
                                }
                            }
                            Source::Listener(local_addr) => loop {
                                let listener = match listeners.get(local_addr) {
                                    Some(listener) => listener,
                                    None => break,
                                };
                                let (conn, addr) = match listener.accept() {
                                    Ok((conn, addr)) => (conn, addr),
                                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                        break;
                                    }
                                    Err(e) => {
                                        error!("Accept error: {}", e.to_string());
                                        break;
                                    }
                                };
                                trace!("{}: Accepting peer connection", addr);

                                conn.set_nonblocking(true)?;

                                let local_addr = conn.local_addr()?;
                                let link = Link::Inbound;

                                self.register_peer(addr, conn, link);

                                machine.connected(addr, &local_addr, link);
                            },
                            Source::Waker => {
                                trace!("Woken up by waker ({} command(s))", commands.len());

                                // Exit the reactor loop if a shutdown was received.
                                if let Ok(()) = self.shutdown.try_recv() {
                                    return Ok(());
                                }
                                popol::Waker::reset(ev.source).ok();

                                for cmd in commands.try_iter() {
                                    machine.command(cmd);
                                }
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                    // Nb. We don't track which timers have rung; as long as
                    // *something* timed out, we wake the state machine.
                    self.timeouts.wake(local_time, &mut timeouts);

                    if !timeouts.is_empty() {
                        timeouts.clear();
                        machine.wake();
                    }
                }
                Err(err) => return Err(err.into()),
            }
            self.process(&mut machine, &mut publisher, local_time);
        }
    }

    /// Return a new waker.
    ///
    /// Used to wake up the main event loop from another thread.
    fn waker(&self) -> Waker {
        self.waker.clone()
    }
}

impl Reactor {
    /// Process state machine outputs.
    fn process<S, E>(&mut self, machine: &mut S, publisher: &mut E, local_time: LocalTime)
    where
        S: StateMachine,
        E: Publisher<S::Event>,
    {
        // Note that there may be instructions destined for a peer that has
        // since been disconnected.
        while let Some(out) = machine.next() {
            match out {
                Io::Write(addr, bytes) => {
                    if let Some(socket) = self.peers.get_mut(&addr) {
                        socket.push(bytes);

                        if socket.queued() > self.max_send_buffer {
                            debug!("{}: Send buffer overflow ({} bytes)", addr, socket.queued());

                            socket.disconnect().ok();
                            self.unregister_peer(
                                addr,
                                DisconnectReason::ConnectionError(Arc::new(io::Error::new(
                                    io::ErrorKind::Other,
                                    "send buffer overflow",
                                ))),
                                machine,
                            );
                        } else if let Some(source) = self.sources.get_mut(&Source::Peer(addr)) {
                            source.set(popol::interest::WRITE);
                        }
                    }
                }
                Io::Connect(addr) => {
                    trace!("Connecting to {}...", &addr);

                    match self::dial(&addr) {
                        Ok(stream) => {
                            trace!("{:#?}", stream);

                            self.register_peer(addr, stream, Link::Outbound);
                            self.connecting.insert(addr);

                            machine.attempted(&addr);
                        }
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                            // Ignore. We are already establishing a connection through
                            // this socket.
                        }
                        Err(err) => {
                            error!("{}: Connection error: {}", addr, err.to_string());

                            machine
                                .disconnected(&addr, DisconnectReason::DialError(Arc::new(err)));
                        }
                    }
                }
                Io::Disconnect(addr, reason) => {
                    if let Some(socket) = self.peers.get_mut(&addr) {
                        trace!("{}: Disconnecting: {}", addr, reason);

                        // Give queued data one last chance to leave; any
                        // remainder is dropped with the connection.
                        socket.flush().ok();

                        // Shut the connection down, ignoring any errors. If
                        // the socket was already disconnected, this yields
                        // `ENOTCONN`, which is safe to ignore.
                        socket.disconnect().ok();

                        self.unregister_peer(addr, reason, machine);
                    }
                }
                Io::PauseRead(addr) => {
                    if let Some(source) = self.sources.get_mut(&Source::Peer(addr)) {
                        source.unset(popol::interest::READ);
                    }
                    if let Some(socket) = self.peers.get_mut(&addr) {
                        socket.paused = true;
                    }
                }
                Io::ResumeRead(addr) => {
                    if let Some(source) = self.sources.get_mut(&Source::Peer(addr)) {
                        source.set(popol::interest::READ);
                    }
                    if let Some(socket) = self.peers.get_mut(&addr) {
                        socket.paused = false;
                    }
                }
                Io::SetTimer(timeout) => {
                    self.timeouts.register((), local_time + timeout);
                }
                Io::Event(event) => {
                    trace!("Event: {:?}", event);

                    publisher.publish(event);
                }
            }
        }
    }

    fn handle_readable<S>(&mut self, addr: &net::SocketAddr, machine: &mut S)
    where
        S: StateMachine,
    {
        // Nb. If the socket was readable and writable at the same time, and it was disconnected
        // during an attempt to write, it will no longer be registered and hence available
        // for reads.
        if let Some(socket) = self.peers.get_mut(addr) {
            let mut buffer = [0; READ_BUFFER_SIZE];

            trace!("{}: Socket is readable", addr);

            // Nb. Since `poll`, which this reactor is based on, is *level-triggered*,
            // we will be notified again if there is still data to be read on the socket.
            // Hence, there is no use in putting this socket read in a loop, as the second
            // invocation would likely block.
            match socket.read(&mut buffer) {
                Ok(count) => {
                    if count > 0 {
                        trace!("{}: Read {} bytes", addr, count);

                        machine.received_bytes(addr, &buffer[..count]);
                    } else {
                        trace!("{}: Read 0 bytes", addr);
                        // If we get zero bytes read as a return value, it means the peer has
                        // performed an orderly shutdown.
                        socket.disconnect().ok();
                        self.unregister_peer(
                            *addr,
                            DisconnectReason::ConnectionError(Arc::new(io::Error::from(
                                io::ErrorKind::ConnectionReset,
                            ))),
                            machine,
                        );
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // This shouldn't normally happen, since this function is only called
                    // when there's data on the socket. We leave it here in case external
                    // conditions change.
                }
                Err(err) => {
                    trace!("{}: Read error: {}", addr, err.to_string());

                    socket.disconnect().ok();
                    self.unregister_peer(
                        *addr,
                        DisconnectReason::ConnectionError(Arc::new(err)),
                        machine,
                    );
                }
            }
        }
    }

    fn handle_writable<S: StateMachine>(
        &mut self,
        addr: &net::SocketAddr,
        source: &Source,
        machine: &mut S,
    ) {
        trace!("{}: Socket is writable", addr);

        let source = match self.sources.get_mut(source) {
            Some(source) => source,
            None => return,
        };
        let socket = match self.peers.get_mut(addr) {
            Some(socket) => socket,
            None => return,
        };

        // "A file descriptor for a socket that is connecting asynchronously shall indicate
        // that it is ready for writing, once a connection has been established."
        //
        // Since we perform a non-blocking connect, we're only really connected once the socket
        // is writable.
        if self.connecting.remove(addr) {
            match socket.local_address() {
                Ok(local_addr) => {
                    machine.connected(socket.address, &local_addr, socket.link);
                }
                Err(err) => {
                    // The connect failed; the local address of an
                    // unconnected socket is meaningless.
                    socket.disconnect().ok();
                    self.unregister_peer(
                        *addr,
                        DisconnectReason::DialError(Arc::new(err)),
                        machine,
                    );
                    return;
                }
            }
        }

        match socket.flush() {
            // In this case, we've written all the data, and are no longer
            // interested in writing to this socket.
            Ok(true) => {
                source.unset(popol::interest::WRITE);
            }
            // In this case, the write couldn't complete. Keep the `WRITE`
            // interest to be notified when the socket is ready again.
            Ok(false) => {
                source.set(popol::interest::WRITE);
            }
            Err(err) => {
                error!("{}: Write error: {}", addr, err.to_string());

                socket.disconnect().ok();
                self.unregister_peer(
                    *addr,
                    DisconnectReason::ConnectionError(Arc::new(err)),
                    machine,
                );
            }
        }
    }
}

/// Connect to a peer given a remote address.
fn dial(addr: &net::SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_nonblocking(true)?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

// Listen for connections on the given address.
fn listen(addr: &net::SocketAddr) -> Result<net::TcpListener, Error> {
    let sock = net::TcpListener::bind(addr).map_err(|e| Error::Bind(*addr, e))?;

    sock.set_nonblocking(true)?;

    Ok(sock)
}
