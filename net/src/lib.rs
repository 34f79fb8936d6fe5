//! Peer-to-peer networking core types.
//!
//! Defines the interface between a network *reactor*, which owns the sockets
//! and performs all I/O, and a protocol *state machine*, which owns all
//! protocol state and instructs the reactor through [`Io`] outputs.
#![deny(unsafe_code)]
use std::sync::Arc;
use std::{fmt, io, net};

use crossbeam_channel as chan;

pub mod error;
pub mod event;
pub mod time;

pub use event::Publisher;
pub use time::{Clock, LocalDuration, LocalTime};

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Inbound connection.
    Inbound,
    /// Outbound connection.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Check whether the link is inbound.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Output of a state transition of a protocol state machine, dispatched by
/// the reactor.
#[derive(Debug)]
pub enum Io<E, D> {
    /// There are bytes ready to be sent to a peer.
    Write(net::SocketAddr, Vec<u8>),
    /// Connect to a peer.
    Connect(net::SocketAddr),
    /// Disconnect from a peer.
    Disconnect(net::SocketAddr, DisconnectReason<D>),
    /// Stop reading from a peer until reads are resumed.
    PauseRead(net::SocketAddr),
    /// Resume reading from a peer.
    ResumeRead(net::SocketAddr),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
}

/// Reason a peer was disconnected, either originating in the network
/// interface, or provided by the state machine.
#[derive(Debug, Clone)]
pub enum DisconnectReason<T> {
    /// Error while dialing the remote. This error occurs before a connection
    /// is even established. Errors of this kind are usually not transient.
    DialError(Arc<io::Error>),
    /// Error with an underlying established connection. Sometimes,
    /// reconnecting after such an error is possible.
    ConnectionError(Arc<io::Error>),
    /// Peer was disconnected for a reason decided by the state machine.
    StateMachine(T),
}

impl<T> DisconnectReason<T> {
    /// Whether the disconnect was caused by a failed dial.
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }

    /// Whether the disconnect was caused by a connection error.
    pub fn is_connection_err(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

impl<T: fmt::Display> fmt::Display for DisconnectReason<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialError(err) => write!(f, "{}", err),
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// A protocol state machine, drivable by a [`Reactor`].
///
/// The state machine is *sans-I/O*: it never reads or writes sockets, it only
/// reacts to reactor inputs and queues [`Io`] instructions, which the reactor
/// obtains by iterating over it.
pub trait StateMachine: Iterator<Item = Io<Self::Event, Self::DisconnectReason>> {
    /// Events emitted to subscribers through the reactor's publisher.
    type Event: fmt::Debug;
    /// Commands handed to the state machine from user threads.
    type Command;
    /// Protocol-specific disconnect reason.
    type DisconnectReason: fmt::Debug + fmt::Display;

    /// Initialize the state machine. Called once, before any other input.
    fn initialize(&mut self, _time: LocalTime) {}

    /// Called when bytes are read from a peer's socket.
    fn received_bytes(&mut self, addr: &net::SocketAddr, bytes: &[u8]);

    /// An outbound connection attempt is underway. Always precedes
    /// [`StateMachine::connected`] for outbound links.
    fn attempted(&mut self, addr: &net::SocketAddr);

    /// A new peer connection was established.
    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link);

    /// A peer connection was closed, either by the remote, by a network
    /// error, or following an [`Io::Disconnect`] instruction.
    fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: DisconnectReason<Self::DisconnectReason>,
    );

    /// A command was received from a user thread.
    fn command(&mut self, cmd: Self::Command);

    /// Called on every reactor iteration, with the current time.
    fn tick(&mut self, local_time: LocalTime);

    /// A timer set with [`Io::SetTimer`] has rung.
    fn wake(&mut self);
}

/// Used by certain types of reactors to wake the event loop, eg. after
/// sending a command from a user thread.
pub trait Waker: Send + Sync + Clone {
    /// Wake up the event loop.
    fn wake(&self) -> io::Result<()>;
}

/// A network reactor that can drive a protocol state machine.
pub trait Reactor {
    /// The type of [`Waker`] this reactor provides.
    type Waker: Waker;

    /// Create a new reactor with a channel to shut it down, and a channel on
    /// which bound listener addresses are delivered.
    fn new(
        shutdown: chan::Receiver<()>,
        listening: chan::Sender<net::SocketAddr>,
    ) -> Result<Self, io::Error>
    where
        Self: Sized;

    /// Run the given state machine with the reactor. Blocks until shutdown.
    fn run<S, E>(
        &mut self,
        listen_addrs: &[net::SocketAddr],
        machine: S,
        publisher: E,
        commands: chan::Receiver<S::Command>,
    ) -> Result<(), error::Error>
    where
        S: StateMachine,
        E: Publisher<S::Event>;

    /// Construct a new instance of the reactor waker.
    fn waker(&self) -> Self::Waker;
}
