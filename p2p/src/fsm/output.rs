//! Protocol output capabilities.
//!
//! Each sub-manager, eg. the handshake or the dialer, is given a copy of the
//! [`Outbox`] with specific capabilities, eg. connecting, disconnecting, or
//! sending messages, to communicate with the reactor.
use log::*;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net;
use std::rc::Rc;

use ferrite_net::LocalDuration;

use crate::fsm::{DisconnectReason, Event, PeerId};
use crate::message::{CommandString, NetworkMessage, VersionMessage};
use crate::wire::{self, Address, Inventory};

/// Output of a state transition of the protocol state machine.
pub type Io = ferrite_net::Io<Event, DisconnectReason>;

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to a peer, with a connection timeout.
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from a peer.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to be woken up in the future.
pub trait Wakeup {
    /// Ask to be woken up in a predefined amount of time.
    fn wakeup(&self, duration: LocalDuration) -> &Self;
}

/// The ability to throttle reading from a peer.
pub trait FlowControl {
    /// Stop reading from a peer.
    fn pause_read(&self, addr: PeerId);
    /// Resume reading from a peer.
    fn resume_read(&self, addr: PeerId);
}

/// The ferrite wire protocol.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    /// Send a `version` message.
    fn version(&mut self, addr: PeerId, msg: VersionMessage) -> &mut Self;

    /// Send a `verack` message.
    fn verack(&mut self, addr: PeerId) -> &mut Self;

    /// Send a `ping` message.
    fn ping(&mut self, addr: PeerId, nonce: u64) -> &Self;

    /// Send a `pong` message.
    fn pong(&mut self, addr: PeerId, nonce: u64) -> &Self;

    /// Send a `getaddr` message.
    fn get_addr(&mut self, addr: PeerId);

    /// Send an `addr` message.
    fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>);

    /// Send an `inv` message.
    fn inv(&mut self, addr: PeerId, inventories: Vec<Inventory>);

    /// Send a `getdata` message.
    fn get_data(&mut self, addr: PeerId, inventories: Vec<Inventory>);

    /// Send a message framed on behalf of the external dispatcher.
    fn raw(&mut self, addr: PeerId, command: CommandString, payload: Vec<u8>);
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// Network magic, used to frame outgoing messages.
    magic: u32,
    /// Output queue.
    outbound: Rc<RefCell<VecDeque<Io>>>,
    /// Bytes queued for sending, in total.
    sent_bytes: Rc<RefCell<u64>>,
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.borrow_mut().pop_front()
    }
}

impl Outbox {
    /// Create a new outbox framing messages with the given network magic.
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            outbound: Rc::new(RefCell::new(VecDeque::new())),
            sent_bytes: Rc::new(RefCell::new(0)),
        }
    }

    /// Push an output to the queue.
    pub fn push(&self, output: Io) {
        self.outbound.borrow_mut().push_back(output);
    }

    /// Total bytes queued for sending over the lifetime of the outbox.
    pub fn sent_bytes(&self) -> u64 {
        *self.sent_bytes.borrow()
    }

    /// Frame and queue a message to a peer.
    pub fn message(&mut self, addr: PeerId, payload: NetworkMessage) -> &Self {
        debug!(target: "p2p", "Sending {} to {}", payload.command(), addr);

        let bytes = wire::serialize(&payload.to_raw(self.magic));

        *self.sent_bytes.borrow_mut() += bytes.len() as u64;
        self.push(Io::Write(addr, bytes));
        self
    }

    #[cfg(test)]
    pub(crate) fn drain(&mut self) -> Vec<Io> {
        self.outbound.borrow_mut().drain(..).collect()
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        debug!(target: "p2p", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(
            addr,
            ferrite_net::DisconnectReason::StateMachine(reason),
        ));
    }
}

impl Wakeup for Outbox {
    fn wakeup(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl FlowControl for Outbox {
    fn pause_read(&self, addr: PeerId) {
        self.push(Io::PauseRead(addr));
    }

    fn resume_read(&self, addr: PeerId) {
        self.push(Io::ResumeRead(addr));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        info!(target: "p2p", "{}", &event);

        self.push(Io::Event(event.into()));
    }

    fn version(&mut self, addr: PeerId, msg: VersionMessage) -> &mut Self {
        self.message(addr, NetworkMessage::Version(msg));
        self
    }

    fn verack(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, NetworkMessage::Verack);
        self
    }

    fn ping(&mut self, addr: PeerId, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Ping(nonce));
        self
    }

    fn pong(&mut self, addr: PeerId, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Pong(nonce));
        self
    }

    fn get_addr(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::GetAddr);
    }

    fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>) {
        self.message(addr, NetworkMessage::Addr(addrs));
    }

    fn inv(&mut self, addr: PeerId, inventories: Vec<Inventory>) {
        self.message(addr, NetworkMessage::Inv(inventories));
    }

    fn get_data(&mut self, addr: PeerId, inventories: Vec<Inventory>) {
        self.message(addr, NetworkMessage::GetData(inventories));
    }

    fn raw(&mut self, addr: PeerId, command: CommandString, payload: Vec<u8>) {
        self.message(addr, NetworkMessage::Unknown { command, payload });
    }
}

#[cfg(test)]
#[allow(unused_variables)]
mod stub {
    use super::*;

    impl<E> Wire<E> for () {
        fn event(&self, event: E) {}
        fn version(&mut self, addr: PeerId, msg: VersionMessage) -> &mut Self {
            self
        }
        fn verack(&mut self, addr: PeerId) -> &mut Self {
            self
        }
        fn ping(&mut self, addr: PeerId, nonce: u64) -> &Self {
            self
        }
        fn pong(&mut self, addr: PeerId, nonce: u64) -> &Self {
            self
        }
        fn get_addr(&mut self, addr: PeerId) {}
        fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>) {}
        fn inv(&mut self, addr: PeerId, inventories: Vec<Inventory>) {}
        fn get_data(&mut self, addr: PeerId, inventories: Vec<Inventory>) {}
        fn raw(&mut self, addr: PeerId, command: CommandString, payload: Vec<u8>) {}
    }

    impl Connect for () {
        fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {}
    }

    impl Disconnect for () {
        fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {}
    }

    impl Wakeup for () {
        fn wakeup(&self, duration: LocalDuration) -> &Self {
            &()
        }
    }

    impl FlowControl for () {
        fn pause_read(&self, addr: PeerId) {}
        fn resume_read(&self, addr: PeerId) {}
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    /// Collect the messages sent to a given peer.
    pub fn messages_to(outbox: &mut Outbox, addr: &net::SocketAddr) -> Vec<NetworkMessage> {
        let mut msgs = Vec::new();

        outbox.outbound.borrow_mut().retain(|o| match o {
            Io::Write(a, bytes) if a == addr => {
                let mut decoder = crate::stream::Decoder::new(0xF9BE_B4D9, 1024);
                decoder.input(bytes);

                while let Ok(Some(raw)) = decoder.decode_next() {
                    msgs.push(NetworkMessage::from_raw(raw).unwrap());
                }
                false
            }
            _ => true,
        });
        msgs
    }

    /// Collect all emitted events.
    pub fn events(outbox: &mut Outbox) -> Vec<Event> {
        let mut events = Vec::new();

        outbox.outbound.borrow_mut().retain(|o| match o {
            Io::Event(e) => {
                events.push(e.clone());
                false
            }
            _ => true,
        });
        events
    }
}
