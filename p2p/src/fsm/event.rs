//! Protocol events.
//!
//! Everything the connection core reports to the outside world, including
//! the messages destined for the external dispatcher.
use std::fmt;

use crate::fsm::{addrmgr, banmgr, connmgr, invmgr, peermgr, PeerId};
use crate::message::CommandString;

/// An event emitted by the protocol state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer manager event.
    Peer(peermgr::Event),
    /// An address manager event.
    Address(addrmgr::Event),
    /// A ban manager event.
    Ban(banmgr::Event),
    /// A connection manager event.
    Connection(connmgr::Event),
    /// An inventory manager event.
    Inventory(invmgr::Event),
    /// A framed message the core doesn't interpret, for the external
    /// dispatcher.
    Message {
        /// The peer the message was received from.
        from: PeerId,
        /// The message command.
        command: CommandString,
        /// The message payload.
        payload: Vec<u8>,
    },
}

impl From<peermgr::Event> for Event {
    fn from(e: peermgr::Event) -> Self {
        Self::Peer(e)
    }
}

impl From<addrmgr::Event> for Event {
    fn from(e: addrmgr::Event) -> Self {
        Self::Address(e)
    }
}

impl From<banmgr::Event> for Event {
    fn from(e: banmgr::Event) -> Self {
        Self::Ban(e)
    }
}

impl From<connmgr::Event> for Event {
    fn from(e: connmgr::Event) -> Self {
        Self::Connection(e)
    }
}

impl From<invmgr::Event> for Event {
    fn from(e: invmgr::Event) -> Self {
        Self::Inventory(e)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(e) => e.fmt(f),
            Self::Address(e) => e.fmt(f),
            Self::Ban(e) => e.fmt(f),
            Self::Connection(e) => e.fmt(f),
            Self::Inventory(e) => e.fmt(f),
            Self::Message { from, command, payload } => {
                write!(f, "{}: `{}` message ({} bytes)", from, command, payload.len())
            }
        }
    }
}
