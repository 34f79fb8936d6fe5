//! Peer-to-peer protocol implementation for the ferrite network.
//!
//! The [`fsm::StateMachine`] holds all protocol state and is driven by a
//! reactor (see `ferrite-net-poll`); it performs no I/O of its own.
#![deny(unsafe_code)]

pub mod fsm;
pub mod message;
pub mod store;
pub mod stream;
pub mod wire;

pub use crossbeam_channel as chan;
pub use ferrite_net::{Link, LocalDuration, LocalTime};
