//! Poll-based reactor for the ferrite peer-to-peer stack.
//!
//! All socket I/O is multiplexed on a single thread with `poll(2)`; the
//! protocol state machine runs on that same thread and never blocks.
#![deny(unsafe_code)]

pub mod reactor;
pub mod socket;
pub mod time;

pub use reactor::{Reactor, Waker};
