//! Reactor errors.
use std::{io, net};

use thiserror::Error;

/// An error occurring in the network reactor.
#[derive(Error, Debug)]
pub enum Error {
    /// A listener could not be bound.
    #[error("binding listener on {0} failed: {1}")]
    Bind(net::SocketAddr, #[source] io::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}
