//! The ferrite network daemon.
//!
//! Wires the protocol state machine to the poll reactor, loads and saves
//! persistent state, and exposes a thread-safe [`node::Handle`] for
//! controlling the running node.
pub mod error;
pub mod logger;
pub mod node;
pub mod store;

pub use error::Error;
pub use node::{Config, Handle, Node};

use ferrite_common::network::Network;

/// Run the node until it is shut down.
pub fn run(config: Config) -> Result<(), Error> {
    let network: Network = config.network;
    let node = Node::new(config)?;

    log::info!("Starting node on {}..", network.as_str());

    node.run()
}
