//! Node errors.
use std::io;

use crossbeam_channel as chan;
use thiserror::Error;

/// A node error.
#[derive(Error, Debug)]
pub enum Error {
    /// An error coming from the networking sub-system.
    #[error(transparent)]
    Net(#[from] ferrite_net::error::Error),
    /// An I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// No listed DNS seed could be resolved.
    #[error("none of the DNS seeds could be resolved")]
    SeedsUnresolved,
    /// A handle request timed out.
    #[error("request timed out")]
    Timeout,
    /// The node is shutting down, or its command channel is disconnected.
    #[error("command channel disconnected")]
    Channel,
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Channel
    }
}

impl From<chan::RecvTimeoutError> for Error {
    fn from(err: chan::RecvTimeoutError) -> Self {
        match err {
            chan::RecvTimeoutError::Timeout => Self::Timeout,
            chan::RecvTimeoutError::Disconnected => Self::Channel,
        }
    }
}
