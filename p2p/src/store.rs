//! Snapshot persistence for protocol state.
//!
//! The address manager and ban list serialize themselves to byte snapshots;
//! a [`Store`] decides where those snapshots live. The daemon provides
//! file-backed stores; tests use [`Memory`].
use std::io;

/// Storage for a state snapshot.
pub trait Store {
    /// Persist a snapshot, atomically replacing any previous one.
    fn put(&mut self, data: &[u8]) -> io::Result<()>;

    /// Load the most recent snapshot, if one exists.
    fn get(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// A store that discards snapshots. Used when persistence is disabled.
impl Store for () {
    fn put(&mut self, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn get(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct Memory {
    data: Option<Vec<u8>>,
}

impl Store for Memory {
    fn put(&mut self, data: &[u8]) -> io::Result<()> {
        self.data = Some(data.to_vec());
        Ok(())
    }

    fn get(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.clone())
    }
}
