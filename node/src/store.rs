//! File-backed snapshot stores.
//!
//! Snapshots are written to a temporary file and moved into place, so a
//! crash mid-write can never corrupt the previous snapshot.
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use ferrite_p2p::store::Store;

/// A store keeping its snapshot in a single file, eg. `peers.dat`.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a store backed by the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Store for FileStore {
    fn put(&mut self, data: &[u8]) -> io::Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }

    fn get(&mut self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("peers.dat"));

        assert_eq!(store.get().unwrap(), None);

        store.put(&[1, 2, 3]).unwrap();
        assert_eq!(store.get().unwrap(), Some(vec![1, 2, 3]));

        // Snapshots replace each other wholesale.
        store.put(&[4, 5]).unwrap();
        assert_eq!(store.get().unwrap(), Some(vec![4, 5]));
    }
}
