//! Peer-to-peer socket abstraction.
//!
//! Wraps a raw stream with an ordered queue of outbound byte chunks. The
//! queue is drained opportunistically whenever the socket is writable.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net;

use ferrite_net::Link;

/// A peer socket with an outbound write queue.
///
/// While the queue is non-empty, `offset` is strictly less than the length
/// of the head chunk.
#[derive(Debug)]
pub struct Socket<R> {
    raw: R,
    /// Remote peer address.
    pub address: net::SocketAddr,
    /// Link direction.
    pub link: Link,
    /// Whether reads from this socket are currently paused.
    pub paused: bool,
    /// Queued chunks, oldest first.
    queue: VecDeque<Vec<u8>>,
    /// Offset into the head chunk, up to which data was already sent.
    offset: usize,
    /// Total number of queued bytes.
    queued: usize,
}

impl<R: Read + Write> Socket<R> {
    /// Create a new socket from a raw stream and an address.
    pub fn from(raw: R, address: net::SocketAddr, link: Link) -> Self {
        Self {
            raw,
            address,
            link,
            paused: false,
            queue: VecDeque::new(),
            offset: 0,
            queued: 0,
        }
    }

    /// Read from the underlying stream.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }

    /// Queue a chunk of bytes to be sent to the peer.
    pub fn push(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.queued += bytes.len();
        self.queue.push_back(bytes);
    }

    /// Total number of bytes queued for sending.
    pub fn queued(&self) -> usize {
        self.queued
    }

    /// Write out as much of the queue as the socket accepts.
    ///
    /// Returns `true` once the queue is fully drained, and `false` if the
    /// socket would block, in which case the caller should retain write
    /// interest. Any other error is fatal to the connection.
    pub fn flush(&mut self) -> io::Result<bool> {
        while let Some(head) = self.queue.front() {
            debug_assert!(self.offset < head.len());

            match self.raw.write(&head[self.offset..]) {
                Ok(0) => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero));
                }
                Ok(n) => {
                    self.offset += n;
                    self.queued -= n;

                    if self.offset == head.len() {
                        self.queue.pop_front();
                        self.offset = 0;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(false);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        self.raw.flush().or_else(|err| {
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(())
            } else {
                Err(err)
            }
        })?;

        Ok(true)
    }
}

impl Socket<net::TcpStream> {
    /// Shut the connection down, ignoring `ENOTCONN` which occurs when the
    /// remote already closed its end.
    pub fn disconnect(&self) -> io::Result<()> {
        match self.raw.shutdown(net::Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }

    /// The local address of this socket.
    pub fn local_address(&self) -> io::Result<net::SocketAddr> {
        self.raw.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_flush_partial_writes() {
        let mut socket = Socket::from(
            PartialWriter::default(),
            ([127, 0, 0, 1], 9333).into(),
            Link::Outbound,
        );
        socket.push(vec![1, 2, 3, 4]);
        socket.push(vec![5, 6]);
        assert_eq!(socket.queued(), 6);

        // First pass accepts three bytes, then blocks.
        assert!(!socket.flush().unwrap());
        assert_eq!(socket.queued(), 3);

        // Second pass drains the rest, across the chunk boundary.
        assert!(socket.flush().unwrap());
        assert_eq!(socket.queued(), 0);
        assert_eq!(socket.raw.written, vec![1, 2, 3, 4, 5, 6]);
    }

    /// Writer accepting at most three bytes per flush pass.
    #[derive(Default)]
    struct PartialWriter {
        written: Vec<u8>,
        pass: usize,
    }

    impl Read for PartialWriter {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for PartialWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.pass >= 3 {
                self.pass = 0;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(3 - self.pass);
            self.pass += n;
            self.written.extend_from_slice(&buf[..n]);

            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_order() {
        let mut socket = Socket::from(
            Cursor::new(Vec::new()),
            ([127, 0, 0, 1], 9333).into(),
            Link::Outbound,
        );
        for chunk in [vec![0xde, 0xad], vec![0xbe, 0xef], vec![0x00]] {
            socket.push(chunk);
        }
        assert!(socket.flush().unwrap());
        assert_eq!(socket.raw.get_ref().as_slice(), [0xde, 0xad, 0xbe, 0xef, 0x00]);
    }
}
