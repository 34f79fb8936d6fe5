//! Message stream decoding.
//!
//! Turns a raw byte stream, delivered in arbitrary chunks, into framed
//! messages. The decoder never blocks: it consumes whatever the reader
//! supplied and emits messages as they complete.
use thiserror::Error;

use crate::message::{Header, RawMessage, HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::wire::{self, Decodable};

/// A framing error.
///
/// [`Error::InvalidChecksum`] is recoverable: the offending message is
/// dropped and decoding continues at the next header. All other errors mean
/// the stream is desynchronized and the peer connection is beyond saving.
#[derive(Error, Debug)]
pub enum Error {
    /// The header magic doesn't match our network.
    #[error("invalid message magic {actual:#x}, expected {expected:#x}")]
    InvalidMagic {
        /// The magic we expect.
        expected: u32,
        /// The magic that was received.
        actual: u32,
    },
    /// The header declares a payload larger than the protocol allows.
    #[error("message payload length {0} exceeds maximum")]
    MessageOversize(usize),
    /// The header could not be parsed.
    #[error("invalid message header: {0}")]
    InvalidHeader(#[from] wire::Error),
    /// The payload doesn't match the header checksum.
    #[error("invalid payload checksum for `{command}` message")]
    InvalidChecksum {
        /// Command of the dropped message.
        command: String,
    },
}

impl Error {
    /// Whether decoding can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidChecksum { .. })
    }
}

/// Message stream decoder.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
    magic: u32,
}

impl Decoder {
    /// Create a new stream decoder for a network with the given magic.
    pub fn new(magic: u32, capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
            magic,
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet decoded into messages.
    pub fn unparsed(&self) -> usize {
        self.unparsed.len()
    }

    /// Decode and return the next message. Returns [`None`] when more input
    /// is needed.
    pub fn decode_next(&mut self) -> Result<Option<RawMessage>, Error> {
        if self.unparsed.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = Header::decode(&mut &self.unparsed[..HEADER_SIZE])?;

        if header.magic != self.magic {
            return Err(Error::InvalidMagic {
                expected: self.magic,
                actual: header.magic,
            });
        }
        let length = header.length as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::MessageOversize(length));
        }
        if self.unparsed.len() < HEADER_SIZE + length {
            return Ok(None);
        }
        let payload = self.unparsed[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        // Drain the frame, valid or not; a checksum failure drops just this
        // message and the stream stays synchronized.
        self.unparsed.drain(..HEADER_SIZE + length);

        if crate::message::checksum(&payload) != header.checksum {
            return Err(Error::InvalidChecksum {
                command: header.command.to_string(),
            });
        }
        Ok(Some(RawMessage {
            magic: header.magic,
            command: header.command,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, NetworkMessage};
    use crate::wire::serialize;

    use quickcheck_macros::quickcheck;

    const MAGIC: u32 = 0xF9BE_B4D9;

    fn encoded(msg: NetworkMessage) -> Vec<u8> {
        serialize(&msg.to_raw(MAGIC))
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let msg = NetworkMessage::Unknown {
            command: message::CommandString::new("ping").unwrap(),
            payload: vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
        };
        let bytes = encoded(msg);
        assert_eq!(bytes.len(), 32);

        let mut decoder = Decoder::new(MAGIC, 1024);
        let mut msgs = Vec::new();

        for byte in &bytes {
            decoder.input(std::slice::from_ref(byte));

            while let Some(msg) = decoder.decode_next().unwrap() {
                msgs.push(msg);
            }
        }
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].command.as_str(), "ping");
        assert_eq!(msgs[0].payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decoder.unparsed(), 0);
    }

    #[quickcheck]
    fn prop_decode_next(chunk_size: usize) {
        let chunk_size = 1 + chunk_size % 64;

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&encoded(NetworkMessage::Verack));
        bytes.extend_from_slice(&encoded(NetworkMessage::Ping(100)));
        bytes.extend_from_slice(&encoded(NetworkMessage::GetAddr));

        let mut decoder = Decoder::new(MAGIC, 1024);
        let mut msgs = Vec::new();

        for chunk in bytes.as_slice().chunks(chunk_size) {
            decoder.input(chunk);

            while let Some(msg) = decoder.decode_next().unwrap() {
                msgs.push(NetworkMessage::from_raw(msg).unwrap());
            }
        }
        assert_eq!(decoder.unparsed(), 0);
        assert_eq!(
            msgs,
            vec![
                NetworkMessage::Verack,
                NetworkMessage::Ping(100),
                NetworkMessage::GetAddr
            ]
        );
    }

    #[test]
    fn test_invalid_magic_detected_on_first_header() {
        let mut bytes = encoded(NetworkMessage::Verack);
        bytes[0] ^= 0xFF;

        let mut decoder = Decoder::new(MAGIC, 1024);

        // The error surfaces as soon as the header is complete, even if the
        // payload never arrives.
        decoder.input(&bytes[..message::HEADER_SIZE]);
        assert!(matches!(
            decoder.decode_next(),
            Err(Error::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_oversize_length_detected_on_first_header() {
        let mut bytes = encoded(NetworkMessage::Verack);
        bytes[16..20].copy_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes());

        let mut decoder = Decoder::new(MAGIC, 1024);
        decoder.input(&bytes[..message::HEADER_SIZE]);

        assert!(matches!(
            decoder.decode_next(),
            Err(Error::MessageOversize(_))
        ));
    }

    #[test]
    fn test_checksum_failure_is_recoverable() {
        let mut bytes = encoded(NetworkMessage::Ping(7));
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF; // Corrupt the payload.
        bytes.extend_from_slice(&encoded(NetworkMessage::Pong(7)));

        let mut decoder = Decoder::new(MAGIC, 1024);
        decoder.input(&bytes);

        let err = decoder.decode_next().unwrap_err();
        assert!(err.is_recoverable());

        // The next message decodes normally.
        let msg = decoder.decode_next().unwrap().unwrap();
        assert_eq!(
            NetworkMessage::from_raw(msg).unwrap(),
            NetworkMessage::Pong(7)
        );
        assert_eq!(decoder.unparsed(), 0);
    }
}
