//! Framed network messages.
//!
//! Every message travels as a 24-byte header followed by its payload:
//!
//! ```text
//! offset  size  field
//! 0       4     network magic
//! 4       12    command, ASCII, NUL-padded
//! 16      4     payload length (uint32 LE)
//! 20      4     checksum: first 4 bytes of SHA256(SHA256(payload))
//! 24      N     payload
//! ```
use std::fmt;
use std::io::{self, Read, Write};

use bitcoin_hashes::{sha256d, Hash};

use ferrite_common::services::ServiceFlags;

use crate::wire::{self, Address, Decodable, Encodable, Inventory};

/// Maximum length of an incoming message payload. No message over 2 MiB is
/// acceptable.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Size of the message header.
pub const HEADER_SIZE: usize = 24;

/// Maximum number of addresses in an `addr` message.
pub const MAX_ADDR_ADDRESSES: usize = 1000;

/// Maximum number of entries in an `inv` or `getdata` message.
pub const MAX_INV_ENTRIES: usize = 50_000;

/// A message command: up to twelve ASCII characters, NUL-padded on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CommandString([u8; 12]);

/// The `version` command.
pub const VERSION: CommandString = CommandString(*b"version\0\0\0\0\0");
/// The `verack` command.
pub const VERACK: CommandString = CommandString(*b"verack\0\0\0\0\0\0");
/// The `ping` command.
pub const PING: CommandString = CommandString(*b"ping\0\0\0\0\0\0\0\0");
/// The `pong` command.
pub const PONG: CommandString = CommandString(*b"pong\0\0\0\0\0\0\0\0");
/// The `getaddr` command.
pub const GETADDR: CommandString = CommandString(*b"getaddr\0\0\0\0\0");
/// The `addr` command.
pub const ADDR: CommandString = CommandString(*b"addr\0\0\0\0\0\0\0\0");
/// The `inv` command.
pub const INV: CommandString = CommandString(*b"inv\0\0\0\0\0\0\0\0\0");
/// The `getdata` command.
pub const GETDATA: CommandString = CommandString(*b"getdata\0\0\0\0\0");

impl CommandString {
    /// Create a command from a string. Fails if the string is longer than
    /// twelve characters or isn't printable ASCII.
    pub fn new(s: &str) -> Result<Self, wire::Error> {
        if s.len() > 12 || !s.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(wire::Error::InvalidData("command"));
        }
        let mut bytes = [0u8; 12];
        bytes[..s.len()].copy_from_slice(s.as_bytes());

        Ok(Self(bytes))
    }

    /// The command name, without padding.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(12);

        // Validated as ASCII on construction and decoding.
        std::str::from_utf8(&self.0[..end]).unwrap_or("?")
    }
}

impl fmt::Display for CommandString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Encodable for CommandString {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        self.0.encode(w)
    }
}

impl Decodable for CommandString {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let bytes = <[u8; 12]>::decode(r)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(12);

        // The name must be printable ASCII, padded with NULs only.
        if !bytes[..end].iter().all(|b| b.is_ascii_graphic())
            || !bytes[end..].iter().all(|&b| b == 0)
        {
            return Err(wire::Error::InvalidData("command"));
        }
        Ok(Self(bytes))
    }
}

/// Compute the frame checksum of a payload: the first four bytes of its
/// double-SHA256.
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d::Hash::hash(payload);
    let mut sum = [0u8; 4];
    sum.copy_from_slice(&hash[..4]);

    sum
}

/// A parsed message header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    /// Network magic.
    pub magic: u32,
    /// Message command.
    pub command: CommandString,
    /// Payload length in bytes.
    pub length: u32,
    /// Payload checksum.
    pub checksum: [u8; 4],
}

impl Decodable for Header {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let magic = u32::from_be_bytes(<[u8; 4]>::decode(r)?);
        let command = CommandString::decode(r)?;
        let length = u32::decode(r)?;
        let checksum = <[u8; 4]>::decode(r)?;

        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }
}

/// A framed message: header plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Network magic.
    pub magic: u32,
    /// Message command.
    pub command: CommandString,
    /// Raw message payload.
    pub payload: Vec<u8>,
}

impl RawMessage {
    /// Total size of the message on the wire.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl Encodable for RawMessage {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        // The magic travels in big-endian order, so that eg. `0xF9BEB4D9`
        // appears on the wire as `F9 BE B4 D9`.
        w.write_all(&self.magic.to_be_bytes())?;
        self.command.encode(w)?;
        (self.payload.len() as u32).encode(w)?;
        checksum(&self.payload).encode(w)?;
        w.write_all(&self.payload)?;

        Ok(self.size())
    }
}

/// The initial message of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    /// Highest protocol version understood by the sender.
    pub version: u32,
    /// Services offered by the sender.
    pub services: ServiceFlags,
    /// The sender's local time, in seconds since Epoch.
    pub timestamp: i64,
    /// The receiver's address, as seen by the sender.
    pub receiver: Address,
    /// The sender's own address.
    pub sender: Address,
    /// Nonce used to detect connections to self.
    pub nonce: u64,
    /// The sender's user agent.
    pub user_agent: String,
    /// The sender's best chain height.
    pub start_height: i32,
    /// Whether the sender wants inventory relayed to it.
    pub relay: bool,
}

impl Encodable for VersionMessage {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        Ok(self.version.encode(w)?
            + self.services.encode(w)?
            + self.timestamp.encode(w)?
            + self.receiver.encode(w)?
            + self.sender.encode(w)?
            + self.nonce.encode(w)?
            + self.user_agent.encode(w)?
            + self.start_height.encode(w)?
            + self.relay.encode(w)?)
    }
}

impl Decodable for VersionMessage {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, wire::Error> {
        let version = u32::decode(r)?;
        let services = ServiceFlags::decode(r)?;
        let timestamp = i64::decode(r)?;
        let receiver = Address::decode(r)?;
        let sender = Address::decode(r)?;
        let nonce = u64::decode(r)?;
        let user_agent = String::decode(r)?;
        let start_height = i32::decode(r)?;
        // Old peers don't send the relay flag; default to relaying.
        let relay = match u8::decode(r) {
            Ok(b) => b != 0,
            Err(wire::Error::Io(ref e)) if e.kind() == io::ErrorKind::UnexpectedEof => true,
            Err(e) => return Err(e),
        };

        Ok(Self {
            version,
            services,
            timestamp,
            receiver,
            sender,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

/// A decoded network message.
///
/// Commands the connection core doesn't interpret itself are surfaced as
/// [`NetworkMessage::Unknown`] and handed to the external dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    /// The `version` handshake message.
    Version(VersionMessage),
    /// The `verack` handshake acknowledgement.
    Verack,
    /// A keepalive probe.
    Ping(u64),
    /// A keepalive reply.
    Pong(u64),
    /// A request for known peer addresses.
    GetAddr,
    /// A batch of known peer addresses, with last-seen timestamps.
    Addr(Vec<(u32, Address)>),
    /// An inventory announcement.
    Inv(Vec<Inventory>),
    /// A request for inventory data.
    GetData(Vec<Inventory>),
    /// A message the connection core doesn't interpret.
    Unknown {
        /// The message command.
        command: CommandString,
        /// The raw message payload.
        payload: Vec<u8>,
    },
}

impl NetworkMessage {
    /// The command of this message.
    pub fn command(&self) -> CommandString {
        match self {
            Self::Version(_) => VERSION,
            Self::Verack => VERACK,
            Self::Ping(_) => PING,
            Self::Pong(_) => PONG,
            Self::GetAddr => GETADDR,
            Self::Addr(_) => ADDR,
            Self::Inv(_) => INV,
            Self::GetData(_) => GETDATA,
            Self::Unknown { command, .. } => *command,
        }
    }

    /// Decode a raw message into a typed one. The full payload must be
    /// consumed; messages with trailing or missing bytes are malformed.
    pub fn from_raw(raw: RawMessage) -> Result<Self, wire::Error> {
        let payload = raw.payload;

        match raw.command {
            VERSION => Ok(Self::Version(wire::deserialize(&payload)?)),
            VERACK => {
                if !payload.is_empty() {
                    return Err(wire::Error::TrailingBytes);
                }
                Ok(Self::Verack)
            }
            PING => Ok(Self::Ping(wire::deserialize(&payload)?)),
            PONG => Ok(Self::Pong(wire::deserialize(&payload)?)),
            GETADDR => {
                if !payload.is_empty() {
                    return Err(wire::Error::TrailingBytes);
                }
                Ok(Self::GetAddr)
            }
            ADDR => Ok(Self::Addr(wire::deserialize(&payload)?)),
            INV => Ok(Self::Inv(wire::deserialize(&payload)?)),
            GETDATA => Ok(Self::GetData(wire::deserialize(&payload)?)),
            command => Ok(Self::Unknown { command, payload }),
        }
    }

    /// Frame this message for the given network.
    pub fn to_raw(&self, magic: u32) -> RawMessage {
        let payload = match self {
            Self::Version(msg) => wire::serialize(msg),
            Self::Verack | Self::GetAddr => Vec::new(),
            Self::Ping(nonce) | Self::Pong(nonce) => wire::serialize(nonce),
            Self::Addr(addrs) => wire::serialize(addrs),
            Self::Inv(inv) | Self::GetData(inv) => wire::serialize(inv),
            Self::Unknown { payload, .. } => payload.clone(),
        };

        RawMessage {
            magic,
            command: self.command(),
            payload,
        }
    }
}

impl fmt::Display for NetworkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::serialize;

    #[test]
    fn test_checksum_of_empty_payload() {
        // SHA256(SHA256("")) starts with 5d f6 e0 e2.
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_command_string() {
        let cmd = CommandString::new("ping").unwrap();
        assert_eq!(cmd, PING);
        assert_eq!(cmd.as_str(), "ping");

        assert!(CommandString::new("thirteenchars").is_err());
        assert!(CommandString::new("with space").is_err());
    }

    #[test]
    fn test_frame_layout() {
        let msg = RawMessage {
            magic: 0xF9BE_B4D9,
            command: PING,
            payload: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let bytes = serialize(&msg);

        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..4], &[0xF9, 0xBE, 0xB4, 0xD9]);
        assert_eq!(&bytes[4..16], b"ping\0\0\0\0\0\0\0\0");
        assert_eq!(&bytes[16..20], &8u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &checksum(&msg.payload));
        assert_eq!(&bytes[24..], &msg.payload[..]);
    }

    #[test]
    fn test_version_roundtrip() {
        let version = VersionMessage {
            version: 70012,
            services: ServiceFlags::NETWORK,
            timestamp: 1_700_000_000,
            receiver: Address::new(&([44, 32, 11, 9], 9333).into(), ServiceFlags::NONE),
            sender: Address::new(&([81, 4, 65, 2], 9333).into(), ServiceFlags::NETWORK),
            nonce: 0xdeadbeef,
            user_agent: "/ferrite:0.1.0/".to_owned(),
            start_height: 512_000,
            relay: true,
        };
        let msg = NetworkMessage::Version(version.clone());
        let raw = msg.to_raw(0xF9BE_B4D9);

        assert_eq!(NetworkMessage::from_raw(raw).unwrap(), msg);

        // A version without the trailing relay flag decodes with relay on.
        let mut payload = serialize(&version);
        payload.pop();

        match NetworkMessage::from_raw(RawMessage {
            magic: 0,
            command: VERSION,
            payload,
        })
        .unwrap()
        {
            NetworkMessage::Version(v) => assert!(v.relay),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payload() {
        let raw = RawMessage {
            magic: 0,
            command: PING,
            payload: vec![1, 2, 3], // Too short for a nonce.
        };
        assert!(NetworkMessage::from_raw(raw).is_err());

        let raw = RawMessage {
            magic: 0,
            command: VERACK,
            payload: vec![0],
        };
        assert!(NetworkMessage::from_raw(raw).is_err());
    }

    #[test]
    fn test_unknown_passthrough() {
        let command = CommandString::new("darksend").unwrap();
        let raw = RawMessage {
            magic: 0,
            command,
            payload: vec![0xAA; 40],
        };
        match NetworkMessage::from_raw(raw.clone()).unwrap() {
            NetworkMessage::Unknown {
                command: cmd,
                payload,
            } => {
                assert_eq!(cmd, command);
                assert_eq!(payload, raw.payload);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
