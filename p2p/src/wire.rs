//! Wire encoding for the ferrite network protocol.
//!
//! All integers are little-endian; variable-length collections are prefixed
//! with a compact size; IP addresses travel as 16 bytes with IPv4 mapped
//! into IPv6, and ports in network byte order.
use std::fmt;
use std::io::{self, Read, Write};
use std::net;

use thiserror::Error;

use ferrite_common::services::ServiceFlags;

/// Upper bound on decoded collection lengths, to limit allocations from
/// untrusted input.
pub const MAX_VEC_SIZE: usize = 64 * 1024;

/// Onion addresses are carried in the address space reserved by OnionCat,
/// `fd87:d87e:eb43::/48`.
const ONION_PREFIX: [u8; 6] = [0xfd, 0x87, 0xd8, 0x7e, 0xeb, 0x43];

/// A decoding error.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error, eg. unexpected end of input.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A field contained an invalid value.
    #[error("invalid value for {0}")]
    InvalidData(&'static str),
    /// A collection length prefix exceeds what we accept.
    #[error("collection length {0} exceeds maximum")]
    OversizedVector(u64),
    /// Input remained after the value was fully decoded.
    #[error("trailing bytes after message payload")]
    TrailingBytes,
}

/// Types that can be encoded to the wire format.
pub trait Encodable {
    /// Encode into the writer, returning the number of bytes written.
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize>;
}

/// Types that can be decoded from the wire format.
pub trait Decodable: Sized {
    /// Decode from the reader.
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error>;
}

/// Encode a value into a fresh byte vector.
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Vec<u8> {
    let mut bytes = Vec::new();
    value
        .encode(&mut bytes)
        .expect("writing to a vector never fails");
    bytes
}

/// Decode a value from a byte slice, requiring all input to be consumed.
pub fn deserialize<T: Decodable>(bytes: &[u8]) -> Result<T, Error> {
    let mut cursor = io::Cursor::new(bytes);
    let value = T::decode(&mut cursor)?;

    if cursor.position() as usize != bytes.len() {
        return Err(Error::TrailingBytes);
    }
    Ok(value)
}

macro_rules! impl_int {
    ($ty:ty) => {
        impl Encodable for $ty {
            fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
                w.write_all(&self.to_le_bytes())?;
                Ok(std::mem::size_of::<$ty>())
            }
        }

        impl Decodable for $ty {
            fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                r.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

impl_int!(u8);
impl_int!(u16);
impl_int!(u32);
impl_int!(u64);
impl_int!(i32);
impl_int!(i64);

macro_rules! impl_array {
    ($size:expr) => {
        impl Encodable for [u8; $size] {
            fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
                w.write_all(&self[..])?;
                Ok($size)
            }
        }

        impl Decodable for [u8; $size] {
            fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
                let mut buf = [0u8; $size];
                r.read_exact(&mut buf)?;
                Ok(buf)
            }
        }
    };
}

impl_array!(4);
impl_array!(12);
impl_array!(16);
impl_array!(32);

impl Encodable for bool {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        (*self as u8).encode(w)
    }
}

impl Decodable for bool {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok(u8::decode(r)? != 0)
    }
}

/// A variable-length integer prefix, as used for collection lengths.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VarInt(pub u64);

impl Encodable for VarInt {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        match self.0 {
            0..=0xFC => {
                (self.0 as u8).encode(w)?;
                Ok(1)
            }
            0xFD..=0xFFFF => {
                0xFDu8.encode(w)?;
                (self.0 as u16).encode(w)?;
                Ok(3)
            }
            0x1_0000..=0xFFFF_FFFF => {
                0xFEu8.encode(w)?;
                (self.0 as u32).encode(w)?;
                Ok(5)
            }
            _ => {
                0xFFu8.encode(w)?;
                self.0.encode(w)?;
                Ok(9)
            }
        }
    }
}

impl Decodable for VarInt {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let n = match u8::decode(r)? {
            0xFF => u64::decode(r)?,
            0xFE => u32::decode(r)? as u64,
            0xFD => u16::decode(r)? as u64,
            n => n as u64,
        };
        Ok(VarInt(n))
    }
}

impl Encodable for String {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = VarInt(self.len() as u64).encode(w)?;
        w.write_all(self.as_bytes())?;
        len += self.len();

        Ok(len)
    }
}

impl Decodable for String {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let bytes = Vec::<u8>::decode(r)?;

        String::from_utf8(bytes).map_err(|_| Error::InvalidData("string"))
    }
}

impl Encodable for Vec<u8> {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        let mut len = VarInt(self.len() as u64).encode(w)?;
        w.write_all(self)?;
        len += self.len();

        Ok(len)
    }
}

impl Decodable for Vec<u8> {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let len = VarInt::decode(r)?.0;
        if len > MAX_VEC_SIZE as u64 {
            return Err(Error::OversizedVector(len));
        }
        let mut bytes = vec![0; len as usize];
        r.read_exact(&mut bytes)?;

        Ok(bytes)
    }
}

macro_rules! impl_vec {
    ($ty:ty) => {
        impl Encodable for Vec<$ty> {
            fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
                let mut len = VarInt(self.len() as u64).encode(w)?;
                for item in self {
                    len += item.encode(w)?;
                }
                Ok(len)
            }
        }

        impl Decodable for Vec<$ty> {
            fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
                let len = VarInt::decode(r)?.0;
                if len > MAX_VEC_SIZE as u64 {
                    return Err(Error::OversizedVector(len));
                }
                let mut items = Vec::with_capacity((len as usize).min(1024));
                for _ in 0..len {
                    items.push(<$ty>::decode(r)?);
                }
                Ok(items)
            }
        }
    };
}

impl Encodable for ServiceFlags {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        self.as_u64().encode(w)
    }
}

impl Decodable for ServiceFlags {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok(ServiceFlags::from(u64::decode(r)?))
    }
}

/// A network-layer address: IPv4, IPv6 or onion.
///
/// Onion addresses are distinguished by the OnionCat prefix they are mapped
/// into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetAddress(pub net::IpAddr);

impl NetAddress {
    /// The sixteen-byte wire representation, IPv4-mapped if necessary.
    pub fn octets(&self) -> [u8; 16] {
        match self.0 {
            net::IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            net::IpAddr::V6(ip) => ip.octets(),
        }
    }

    /// Whether this is an onion address.
    pub fn is_onion(&self) -> bool {
        self.octets()[..6] == ONION_PREFIX
    }

    /// Whether the address is globally routable.
    pub fn is_routable(&self) -> bool {
        if self.is_onion() {
            return true;
        }
        match self.0 {
            net::IpAddr::V4(ip) => {
                // 192.0.0.9 and 192.0.0.10 are the only globally routable
                // addresses in 192.0.0.0/24.
                if u32::from(ip) == 0xc0000009 || u32::from(ip) == 0xc000000a {
                    return true;
                }
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && ip.octets()[0] != 0
            }
            net::IpAddr::V6(ip) => !ip.is_loopback() && !ip.is_unspecified(),
        }
    }

    /// Whether the address belongs to the local network.
    pub fn is_local(&self) -> bool {
        match self.0 {
            net::IpAddr::V4(ip) => {
                ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.is_unspecified()
            }
            net::IpAddr::V6(ip) => ip.is_loopback() || ip.is_unspecified(),
        }
    }

    /// The group this address belongs to, for connection diversity: /16 for
    /// IPv4, /32 for IPv6, and the network class for onion addresses.
    /// Addresses in the same group share a prefix an adversary could control
    /// as a block.
    pub fn group(&self) -> Vec<u8> {
        if self.is_onion() {
            let mut group = vec![3];
            group.extend_from_slice(&self.octets()[6..10]);
            return group;
        }
        match self.0 {
            _ if !self.is_routable() => vec![0],
            net::IpAddr::V4(ip) => {
                let octets = ip.octets();
                vec![1, octets[0], octets[1]]
            }
            net::IpAddr::V6(ip) => {
                let octets = ip.octets();
                vec![2, octets[0], octets[1], octets[2], octets[3]]
            }
        }
    }
}

impl From<net::IpAddr> for NetAddress {
    fn from(ip: net::IpAddr) -> Self {
        NetAddress(ip)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Encodable for NetAddress {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        self.octets().encode(w)
    }
}

impl Decodable for NetAddress {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let octets = <[u8; 16]>::decode(r)?;
        let ip = net::Ipv6Addr::from(octets);

        Ok(match ip.to_ipv4_mapped() {
            Some(v4) => NetAddress(net::IpAddr::V4(v4)),
            None => NetAddress(net::IpAddr::V6(ip)),
        })
    }
}

/// A network address together with a port: somewhere a peer can be reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Service {
    /// Network address.
    pub ip: NetAddress,
    /// TCP port, in host byte order.
    pub port: u16,
}

impl Service {
    /// Convert to a socket address.
    pub fn socket_addr(&self) -> net::SocketAddr {
        net::SocketAddr::new(self.ip.0, self.port)
    }
}

impl From<net::SocketAddr> for Service {
    fn from(addr: net::SocketAddr) -> Self {
        Self {
            ip: NetAddress(addr.ip()),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl Encodable for Service {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        let len = self.ip.encode(w)?;
        // Port travels in network byte order.
        w.write_all(&self.port.to_be_bytes())?;

        Ok(len + 2)
    }
}

impl Decodable for Service {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let ip = NetAddress::decode(r)?;
        let mut port = [0u8; 2];
        r.read_exact(&mut port)?;

        Ok(Self {
            ip,
            port: u16::from_be_bytes(port),
        })
    }
}

/// An address advertised on the network: a [`Service`] and the services its
/// peer claims to offer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    /// Services offered by the peer at this address.
    pub services: ServiceFlags,
    /// Where the peer can be reached.
    pub service: Service,
}

impl Address {
    /// Create a new address.
    pub fn new(addr: &net::SocketAddr, services: ServiceFlags) -> Self {
        Self {
            services,
            service: Service::from(*addr),
        }
    }

    /// Convert to a socket address.
    pub fn socket_addr(&self) -> net::SocketAddr {
        self.service.socket_addr()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service)
    }
}

impl Encodable for Address {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        Ok(self.services.encode(w)? + self.service.encode(w)?)
    }
}

impl Decodable for Address {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            services: ServiceFlags::decode(r)?,
            service: Service::decode(r)?,
        })
    }
}

impl Encodable for (u32, Address) {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        Ok(self.0.encode(w)? + self.1.encode(w)?)
    }
}

impl Decodable for (u32, Address) {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok((u32::decode(r)?, Address::decode(r)?))
    }
}

/// Inventory: a compact identifier advertising the availability of an
/// object, eg. a block or a transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inventory {
    /// Object type.
    pub kind: u32,
    /// Object hash.
    pub hash: [u8; 32],
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            1 => "tx",
            2 => "block",
            _ => "other",
        };
        write!(f, "{}(", kind)?;
        for byte in self.hash.iter().rev().take(8) {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..)")
    }
}

impl Encodable for Inventory {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        Ok(self.kind.encode(w)? + self.hash.encode(w)?)
    }
}

impl Decodable for Inventory {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        Ok(Self {
            kind: u32::decode(r)?,
            hash: <[u8; 32]>::decode(r)?,
        })
    }
}

impl_vec!(Inventory);
impl_vec!((u32, Address));
impl_vec!(Subnet);

/// A subnet: a network address and a prefix length over its sixteen-byte
/// representation. Stored canonicalized, ie. with the host bits cleared.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subnet {
    network: [u8; 16],
    prefix: u8,
}

impl Subnet {
    /// Create a subnet covering a single address.
    pub fn single(ip: NetAddress) -> Self {
        Self::new(ip, 128)
    }

    /// Create a subnet from an address and a prefix length over the 16-byte
    /// representation. IPv4 prefixes should be given relative to the mapped
    /// form, ie. `/120` for an IPv4 `/24`.
    pub fn new(ip: NetAddress, prefix: u8) -> Self {
        let prefix = prefix.min(128);
        let mut network = ip.octets();

        for (i, byte) in network.iter_mut().enumerate() {
            *byte &= Self::mask_byte(prefix, i);
        }
        Self { network, prefix }
    }

    /// Create a subnet from an IPv4 address and an IPv4 prefix length.
    pub fn ipv4(ip: net::Ipv4Addr, prefix: u8) -> Self {
        Self::new(NetAddress(net::IpAddr::V4(ip)), 96 + prefix.min(32))
    }

    /// The prefix length, over the 16-byte representation.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Check whether the subnet covers the given address.
    pub fn contains(&self, ip: &NetAddress) -> bool {
        let octets = ip.octets();

        for i in 0..16 {
            let mask = Self::mask_byte(self.prefix, i);
            if octets[i] & mask != self.network[i] {
                return false;
            }
        }
        true
    }

    fn mask_byte(prefix: u8, index: usize) -> u8 {
        let bits = (prefix as usize).saturating_sub(index * 8).min(8);

        !(0xFFu16 >> bits) as u8
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = net::Ipv6Addr::from(self.network);

        match ip.to_ipv4_mapped() {
            Some(v4) if self.prefix >= 96 => write!(f, "{}/{}", v4, self.prefix - 96),
            _ => write!(f, "{}/{}", ip, self.prefix),
        }
    }
}

impl Encodable for Subnet {
    fn encode<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<usize> {
        Ok(self.network.encode(w)? + self.prefix.encode(w)?)
    }
}

impl Decodable for Subnet {
    fn decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, Error> {
        let network = <[u8; 16]>::decode(r)?;
        let prefix = u8::decode(r)?;
        if prefix > 128 {
            return Err(Error::InvalidData("subnet prefix"));
        }
        // Re-canonicalize, in case the input carried host bits.
        let ip = NetAddress(net::IpAddr::V6(net::Ipv6Addr::from(network)));

        Ok(Self::new(ip, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Encodable + Decodable + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = serialize(&value);
        let decoded: T = deserialize(&bytes).unwrap();

        assert_eq!(value, decoded);
    }

    #[test]
    fn test_varint_boundaries() {
        for n in [0u64, 0xFC, 0xFD, 0xFFFF, 0x1_0000, 0xFFFF_FFFF, u64::MAX] {
            roundtrip(VarInt(n));
        }
        assert_eq!(serialize(&VarInt(0xFC)).len(), 1);
        assert_eq!(serialize(&VarInt(0xFD)).len(), 3);
        assert_eq!(serialize(&VarInt(0x1_0000)).len(), 5);
        assert_eq!(serialize(&VarInt(u64::MAX)).len(), 9);
    }

    #[test]
    fn test_address_roundtrip() {
        roundtrip(Address::new(
            &([203, 11, 44, 71], 9333).into(),
            ServiceFlags::NETWORK,
        ));
        roundtrip(Address::new(
            &"[2001:db8::1]:9333".parse().unwrap(),
            ServiceFlags::NONE,
        ));
    }

    #[test]
    fn test_ipv4_mapping() {
        let addr = Address::new(&([1, 2, 3, 4], 9333).into(), ServiceFlags::NONE);
        let bytes = serialize(&addr);

        // 8 bytes services, 16 bytes address, 2 bytes port.
        assert_eq!(bytes.len(), 26);
        assert_eq!(
            &bytes[8..24],
            &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF, 1, 2, 3, 4]
        );
        // Port is in network byte order.
        assert_eq!(&bytes[24..], &(9333u16).to_be_bytes());
    }

    #[test]
    fn test_subnet_contains() {
        let subnet = Subnet::ipv4([10, 20, 0, 0].into(), 16);

        assert!(subnet.contains(&NetAddress("10.20.99.1".parse().unwrap())));
        assert!(subnet.contains(&NetAddress("10.20.0.0".parse().unwrap())));
        assert!(!subnet.contains(&NetAddress("10.21.0.1".parse().unwrap())));

        let single = Subnet::single(NetAddress("10.20.99.1".parse().unwrap()));
        assert!(single.contains(&NetAddress("10.20.99.1".parse().unwrap())));
        assert!(!single.contains(&NetAddress("10.20.99.2".parse().unwrap())));
    }

    #[test]
    fn test_subnet_canonicalized() {
        let a = Subnet::ipv4([10, 20, 33, 7].into(), 16);
        let b = Subnet::ipv4([10, 20, 0, 0].into(), 16);

        assert_eq!(a, b, "host bits are cleared on construction");
        assert_eq!(a.to_string(), "10.20.0.0/16");

        roundtrip(a);
    }

    #[test]
    fn test_address_groups() {
        let a = NetAddress("100.99.43.12".parse().unwrap());
        let b = NetAddress("100.99.12.8".parse().unwrap());
        let c = NetAddress("100.98.43.12".parse().unwrap());

        assert_eq!(a.group(), b.group(), "same /16 means same group");
        assert_ne!(a.group(), c.group(), "different /16 means different group");

        let local = NetAddress("127.0.0.1".parse().unwrap());
        assert_eq!(local.group(), vec![0], "non-routable addresses all group together");
    }

    #[test]
    fn test_oversized_vector_rejected() {
        let mut bytes = serialize(&VarInt(MAX_VEC_SIZE as u64 + 1));
        bytes.extend_from_slice(&[0; 64]);

        assert!(matches!(
            deserialize::<Vec<Inventory>>(&bytes),
            Err(Error::OversizedVector(_))
        ));
    }
}
