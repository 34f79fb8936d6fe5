//! Service flags advertised by peers during the handshake and carried in
//! address records.
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmap of services a peer offers to the network.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceFlags(u64);

impl ServiceFlags {
    /// No services.
    pub const NONE: ServiceFlags = ServiceFlags(0);
    /// The peer can serve the full block chain.
    pub const NETWORK: ServiceFlags = ServiceFlags(1);

    /// Check whether all of the given flags are set.
    pub fn has(self, flags: ServiceFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    /// The raw bitmap.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ServiceFlags {
    fn from(bits: u64) -> Self {
        ServiceFlags(bits)
    }
}

impl BitOr for ServiceFlags {
    type Output = Self;

    fn bitor(self, other: Self) -> Self {
        ServiceFlags(self.0 | other.0)
    }
}

impl BitOrAssign for ServiceFlags {
    fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            return write!(f, "NONE");
        }
        if self.has(Self::NETWORK) {
            write!(f, "NETWORK")?;
        }
        let unknown = self.0 & !Self::NETWORK.0;
        if unknown != 0 {
            if self.has(Self::NETWORK) {
                write!(f, "|")?;
            }
            write!(f, "{:#x}", unknown)?;
        }
        Ok(())
    }
}
