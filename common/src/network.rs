//! Peer network parameters, eg. *Mainnet*.

/// The peer network to connect to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The test network.
    Testnet,
    /// The regression test network, for local testing only.
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl Network {
    /// Magic prefix of every message framed for this network.
    ///
    /// The four bytes are written to the wire in big-endian order, so that
    /// eg. `0xF9BEB4D9` appears on the wire as `F9 BE B4 D9`.
    pub fn magic(&self) -> u32 {
        match self {
            Network::Mainnet => 0xF9BE_B4D9,
            Network::Testnet => 0x0B11_0907,
            Network::Regtest => 0xFABF_B5DA,
        }
    }

    /// Return the default listen port for the network.
    pub fn port(&self) -> u16 {
        match self {
            Network::Mainnet => 9333,
            Network::Testnet => 19333,
            Network::Regtest => 19444,
        }
    }

    /// DNS seeds used to bootstrap the address manager.
    pub fn seeds(&self) -> &[&str] {
        match self {
            Network::Mainnet => &[
                "seed.ferrite.network",
                "dnsseed.ferrite.network",
                "seed.ferritenodes.org",
            ],
            Network::Testnet => &["testnet-seed.ferrite.network"],
            Network::Regtest => &[],
        }
    }

    /// Return the short string representation of this network.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}
