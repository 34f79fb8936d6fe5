use std::net;
use std::path::PathBuf;

use argh::FromArgs;

use ferrite_common::network::Network;
use ferrite_node::{logger, Config};

#[derive(FromArgs)]
/// A ferrite network node.
pub struct Options {
    /// accept connections from outside (default: true)
    #[argh(switch)]
    pub nolisten: bool,

    /// bind to the given address for peer connections
    #[argh(option)]
    pub bind: Vec<net::SocketAddr>,

    /// connect to the specified peers only
    #[argh(option)]
    pub connect: Vec<net::SocketAddr>,

    /// add a node to connect to and attempt to keep the connection open
    #[argh(option)]
    pub addnode: Vec<String>,

    /// connect to a node to retrieve peer addresses, and disconnect
    #[argh(option)]
    pub seednode: Vec<String>,

    /// query DNS seeds when the address book is empty (default: true)
    #[argh(switch)]
    pub nodnsseed: bool,

    /// maintain at most this many connections to peers (default: 125)
    #[argh(option, default = "125")]
    pub maxconnections: usize,

    /// maintain this many automatic outbound connections (default: 8)
    #[argh(option, default = "8")]
    pub maxoutbound: usize,

    /// maximum per-connection receive buffer, in KiB (default: 5000)
    #[argh(option, default = "5000")]
    pub maxreceivebuffer: usize,

    /// maximum per-connection send buffer, in KiB (default: 1000)
    #[argh(option, default = "1000")]
    pub maxsendbuffer: usize,

    /// specify our own public address
    #[argh(option)]
    pub externalip: Vec<net::SocketAddr>,

    /// use UPnP to map the listening port (handled by an external tool)
    #[argh(switch)]
    pub upnp: bool,

    /// only connect to nodes in the given network (not supported yet)
    #[argh(option)]
    pub onlynet: Option<String>,

    /// connect through a SOCKS5 proxy (not supported yet)
    #[argh(option)]
    pub proxy: Option<net::SocketAddr>,

    /// use the test network (default: false)
    #[argh(switch)]
    pub testnet: bool,

    /// node home directory (default: $HOME)
    #[argh(option)]
    pub root: Option<PathBuf>,

    /// log level (default: info)
    #[argh(option, default = "log::Level::Info")]
    pub log: log::Level,
}

impl Options {
    pub fn from_env() -> Self {
        argh::from_env()
    }
}

fn main() {
    let opts = Options::from_env();

    logger::init(opts.log).expect("initializing logger for the first time");

    let network = if opts.testnet {
        Network::Testnet
    } else {
        Network::Mainnet
    };

    if opts.upnp {
        log::info!("Port mapping is delegated to an external tool; pass the mapped address with --externalip");
    }
    if let Some(ref onlynet) = opts.onlynet {
        log::warn!("--onlynet={} is not supported yet and will be ignored", onlynet);
    }
    if let Some(proxy) = opts.proxy {
        log::warn!("--proxy={} is not supported yet and will be ignored", proxy);
    }

    let listen = if opts.nolisten {
        Vec::new()
    } else if opts.bind.is_empty() {
        vec![(net::Ipv4Addr::UNSPECIFIED, network.port()).into()]
    } else {
        opts.bind
    };

    let config = Config {
        network,
        listen,
        connect: opts.connect,
        added_nodes: opts.addnode,
        seed_nodes: opts.seednode,
        dns_seeds: !opts.nodnsseed,
        target_outbound: opts.maxoutbound,
        max_connections: opts.maxconnections,
        max_receive_buffer: opts.maxreceivebuffer * 1000,
        max_send_buffer: opts.maxsendbuffer * 1000,
        external_addresses: opts.externalip,
        root: opts.root.unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_default())
        }),
        ..Config::default()
    };

    if let Err(err) = ferrite_node::run(config) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}
