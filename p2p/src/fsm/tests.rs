use super::*;

use crate::message::{self, RawMessage};
use crate::store::Memory;
use crate::wire;

use ferrite_net::StateMachine as _;

type Machine = StateMachine<Memory, Memory>;
type Io = output::Io;

fn machine(seed: u64, config: Config) -> Machine {
    StateMachine::new(
        config,
        Memory::default(),
        Memory::default(),
        fastrand::Rng::with_seed(seed),
    )
}

fn outputs(m: &mut Machine) -> Vec<Io> {
    std::iter::from_fn(|| m.next()).collect()
}

/// Shuttle wire bytes between two machines until the conversation dies
/// down.
fn converse(a: &mut Machine, a_id: PeerId, b: &mut Machine, b_id: PeerId) {
    loop {
        let mut progress = false;

        for io in outputs(a) {
            if let Io::Write(to, bytes) = io {
                if to == b_id {
                    b.received_bytes(&a_id, &bytes);
                    progress = true;
                }
            }
        }
        for io in outputs(b) {
            if let Io::Write(to, bytes) = io {
                if to == a_id {
                    a.received_bytes(&b_id, &bytes);
                    progress = true;
                }
            }
        }
        if !progress {
            break;
        }
    }
}

#[test]
fn test_handshake() {
    let now = LocalTime::from_secs(1_700_000_000);
    let a_id: PeerId = ([33, 1, 1, 1], 9333).into();
    let b_id: PeerId = ([44, 1, 1, 1], 9333).into();

    let mut alice = machine(1, Config::default());
    let mut bob = machine(2, Config::default());

    alice.initialize(now);
    bob.initialize(now);

    alice.connected(b_id, &a_id, Link::Outbound);
    bob.connected(a_id, &b_id, Link::Inbound);

    converse(&mut alice, a_id, &mut bob, b_id);

    assert!(alice.peermgr.get(&b_id).unwrap().is_negotiated());
    assert!(bob.peermgr.get(&a_id).unwrap().is_negotiated());

    // Each side now knows that the other knows its own address.
    assert!(alice.invmgr.is_address_known(&b_id, &Service::from(b_id)));
    assert!(bob.invmgr.is_address_known(&a_id, &Service::from(a_id)));
}

#[test]
fn test_self_connection() {
    let now = LocalTime::from_secs(1_700_000_000);
    let self_id: PeerId = ([55, 5, 5, 5], 9333).into();
    let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

    let mut m = machine(3, Config::default());
    m.initialize(now);
    m.connected(self_id, &local, Link::Outbound);

    // Our own `version` comes right back at us.
    let mut version = None;
    for io in outputs(&mut m) {
        if let Io::Write(to, bytes) = io {
            if to == self_id {
                version = Some(bytes);
            }
        }
    }
    m.received_bytes(&self_id, &version.expect("a version was sent"));

    let disconnected = outputs(&mut m).into_iter().any(|io| {
        matches!(
            io,
            Io::Disconnect(
                addr,
                ferrite_net::DisconnectReason::StateMachine(DisconnectReason::SelfConnection),
            ) if addr == self_id
        )
    });
    assert!(disconnected, "the nonce gives the self-connection away");

    // The address is never recorded as a working peer.
    assert!(m.addrmgr.is_empty());
}

#[test]
fn test_misbehavior_ban() {
    let now = LocalTime::from_secs(1_700_000_000);
    let addr: PeerId = ([66, 6, 6, 6], 9333).into();
    let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

    let mut m = machine(4, Config::default());
    m.initialize(now);
    m.connected(addr, &local, Link::Inbound);
    outputs(&mut m);

    // A `ping` payload must be eight bytes; this one is malformed.
    let bad = wire::serialize(&RawMessage {
        magic: Network::default().magic(),
        command: message::PING,
        payload: vec![1, 2, 3],
    });

    for _ in 0..9 {
        m.received_bytes(&addr, &bad);
        assert!(!m.banmgr.is_banned(&NetAddress(addr.ip()), now));
    }
    m.received_bytes(&addr, &bad);

    // The tenth strike: banned and disconnected.
    assert!(m.banmgr.is_banned(&NetAddress(addr.ip()), now));
    let disconnected = outputs(&mut m).into_iter().any(|io| {
        matches!(
            io,
            Io::Disconnect(
                a,
                ferrite_net::DisconnectReason::StateMachine(DisconnectReason::PeerMisbehaving(_)),
            ) if a == addr
        )
    });
    assert!(disconnected);

    // The ban list is written out by the next flush.
    assert!(m.banmgr.is_dirty());
    m.tick(now + LocalDuration::from_mins(20));
    m.wake();
    assert!(!m.banmgr.is_dirty());
}

#[test]
fn test_banned_inbound_rejected() {
    let now = LocalTime::from_secs(1_700_000_000);
    let addr: PeerId = ([66, 6, 6, 6], 9333).into();
    let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

    let mut m = machine(5, Config::default());
    m.initialize(now);
    m.command(Command::Ban(Subnet::single(NetAddress(addr.ip())), None));
    outputs(&mut m);

    m.connected(addr, &local, Link::Inbound);

    let rejected = outputs(&mut m).into_iter().any(|io| {
        matches!(
            io,
            Io::Disconnect(
                a,
                ferrite_net::DisconnectReason::StateMachine(DisconnectReason::PeerBanned),
            ) if a == addr
        )
    });
    assert!(rejected, "banned peers are refused on accept");
    assert!(m.peermgr.get(&addr).is_none());
}

#[test]
fn test_receive_flood_pauses_reads() {
    let now = LocalTime::from_secs(1_700_000_000);
    let addr: PeerId = ([66, 6, 6, 6], 9333).into();
    let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

    let mut m = machine(
        6,
        Config {
            receive_flood_size: 1024,
            ..Config::default()
        },
    );
    m.initialize(now);
    m.connected(addr, &local, Link::Inbound);
    outputs(&mut m);

    let big = wire::serialize(&RawMessage {
        magic: Network::default().magic(),
        command: message::CommandString::new("bulk").unwrap(),
        payload: vec![0xAB; 4096],
    });
    m.received_bytes(&addr, &big);

    let paused = outputs(&mut m)
        .into_iter()
        .any(|io| matches!(io, Io::PauseRead(a) if a == addr));
    assert!(paused, "reads pause once the flood limit is hit");

    // The next reactor pass resumes reading.
    m.tick(now + LocalDuration::from_millis(50));
    let resumed = outputs(&mut m)
        .into_iter()
        .any(|io| matches!(io, Io::ResumeRead(a) if a == addr));
    assert!(resumed);
}

#[test]
fn test_request_reply_tracking() {
    let now = LocalTime::from_secs(1_700_000_000);
    let addr: PeerId = ([66, 6, 6, 6], 9333).into();
    let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

    let mut m = machine(7, Config::default());
    m.initialize(now);
    m.connected(addr, &local, Link::Outbound);
    outputs(&mut m);

    let (reply, replies) = chan::unbounded();
    m.command(Command::Request(
        addr,
        message::CommandString::new("getstate").unwrap(),
        vec![7, 7],
        reply,
    ));

    // Fish the request id out of the framed request.
    let mut request = None;
    for io in outputs(&mut m) {
        if let Io::Write(to, bytes) = io {
            if to == addr {
                request = Some(bytes);
            }
        }
    }
    let request = request.expect("the request was framed and sent");

    let mut decoder = Decoder::new(Network::default().magic(), 1024);
    decoder.input(&request);
    let raw = decoder.decode_next().unwrap().unwrap();
    assert_eq!(raw.command.as_str(), "getstate");
    assert_eq!(&raw.payload[32..], &[7, 7]);

    // A reply tagged with the same id finds its way back to the caller.
    let mut payload = raw.payload[..32].to_vec();
    payload.extend_from_slice(&[9, 9, 9]);

    let reply_msg = wire::serialize(&RawMessage {
        magic: Network::default().magic(),
        command: message::CommandString::new("state").unwrap(),
        payload,
    });
    m.received_bytes(&addr, &reply_msg);

    assert_eq!(replies.try_recv().unwrap(), vec![9, 9, 9]);
}

#[test]
fn test_unknown_messages_reach_the_dispatcher() {
    let now = LocalTime::from_secs(1_700_000_000);
    let addr: PeerId = ([66, 6, 6, 6], 9333).into();
    let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

    let mut m = machine(8, Config::default());
    m.initialize(now);
    m.connected(addr, &local, Link::Inbound);
    outputs(&mut m);

    let msg = wire::serialize(&RawMessage {
        magic: Network::default().magic(),
        command: message::CommandString::new("darksend").unwrap(),
        payload: vec![0xCC; 8],
    });
    m.received_bytes(&addr, &msg);

    let dispatched = outputs(&mut m).into_iter().any(|io| {
        matches!(
            io,
            Io::Event(Event::Message { from, ref command, ref payload })
                if from == addr && command.as_str() == "darksend" && payload.len() == 8
        )
    });
    assert!(dispatched);
}

#[test]
fn test_wrong_magic_is_fatal() {
    let now = LocalTime::from_secs(1_700_000_000);
    let addr: PeerId = ([66, 6, 6, 6], 9333).into();
    let local: net::SocketAddr = ([0, 0, 0, 0], 9333).into();

    let mut m = machine(9, Config::default());
    m.initialize(now);
    m.connected(addr, &local, Link::Inbound);
    outputs(&mut m);

    let msg = wire::serialize(&RawMessage {
        magic: 0xDEAD_BEEF,
        command: message::PING,
        payload: vec![0; 8],
    });
    m.received_bytes(&addr, &msg);

    let disconnected = outputs(&mut m).into_iter().any(|io| {
        matches!(
            io,
            Io::Disconnect(
                a,
                ferrite_net::DisconnectReason::StateMachine(DisconnectReason::PeerMagic(_)),
            ) if a == addr
        )
    });
    assert!(disconnected, "a magic mismatch means the stream is lost");
}
