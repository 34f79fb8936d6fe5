//! Keepalive pings.
//!
//! Detects dead peer connections, answers peer pings, and keeps a window of
//! round-trip latencies per peer. The latencies feed the inbound eviction
//! policy.
use std::collections::VecDeque;
use std::net;

use ferrite_net::{LocalDuration, LocalTime};

use ferrite_common::collections::HashMap;

use crate::fsm::{DisconnectReason, PeerId};

use super::output::{Disconnect, Wakeup, Wire};

/// Time interval to wait between sent pings.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_mins(2);
/// Time to wait to receive a pong when sending a ping.
pub const PING_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);

/// Maximum number of latencies recorded per peer.
const MAX_RECORDED_LATENCIES: usize = 64;

#[derive(Debug)]
enum State {
    AwaitingPong { nonce: u64, since: LocalTime },
    Idle { since: LocalTime },
}

#[derive(Debug)]
struct Peer {
    address: net::SocketAddr,
    state: State,
    /// Observed round-trip latencies for this peer, most recent first.
    latencies: VecDeque<LocalDuration>,
}

impl Peer {
    fn record_latency(&mut self, sample: LocalDuration) {
        self.latencies.push_front(sample);
        self.latencies.truncate(MAX_RECORDED_LATENCIES);
    }
}

/// Detects dead peer connections.
#[derive(Debug)]
pub struct PingManager<U> {
    peers: HashMap<PeerId, Peer>,
    rng: fastrand::Rng,
    upstream: U,
}

impl<U: Wire<super::Event> + Wakeup + Disconnect> PingManager<U> {
    /// Create a new ping manager.
    pub fn new(rng: fastrand::Rng, upstream: U) -> Self {
        let peers = HashMap::with_hasher(rng.clone().into());

        Self {
            peers,
            rng,
            upstream,
        }
    }

    /// The average observed latency of a peer, if any pongs were received.
    pub fn latency(&self, addr: &PeerId) -> Option<LocalDuration> {
        let peer = self.peers.get(addr)?;
        if peer.latencies.is_empty() {
            return None;
        }
        let sum: LocalDuration = peer.latencies.iter().sum();

        Some(sum / peer.latencies.len() as u32)
    }

    /// Called when a peer is negotiated. Sends the first ping.
    pub fn peer_negotiated(&mut self, address: PeerId, now: LocalTime) {
        let nonce = self.rng.u64(..);

        self.upstream
            .ping(address, nonce)
            .wakeup(PING_TIMEOUT)
            .wakeup(PING_INTERVAL);
        self.peers.insert(
            address,
            Peer {
                address,
                state: State::AwaitingPong { nonce, since: now },
                latencies: VecDeque::new(),
            },
        );
    }

    /// Called when a peer is disconnected.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);
    }

    /// Called when a timer rings.
    pub fn received_wake(&mut self, now: LocalTime) {
        for peer in self.peers.values_mut() {
            match peer.state {
                State::AwaitingPong { since, .. } => {
                    // A ping was sent and we're waiting for a `pong`. If too
                    // much time has passed, we consider this peer dead, and
                    // disconnect from them.
                    if now - since >= PING_TIMEOUT {
                        self.upstream
                            .disconnect(peer.address, DisconnectReason::PeerTimeout("ping"));
                    }
                }
                State::Idle { since } => {
                    // Check whether enough time has passed since the last
                    // `pong`, and if so, send a new `ping`.
                    if now - since >= PING_INTERVAL {
                        let nonce = self.rng.u64(..);

                        self.upstream
                            .ping(peer.address, nonce)
                            .wakeup(PING_TIMEOUT)
                            .wakeup(PING_INTERVAL);

                        peer.state = State::AwaitingPong { nonce, since: now };
                    }
                }
            }
        }
    }

    /// Called when a `ping` is received. Replies with a `pong`.
    pub fn received_ping(&mut self, addr: PeerId, nonce: u64) -> bool {
        if self.peers.contains_key(&addr) {
            self.upstream.pong(addr, nonce);

            return true;
        }
        false
    }

    /// Called when a `pong` is received.
    pub fn received_pong(&mut self, addr: PeerId, nonce: u64, now: LocalTime) -> bool {
        if let Some(peer) = self.peers.get_mut(&addr) {
            match peer.state {
                State::AwaitingPong {
                    nonce: last_nonce,
                    since,
                } => {
                    if nonce == last_nonce {
                        peer.record_latency(now - since);
                        peer.state = State::Idle { since: now };

                        return true;
                    }
                }
                // Unsolicited or redundant `pong`. Ignore.
                State::Idle { .. } => {}
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_records_latency() {
        let mut pingmgr = PingManager::new(fastrand::Rng::with_seed(1), ());
        let addr: PeerId = ([88, 12, 4, 2], 9333).into();
        let now = LocalTime::from_secs(1_700_000_000);

        pingmgr.peer_negotiated(addr, now);
        assert!(pingmgr.latency(&addr).is_none());

        let nonce = match pingmgr.peers.get(&addr).map(|p| &p.state) {
            Some(State::AwaitingPong { nonce, .. }) => *nonce,
            _ => panic!("peer should be awaiting a pong"),
        };

        // A pong with the wrong nonce doesn't count.
        assert!(!pingmgr.received_pong(addr, nonce ^ 1, now + LocalDuration::from_secs(1)));
        assert!(pingmgr.received_pong(addr, nonce, now + LocalDuration::from_secs(2)));
        assert_eq!(pingmgr.latency(&addr), Some(LocalDuration::from_secs(2)));
    }

    #[test]
    fn test_unknown_peer_ping_ignored() {
        let mut pingmgr = PingManager::new(fastrand::Rng::with_seed(2), ());
        let addr: PeerId = ([88, 12, 4, 2], 9333).into();

        assert!(!pingmgr.received_ping(addr, 42));
    }
}
