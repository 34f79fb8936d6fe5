//! Inventory and address relay.
//!
//! Keeps, per peer, what we know they know, so we don't re-announce it,
//! along with the queues of inventory and addresses waiting to be
//! announced. Announcements are trickled out on a Poisson-distributed
//! timer to make traffic analysis harder, and inventory requests are
//! spaced out per object.
use std::collections::BTreeMap;
use std::fmt;

use log::*;

use ferrite_net::{Link, LocalDuration, LocalTime};

use ferrite_common::collections::{HashMap, KnownFilter};

use crate::message::MAX_ADDR_ADDRESSES;
use crate::wire::{Address, Inventory, Service};

use super::output::{Wakeup, Wire};
use super::{PeerId, Socket};

/// Maximum number of queued address announcements per peer. When the queue
/// is full, a random entry is replaced.
pub const MAX_ADDR_TO_SEND: usize = 1000;
/// Maximum number of inventory entries per `inv` message sent.
pub const MAX_INV_TO_SEND: usize = 1000;
/// How many addresses a peer is remembered to know about.
const KNOWN_ADDR_CAPACITY: usize = 5000;
/// How many inventories a peer is remembered to know about.
const KNOWN_INV_CAPACITY: usize = 1000;

/// Average interval between announcement trickles, per peer.
pub const TRICKLE_INTERVAL: LocalDuration = LocalDuration::from_secs(5);
/// Minimum spacing between requests for the same inventory.
pub const ASK_FOR_SPACING: LocalDuration = LocalDuration::from_secs(2);
/// Upper bound on the jitter added to request times.
const ASK_FOR_JITTER_MS: u64 = 500;

/// An event originating in the inventory manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer announced inventory. The dispatcher decides what to fetch.
    ReceivedInv {
        /// The announcing peer.
        addr: PeerId,
        /// The announced items.
        items: Vec<Inventory>,
    },
    /// A peer requested inventory data. The dispatcher serves it.
    ReceivedGetData {
        /// The requesting peer.
        addr: PeerId,
        /// The requested items.
        items: Vec<Inventory>,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ReceivedInv { addr, items } => {
                write!(f, "{}: announced {} inventory item(s)", addr, items.len())
            }
            Event::ReceivedGetData { addr, items } => {
                write!(f, "{}: requested {} inventory item(s)", addr, items.len())
            }
        }
    }
}

#[derive(Debug)]
struct Peer {
    #[allow(dead_code)]
    socket: Socket,
    link: Link,
    /// Whether the peer asked for inventory to be relayed to it.
    relay: bool,
    addr_known: KnownFilter<Service>,
    inv_known: KnownFilter<Inventory>,
    addrs_to_send: Vec<(u32, Address)>,
    inv_to_send: Vec<Inventory>,
    /// Inventory requests scheduled for the future.
    ask_for: BTreeMap<LocalTime, Vec<Inventory>>,
    next_trickle: LocalTime,
}

/// Manages inventory and address relay.
#[derive(Debug)]
pub struct InventoryManager<U> {
    peers: HashMap<PeerId, Peer>,
    /// When each inventory was last scheduled to be requested, across all
    /// peers. Requests for the same object are spaced out.
    already_asked: HashMap<Inventory, LocalTime>,
    rng: fastrand::Rng,
    upstream: U,
}

impl<U: Wire<Event> + Wakeup> InventoryManager<U> {
    /// Create a new inventory manager.
    pub fn new(rng: fastrand::Rng, upstream: U) -> Self {
        Self {
            peers: HashMap::with_hasher(rng.clone().into()),
            already_asked: HashMap::with_hasher(rng.clone().into()),
            rng,
            upstream,
        }
    }

    /// Whether a peer is registered.
    pub fn is_registered(&self, addr: &PeerId) -> bool {
        self.peers.contains_key(addr)
    }

    /// What a peer has queued, for diagnostics.
    pub fn queued(&self, addr: &PeerId) -> Option<(usize, usize)> {
        self.peers
            .get(addr)
            .map(|p| (p.addrs_to_send.len(), p.inv_to_send.len()))
    }

    /// Whether a peer is known to have an address.
    pub fn is_address_known(&self, addr: &PeerId, service: &Service) -> bool {
        self.peers
            .get(addr)
            .map_or(false, |p| p.addr_known.contains(service))
    }

    /// Called when a peer completes its handshake.
    pub fn peer_negotiated(
        &mut self,
        addr: PeerId,
        socket: Socket,
        link: Link,
        relay: bool,
        now: LocalTime,
    ) {
        let next_trickle = now + self.poisson_interval();

        self.upstream.wakeup(next_trickle - now);
        self.peers.insert(
            addr,
            Peer {
                socket,
                link,
                relay,
                addr_known: KnownFilter::new(KNOWN_ADDR_CAPACITY, self.rng.clone()),
                inv_known: KnownFilter::new(KNOWN_INV_CAPACITY, self.rng.clone()),
                addrs_to_send: Vec::new(),
                inv_to_send: Vec::new(),
                ask_for: BTreeMap::new(),
                next_trickle,
            },
        );
    }

    /// Called when a peer is disconnected.
    pub fn peer_disconnected(&mut self, addr: &PeerId) {
        self.peers.remove(addr);
    }

    /// Remember that a peer knows an address.
    pub fn add_address_known(&mut self, addr: &PeerId, service: Service) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.addr_known.insert(service);
        }
    }

    /// Remember that a peer knows an inventory.
    pub fn add_inventory_known(&mut self, addr: &PeerId, inv: Inventory) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.inv_known.insert(inv);
        }
    }

    /// Queue an address announcement to a peer. Announcements the peer
    /// already knows about are suppressed; when the queue is full, a random
    /// entry is replaced.
    pub fn push_address(&mut self, addr: &PeerId, entry: (u32, Address)) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if peer.addr_known.contains(&entry.1.service) {
                return;
            }
            if peer.addrs_to_send.len() >= MAX_ADDR_TO_SEND {
                let ix = self.rng.usize(..peer.addrs_to_send.len());
                peer.addrs_to_send[ix] = entry;
            } else {
                peer.addrs_to_send.push(entry);
            }
        }
    }

    /// Queue an inventory announcement to a peer, unless it already knows.
    pub fn push_inventory(&mut self, addr: &PeerId, inv: Inventory) {
        if let Some(peer) = self.peers.get_mut(addr) {
            if !peer.inv_known.contains(&inv) {
                peer.inv_to_send.push(inv);
            }
        }
    }

    /// Announce an inventory to every negotiated peer that wants relay.
    pub fn broadcast_inventory(&mut self, inv: Inventory) {
        let peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.relay)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in peers {
            self.push_inventory(&addr, inv);
        }
    }

    /// Relay freshly learned addresses to a couple of random peers.
    pub fn relay_addresses(&mut self, addrs: &[(u32, Address)], from: PeerId) {
        let mut others: Vec<PeerId> =
            self.peers.keys().filter(|a| **a != from).copied().collect();
        self.rng.shuffle(&mut others);
        others.truncate(2);

        for entry in addrs {
            for addr in &others {
                self.push_address(addr, *entry);
            }
        }
    }

    /// Schedule an inventory request to a peer.
    ///
    /// The request goes out no earlier than two seconds after the last
    /// scheduled request for the same object, anywhere, plus a small
    /// jitter.
    pub fn ask_for(&mut self, addr: &PeerId, inv: Inventory, now: LocalTime) {
        if !self.peers.contains_key(addr) {
            return;
        }
        let earliest = self
            .already_asked
            .get(&inv)
            .map(|last| *last + ASK_FOR_SPACING)
            .unwrap_or(now);
        let at = earliest.max(now)
            + LocalDuration::from_millis(self.rng.u64(..ASK_FOR_JITTER_MS) as u128);

        self.already_asked.insert(inv, at);

        if let Some(peer) = self.peers.get_mut(addr) {
            peer.ask_for.entry(at).or_default().push(inv);
        }
        self.upstream.wakeup(at - now);
    }

    /// Called when a peer announces inventory.
    pub fn received_inv(&mut self, addr: PeerId, items: Vec<Inventory>) {
        for inv in items.iter() {
            self.add_inventory_known(&addr, *inv);
        }
        self.upstream.event(Event::ReceivedInv { addr, items });
    }

    /// Called when a peer requests inventory data.
    pub fn received_getdata(&mut self, addr: PeerId, items: Vec<Inventory>) {
        self.upstream.event(Event::ReceivedGetData { addr, items });
    }

    /// Called when a timer rings: send due inventory requests, and trickle
    /// out queued announcements.
    pub fn received_wake(&mut self, now: LocalTime) {
        // Old request times are of no further use once their spacing window
        // has long passed.
        self.already_asked
            .retain(|_, at| *at + ASK_FOR_SPACING * 8 > now);

        let mut next_wakeup: Option<LocalTime> = None;
        let addrs: Vec<PeerId> = self.peers.keys().copied().collect();

        for addr in addrs {
            let interval = self.poisson_interval();
            let peer = match self.peers.get_mut(&addr) {
                Some(peer) => peer,
                None => continue,
            };

            // Send out due inventory requests.
            let mut due = Vec::new();
            while let Some(entry) = peer.ask_for.first_entry() {
                if *entry.key() > now {
                    break;
                }
                due.extend(entry.remove());
            }
            if !due.is_empty() {
                for chunk in due.chunks(MAX_INV_TO_SEND) {
                    self.upstream.get_data(addr, chunk.to_vec());
                }
            }

            let peer = match self.peers.get_mut(&addr) {
                Some(peer) => peer,
                None => continue,
            };

            // Trickle out announcements.
            if peer.next_trickle <= now {
                let mut inv = Vec::new();
                for item in peer.inv_to_send.drain(..) {
                    // Re-check the filter: the peer may have announced the
                    // item to us since it was queued.
                    if peer.inv_known.insert(item) {
                        inv.push(item);
                    }
                }
                let mut addr_batch = Vec::new();
                for entry in peer.addrs_to_send.drain(..) {
                    if peer.addr_known.insert(entry.1.service) {
                        addr_batch.push(entry);
                    }
                }
                peer.next_trickle = now + interval;

                for chunk in inv.chunks(MAX_INV_TO_SEND) {
                    self.upstream.inv(addr, chunk.to_vec());
                }
                for chunk in addr_batch.chunks(MAX_ADDR_ADDRESSES) {
                    self.upstream.addr(addr, chunk.to_vec());
                }
            }

            let peer = match self.peers.get(&addr) {
                Some(peer) => peer,
                None => continue,
            };
            let peer_next = peer
                .ask_for
                .keys()
                .next()
                .copied()
                .map_or(peer.next_trickle, |ask| ask.min(peer.next_trickle));

            next_wakeup = Some(next_wakeup.map_or(peer_next, |w| w.min(peer_next)));
        }

        if let Some(at) = next_wakeup {
            self.upstream.wakeup(if at > now {
                at - now
            } else {
                LocalDuration::from_millis(1)
            });
        }
    }

    /// A Poisson-distributed interval with mean [`TRICKLE_INTERVAL`],
    /// floored at one second. Randomizing announcement times frustrates
    /// traffic analysis.
    fn poisson_interval(&self) -> LocalDuration {
        let mean = TRICKLE_INTERVAL.as_millis() as f64;
        let millis = -(1.0 - self.rng.f64()).ln() * mean;

        LocalDuration::from_millis(millis.max(1000.0) as u128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::{test, Outbox};
    use crate::message::NetworkMessage;
    use ferrite_common::services::ServiceFlags;

    fn inv(n: u8) -> Inventory {
        Inventory {
            kind: 1,
            hash: [n; 32],
        }
    }

    fn setup() -> (InventoryManager<Outbox>, Outbox, PeerId, LocalTime) {
        let outbox = Outbox::new(0xF9BE_B4D9);
        let mut invmgr = InventoryManager::new(fastrand::Rng::with_seed(77), outbox.clone());
        let addr: PeerId = ([91, 4, 4, 4], 9333).into();
        let now = LocalTime::from_secs(1_700_000_000);

        invmgr.peer_negotiated(addr, Socket::new(addr), Link::Outbound, true, now);

        (invmgr, outbox, addr, now)
    }

    #[test]
    fn test_trickle_dedupes_and_batches() {
        let (mut invmgr, mut outbox, addr, now) = setup();
        outbox.drain();

        invmgr.push_inventory(&addr, inv(1));
        invmgr.push_inventory(&addr, inv(2));
        invmgr.push_inventory(&addr, inv(1)); // Queued twice.
        invmgr.add_inventory_known(&addr, inv(3));
        invmgr.push_inventory(&addr, inv(3)); // Already known.

        // Nothing goes out before the trickle timer.
        invmgr.received_wake(now);
        assert!(test::messages_to(&mut outbox, &addr).is_empty());

        // Trickle intervals average five seconds; a minute later the timer
        // has certainly expired.
        let later = now + LocalDuration::from_mins(1);
        invmgr.received_wake(later);

        let msgs = test::messages_to(&mut outbox, &addr);
        match &msgs[..] {
            [NetworkMessage::Inv(items)] => {
                assert_eq!(items.as_slice(), [inv(1), inv(2)]);
            }
            other => panic!("expected a single inv message, got {:?}", other),
        }

        // Once sent, the items are known and are not re-announced.
        invmgr.push_inventory(&addr, inv(1));
        invmgr.received_wake(later + LocalDuration::from_mins(1));
        assert!(test::messages_to(&mut outbox, &addr).is_empty());
    }

    #[test]
    fn test_push_address_reservoir_cap() {
        let (mut invmgr, _outbox, addr, _now) = setup();

        for i in 0..(MAX_ADDR_TO_SEND + 100) as u32 {
            let octets = [10 + (i >> 8) as u8, (i & 0xFF) as u8, 1, 1];
            invmgr.push_address(
                &addr,
                (
                    0,
                    Address::new(&(octets, 9333).into(), ServiceFlags::NETWORK),
                ),
            );
        }
        let (queued_addrs, _) = invmgr.queued(&addr).unwrap();
        assert_eq!(queued_addrs, MAX_ADDR_TO_SEND);
    }

    #[test]
    fn test_ask_for_spacing() {
        let (mut invmgr, mut outbox, addr, now) = setup();
        let other: PeerId = ([92, 5, 5, 5], 9333).into();
        invmgr.peer_negotiated(other, Socket::new(other), Link::Outbound, true, now);
        outbox.drain();

        invmgr.ask_for(&addr, inv(9), now);
        invmgr.ask_for(&other, inv(9), now);

        let first = invmgr.already_asked[&inv(9)];
        let peer_schedules: Vec<LocalTime> = invmgr
            .peers
            .values()
            .flat_map(|p| p.ask_for.keys().copied())
            .collect();

        assert_eq!(peer_schedules.len(), 2);

        // The second request for the same object is scheduled at least two
        // seconds after the first.
        let (a, b) = (peer_schedules[0], peer_schedules[1]);
        let (earlier, later) = if a < b { (a, b) } else { (b, a) };

        assert!(later - earlier >= ASK_FOR_SPACING);
        assert!(first >= now);

        // Due requests go out as getdata.
        invmgr.received_wake(now + LocalDuration::from_mins(1));
        let to_first = test::messages_to(&mut outbox, &addr);
        let to_other = test::messages_to(&mut outbox, &other);

        assert!(matches!(&to_first[..], [NetworkMessage::GetData(items), ..] if items == &vec![inv(9)]));
        assert!(matches!(&to_other[..], [NetworkMessage::GetData(items), ..] if items == &vec![inv(9)]));
    }

    #[test]
    fn test_poisson_interval_distribution() {
        let (invmgr, _outbox, _addr, _now) = setup();

        let samples = 1000;
        let total: u128 = (0..samples)
            .map(|_| invmgr.poisson_interval().as_millis())
            .sum();
        let mean = (total / samples as u128) as u64;

        // The mean of a thousand draws lands near the configured average.
        assert!(mean > 3000 && mean < 8000, "mean was {}ms", mean);
    }
}
