//! The ban list.
//!
//! Maps subnets to ban expiry times. Lookups are "most specific match
//! wins": when several entries cover an address, the longest prefix decides
//! whether the address is banned. Expired entries are only removed at sweep
//! time, never on read.
use std::fmt;

use log::*;

use ferrite_net::{LocalDuration, LocalTime};

use ferrite_common::collections::HashMap;

use crate::store::Store;
use crate::wire::{self, Decodable, Encodable, NetAddress, Subnet};

use super::output::{Wakeup, Wire};

/// Default duration of a ban.
pub const DEFAULT_BAN_TIME: LocalDuration = LocalDuration::from_mins(24 * 60);

/// How often expired entries are swept out.
pub const SWEEP_INTERVAL: LocalDuration = LocalDuration::from_mins(15);

/// Minimum time between writes of the ban list to its store. Debounces
/// write storms when many peers are banned in quick succession.
pub const FLUSH_DEBOUNCE: LocalDuration = LocalDuration::from_secs(60);

/// Magic bytes tagging the ban list snapshot format.
const SNAPSHOT_MAGIC: u32 = 0x4642_414E; // "FBAN"
/// Snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// An event emitted by the ban manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A subnet was banned.
    Banned(Subnet, LocalTime),
    /// A subnet ban was lifted.
    Unbanned(Subnet),
    /// Expired entries were swept out.
    Swept(usize),
    /// An error was encountered.
    Error(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Banned(subnet, until) => write!(f, "{} banned until {}", subnet, until),
            Event::Unbanned(subnet) => write!(f, "{} unbanned", subnet),
            Event::Swept(count) => write!(f, "{} expired ban(s) swept", count),
            Event::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Manages the ban list.
#[derive(Debug)]
pub struct BanManager<P, U> {
    entries: HashMap<Subnet, LocalTime>,
    dirty: bool,
    last_sweep: Option<LocalTime>,
    last_flush: Option<LocalTime>,
    store: P,
    upstream: U,
}

impl<P: Store, U: Wire<Event> + Wakeup> BanManager<P, U> {
    /// Create a new, empty ban manager.
    pub fn new(store: P, rng: fastrand::Rng, upstream: U) -> Self {
        Self {
            entries: HashMap::with_hasher(rng.into()),
            dirty: false,
            last_sweep: None,
            last_flush: None,
            store,
            upstream,
        }
    }

    /// Initialize the ban manager, loading the ban list from its store.
    /// A corrupt snapshot is discarded.
    pub fn initialize(&mut self, now: LocalTime) {
        match self.store.get() {
            Ok(Some(bytes)) => match self.decode(&bytes) {
                Ok(entries) => {
                    debug!(target: "p2p", "Loaded {} banned subnet(s)", entries.len());
                    self.entries.extend(entries);
                }
                Err(err) => {
                    self.upstream
                        .event(Event::Error(format!("corrupt ban list discarded: {}", err)));
                }
            },
            Ok(None) => {}
            Err(err) => {
                self.upstream
                    .event(Event::Error(format!("failed to read ban list: {}", err)));
            }
        }
        self.last_sweep = Some(now);
        self.upstream.wakeup(SWEEP_INTERVAL);
    }

    /// Ban a subnet. The entry expires after the given offset, or
    /// [`DEFAULT_BAN_TIME`] if none is given.
    pub fn ban(&mut self, subnet: Subnet, offset: Option<LocalDuration>, now: LocalTime) {
        let until = now + offset.unwrap_or(DEFAULT_BAN_TIME);

        self.entries.insert(subnet, until);
        self.dirty = true;
        self.upstream.event(Event::Banned(subnet, until));
    }

    /// Ban the address of a single peer.
    pub fn ban_peer(&mut self, ip: NetAddress, now: LocalTime) {
        self.ban(Subnet::single(ip), None, now);
    }

    /// Lift a ban. Returns `false` if no such entry existed.
    pub fn unban(&mut self, subnet: &Subnet) -> bool {
        if self.entries.remove(subnet).is_some() {
            self.dirty = true;
            self.upstream.event(Event::Unbanned(*subnet));

            return true;
        }
        false
    }

    /// Check whether an address is banned.
    ///
    /// The most specific covering entry decides: an expired `/32` overrides
    /// a live `/16`.
    pub fn is_banned(&self, ip: &NetAddress, now: LocalTime) -> bool {
        self.entries
            .iter()
            .filter(|(subnet, _)| subnet.contains(ip))
            .max_by_key(|(subnet, _)| subnet.prefix())
            .map_or(false, |(_, until)| *until > now)
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Snapshot the ban list.
    pub fn entries(&self) -> impl Iterator<Item = (&Subnet, &LocalTime)> {
        self.entries.iter()
    }

    /// Replace the ban list with the given entries.
    pub fn replace(&mut self, entries: impl IntoIterator<Item = (Subnet, LocalTime)>) {
        self.entries.clear();
        self.entries.extend(entries);
        self.dirty = true;
    }

    /// Remove entries whose expiry has passed.
    pub fn sweep(&mut self, now: LocalTime) {
        let before = self.entries.len();
        self.entries.retain(|_, until| *until > now);
        let swept = before - self.entries.len();

        if swept > 0 {
            self.dirty = true;
            self.upstream.event(Event::Swept(swept));
        }
        self.last_sweep = Some(now);
    }

    /// Called when a timer rings. Sweeps periodically and flushes the list
    /// when it has unwritten changes.
    pub fn received_wake(&mut self, now: LocalTime) {
        if now - self.last_sweep.unwrap_or_default() >= SWEEP_INTERVAL {
            self.sweep(now);
            self.upstream.wakeup(SWEEP_INTERVAL);
        }
        if self.dirty && now - self.last_flush.unwrap_or_default() >= FLUSH_DEBOUNCE {
            self.flush(now);
        }
    }

    /// Write the ban list to its store, if it has unwritten changes.
    pub fn flush(&mut self, now: LocalTime) {
        if !self.dirty {
            return;
        }
        let snapshot = self.encode();

        match self.store.put(&snapshot) {
            Ok(()) => {
                self.dirty = false;
                self.last_flush = Some(now);
            }
            Err(err) => {
                self.upstream
                    .event(Event::Error(format!("failed to write ban list: {}", err)));
            }
        }
    }

    /// Whether the list has changes not yet written to the store.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        SNAPSHOT_MAGIC
            .encode(&mut bytes)
            .and_then(|_| SNAPSHOT_VERSION.encode(&mut bytes))
            .expect("writing to a vector never fails");

        wire::VarInt(self.entries.len() as u64)
            .encode(&mut bytes)
            .expect("writing to a vector never fails");

        for (subnet, until) in self.entries.iter() {
            subnet
                .encode(&mut bytes)
                .and_then(|_| until.as_secs().encode(&mut bytes))
                .expect("writing to a vector never fails");
        }
        bytes
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<(Subnet, LocalTime)>, wire::Error> {
        let mut r = std::io::Cursor::new(bytes);

        let magic = u32::decode(&mut r)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(wire::Error::InvalidData("ban list magic"));
        }
        let version = u8::decode(&mut r)?;
        if version != SNAPSHOT_VERSION {
            return Err(wire::Error::InvalidData("ban list version"));
        }
        let count = wire::VarInt::decode(&mut r)?.0;
        let mut entries = Vec::with_capacity((count as usize).min(1024));

        for _ in 0..count {
            let subnet = Subnet::decode(&mut r)?;
            let until = LocalTime::from_secs(u64::decode(&mut r)?);

            entries.push((subnet, until));
        }
        Ok(entries)
    }
}
