//! The client database: one record per client identity, with timed eviction
//! of stale offers and expired leases.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use core::fmt::{self, Display};
use core::net::Ipv4Addr;

use embassy_time::{Duration, Instant};

use log::info;

use crate::Packet;

/// The identity a client is keyed by: the raw bytes of its client identifier
/// option if it sent one, its hardware address otherwise.
///
/// Keys compare as plain byte strings, so two clients are the same exactly
/// when their identifier bytes are equal, independent of length.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ClientKey(Vec<u8>);

impl ClientKey {
    pub fn new(identifier: impl Into<Vec<u8>>) -> Self {
        Self(identifier.into())
    }

    pub fn of(request: &Packet) -> Self {
        request
            .options
            .client_identifier()
            .filter(|identifier| !identifier.is_empty())
            .map(Self::new)
            .unwrap_or_else(|| Self::new(request.hardware_address()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if index > 0 {
                write!(f, ":")?;
            }

            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum LeaseState {
    #[default]
    Released,
    Offered,
    Assigned,
}

/// Everything the server remembers about one client.
#[derive(Clone, Debug)]
pub struct ClientRecord {
    pub identifier: Vec<u8>,
    pub hardware_address: Vec<u8>,
    pub hostname: String,
    pub state: LeaseState,
    /// The address offered to or held by the client; unspecified means none.
    pub ip_address: Ipv4Addr,
    pub offered_at: Instant,
    pub lease_start: Instant,
    /// `None` models a lease that never expires.
    pub lease_duration: Option<Duration>,
}

impl ClientRecord {
    pub fn new(
        identifier: impl Into<Vec<u8>>,
        hardware_address: impl Into<Vec<u8>>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            hardware_address: hardware_address.into(),
            hostname: hostname.into(),
            state: LeaseState::Released,
            ip_address: Ipv4Addr::UNSPECIFIED,
            offered_at: Instant::from_ticks(0),
            lease_start: Instant::from_ticks(0),
            lease_duration: None,
        }
    }

    pub fn key(&self) -> ClientKey {
        ClientKey::new(self.identifier.clone())
    }

    /// The end of the lease, or `None` for a never-expiring one.
    pub fn lease_end(&self) -> Option<Instant> {
        self.lease_duration
            .map(|duration| self.lease_start + duration)
    }

    fn expired(&self, now: Instant, offer_expiration: Duration) -> bool {
        match self.state {
            LeaseState::Offered => now > self.offered_at + offer_expiration,
            LeaseState::Assigned => self.lease_end().map(|end| now > end).unwrap_or(false),
            LeaseState::Released => false,
        }
    }
}

/// The `ClientKey`-indexed lease table, together with the addresses clients
/// have declined recently.
///
/// Mutations raise an internal dirty flag which the owner collects with
/// [`LeaseTable::take_dirty`] to drive persistence.
pub struct LeaseTable {
    records: BTreeMap<ClientKey, ClientRecord>,
    declined: BTreeMap<Ipv4Addr, Instant>,
    offer_expiration: Duration,
    decline_hold: Duration,
    dirty: bool,
}

impl LeaseTable {
    pub fn new(offer_expiration: Duration, decline_hold: Duration) -> Self {
        Self {
            records: BTreeMap::new(),
            declined: BTreeMap::new(),
            offer_expiration,
            decline_hold,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &ClientKey) -> Option<&ClientRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &ClientKey) -> Option<&mut ClientRecord> {
        let record = self.records.get_mut(key);

        if record.is_some() {
            self.dirty = true;
        }

        record
    }

    /// Inserts the record, replacing an earlier one with the same key.
    pub fn insert(&mut self, record: ClientRecord) {
        self.dirty = true;
        self.records.insert(record.key(), record);
    }

    pub fn remove(&mut self, key: &ClientKey) -> bool {
        let removed = self.records.remove(key).is_some();

        if removed {
            self.dirty = true;
        }

        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.records.values()
    }

    pub fn snapshot(&self) -> Vec<ClientRecord> {
        self.records.values().cloned().collect()
    }

    /// Whether some record currently owns the address. Released records only
    /// count when their addresses are not up for reuse.
    pub fn address_in_use(&self, addr: Ipv4Addr, reuse_released: bool) -> bool {
        self.records.values().any(|record| {
            record.ip_address == addr
                && (!reuse_released || record.state != LeaseState::Released)
        })
    }

    /// Takes the address away from any Released record still remembering it.
    pub fn reclaim_address(&mut self, addr: Ipv4Addr) {
        for record in self.records.values_mut() {
            if record.ip_address == addr && record.state == LeaseState::Released {
                record.ip_address = Ipv4Addr::UNSPECIFIED;
                self.dirty = true;
            }
        }
    }

    /// Takes the address away from every record but the given one. Keeps a
    /// preempted reservation from leaving two live owners of one address.
    pub fn preempt_address(&mut self, addr: Ipv4Addr, keep: &ClientKey) {
        for (key, record) in self.records.iter_mut() {
            if key != keep && record.ip_address == addr {
                record.ip_address = Ipv4Addr::UNSPECIFIED;
                record.state = LeaseState::Released;
                self.dirty = true;
            }
        }
    }

    /// Puts the address on hold after a client declined it.
    pub fn decline(&mut self, addr: Ipv4Addr, now: Instant) {
        if self.decline_hold.as_ticks() != 0 && addr != Ipv4Addr::UNSPECIFIED {
            self.declined.insert(addr, now + self.decline_hold);
        }
    }

    pub fn is_declined(&self, addr: Ipv4Addr, now: Instant) -> bool {
        self.declined
            .get(&addr)
            .map(|until| now <= *until)
            .unwrap_or(false)
    }

    /// Drops expired offers and leases, and lifts expired decline holds.
    /// Returns whether any record was evicted.
    pub fn tick(&mut self, now: Instant) -> bool {
        let offer_expiration = self.offer_expiration;
        let before = self.records.len();

        self.records.retain(|key, record| {
            let expired = record.expired(now, offer_expiration);

            if expired {
                info!(
                    "Client {key} lost its {:?} {} entry",
                    record.state, record.ip_address
                );
            }

            !expired
        });

        self.declined.retain(|_, until| now <= *until);

        let evicted = self.records.len() != before;
        if evicted {
            self.dirty = true;
        }

        evicted
    }

    /// Collects and clears the dirty flag.
    pub fn take_dirty(&mut self) -> bool {
        core::mem::take(&mut self.dirty)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(identifier: &[u8], state: LeaseState, ip: Ipv4Addr) -> ClientRecord {
        let mut record = ClientRecord::new(identifier, identifier, "");
        record.state = state;
        record.ip_address = ip;

        record
    }

    #[test]
    fn records_are_unique_per_key() {
        let mut table = LeaseTable::new(Duration::from_secs(30), Duration::from_secs(0));

        table.insert(record(b"one", LeaseState::Offered, Ipv4Addr::new(10, 0, 0, 100)));
        table.insert(record(b"one", LeaseState::Assigned, Ipv4Addr::new(10, 0, 0, 101)));

        assert_eq!(table.len(), 1);
        assert_eq!(
            table.get(&ClientKey::new(&b"one"[..])).unwrap().ip_address,
            Ipv4Addr::new(10, 0, 0, 101)
        );
    }

    #[test]
    fn expired_offers_and_leases_are_evicted() {
        let mut table = LeaseTable::new(Duration::from_secs(30), Duration::from_secs(0));

        let mut offered = record(b"offered", LeaseState::Offered, Ipv4Addr::new(10, 0, 0, 100));
        offered.offered_at = Instant::from_secs(100);
        table.insert(offered);

        let mut assigned = record(b"assigned", LeaseState::Assigned, Ipv4Addr::new(10, 0, 0, 101));
        assigned.lease_start = Instant::from_secs(100);
        assigned.lease_duration = Some(Duration::from_secs(3600));
        table.insert(assigned);

        let mut forever = record(b"forever", LeaseState::Assigned, Ipv4Addr::new(10, 0, 0, 102));
        forever.lease_start = Instant::from_secs(100);
        forever.lease_duration = None;
        table.insert(forever);

        assert!(!table.tick(Instant::from_secs(120)));
        assert_eq!(table.len(), 3);

        // The offer lapses first, the lease an hour in
        assert!(table.tick(Instant::from_secs(131)));
        assert_eq!(table.len(), 2);

        assert!(table.tick(Instant::from_secs(100 + 3601)));
        assert_eq!(table.len(), 1);
        assert!(table.get(&ClientKey::new(&b"forever"[..])).is_some());
    }

    #[test]
    fn address_use_honors_released_reuse() {
        let mut table = LeaseTable::new(Duration::from_secs(30), Duration::from_secs(0));
        let addr = Ipv4Addr::new(10, 0, 0, 100);

        table.insert(record(b"one", LeaseState::Released, addr));

        assert!(table.address_in_use(addr, false));
        assert!(!table.address_in_use(addr, true));

        table.insert(record(b"one", LeaseState::Assigned, addr));

        assert!(table.address_in_use(addr, true));
    }

    #[test]
    fn declined_addresses_are_held_and_lifted() {
        let mut table = LeaseTable::new(Duration::from_secs(30), Duration::from_secs(60));
        let addr = Ipv4Addr::new(10, 0, 0, 100);

        table.decline(addr, Instant::from_secs(0));

        assert!(table.is_declined(addr, Instant::from_secs(59)));

        table.tick(Instant::from_secs(61));

        assert!(!table.is_declined(addr, Instant::from_secs(61)));
    }

    #[test]
    fn mutations_raise_the_dirty_flag() {
        let mut table = LeaseTable::new(Duration::from_secs(30), Duration::from_secs(0));

        assert!(!table.take_dirty());

        table.insert(record(b"one", LeaseState::Offered, Ipv4Addr::new(10, 0, 0, 100)));

        assert!(table.take_dirty());
        assert!(!table.take_dirty());
    }
}
