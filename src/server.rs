//! The per-message request/reply logic of the server.
//!
//! Only BOOTP requests carrying a DHCP message type are processed; everything
//! the server learns along the way lives in the [`LeaseTable`].

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::vec::Vec;

use core::net::{Ipv4Addr, SocketAddrV4};

use embassy_time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::lease::{ClientKey, ClientRecord, LeaseState, LeaseTable};
use crate::options::{self, DhcpOption, Options};
use crate::pool;
use crate::reserve::Reservation;
use crate::{MessageType, Packet, DEFAULT_CLIENT_PORT, DEFAULT_SERVER_PORT};

/// Leases last a day unless configured otherwise.
pub const DEFAULT_LEASE_TIME_SECS: u32 = 24 * 60 * 60;
/// An offer not followed up by a request lapses after half a minute.
pub const DEFAULT_OFFER_EXPIRATION: Duration = Duration::from_secs(30);
/// Replies are padded to the minimum datagram size every BOOTP client can take.
pub const MIN_PACKET_SIZE: u16 = 312;
/// A lease time of all-ones means the lease never expires.
pub const INFINITE_LEASE_TIME_SECS: u32 = u32::MAX;

/// When a configured option is sent along: always, or only when the client
/// asked for its code in the parameter request list.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OptionMode {
    Default,
    Force,
}

/// Everything the server is told up front; immutable while it runs.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// The address and port the server answers on.
    pub socket: SocketAddrV4,
    pub subnet_mask: Ipv4Addr,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
    pub offer_expiration: Duration,
    /// Lease duration in seconds; [`INFINITE_LEASE_TIME_SECS`] never expires.
    pub lease_time_secs: u32,
    /// Replies are zero-padded up to this size, never below [`MIN_PACKET_SIZE`].
    pub minimum_packet_size: u16,
    /// Extra reply options and when to include them.
    pub options: Vec<(OptionMode, DhcpOption)>,
    pub reservations: Vec<Reservation>,
    /// How long a declined address is kept out of circulation; zero disables
    /// the hold.
    pub decline_hold: Duration,
}

impl Configuration {
    pub fn new(
        ip: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        range_start: Ipv4Addr,
        range_end: Ipv4Addr,
    ) -> Self {
        Self {
            socket: SocketAddrV4::new(ip, DEFAULT_SERVER_PORT),
            subnet_mask,
            range_start,
            range_end,
            offer_expiration: DEFAULT_OFFER_EXPIRATION,
            lease_time_secs: DEFAULT_LEASE_TIME_SECS,
            minimum_packet_size: MIN_PACKET_SIZE,
            options: Vec::new(),
            reservations: Vec::new(),
            decline_hold: Duration::from_secs(0),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        *self.socket.ip()
    }

    /// The configured lease duration; `None` when leases never expire.
    pub fn lease_duration(&self) -> Option<Duration> {
        (self.lease_time_secs != INFINITE_LEASE_TIME_SECS)
            .then(|| Duration::from_secs(self.lease_time_secs as u64))
    }

    pub fn min_packet_size(&self) -> usize {
        self.minimum_packet_size.max(MIN_PACKET_SIZE) as usize
    }

    /// Whether the address lies in the main pool or any reservation range.
    pub fn in_any_range(&self, addr: Ipv4Addr) -> bool {
        let ranges = core::iter::once((self.range_start, self.range_end)).chain(
            self.reservations
                .iter()
                .map(|reservation| (reservation.range_start, reservation.range_end)),
        );

        let pos: u32 = addr.into();

        for (start, end) in ranges {
            let start: u32 = pool::sanitize(self.ip(), self.subnet_mask, start).into();
            let end: u32 = pool::sanitize(self.ip(), self.subnet_mask, end).into();

            if pos >= start && pos <= end {
                return true;
            }
        }

        false
    }
}

/// A hook invoked on every positive reply after the configured options went
/// in; may add further options.
pub trait MessageInterceptor {
    fn apply(&self, request: &Packet, response: &mut Packet);
}

/// The DHCP server state machine.
///
/// The server is unaware of the IP/UDP transport layer and operates purely in
/// terms of decoded packets; feeding it datagrams and delivering its replies
/// is the job of the io layer (or of a test).
pub struct Server {
    config: Configuration,
    table: LeaseTable,
    interceptors: Vec<Box<dyn MessageInterceptor + Send>>,
}

impl Server {
    pub fn new(config: Configuration) -> Self {
        let table = LeaseTable::new(config.offer_expiration, config.decline_hold);

        Self {
            config,
            table,
            interceptors: Vec::new(),
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn table(&self) -> &LeaseTable {
        &self.table
    }

    pub fn add_interceptor(&mut self, interceptor: Box<dyn MessageInterceptor + Send>) {
        self.interceptors.push(interceptor);
    }

    /// Re-seeds the table from stored records. Offers are not worth keeping
    /// across a restart, and addresses outside every configured range would
    /// never be handed out again, so both are dropped. Returns the number of
    /// records kept.
    pub fn restore(&mut self, records: Vec<ClientRecord>) -> usize {
        let mut kept = 0;

        for record in records {
            if record.state == LeaseState::Offered {
                continue;
            }

            if record.ip_address != Ipv4Addr::UNSPECIFIED
                && !self.config.in_any_range(record.ip_address)
            {
                continue;
            }

            self.table.insert(record);
            kept += 1;
        }

        // Seeding is not a change worth writing straight back
        self.table.take_dirty();

        kept
    }

    /// Evicts whatever expired by `now`; returns whether anything was evicted.
    pub fn tick(&mut self, now: Instant) -> bool {
        self.table.tick(now)
    }

    /// Collects whether the table changed since the last call.
    pub fn take_changed(&mut self) -> bool {
        self.table.take_dirty()
    }

    pub fn snapshot(&self) -> Vec<ClientRecord> {
        self.table.snapshot()
    }

    /// Processes one inbound packet and produces the reply to send, if any.
    pub fn handle(&mut self, request: &Packet, now: Instant) -> Option<Packet> {
        if request.reply {
            return None;
        }

        let Some(message_type) = request.message_type() else {
            info!("Ignoring BOOTP request without a DHCP message type");
            return None;
        };

        debug!(
            "Received {message_type} from {}",
            ClientKey::of(request)
        );

        match message_type {
            MessageType::Discover => self.discover(request, now),
            MessageType::Request => self.request(request, now),
            MessageType::Decline => self.decline(request, now),
            MessageType::Release => self.release(request),
            MessageType::Inform => Some(self.inform(request)),
            other => {
                debug!("Ignoring {other} message");
                None
            }
        }
    }

    fn discover(&mut self, request: &Packet, now: Instant) -> Option<Packet> {
        let key = ClientKey::of(request);

        // A client we already offered to or serve keeps its address
        let current = self.table.get(&key).and_then(|record| {
            (record.state != LeaseState::Released && record.ip_address != Ipv4Addr::UNSPECIFIED)
                .then_some((record.state, record.ip_address))
        });

        if let Some((state, addr)) = current {
            if state == LeaseState::Offered {
                if let Some(record) = self.table.get_mut(&key) {
                    record.offered_at = now;
                }
            }

            info!("Re-offering {addr} to {key}");

            return Some(self.offer(request, addr));
        }

        let hostname = request.options.host_name();
        let requested = request.options.requested_ip();

        let Some(addr) = pool::allocate(
            &self.config,
            &mut self.table,
            request.hardware_address(),
            hostname,
            requested,
            now,
        ) else {
            error!("Address pool exhausted, no offer for {key}");
            return None;
        };

        let mut record = self
            .table
            .get(&key)
            .cloned()
            .unwrap_or_else(|| ClientRecord::new(key.as_bytes(), Vec::new(), ""));

        record.hardware_address = request.hardware_address().into();
        if let Some(hostname) = hostname {
            record.hostname = hostname.to_string();
        }
        record.state = LeaseState::Offered;
        record.ip_address = addr;
        record.offered_at = now;

        self.table.insert(record);

        info!("Offering {addr} to {key}");

        Some(self.offer(request, addr))
    }

    fn request(&mut self, request: &Packet, now: Instant) -> Option<Packet> {
        let key = ClientKey::of(request);

        match request.options.server_identifier() {
            Some(server_id) if server_id != self.config.ip() => {
                // The client went with another server's offer
                if matches!(self.table.get(&key), Some(record) if record.state == LeaseState::Offered)
                {
                    debug!("Client {key} chose server {server_id}, dropping our offer");
                    self.table.remove(&key);
                }

                None
            }
            Some(_) => self.request_selecting(request, &key, now),
            None if request.ciaddr == Ipv4Addr::UNSPECIFIED => {
                self.request_init_reboot(request, &key, now)
            }
            None => self.request_renewing(request, &key, now),
        }
    }

    /// The client accepted our offer and asks for the offered address.
    fn request_selecting(
        &mut self,
        request: &Packet,
        key: &ClientKey,
        now: Instant,
    ) -> Option<Packet> {
        let requested = request.options.requested_ip();
        let offered = self
            .table
            .get(key)
            .filter(|record| record.state == LeaseState::Offered)
            .map(|record| record.ip_address);

        match (requested, offered) {
            (Some(requested), Some(offered)) if requested == offered => {
                self.assign(key, requested, now);

                info!("Assigned {requested} to {key}");

                Some(self.ack(request, requested))
            }
            (_, Some(offered)) => {
                warn!("Client {key} requested something other than its offered {offered}");
                self.table.remove(key);

                Some(self.nak(request))
            }
            _ => {
                warn!("Client {key} requested an address without an outstanding offer");

                Some(self.nak(request))
            }
        }
    }

    /// The client rebooted and verifies the address it still holds.
    fn request_init_reboot(
        &mut self,
        request: &Packet,
        key: &ClientKey,
        now: Instant,
    ) -> Option<Packet> {
        let requested = request.options.requested_ip();
        let assigned = self
            .table
            .get(key)
            .filter(|record| record.state == LeaseState::Assigned)
            .map(|record| record.ip_address);

        match (requested, assigned) {
            (Some(requested), Some(assigned)) if requested == assigned => {
                self.refresh(key, now);

                info!("Confirmed {assigned} for rebooted client {key}");

                Some(self.ack(request, assigned))
            }
            _ => {
                warn!("No verifiable binding for rebooted client {key}");
                self.table.remove(key);

                Some(self.nak(request))
            }
        }
    }

    /// The client extends its lease mid-life; `ciaddr` names the address.
    fn request_renewing(
        &mut self,
        request: &Packet,
        key: &ClientKey,
        now: Instant,
    ) -> Option<Packet> {
        let ciaddr = request.ciaddr;
        let assigned = self
            .table
            .get(key)
            .filter(|record| record.state == LeaseState::Assigned)
            .map(|record| record.ip_address);

        if assigned == Some(ciaddr) {
            self.refresh(key, now);

            info!("Renewed {ciaddr} for {key}");

            return Some(self.ack(request, ciaddr));
        }

        // Whatever we remember does not match what the client holds
        self.table.remove(key);

        if pool::is_free(&self.config, &self.table, ciaddr, true, now) {
            self.table.reclaim_address(ciaddr);

            let mut record = ClientRecord::new(key.as_bytes(), request.hardware_address(), "");
            if let Some(hostname) = request.options.host_name() {
                record.hostname = hostname.to_string();
            }
            record.state = LeaseState::Assigned;
            record.ip_address = ciaddr;
            record.lease_start = now;
            record.lease_duration = self.config.lease_duration();

            self.table.insert(record);

            info!("Adopted renewing client {key} at {ciaddr}");

            Some(self.ack(request, ciaddr))
        } else {
            warn!("Renewing client {key} claims {ciaddr}, which is taken; staying silent");

            None
        }
    }

    fn decline(&mut self, request: &Packet, now: Instant) -> Option<Packet> {
        if request.options.server_identifier() != Some(self.config.ip()) {
            return None;
        }

        let key = ClientKey::of(request);

        let declined = self.table.get(&key).map(|record| {
            if record.ip_address != Ipv4Addr::UNSPECIFIED {
                record.ip_address
            } else {
                request
                    .options
                    .requested_ip()
                    .unwrap_or(Ipv4Addr::UNSPECIFIED)
            }
        });

        if let Some(addr) = declined {
            warn!("Client {key} declined {addr}");

            self.table.remove(&key);
            self.table.decline(addr, now);
        }

        None
    }

    fn release(&mut self, request: &Packet) -> Option<Packet> {
        if request.options.server_identifier() != Some(self.config.ip()) {
            return None;
        }

        let key = ClientKey::of(request);

        if let Some(record) = self.table.get_mut(&key) {
            if request.ciaddr == record.ip_address {
                // The address stays with the record so the client can get it
                // back cheaply
                record.state = LeaseState::Released;
            } else {
                record.ip_address = Ipv4Addr::UNSPECIFIED;
                record.state = LeaseState::Released;
            }

            info!("Client {key} released its lease");
        }

        None
    }

    fn inform(&self, request: &Packet) -> Packet {
        let mut options = Options::new();
        options.set_message_type(MessageType::Ack);
        options.push(DhcpOption::ServerIdentifier(self.config.ip()));

        if request.options.requests(options::SUBNET_MASK) {
            options.push(DhcpOption::SubnetMask(self.config.subnet_mask));
        }

        // No address and no lease time; the client only wants configuration
        let mut reply = request.new_reply(Ipv4Addr::UNSPECIFIED, options);
        reply.ciaddr = request.ciaddr;

        self.finish(request, &mut reply);

        reply
    }

    /// Commits the address to the client and preempts any other holder.
    fn assign(&mut self, key: &ClientKey, addr: Ipv4Addr, now: Instant) {
        let duration = self.config.lease_duration();

        self.table.preempt_address(addr, key);

        if let Some(record) = self.table.get_mut(key) {
            record.state = LeaseState::Assigned;
            record.ip_address = addr;
            record.lease_start = now;
            record.lease_duration = duration;
        }
    }

    fn refresh(&mut self, key: &ClientKey, now: Instant) {
        let duration = self.config.lease_duration();

        if let Some(record) = self.table.get_mut(key) {
            record.lease_start = now;
            record.lease_duration = duration;
        }
    }

    fn offer(&self, request: &Packet, addr: Ipv4Addr) -> Packet {
        let mut reply = request.new_reply(addr, self.lease_options(request, MessageType::Offer));

        self.finish(request, &mut reply);

        reply
    }

    fn ack(&self, request: &Packet, addr: Ipv4Addr) -> Packet {
        let mut reply = request.new_reply(addr, self.lease_options(request, MessageType::Ack));
        reply.ciaddr = request.ciaddr;

        self.finish(request, &mut reply);

        reply
    }

    fn nak(&self, request: &Packet) -> Packet {
        let mut options = Options::new();
        options.set_message_type(MessageType::Nak);
        options.push(DhcpOption::ServerIdentifier(self.config.ip()));

        if request.options.requests(options::SUBNET_MASK) {
            options.push(DhcpOption::SubnetMask(self.config.subnet_mask));
        }

        let mut reply = request.new_reply(Ipv4Addr::UNSPECIFIED, options);
        reply.ciaddr = Ipv4Addr::UNSPECIFIED;

        reply
    }

    fn lease_options(&self, request: &Packet, mt: MessageType) -> Options {
        let mut options = Options::new();
        options.set_message_type(mt);
        options.push(DhcpOption::IpAddressLeaseTime(self.config.lease_time_secs));
        options.push(DhcpOption::ServerIdentifier(self.config.ip()));

        if request.options.requests(options::SUBNET_MASK) {
            options.push(DhcpOption::SubnetMask(self.config.subnet_mask));
        }

        options
    }

    /// Appends the configured options the client should see, then lets the
    /// interceptors have the final word.
    fn finish(&self, request: &Packet, reply: &mut Packet) {
        for (mode, option) in &self.config.options {
            let wanted =
                matches!(mode, OptionMode::Force) || request.options.requests(option.code());

            if wanted && !reply.options.contains(option.code()) {
                reply.options.push(option.clone());
            }
        }

        for interceptor in &self.interceptors {
            interceptor.apply(request, reply);
        }
    }
}

/// Where a reply goes, per RFC 2131 §4.1.
///
/// Relayed requests go back through the relay agent, negative answers are
/// broadcast, and clients with a working address are answered directly. A
/// client that has no address yet and did not ask for broadcast should be
/// unicast to `yiaddr`, but that needs an ARP-table injection the transport
/// cannot do, so the reply is broadcast as well.
pub fn reply_destination(request: &Packet, reply: &Packet) -> SocketAddrV4 {
    if request.giaddr != Ipv4Addr::UNSPECIFIED {
        return SocketAddrV4::new(request.giaddr, DEFAULT_SERVER_PORT);
    }

    if reply.message_type() == Some(MessageType::Nak) {
        return SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_CLIENT_PORT);
    }

    if request.ciaddr != Ipv4Addr::UNSPECIFIED {
        return SocketAddrV4::new(request.ciaddr, DEFAULT_CLIENT_PORT);
    }

    SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_CLIENT_PORT)
}
