//! Address selection: reservations first, then the client's wish, then the
//! pool scan that prefers addresses no released client still remembers.

use core::net::Ipv4Addr;

use embassy_time::Instant;

use log::debug;

use crate::lease::LeaseTable;
use crate::server::Configuration;

/// Forces an address into the server's subnet: the network bits come from the
/// server, the host bits from the address itself.
pub(crate) fn sanitize(server: Ipv4Addr, mask: Ipv4Addr, addr: Ipv4Addr) -> Ipv4Addr {
    let server: u32 = server.into();
    let mask: u32 = mask.into();
    let addr: u32 = addr.into();

    ((server & mask) | (addr & !mask)).into()
}

fn in_subnet(server: Ipv4Addr, mask: Ipv4Addr, addr: Ipv4Addr) -> bool {
    let server: u32 = server.into();
    let mask: u32 = mask.into();
    let addr: u32 = addr.into();

    addr & mask == server & mask
}

/// Whether the address can be handed out right now.
pub(crate) fn is_free(
    config: &Configuration,
    table: &LeaseTable,
    addr: Ipv4Addr,
    reuse_released: bool,
    now: Instant,
) -> bool {
    addr != Ipv4Addr::UNSPECIFIED
        && in_subnet(config.ip(), config.subnet_mask, addr)
        && addr != config.ip()
        && !table.is_declined(addr, now)
        && !table.address_in_use(addr, reuse_released)
}

/// Picks an address for the client, or `None` when every candidate is taken.
///
/// A client matching a reservation allocates from that reservation's range
/// and nowhere else. For everyone else the client's requested address wins
/// over the pool scan, and the scan itself runs twice: the first pass skips
/// addresses a released client still remembers, the second reclaims them.
pub fn allocate(
    config: &Configuration,
    table: &mut LeaseTable,
    hardware_address: &[u8],
    hostname: Option<&str>,
    requested: Option<Ipv4Addr>,
    now: Instant,
) -> Option<Ipv4Addr> {
    let server = config.ip();
    let mask = config.subnet_mask;

    // Declaration order, first matching reservation wins
    if let Some(reservation) = config
        .reservations
        .iter()
        .find(|reservation| reservation.matches(hardware_address, hostname))
    {
        let start: u32 = sanitize(server, mask, reservation.range_start).into();
        let end: u32 = sanitize(server, mask, reservation.range_end).into();

        for pos in start..=end {
            let addr = pos.into();

            if is_free(config, table, addr, true, now) {
                table.reclaim_address(addr);

                return Some(addr);
            }
        }

        if reservation.preempt {
            debug!("Reservation range exhausted, preempting {}", Ipv4Addr::from(start));

            return Some(start.into());
        }

        // The reservation is a binding, not a preference; an exhausted range
        // does not spill the client into the general pool
        return None;
    }

    // The client's wish counts as long as the address is not taken
    if let Some(addr) = requested {
        if is_free(config, table, addr, true, now) {
            table.reclaim_address(addr);

            return Some(addr);
        }
    }

    let start: u32 = sanitize(server, mask, config.range_start).into();
    let end: u32 = sanitize(server, mask, config.range_end).into();

    // Addresses nobody remembers come first...
    for pos in start..=end {
        let addr = pos.into();

        if is_free(config, table, addr, false, now) {
            return Some(addr);
        }
    }

    // ...then the ones released clients gave back
    for pos in start..=end {
        let addr = pos.into();

        if is_free(config, table, addr, true, now) {
            table.reclaim_address(addr);

            return Some(addr);
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::lease::{ClientKey, ClientRecord, LeaseState};
    use crate::reserve::{MacPrefix, Reservation};

    use embassy_time::Duration;

    fn config() -> Configuration {
        Configuration::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 100),
            Ipv4Addr::new(10, 0, 0, 102),
        )
    }

    fn table() -> LeaseTable {
        LeaseTable::new(Duration::from_secs(30), Duration::from_secs(0))
    }

    fn occupy(table: &mut LeaseTable, identifier: &[u8], state: LeaseState, addr: Ipv4Addr) {
        let mut record = ClientRecord::new(identifier, identifier, "");
        record.state = state;
        record.ip_address = addr;

        table.insert(record);
    }

    fn next(config: &Configuration, table: &mut LeaseTable) -> Option<Ipv4Addr> {
        allocate(config, table, &[0xee; 6], None, None, Instant::from_ticks(0))
    }

    #[test]
    fn addresses_come_out_in_pool_order() {
        let config = config();
        let mut table = table();

        for host in 100..=102 {
            let addr = next(&config, &mut table).unwrap();
            assert_eq!(addr, Ipv4Addr::new(10, 0, 0, host));

            occupy(&mut table, &[host], LeaseState::Assigned, addr);
        }

        assert_eq!(next(&config, &mut table), None);
    }

    #[test]
    fn pool_boundaries_are_forced_into_the_subnet() {
        let mut config = config();
        config.range_start = Ipv4Addr::new(192, 168, 7, 100);
        config.range_end = Ipv4Addr::new(172, 16, 0, 102);

        let mut table = table();

        assert_eq!(
            next(&config, &mut table),
            Some(Ipv4Addr::new(10, 0, 0, 100))
        );
    }

    #[test]
    fn released_addresses_are_reused_last() {
        let config = config();
        let mut table = table();

        occupy(
            &mut table,
            b"gone",
            LeaseState::Released,
            Ipv4Addr::new(10, 0, 0, 100),
        );

        // Fresh addresses first, despite the hole at .100
        assert_eq!(
            next(&config, &mut table),
            Some(Ipv4Addr::new(10, 0, 0, 101))
        );
        occupy(&mut table, &[1], LeaseState::Assigned, Ipv4Addr::new(10, 0, 0, 101));

        assert_eq!(
            next(&config, &mut table),
            Some(Ipv4Addr::new(10, 0, 0, 102))
        );
        occupy(&mut table, &[2], LeaseState::Assigned, Ipv4Addr::new(10, 0, 0, 102));

        // Only the released address remains; its old owner forgets it
        assert_eq!(
            next(&config, &mut table),
            Some(Ipv4Addr::new(10, 0, 0, 100))
        );
        assert_eq!(
            table
                .get(&ClientKey::new(&b"gone"[..]))
                .unwrap()
                .ip_address,
            Ipv4Addr::UNSPECIFIED
        );
    }

    #[test]
    fn requested_addresses_are_honored_when_free() {
        let config = config();
        let mut table = table();

        let requested = Some(Ipv4Addr::new(10, 0, 0, 102));

        assert_eq!(
            allocate(&config, &mut table, &[0xee; 6], None, requested, Instant::from_ticks(0)),
            Some(Ipv4Addr::new(10, 0, 0, 102))
        );

        occupy(
            &mut table,
            b"other",
            LeaseState::Assigned,
            Ipv4Addr::new(10, 0, 0, 102),
        );

        // Taken now, so the scan hands out the pool start instead
        assert_eq!(
            allocate(&config, &mut table, &[0xee; 6], None, requested, Instant::from_ticks(0)),
            Some(Ipv4Addr::new(10, 0, 0, 100))
        );
    }

    #[test]
    fn the_server_address_is_never_allocated() {
        let mut config = config();
        config.range_start = Ipv4Addr::new(10, 0, 0, 1);
        config.range_end = Ipv4Addr::new(10, 0, 0, 2);

        let mut table = table();

        assert_eq!(next(&config, &mut table), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn reservations_override_the_pool() {
        let mut config = config();
        config.reservations.push(Reservation::for_mac(
            MacPrefix::new([0xaa, 0xbb], 16),
            Ipv4Addr::new(10, 0, 0, 200),
            Ipv4Addr::new(10, 0, 0, 201),
        ));

        let mut table = table();

        assert_eq!(
            allocate(
                &config,
                &mut table,
                &[0xaa, 0xbb, 1, 2, 3, 4],
                None,
                None,
                Instant::from_ticks(0)
            ),
            Some(Ipv4Addr::new(10, 0, 0, 200))
        );

        // Non-matching clients stay in the pool
        assert_eq!(next(&config, &mut table), Some(Ipv4Addr::new(10, 0, 0, 100)));
    }

    #[test]
    fn a_reserved_client_is_confined_to_its_range() {
        let mut config = config();
        config.reservations.push(Reservation::for_mac(
            MacPrefix::new([0xaa, 0xbb], 16),
            Ipv4Addr::new(10, 0, 0, 200),
            Ipv4Addr::new(10, 0, 0, 200),
        ));

        let mut table = table();

        occupy(
            &mut table,
            b"squatter",
            LeaseState::Assigned,
            Ipv4Addr::new(10, 0, 0, 200),
        );

        // Range full, no preemption: neither the requested address nor the
        // general pool is an escape hatch
        assert_eq!(
            allocate(
                &config,
                &mut table,
                &[0xaa, 0xbb, 1, 2, 3, 4],
                None,
                Some(Ipv4Addr::new(10, 0, 0, 101)),
                Instant::from_ticks(0)
            ),
            None
        );
    }

    #[test]
    fn preempting_reservations_always_yield_their_address() {
        let mut config = config();
        config.reservations.push(
            Reservation::for_mac(
                MacPrefix::new([0xaa, 0xbb], 16),
                Ipv4Addr::new(10, 0, 0, 200),
                Ipv4Addr::new(10, 0, 0, 200),
            )
            .preempt(),
        );

        let mut table = table();

        occupy(
            &mut table,
            b"squatter",
            LeaseState::Assigned,
            Ipv4Addr::new(10, 0, 0, 200),
        );

        assert_eq!(
            allocate(
                &config,
                &mut table,
                &[0xaa, 0xbb, 1, 2, 3, 4],
                None,
                None,
                Instant::from_ticks(0)
            ),
            Some(Ipv4Addr::new(10, 0, 0, 200))
        );
    }

    #[test]
    fn declined_addresses_are_skipped() {
        let config = config();
        let mut table = LeaseTable::new(Duration::from_secs(30), Duration::from_secs(300));

        table.decline(Ipv4Addr::new(10, 0, 0, 100), Instant::from_secs(0));

        assert_eq!(
            allocate(&config, &mut table, &[0xee; 6], None, None, Instant::from_secs(1)),
            Some(Ipv4Addr::new(10, 0, 0, 101))
        );
    }
}
