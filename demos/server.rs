use core::net::Ipv4Addr;

use edge_dhcpd::io::Runner;
use edge_dhcpd::options::DhcpOption;
use edge_dhcpd::reserve::{MacPrefix, Reservation};
use edge_dhcpd::server::{Configuration, OptionMode, Server};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;

fn main() {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    futures_lite::future::block_on(run()).unwrap();
}

async fn run() -> Result<(), anyhow::Error> {
    let stack = edge_nal_std::Stack::new();

    let mut config = Configuration::new(
        Ipv4Addr::new(192, 168, 0, 1),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(192, 168, 0, 50),
        Ipv4Addr::new(192, 168, 0, 200),
    );

    config.options.push((
        OptionMode::Force,
        DhcpOption::Router(vec![Ipv4Addr::new(192, 168, 0, 1)]),
    ));
    config.options.push((
        OptionMode::Default,
        DhcpOption::DomainNameServer(vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]),
    ));

    // The printer always gets .10, no matter who squats on it
    config.reservations.push(
        Reservation::for_mac(
            MacPrefix::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff], 48),
            Ipv4Addr::new(192, 168, 0, 10),
            Ipv4Addr::new(192, 168, 0, 10),
        )
        .preempt(),
    );

    let runner = Runner::<NoopRawMutex>::new(Server::new(config));

    let mut rx_buf = [0; 1500];
    let mut tx_buf = [0; 1500];

    runner
        .run(&stack, (), rand::thread_rng(), &mut rx_buf, &mut tx_buf)
        .await?;

    Ok(())
}
