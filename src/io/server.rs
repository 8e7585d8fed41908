//! The asynchronous runner around the server state machine: one task serves
//! the socket, one evicts expired table entries, one writes the client
//! database whenever the table changed.
//!
//! The shared state sits behind a blocking mutex with short critical
//! sections; no IO happens while it is held.

use core::cell::RefCell;
use core::net::SocketAddr;
use core::pin::pin;

use embassy_futures::select::{select3, Either3};
use embassy_sync::blocking_mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use edge_nal::io::{Error as _, ErrorKind};
use edge_nal::{UdpBind, UdpReceive, UdpSend};

use log::{debug, info, warn};

use rand_core::RngCore;

use crate::lease::ClientRecord;
use crate::server::{reply_destination, Server};
use crate::store::ClientStore;
use crate::Packet;

use super::ServerIoError;

/// Attempts before a snapshot write is abandoned until the next change.
const STORE_ATTEMPTS: usize = 10;

const EVICTION_PERIOD: Duration = Duration::from_secs(1);

/// Owns the server state machine and drives it against a UDP stack.
///
/// The state is reachable from outside the running future through
/// [`Runner::with`], e.g. to inspect the current leases.
pub struct Runner<M>
where
    M: RawMutex,
{
    state: blocking_mutex::Mutex<M, RefCell<Server>>,
    changed: Signal<M, ()>,
}

impl<M> Runner<M>
where
    M: RawMutex,
{
    pub fn new(server: Server) -> Self {
        Self {
            state: blocking_mutex::Mutex::new(RefCell::new(server)),
            changed: Signal::new(),
        }
    }

    /// Synchronous access to the server state. The closure runs under the
    /// state lock, so it must not block.
    pub fn with<R>(&self, f: impl FnOnce(&mut Server) -> R) -> R {
        self.state.lock(|server| f(&mut server.borrow_mut()))
    }

    /// Binds the configured endpoint, restores the client database from the
    /// store and serves requests until the socket fails.
    ///
    /// Pending database changes are flushed once more before the failure is
    /// surfaced.
    pub async fn run<S, P, R>(
        &self,
        stack: &S,
        mut store: P,
        rng: R,
        rx_buf: &mut [u8],
        tx_buf: &mut [u8],
    ) -> Result<(), ServerIoError<S::Error>>
    where
        S: UdpBind,
        P: ClientStore,
        R: RngCore,
    {
        let local = self.with(|server| server.configuration().socket);

        let mut socket = stack
            .bind(SocketAddr::V4(local))
            .await
            .map_err(ServerIoError::Io)?;

        match store.load().await {
            Ok(records) => {
                let total = records.len();
                let kept = self.with(|server| server.restore(records));

                if total > 0 {
                    info!("Restored {kept} of {total} stored client records");
                }
            }
            Err(err) => warn!("Client database could not be read: {err:?}"),
        }

        info!("DHCP server listening on {local}");

        let result = {
            let mut serve = pin!(self.serve(&mut socket, rx_buf, tx_buf));
            let mut evict = pin!(self.evict());
            let mut persist = pin!(self.persist(&mut store, rng));

            match select3(&mut serve, &mut evict, &mut persist).await {
                Either3::First(result) => result,
                Either3::Second(result) => result,
                Either3::Third(result) => result,
            }
        };

        // A snapshot still waiting for the writer would be lost otherwise
        if self.changed.try_take().is_some() {
            let snapshot = self.with(|server| server.snapshot());

            if let Err(err) = store.store(&snapshot).await {
                debug!("Final client database write failed: {err:?}");
            }
        }

        if let Err(err) = &result {
            warn!("DHCP server stopped: {err:?}");
        }

        result
    }

    async fn serve<T>(
        &self,
        socket: &mut T,
        rx_buf: &mut [u8],
        tx_buf: &mut [u8],
    ) -> Result<(), ServerIoError<T::Error>>
    where
        T: UdpReceive + UdpSend,
    {
        loop {
            let (len, remote) = match socket.receive(rx_buf).await {
                Ok(received) => received,
                Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                    warn!("Transient receive failure: {err:?}");
                    continue;
                }
                Err(err) => Err(ServerIoError::Io(err))?,
            };

            if len > rx_buf.len() {
                warn!("Datagram of {len} bytes from {remote} exceeds the receive buffer, dropping");
                continue;
            }

            let request = match Packet::decode(&rx_buf[..len]) {
                Ok(request) => request,
                Err(err) => {
                    warn!("Malformed datagram from {remote}: {err}");
                    continue;
                }
            };

            let now = Instant::now();

            let (reply, min_size, changed) = self.with(|server| {
                let reply = server.handle(&request, now);

                (
                    reply,
                    server.configuration().min_packet_size(),
                    server.take_changed(),
                )
            });

            if changed {
                self.changed.signal(());
            }

            let Some(reply) = reply else {
                continue;
            };

            let destination = reply_destination(&request, &reply);

            let data = match reply.encode(tx_buf, min_size) {
                Ok(data) => data,
                Err(err) => {
                    warn!("Reply for {destination} does not fit the send buffer: {err}");
                    continue;
                }
            };

            match socket.send(SocketAddr::V4(destination), data).await {
                Ok(()) => debug!("Sent {} bytes to {destination}", data.len()),
                Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                    warn!("Transient send failure: {err:?}");
                }
                Err(err) => Err(ServerIoError::Io(err))?,
            }
        }
    }

    async fn evict<E>(&self) -> Result<(), ServerIoError<E>> {
        loop {
            Timer::after(EVICTION_PERIOD).await;

            let evicted = self.with(|server| server.tick(Instant::now()));

            if evicted {
                self.changed.signal(());
            }
        }
    }

    async fn persist<P, R, E>(
        &self,
        store: &mut P,
        mut rng: R,
    ) -> Result<(), ServerIoError<E>>
    where
        P: ClientStore,
        R: RngCore,
    {
        loop {
            self.changed.wait().await;

            // Any number of mutations since the last write collapse into this
            // one snapshot
            let snapshot = self.with(|server| server.snapshot());

            self.write(store, &mut rng, &snapshot).await;
        }
    }

    async fn write<P, R>(&self, store: &mut P, rng: &mut R, snapshot: &[ClientRecord])
    where
        P: ClientStore,
        R: RngCore,
    {
        for attempt in 1..=STORE_ATTEMPTS {
            match store.store(snapshot).await {
                Ok(()) => {
                    debug!("Client database written ({} records)", snapshot.len());
                    return;
                }
                Err(err) if attempt < STORE_ATTEMPTS => {
                    debug!("Client database write failed: {err:?}, retrying");

                    Timer::after(Duration::from_millis(500 + (rng.next_u32() % 500) as u64))
                        .await;
                }
                Err(err) => {
                    debug!("Client database write abandoned after {attempt} attempts: {err:?}");
                }
            }
        }
    }
}
