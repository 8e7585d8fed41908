//! The boundary behind which the client database lives on disk.
//!
//! The encoding is the store's business; the server only ever hands over a
//! snapshot of its records and takes a list back on startup. Restored records
//! still pass the filters in [`Server::restore`](crate::server::Server::restore).

use alloc::vec::Vec;

use core::convert::Infallible;
use core::fmt::Debug;

use crate::lease::ClientRecord;

pub trait ClientStore {
    type Error: Debug;

    /// Reads back whatever records the store holds.
    async fn load(&mut self) -> Result<Vec<ClientRecord>, Self::Error>;

    /// Replaces the stored records with the given snapshot.
    async fn store(&mut self, records: &[ClientRecord]) -> Result<(), Self::Error>;
}

/// The store for servers that do not persist anything.
impl ClientStore for () {
    type Error = Infallible;

    async fn load(&mut self) -> Result<Vec<ClientRecord>, Self::Error> {
        Ok(Vec::new())
    }

    async fn store(&mut self, _records: &[ClientRecord]) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<T> ClientStore for &mut T
where
    T: ClientStore,
{
    type Error = T::Error;

    async fn load(&mut self) -> Result<Vec<ClientRecord>, Self::Error> {
        (**self).load().await
    }

    async fn store(&mut self, records: &[ClientRecord]) -> Result<(), Self::Error> {
        (**self).store(records).await
    }
}
