use core::fmt;

pub use crate::{DEFAULT_CLIENT_PORT, DEFAULT_SERVER_PORT};

pub mod server;

pub use server::Runner;

/// A wrapper for codec and IO errors.
#[derive(Debug)]
pub enum ServerIoError<E> {
    Format(crate::Error),
    Io(E),
}

pub type ServerIoErrorKind = ServerIoError<edge_nal::io::ErrorKind>;

impl<E> ServerIoError<E>
where
    E: edge_nal::io::Error,
{
    pub fn erase(&self) -> ServerIoError<edge_nal::io::ErrorKind> {
        match self {
            Self::Format(err) => ServerIoError::Format(*err),
            Self::Io(err) => ServerIoError::Io(err.kind()),
        }
    }
}

impl<E> From<crate::Error> for ServerIoError<E> {
    fn from(err: crate::Error) -> Self {
        Self::Format(err)
    }
}

impl<E> fmt::Display for ServerIoError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(err) => write!(f, "Format error: {}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

#[cfg(feature = "std")]
impl<E> std::error::Error for ServerIoError<E> where E: std::error::Error {}
