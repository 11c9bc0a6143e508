//! Mapping from a configured transport mode to the way a device is reached.
//!
//! A [`DispatchTable`] is a fixed list of `(mode, opener)` pairs. Resolving a mode string happens
//! once, when a facade is built, so an unsupported mode fails before anything is queried.

use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    transport::Transport,
};

/// Logical transport modes an instrument can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum TransportMode {
    /// Ethernet socket.
    Ip,
    /// Resource addressed by name (serial line).
    Visa,
}

impl TransportMode {
    /// Parse a user supplied mode, ignoring case and surrounding whitespace.
    pub fn parse<E: embedded_io::Error>(mode: &str) -> Result<Self, E> {
        mode.trim()
            .parse()
            .map_err(|_| Error::UnsupportedMode(mode.into()))
    }
}

pub type BoxedTransport<E> = Box<dyn Transport<Error = E>>;

/// Builds a transport for an endpoint. No I/O happens until the first exchange.
pub type Opener<E> = fn(&Endpoint) -> BoxedTransport<E>;

pub struct DispatchTable<E: 'static> {
    entries: &'static [(TransportMode, Opener<E>)],
}

impl<E: embedded_io::Error + 'static> DispatchTable<E> {
    pub const fn new(entries: &'static [(TransportMode, Opener<E>)]) -> Self {
        Self { entries }
    }

    /// Modes this table can open.
    pub fn modes(&self) -> impl Iterator<Item = TransportMode> + '_ {
        self.entries.iter().map(|(mode, _)| *mode)
    }

    pub fn resolve(&self, mode: &str) -> Result<Opener<E>, E> {
        let parsed = TransportMode::parse(mode)?;
        self.entries
            .iter()
            .find(|(candidate, _)| *candidate == parsed)
            .map(|(_, opener)| *opener)
            .ok_or_else(|| Error::UnsupportedMode(mode.into()))
    }

    /// Resolve `mode` and build a transport to `endpoint`.
    pub fn open(&self, mode: &str, endpoint: &Endpoint) -> Result<BoxedTransport<E>, E> {
        let opener = self.resolve(mode)?;
        log::debug!("using {} transport", mode.trim());
        Ok(opener(endpoint))
    }
}

/// Dispatch tables over `std` sockets and serial ports.
pub mod std_tables {
    use super::*;
    use crate::{
        endpoint::SessionPolicy,
        std_io::{IoError, TcpConnector},
        transport::Session,
    };

    fn tcp_per_call(endpoint: &Endpoint) -> BoxedTransport<IoError> {
        let connector = TcpConnector::from_endpoint(endpoint);
        Box::new(Session::<_>::for_endpoint(connector, SessionPolicy::PerCall, endpoint))
    }

    fn tcp_persistent(endpoint: &Endpoint) -> BoxedTransport<IoError> {
        let connector = TcpConnector::from_endpoint(endpoint);
        Box::new(Session::<_>::for_endpoint(connector, SessionPolicy::Persistent, endpoint))
    }

    #[cfg(feature = "serial")]
    fn serial_per_call(endpoint: &Endpoint) -> BoxedTransport<IoError> {
        let connector = crate::std_io::SerialConnector::from_endpoint(endpoint);
        Box::new(Session::<_>::for_endpoint(connector, SessionPolicy::PerCall, endpoint))
    }

    /// Mercury iPS / iTC: one socket per exchange over `ip`, the resource reopened per exchange over `visa`.
    #[cfg(feature = "serial")]
    pub const MERCURY: DispatchTable<IoError> = DispatchTable::new(&[
        (TransportMode::Ip, tcp_per_call),
        (TransportMode::Visa, serial_per_call),
    ]);

    /// Mercury iPS / iTC: one socket per exchange. `visa` needs the `serial` feature.
    #[cfg(not(feature = "serial"))]
    pub const MERCURY: DispatchTable<IoError> =
        DispatchTable::new(&[(TransportMode::Ip, tcp_per_call)]);

    /// Triton keeps one socket for its lifetime.
    pub const TRITON: DispatchTable<IoError> =
        DispatchTable::new(&[(TransportMode::Ip, tcp_persistent)]);
}
