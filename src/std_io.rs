//! Adapters from `std::io` streams to [embedded_io], plus connectors for TCP sockets and, with the
//! `serial` feature, serial ports.

use std::net::{TcpStream, ToSocketAddrs};

use thiserror::Error;

use crate::{endpoint::Endpoint, transport::Connector};

/// A `std::io::Error` usable as an [embedded_io::Error].
#[derive(Error, Debug)]
#[error(transparent)]
pub struct IoError(#[from] pub std::io::Error);

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self.0.kind() {
            std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
            std::io::ErrorKind::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
            std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
            std::io::ErrorKind::AddrInUse => embedded_io::ErrorKind::AddrInUse,
            std::io::ErrorKind::AddrNotAvailable => embedded_io::ErrorKind::AddrNotAvailable,
            std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
            std::io::ErrorKind::AlreadyExists => embedded_io::ErrorKind::AlreadyExists,
            std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
            std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                embedded_io::ErrorKind::TimedOut
            }
            std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
            std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
            std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

/// Wraps any `std::io::Read + std::io::Write` stream.
pub struct StdStream<T>(pub T);

impl<T> embedded_io::ErrorType for StdStream<T> {
    type Error = IoError;
}

impl<T: std::io::Read> embedded_io::Read for StdStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf).map_err(IoError)
    }
}

impl<T: std::io::Write> embedded_io::Write for StdStream<T> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf).map_err(IoError)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush().map_err(IoError)
    }
}

/// Opens TCP connections to `address:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    port: u16,
    timeout: std::time::Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, port: u16, timeout: fugit::MillisDurationU64) -> Self {
        Self {
            address: address.into(),
            port,
            timeout: std::time::Duration::from_millis(timeout.to_millis()),
        }
    }

    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        Self::new(
            endpoint.address.clone().unwrap_or_default(),
            endpoint.port,
            endpoint.timeout,
        )
    }
}

impl Connector for TcpConnector {
    type Stream = StdStream<TcpStream>;

    fn connect(&mut self) -> Result<Self::Stream, IoError> {
        let address = (self.address.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("{} did not resolve", self.address),
                )
            })?;
        log::debug!("connecting to {address}");
        let stream = TcpStream::connect_timeout(&address, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(StdStream(stream))
    }
}

/// Opens a serial port.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    resource: String,
    baud_rate: u32,
    timeout: std::time::Duration,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    pub fn new(resource: impl Into<String>, baud_rate: u32, timeout: fugit::MillisDurationU64) -> Self {
        Self {
            resource: resource.into(),
            baud_rate,
            timeout: std::time::Duration::from_millis(timeout.to_millis()),
        }
    }

    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        Self::new(
            endpoint.resource.clone().unwrap_or_default(),
            endpoint.baud_rate,
            endpoint.timeout,
        )
    }
}

#[cfg(feature = "serial")]
impl Connector for SerialConnector {
    type Stream = StdStream<Box<dyn serialport::SerialPort>>;

    fn connect(&mut self) -> Result<Self::Stream, IoError> {
        log::debug!("opening {} at {} baud", self.resource, self.baud_rate);
        let port = serialport::new(&self.resource, self.baud_rate)
            .timeout(self.timeout)
            .open()
            .map_err(std::io::Error::from)?;
        Ok(StdStream(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error as _, ErrorKind, Read, Write};
    use std::io::Cursor;

    #[test]
    fn error_kinds_map() {
        let kinds = [
            (std::io::ErrorKind::TimedOut, ErrorKind::TimedOut),
            (std::io::ErrorKind::WouldBlock, ErrorKind::TimedOut),
            (std::io::ErrorKind::ConnectionRefused, ErrorKind::ConnectionRefused),
            (std::io::ErrorKind::BrokenPipe, ErrorKind::BrokenPipe),
            (std::io::ErrorKind::UnexpectedEof, ErrorKind::Other),
        ];
        for (std_kind, kind) in kinds {
            assert_eq!(IoError(std_kind.into()).kind(), kind);
        }
    }

    #[test]
    fn std_stream_round_trip() {
        let mut stream = StdStream(Cursor::new(Vec::new()));
        stream.write_all(b"*IDN?\n").unwrap();
        stream.flush().unwrap();
        stream.0.set_position(0);
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"*IDN?\n");
    }

    #[test]
    fn unresolvable_address_fails_to_connect() {
        let mut connector =
            TcpConnector::new("", 7020, fugit::MillisDurationU64::millis(100));
        assert!(connector.connect().is_err());
    }
}
