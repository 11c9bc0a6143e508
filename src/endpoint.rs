//! Where an instrument lives and how to talk to it.

use fugit::MillisDurationU64;
use thiserror::Error;

/// Port the Mercury family listens on.
pub const DEFAULT_PORT: u16 = 7020;
pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TIMEOUT: MillisDurationU64 = MillisDurationU64::secs(10);

/// Whether a session holds its stream open or opens it around every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// Opened on first use (or eagerly), kept until closed.
    #[default]
    Persistent,
    /// Opened and closed around every exchange.
    PerCall,
}

/// Use [`EndpointBuilder`] to create an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// IP address or host name, for socket transports.
    pub address: Option<String>,
    pub port: u16,
    /// Resource name, e.g. `/dev/ttyUSB0`, for serial transports.
    pub resource: Option<String>,
    pub baud_rate: u32,
    pub timeout: MillisDurationU64,
    /// Appended to every command.
    pub command_terminator: &'static str,
    /// Byte that ends every reply.
    pub reply_terminator: u8,
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::default()
    }
}

pub struct EndpointBuilder {
    address: Option<String>,
    port: u16,
    resource: Option<String>,
    baud_rate: u32,
    timeout: MillisDurationU64,
    command_terminator: &'static str,
    reply_terminator: u8,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        EndpointBuilder {
            address: None,
            port: DEFAULT_PORT,
            resource: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            command_terminator: "\n",
            reply_terminator: b'\n',
        }
    }
}

impl EndpointBuilder {
    pub fn new() -> EndpointBuilder {
        Self::default()
    }

    pub fn build(self) -> Result<Endpoint, EndpointBuilderError> {
        if self.address.is_none() && self.resource.is_none() {
            return Err(EndpointBuilderError::NoAddress);
        }
        if self.timeout.to_millis() == 0 {
            return Err(EndpointBuilderError::ZeroTimeout);
        }
        Ok(Endpoint {
            address: self.address,
            port: self.port,
            resource: self.resource,
            baud_rate: self.baud_rate,
            timeout: self.timeout,
            command_terminator: self.command_terminator,
            reply_terminator: self.reply_terminator,
        })
    }

    /// Set the IP address or host name.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the serial resource name.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set how long to wait for a reply.
    pub fn with_timeout(mut self, timeout: MillisDurationU64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set what is appended to each command. Triton expects `\r\n`.
    pub fn with_command_terminator(mut self, terminator: &'static str) -> Self {
        self.command_terminator = terminator;
        self
    }

    pub fn with_reply_terminator(mut self, terminator: u8) -> Self {
        self.reply_terminator = terminator;
        self
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointBuilderError {
    #[error("neither an address nor a resource name was given")]
    NoAddress,
    #[error("timeout must be non-zero")]
    ZeroTimeout,
}
