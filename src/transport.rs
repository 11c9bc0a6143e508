//! Line oriented exchanges with an instrument.
//!
//! A [`Connector`] knows how to open a byte stream (anything implementing [embedded_io::Read] &
//! [embedded_io::Write]). A [`Session`] owns a connector and frames terminated ASCII commands and
//! replies on top of the streams it opens. Device facades only see the [`Transport`] trait.

use embedded_io::{Error as _, ErrorType, Read, Write};

use crate::{
    endpoint::{Endpoint, SessionPolicy},
    error::{Error, Result},
};

/// A channel to one instrument.
pub trait Transport {
    type Error: embedded_io::Error;

    /// Send a command that produces no reply.
    fn write(&mut self, command: &str) -> Result<(), Self::Error>;

    /// Send a command and return its reply, line terminator stripped.
    fn query(&mut self, command: &str) -> Result<String, Self::Error>;

    /// Release the underlying stream. The next exchange reopens it.
    fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    type Error = T::Error;

    fn write(&mut self, command: &str) -> Result<(), Self::Error> {
        (**self).write(command)
    }

    fn query(&mut self, command: &str) -> Result<String, Self::Error> {
        (**self).query(command)
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        (**self).close()
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn write(&mut self, command: &str) -> Result<(), Self::Error> {
        (**self).write(command)
    }

    fn query(&mut self, command: &str) -> Result<String, Self::Error> {
        (**self).query(command)
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        (**self).close()
    }
}

/// Opens streams to one physical address.
pub trait Connector {
    type Stream: embedded_io::Read + embedded_io::Write;

    fn connect(&mut self) -> core::result::Result<Self::Stream, <Self::Stream as ErrorType>::Error>;
}

type StreamError<C> = <<C as Connector>::Stream as ErrorType>::Error;

/// Frames ASCII exchanges over streams opened by `C`. Replies longer than `L` bytes are rejected.
pub struct Session<C: Connector, const L: usize = 2048> {
    connector: C,
    stream: Option<C::Stream>,
    policy: SessionPolicy,
    command_terminator: &'static str,
    reply_terminator: u8,
    /// Bytes received past the end of the last reply.
    rx: heapless::Vec<u8, L>,
}

impl<C: Connector, const L: usize> Session<C, L> {
    /// Create a session with `\n` terminators. Nothing is opened yet.
    pub fn new(connector: C, policy: SessionPolicy) -> Self {
        Self {
            connector,
            stream: None,
            policy,
            command_terminator: "\n",
            reply_terminator: b'\n',
            rx: heapless::Vec::new(),
        }
    }

    /// Create a session using the terminators configured on `endpoint`.
    pub fn for_endpoint(connector: C, policy: SessionPolicy, endpoint: &Endpoint) -> Self {
        Self::new(connector, policy)
            .with_terminators(endpoint.command_terminator, endpoint.reply_terminator)
    }

    pub fn with_terminators(mut self, command: &'static str, reply: u8) -> Self {
        self.command_terminator = command;
        self.reply_terminator = reply;
        self
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the stream now rather than on first use.
    pub fn open(&mut self) -> Result<(), StreamError<C>> {
        self.stream_mut().map(|_| ())
    }

    fn stream_mut(&mut self) -> Result<&mut C::Stream, StreamError<C>> {
        let stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                let stream = self.connector.connect().map_err(Error::Transport)?;
                log::debug!("connection opened");
                self.rx.clear();
                stream
            }
        };
        Ok(self.stream.insert(stream))
    }

    fn send(&mut self, command: &str) -> Result<(), StreamError<C>> {
        let terminator = self.command_terminator;
        let stream = self.stream_mut()?;
        log::debug!("tx {command:?}");
        stream.write_all(command.as_bytes()).map_err(Error::Transport)?;
        stream.write_all(terminator.as_bytes()).map_err(Error::Transport)?;
        stream.flush().map_err(Error::Transport)
    }

    fn receive(&mut self) -> Result<String, StreamError<C>> {
        let terminator = self.reply_terminator;
        let mut temp_buf = [0u8; 64];
        loop {
            if let Some(end) = self.rx.iter().position(|&byte| byte == terminator) {
                return self.take_line(end + 1);
            }
            let stream = self.stream_mut()?;
            match stream.read(&mut temp_buf) {
                // End of stream: whatever has arrived is the reply.
                Ok(0) => return self.take_line(self.rx.len()),
                Ok(bytes_read) => {
                    if self.rx.extend_from_slice(&temp_buf[..bytes_read]).is_err() {
                        return Err(Error::BufferOverflow);
                    }
                }
                Err(e) => {
                    // A quiet link after a partial reply means the device has finished talking.
                    if matches!(
                        e.kind(),
                        embedded_io::ErrorKind::Other | embedded_io::ErrorKind::TimedOut
                    ) && !self.rx.is_empty()
                    {
                        return self.take_line(self.rx.len());
                    }
                    return Err(Error::Transport(e));
                }
            }
        }
    }

    fn take_line(&mut self, len: usize) -> Result<String, StreamError<C>> {
        let line = String::from_utf8_lossy(&self.rx[..len])
            .trim_end_matches(['\r', '\n'])
            .to_string();
        let total = self.rx.len();
        self.rx.rotate_left(len);
        self.rx.truncate(total - len);
        log::debug!("rx {line:?}");
        if line.is_empty() {
            return Err(Error::InvalidResponse(line));
        }
        Ok(line)
    }

    /// Run `exchange`, closing the stream afterwards when the policy says so.
    fn exchange<T>(
        &mut self,
        exchange: impl FnOnce(&mut Self) -> Result<T, StreamError<C>>,
    ) -> Result<T, StreamError<C>> {
        let result = exchange(self);
        if self.policy == SessionPolicy::PerCall {
            self.drop_stream();
        }
        result
    }

    fn drop_stream(&mut self) {
        if self.stream.take().is_some() {
            log::debug!("connection closed");
        }
        self.rx.clear();
    }
}

impl<C: Connector, const L: usize> Transport for Session<C, L> {
    type Error = StreamError<C>;

    fn write(&mut self, command: &str) -> Result<(), Self::Error> {
        self.exchange(|session| session.send(command))
    }

    fn query(&mut self, command: &str) -> Result<String, Self::Error> {
        self.exchange(|session| {
            session.send(command)?;
            session.receive()
        })
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        self.drop_stream();
        Ok(())
    }
}
