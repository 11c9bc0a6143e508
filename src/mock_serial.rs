//! We use this mocking module in unit tests to emulate an instrument link.
//!
//! A [`MockSerial`] is a cheap handle onto shared state, so a test can keep one clone to script
//! replies and inspect written commands while the session under test owns another.

use std::{cell::RefCell, rc::Rc};

use thiserror::Error;

use crate::transport::Connector;

const CAPACITY: usize = 4096;

#[derive(Default)]
struct MockState {
    /// Everything written to the link, across all connections.
    write_buffer: heapless::Vec<u8, CAPACITY>,
    /// Scripted reply bytes, consumed front to back.
    read_buffer: heapless::Vec<u8, CAPACITY>,
    read_position: usize,
    connects: u32,
    should_error_on_write: bool,
    should_error_on_read: bool,
    should_error_on_connect: bool,
}

/// Our mock type used to emulate an instrument behind a serial port or socket.
#[derive(Clone, Default)]
pub struct MockSerial {
    state: Rc<RefCell<MockState>>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockSerialError {
    #[error("simulated timeout")]
    Timeout,
    #[error("simulated buffer overflow")]
    BufferOverflow,
    #[error("simulated invalid data")]
    InvalidData,
    #[error("simulated error")]
    SimulatedError,
    /// No scripted data left to read.
    #[error("would block")]
    WouldBlock,
}

impl embedded_io::Error for MockSerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockSerialError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockSerialError::BufferOverflow => embedded_io::ErrorKind::OutOfMemory,
            MockSerialError::InvalidData => embedded_io::ErrorKind::InvalidData,
            MockSerialError::SimulatedError => embedded_io::ErrorKind::Other,
            MockSerialError::WouldBlock => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockSerial {
    type Error = MockSerialError;
}

impl embedded_io::Write for MockSerial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.state.borrow_mut();
        if state.should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        state
            .write_buffer
            .extend_from_slice(buf)
            .map_err(|_| MockSerialError::BufferOverflow)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.state.borrow().should_error_on_write {
            return Err(MockSerialError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockSerial {
    /// Hands out at most one line per call, like an instrument that answers one query at a time.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.should_error_on_read {
            return Err(MockSerialError::SimulatedError);
        }
        let remaining = &state.read_buffer[state.read_position..];
        if remaining.is_empty() {
            return Err(MockSerialError::WouldBlock);
        }
        let line_len = remaining
            .iter()
            .position(|&byte| byte == b'\n')
            .map_or(remaining.len(), |pos| pos + 1);
        let bytes_to_read = line_len.min(buf.len());
        buf[..bytes_to_read].copy_from_slice(&remaining[..bytes_to_read]);
        state.read_position += bytes_to_read;
        Ok(bytes_to_read)
    }
}

impl Connector for MockSerial {
    type Stream = MockSerial;

    fn connect(&mut self) -> Result<Self::Stream, MockSerialError> {
        let mut state = self.state.borrow_mut();
        if state.should_error_on_connect {
            return Err(MockSerialError::Timeout);
        }
        state.connects += 1;
        Ok(self.clone())
    }
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `reply` to the data that read() will return.
    pub fn queue_reply(&self, reply: &str) {
        let mut state = self.state.borrow_mut();
        if state.read_position == state.read_buffer.len() {
            state.read_buffer.clear();
            state.read_position = 0;
        }
        state
            .read_buffer
            .extend_from_slice(reply.as_bytes())
            .expect("mock read buffer is full");
    }

    /// Queue several replies in order.
    pub fn queue_replies<'a>(&self, replies: impl IntoIterator<Item = &'a str>) {
        for reply in replies {
            self.queue_reply(reply);
        }
    }

    /// Everything written so far.
    pub fn written_data(&self) -> Vec<u8> {
        self.state.borrow().write_buffer.to_vec()
    }

    /// Everything written so far, split into commands on `\n` with `\r` stripped.
    pub fn written_commands(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.written_data())
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect()
    }

    pub fn clear_written_data(&self) {
        self.state.borrow_mut().write_buffer.clear();
    }

    /// Number of scripted reply bytes not yet read.
    pub fn unread(&self) -> usize {
        let state = self.state.borrow();
        state.read_buffer.len() - state.read_position
    }

    /// How many times a connector opened this link.
    pub fn connects(&self) -> u32 {
        self.state.borrow().connects
    }

    pub fn set_write_error(&self, should_error: bool) {
        self.state.borrow_mut().should_error_on_write = should_error;
    }

    pub fn set_read_error(&self, should_error: bool) {
        self.state.borrow_mut().should_error_on_read = should_error;
    }

    pub fn set_connect_error(&self, should_error: bool) {
        self.state.borrow_mut().should_error_on_connect = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    #[test]
    fn test_new_mock_serial() {
        let mock = MockSerial::new();
        assert!(mock.written_data().is_empty());
        assert_eq!(mock.unread(), 0);
        assert_eq!(mock.connects(), 0);
    }

    #[test]
    fn test_write_data() {
        let mut mock = MockSerial::new();
        mock.write(b"READ:DEV:GRPZ:PSU:SIG:FLD\n").unwrap();
        mock.write(b"*IDN?\r\n").unwrap();
        assert_eq!(
            mock.written_commands(),
            ["READ:DEV:GRPZ:PSU:SIG:FLD", "*IDN?"]
        );
    }

    #[test]
    fn test_clones_share_state() {
        let observer = MockSerial::new();
        let mut link = observer.clone();
        link.write(b"abc").unwrap();
        assert_eq!(observer.written_data(), b"abc");
    }

    #[test]
    fn test_write_buffer_overflow() {
        let mut mock = MockSerial::new();
        let result = mock.write(&vec![0u8; CAPACITY + 1]);
        assert_eq!(result, Err(MockSerialError::BufferOverflow));
    }

    #[test]
    fn test_reads_stop_at_line_end() {
        let mut mock = MockSerial::new();
        mock.queue_replies(["first\n", "second\n"]);

        let mut buffer = [0u8; 32];
        assert_eq!(mock.read(&mut buffer).unwrap(), 6);
        assert_eq!(&buffer[..6], b"first\n");
        assert_eq!(mock.read(&mut buffer).unwrap(), 7);
        assert_eq!(&buffer[..7], b"second\n");
        assert_eq!(mock.read(&mut buffer), Err(MockSerialError::WouldBlock));
    }

    #[test]
    fn test_read_partial_data() {
        let mut mock = MockSerial::new();
        mock.queue_reply("Long response data\n");

        let mut buffer = [0u8; 5];
        assert_eq!(mock.read(&mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b"Long ");
        assert_eq!(mock.unread(), 14);
    }

    #[test]
    fn test_error_simulation() {
        let mut mock = MockSerial::new();
        mock.queue_reply("data\n");
        mock.set_write_error(true);
        mock.set_read_error(true);

        assert_eq!(mock.write(b"x"), Err(MockSerialError::SimulatedError));
        assert_eq!(mock.flush(), Err(MockSerialError::SimulatedError));
        assert_eq!(mock.read(&mut [0u8; 8]), Err(MockSerialError::SimulatedError));
        assert!(mock.written_data().is_empty());

        mock.set_read_error(false);
        assert!(mock.read(&mut [0u8; 8]).is_ok());
    }

    #[test]
    fn test_connect_counts_and_fails() {
        let mut mock = MockSerial::new();
        mock.connect().unwrap();
        mock.connect().unwrap();
        assert_eq!(mock.connects(), 2);

        mock.set_connect_error(true);
        assert!(mock.connect().is_err());
        assert_eq!(mock.connects(), 2);
    }

    #[test]
    fn test_error_kinds() {
        assert!(matches!(MockSerialError::Timeout.kind(), embedded_io::ErrorKind::TimedOut));
        assert!(matches!(MockSerialError::BufferOverflow.kind(), embedded_io::ErrorKind::OutOfMemory));
        assert!(matches!(MockSerialError::InvalidData.kind(), embedded_io::ErrorKind::InvalidData));
        assert!(matches!(MockSerialError::SimulatedError.kind(), embedded_io::ErrorKind::Other));
    }
}
