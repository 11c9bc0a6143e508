//! This crate provides drivers for controlling laboratory instruments over text command protocols.
//!
//! Every driver is built from the same pieces:
//! * [`command`] validates values against their limits and formats the command text.
//! * [`response`] parses replies, checking the echoed prefix and stripping unit suffixes.
//! * [`transport`] exchanges lines with the device over any `embedded_io` stream, and
//!   [`dispatch`] picks how that stream is opened from a configured mode string.
//! * [`settle`] waits for slow hardware, polling a status or watching a reading drift in.
//!
//! Instruments with a driver in [`instruments`]:
//! * Oxford Instruments Mercury iPS magnet power supply
//! * Oxford Instruments Mercury iTC temperature controller
//! * Oxford Instruments Triton dilution refrigerator
//! * Keithley 6221 current source (with a 2182A nanovoltmeter)
//! * Keithley 2400 source-measure unit
//! * Stanford Research SR830 lock-in amplifier
//! * A motorised rotation stage
//!
//! The Oxford instruments listen on TCP port 7020 (Triton on 33576) and use `\n` terminated
//! lines. Serial resources need the `serial` feature:
//! * Default baud rate: 9600
//! * Data bits: 8
//! * Stop bits: 1
//! * Parity: None

pub mod command;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod instruments;
pub mod oxford;
pub mod response;
pub mod scaling;
pub mod scpi;
pub mod settle;
pub mod std_io;
pub mod transport;

#[cfg(test)]
mod mock_clock;
#[cfg(test)]
mod mock_serial;
