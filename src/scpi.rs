//! Exchanges in the space delimited SCPI style grammar used by the Keithley and SRS instruments.
//!
//! Commands are `HEADER value`, queries `HEADER?` and replies bare ASCII numbers or comma
//! separated arrays. Unlike the Oxford family nothing is acknowledged, so a set is a plain write.

use crate::{
    command::{Param, Value},
    error::{Error, Result},
    response::{parse_ascii_values, parse_scalar},
    transport::Transport,
};

/// Send a command that produces no reply.
pub fn write<T: Transport>(transport: &mut T, command: &str) -> Result<(), T::Error> {
    transport.write(command)
}

/// Validate `value` against `param` and send `HEADER value`.
pub fn set<'a, T: Transport>(
    transport: &mut T,
    param: &Param,
    value: impl Into<Value<'a>>,
) -> Result<(), T::Error> {
    let command = param.scpi_command(value)?;
    transport.write(&command)
}

/// Query `HEADER?` for a number.
pub fn get<T: Transport>(transport: &mut T, param: &Param) -> Result<f64, T::Error> {
    query_scalar(transport, &param.scpi_query())
}

pub fn query_scalar<T: Transport>(transport: &mut T, query: &str) -> Result<f64, T::Error> {
    let reply = transport.query(query)?;
    Ok(parse_scalar(&reply)?)
}

/// Query for a whole number such as an index or a register value (`+0`, `3`).
pub fn query_integer<T: Transport>(transport: &mut T, query: &str) -> Result<i64, T::Error> {
    let reply = transport.query(query)?;
    let trimmed = reply.trim();
    trimmed
        .parse::<i64>()
        .or_else(|_| match trimmed.parse::<f64>() {
            Ok(real) if real.fract() == 0.0 => Ok(real as i64),
            _ => Err(Error::InvalidResponse(reply.clone())),
        })
}

pub fn query_values<T: Transport>(transport: &mut T, query: &str) -> Result<Vec<f64>, T::Error> {
    let reply = transport.query(query)?;
    Ok(parse_ascii_values(&reply)?)
}

/// Query for text, e.g. `*IDN?`. Surrounding whitespace is removed.
pub fn query_text<T: Transport>(transport: &mut T, query: &str) -> Result<String, T::Error> {
    Ok(transport.query(query)?.trim().to_string())
}
