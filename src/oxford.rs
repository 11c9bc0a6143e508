//! Exchanges in the Oxford Instruments ASCII grammar shared by the Mercury iPS, Mercury iTC and
//! Triton.
//!
//! `READ:<noun>` is answered with `STAT:<noun>:<value><unit>`, `SET:<noun>[:<value>]` with
//! `STAT:SET:<noun>[:<value>]:<status>` where the status is `VALID` on success.

use crate::{
    command::{Limits, Param, Value, Verb, format_command},
    error::{Error, Result},
    response::{ResponseError, extract_token, extract_value, strip_envelope},
    transport::Transport,
};

/// Acknowledgement statuses that mean the instrument refused a `SET`.
const REFUSED: [&str; 2] = ["INVALID", "NOT_FOUND"];

/// Read a numeric quantity.
pub fn read_value<T: Transport>(transport: &mut T, noun: &str, unit: &str) -> Result<f64, T::Error> {
    let command = format_command(noun, Verb::Read, None, &Limits::tokens(&[]))?;
    let reply = transport.query(&command)?;
    Ok(extract_value(&reply, noun, unit)?)
}

/// Read a textual status, e.g. `HOLD` or `ON`.
pub fn read_token<T: Transport>(transport: &mut T, noun: &str) -> Result<String, T::Error> {
    let command = format_command(noun, Verb::Read, None, &Limits::tokens(&[]))?;
    let reply = transport.query(&command)?;
    Ok(extract_token(&reply, noun)?.to_string())
}

/// Validate and send `SET:<noun>:<value>`, returning the acknowledgement payload.
pub fn set_value<T: Transport>(
    transport: &mut T,
    noun: &str,
    limits: &Limits,
    value: Value<'_>,
) -> Result<String, T::Error> {
    let command = format_command(noun, Verb::Set, Some(value), limits)?;
    let reply = transport.query(&command)?;
    check_ack(&reply, noun)
}

/// Send a valueless `SET:<noun>`, returning the acknowledgement payload (`VALID`, `NOT_RDY`, ...).
pub fn action<T: Transport>(transport: &mut T, noun: &str) -> Result<String, T::Error> {
    let command = format_command(noun, Verb::Set, None, &Limits::tokens(&[]))?;
    let reply = transport.query(&command)?;
    check_ack(&reply, noun)
}

/// [`read_value`] for a fixed parameter.
pub fn read<T: Transport>(transport: &mut T, param: &Param) -> Result<f64, T::Error> {
    read_value(transport, param.noun, param.unit)
}

/// [`set_value`] for a fixed parameter.
pub fn set<'a, T: Transport>(
    transport: &mut T,
    param: &Param,
    value: impl Into<Value<'a>>,
) -> Result<String, T::Error> {
    set_value(transport, param.noun, &param.limits, value.into())
}

fn check_ack<E: embedded_io::Error>(reply: &str, noun: &str) -> Result<String, E> {
    if reply.trim().is_empty() {
        return Err(Error::InvalidResponse(reply.into()));
    }
    let prefix = format!("STAT:SET:{noun}");
    let rest = strip_envelope(reply, &prefix)?;
    let payload = match rest.strip_prefix(':') {
        Some(payload) => payload.trim(),
        None if rest.trim().is_empty() => "",
        None => {
            return Err(ResponseError::Mismatch {
                expected: format!("{prefix}:"),
                response: reply.into(),
            }
            .into());
        }
    };
    let status = payload.rsplit(':').next().unwrap_or(payload);
    if REFUSED.contains(&status) {
        return Err(Error::DeviceFault(format!("{noun} refused: {reply}")));
    }
    Ok(payload.to_string())
}
