//! Parsing of instrument replies.
//!
//! Oxford instruments answer `READ:<noun>` with `STAT:<noun>:<value><unit>\n`. The echoed prefix
//! is always checked: a reply for some other noun is a [`ResponseError::Mismatch`], never a
//! number. The unit suffix is stripped when present and tolerated when absent, as some firmware
//! revisions omit it.
//!
//! SCPI instruments answer with bare numbers or comma separated arrays, handled by
//! [`parse_scalar`] and [`parse_ascii_values`].

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("expected a reply starting with {expected:?}, got {response:?}")]
    Mismatch { expected: String, response: String },
    #[error("malformed reply {0:?}")]
    Malformed(String),
}

/// Strip `prefix` and the line terminator from `response`.
pub fn strip_envelope<'r>(response: &'r str, prefix: &str) -> Result<&'r str, ResponseError> {
    response
        .strip_prefix(prefix)
        .map(|rest| rest.trim_end_matches(['\r', '\n']))
        .ok_or_else(|| ResponseError::Mismatch {
            expected: prefix.into(),
            response: response.into(),
        })
}

/// The textual payload of `STAT:<noun>:<payload>\n`, e.g. `HOLD` or `ON`.
pub fn extract_token<'r>(response: &'r str, noun: &str) -> Result<&'r str, ResponseError> {
    let prefix = format!("STAT:{noun}:");
    strip_envelope(response, &prefix).map(str::trim)
}

/// The numeric payload of `STAT:<noun>:<value><unit>\n`.
pub fn extract_value(response: &str, noun: &str, unit: &str) -> Result<f64, ResponseError> {
    let payload = extract_token(response, noun)?;
    let number = payload.strip_suffix(unit).unwrap_or(payload);
    number
        .trim()
        .parse()
        .map_err(|_| ResponseError::Malformed(response.into()))
}

/// A single bare ASCII number, as returned by most SCPI queries.
pub fn parse_scalar(response: &str) -> Result<f64, ResponseError> {
    response
        .trim()
        .parse()
        .map_err(|_| ResponseError::Malformed(response.into()))
}

/// A comma separated array such as `1.0,\t0.1,\t2.0,\t0.2\n`. Empty fields are skipped.
pub fn parse_ascii_values(response: &str) -> Result<Vec<f64>, ResponseError> {
    response
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(|field| {
            field
                .parse()
                .map_err(|_| ResponseError::Malformed(response.into()))
        })
        .collect()
}

/// Split an interleaved array into `S` streams: element `i` goes to stream `i % S`.
pub fn deinterleave<const S: usize>(values: &[f64]) -> [Vec<f64>; S] {
    let mut streams: [Vec<f64>; S] =
        core::array::from_fn(|_| Vec::with_capacity(values.len().div_ceil(S.max(1))));
    for (i, value) in values.iter().enumerate() {
        streams[i % S].push(*value);
    }
    streams
}

/// Readings paired with their timestamps, read from a buffer laid out
/// `measurement, time, measurement, time, ...`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepData {
    pub measurement: Vec<f64>,
    pub time: Vec<f64>,
}

impl SweepData {
    pub fn parse(response: &str) -> Result<Self, ResponseError> {
        let [measurement, time] = deinterleave::<2>(&parse_ascii_values(response)?);
        Ok(Self { measurement, time })
    }

    pub fn len(&self) -> usize {
        self.measurement.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurement.is_empty()
    }
}
