//! Validation and formatting of outgoing commands.
//!
//! Every settable quantity is described by a [`Param`]: the noun (or SCPI header) that addresses it,
//! the unit the instrument reports it in, and the [`Limits`] it must respect. A value is checked
//! against those limits before any command string exists, so an out-of-range request can never
//! reach the wire.

use core::fmt;

use strum_macros::{Display, EnumString};
use thiserror::Error;

/// The two operations of the Oxford Instruments ASCII grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Verb {
    #[strum(serialize = "READ")]
    Read,
    #[strum(serialize = "SET")]
    Set,
}

/// What kind of value a parameter accepts besides its sentinel tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Real,
    /// Whole numbers only. `5.0` is accepted and sent as `5`, `5.5` is rejected.
    Integer,
    /// No numeric values at all, only the sentinel set.
    Token,
}

/// Inclusive legal range of a parameter, plus any literal tokens it also accepts (e.g. `INF`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub min: f64,
    pub max: f64,
    pub kind: Kind,
    pub sentinels: &'static [&'static str],
}

impl Limits {
    pub const fn real(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            kind: Kind::Real,
            sentinels: &[],
        }
    }

    pub const fn integer(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            kind: Kind::Integer,
            sentinels: &[],
        }
    }

    /// A parameter that only accepts one of `tokens`.
    pub const fn tokens(tokens: &'static [&'static str]) -> Self {
        Self {
            min: f64::NAN,
            max: f64::NAN,
            kind: Kind::Token,
            sentinels: tokens,
        }
    }

    /// Any finite real value.
    pub const fn unbounded() -> Self {
        Self::real(f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Real values from `min` upwards with no hardware ceiling known.
    pub const fn at_least(min: f64) -> Self {
        Self::real(min, f64::INFINITY)
    }

    pub const fn with_sentinels(mut self, sentinels: &'static [&'static str]) -> Self {
        self.sentinels = sentinels;
        self
    }

    /// Check `value` and return its wire representation.
    pub fn check(&self, name: &str, value: Value<'_>) -> Result<String, InvalidParameter> {
        let rejected = || InvalidParameter::new(name, &value, self);
        match value {
            Value::Token(token) => self
                .sentinels
                .iter()
                .find(|s| s.eq_ignore_ascii_case(token.trim()))
                .map(|s| (*s).into())
                .ok_or_else(rejected),
            Value::Integer(number) => {
                let as_real = number as f64;
                if self.kind == Kind::Token || !self.contains(as_real) {
                    return Err(rejected());
                }
                Ok(number.to_string())
            }
            Value::Real(number) => {
                if !number.is_finite() || !self.contains(number) {
                    return Err(rejected());
                }
                match self.kind {
                    Kind::Real => Ok(render_real(number)),
                    Kind::Integer if number.fract() == 0.0 => Ok((number as i64).to_string()),
                    _ => Err(rejected()),
                }
            }
        }
    }

    fn contains(&self, value: f64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Kind::Token => {}
            Kind::Real => write!(f, "a number in [{}, {}]", self.min, self.max)?,
            Kind::Integer => write!(f, "an integer in [{}, {}]", self.min, self.max)?,
        }
        if !self.sentinels.is_empty() {
            if self.kind != Kind::Token {
                f.write_str(" or ")?;
            }
            write!(f, "one of {}", self.sentinels.join("|"))?;
        }
        Ok(())
    }
}

/// A value offered for transmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    Real(f64),
    Integer(i64),
    Token(&'a str),
}

impl From<f64> for Value<'_> {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<i64> for Value<'_> {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value<'_> {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u32> for Value<'_> {
    fn from(value: u32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u8> for Value<'_> {
    fn from(value: u8) -> Self {
        Value::Integer(value.into())
    }
}

impl<'a> From<&'a str> for Value<'a> {
    fn from(value: &'a str) -> Self {
        Value::Token(value)
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Real(number) => f.write_str(&render_real(*number)),
            Value::Integer(number) => write!(f, "{number}"),
            Value::Token(token) => f.write_str(token),
        }
    }
}

/// A value was refused before transmission.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{value} is not valid for {name}: expected {limits}")]
pub struct InvalidParameter {
    pub name: String,
    pub value: String,
    pub limits: Limits,
}

impl InvalidParameter {
    fn new(name: &str, value: &Value<'_>, limits: &Limits) -> Self {
        Self {
            name: name.into(),
            value: value.to_string(),
            limits: *limits,
        }
    }
}

/// A settable or readable quantity of one instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Param {
    /// Noun path (`DEV:GRPZ:PSU:SIG:FSET`) or SCPI header (`SOUR:CURR:RANG`).
    pub noun: &'static str,
    /// Unit suffix the instrument appends to replies, empty if none.
    pub unit: &'static str,
    pub limits: Limits,
}

impl Param {
    pub const fn new(noun: &'static str, unit: &'static str, limits: Limits) -> Self {
        Self { noun, unit, limits }
    }

    /// `READ:<noun>`
    pub fn read_command(&self) -> String {
        format!("{}:{}", Verb::Read, self.noun)
    }

    /// `SET:<noun>:<value>` after validation.
    pub fn set_command<'a>(&self, value: impl Into<Value<'a>>) -> Result<String, InvalidParameter> {
        format_command(self.noun, Verb::Set, Some(value.into()), &self.limits)
    }

    /// `<header> <value>` after validation.
    pub fn scpi_command<'a>(&self, value: impl Into<Value<'a>>) -> Result<String, InvalidParameter> {
        format_scpi(self.noun, value.into(), &self.limits)
    }

    /// `<header>?`
    pub fn scpi_query(&self) -> String {
        format!("{}?", self.noun)
    }

    /// Only validate, returning the wire form of `value`.
    pub fn check<'a>(&self, value: impl Into<Value<'a>>) -> Result<String, InvalidParameter> {
        self.limits.check(self.noun, value.into())
    }
}

/// Build an Oxford ASCII command.
///
/// `READ` takes no value. `SET` without a value is an action (`SET:DEV:GRPZ:PSU:ACTN:HOLD`), with a
/// value it is validated against `limits` first.
pub fn format_command(
    noun: &str,
    verb: Verb,
    value: Option<Value<'_>>,
    limits: &Limits,
) -> Result<String, InvalidParameter> {
    match (verb, value) {
        (Verb::Read, None) | (Verb::Set, None) => Ok(format!("{verb}:{noun}")),
        (Verb::Read, Some(value)) => Err(InvalidParameter {
            name: noun.into(),
            value: value.to_string(),
            limits: Limits::tokens(&[]),
        }),
        (Verb::Set, Some(value)) => {
            let rendered = limits.check(noun, value)?;
            Ok(format!("{verb}:{noun}:{rendered}"))
        }
    }
}

/// Build a space delimited SCPI command, `SOUR:CURR:RANG 0.001`.
pub fn format_scpi(
    header: &str,
    value: Value<'_>,
    limits: &Limits,
) -> Result<String, InvalidParameter> {
    let rendered = limits.check(header, value)?;
    Ok(format!("{header} {rendered}"))
}

/// Shortest round-trip form of `value`, always with a decimal point or an exponent (`5.0`, `1e-12`).
pub fn render_real(value: f64) -> String {
    format!("{value:?}")
}
