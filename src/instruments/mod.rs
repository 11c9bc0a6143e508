//! One facade per instrument.
//!
//! Each facade owns its [`Transport`](crate::transport::Transport) and a
//! [`Clock`](crate::settle::Clock) for its waiting operations. Every method validates its
//! arguments before the first byte is written.

use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

pub mod keithley2400;
pub mod keithley6221;
pub mod mercury_ips;
pub mod mercury_itc;
pub mod rotator;
pub mod sr830;
pub mod triton;

/// Used to be less ambiguous about whether something is on or off.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(ascii_case_insensitive)]
pub enum State {
    #[default]
    #[strum(serialize = "OFF")]
    Off,
    #[strum(serialize = "ON")]
    On,
}

impl State {
    /// The token sent on the wire.
    pub fn token(self) -> &'static str {
        self.into()
    }
}

impl From<State> for bool {
    fn from(value: State) -> Self {
        match value {
            State::Off => false,
            State::On => true,
        }
    }
}

impl From<bool> for State {
    fn from(value: bool) -> Self {
        match value {
            true => State::On,
            false => State::Off,
        }
    }
}
