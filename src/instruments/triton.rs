//! Oxford Instruments Triton 200 dilution refrigerator.
//!
//! The Triton keeps one socket open for the whole session and expects `\r\n` after every
//! command. Most operations act on the current temperature channel, which is also the channel the
//! mixing chamber heater (H1) regulates on.

use fugit::MillisDurationU64;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    command::{Limits, Value},
    dispatch::{BoxedTransport, DispatchTable},
    endpoint::{Endpoint, EndpointBuilder},
    error::{Error, Result},
    instruments::State,
    oxford,
    settle::{Clock, PollBudget, PollState, SettleCriteria, SystemClock, poll_until, settle},
    transport::Transport,
};

/// Port the Triton control software listens on.
pub const DEFAULT_PORT: u16 = 33576;
pub const COMMAND_TERMINATOR: &str = "\r\n";
pub const DEFAULT_CHANNEL: u8 = 5;

const CHANNEL: Limits = Limits::integer(1.0, 15.0);
const VALVE: Limits = Limits::integer(1.0, 9.0);
const ON_OFF: Limits = Limits::tokens(&["ON", "OFF"]);
const TEMPERATURE_SETPOINT: Limits = Limits::real(0.0, 10.0);
const RAMP_RATE: Limits = Limits::at_least(0.0);
const HEATER_CONTROL_SENSOR: &str = "DEV:H1:HTR:LOOP:SENS";
const TURBO: &str = "DEV:TURB1:PUMP:SIG:STATE";

/// Heater current ranges in mA, lowest first.
pub const HEATER_RANGES: [&str; 6] = ["0.316", "1", "3.16", "10", "31.6", "100"];

pub const SETTLE_WINDOW: usize = 50;
pub const SETTLE_INTERVAL: MillisDurationU64 = MillisDurationU64::millis(200);
pub const SETTLE_MEAN_TOLERANCE: f64 = 2e-4;
pub const SETTLE_VARIANCE_TOLERANCE: f64 = 1e-5;

/// Start from the defaults the Triton needs: its port and `\r\n` after commands.
pub fn endpoint(address: impl Into<String>) -> EndpointBuilder {
    Endpoint::builder()
        .with_address(address)
        .with_port(DEFAULT_PORT)
        .with_command_terminator(COMMAND_TERMINATOR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ValveAction {
    Open,
    Close,
    Toggle,
}

/// Setpoint breakpoints used to pick the heater range.
///
/// Two calibrations exist and neither is known to supersede the other, so both are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumIter)]
pub enum HeaterTable {
    /// Normal circulation.
    #[default]
    Standard,
    /// Valve V4 open.
    ValveFourOpen,
}

impl HeaterTable {
    /// Setpoints in kelvin above which the next range up is used.
    pub fn breakpoints(self) -> [f64; 5] {
        match self {
            HeaterTable::Standard => [0.030, 0.050, 0.170, 0.240, 1.0],
            HeaterTable::ValveFourOpen => [0.05, 0.2, 0.5, 1.0, 10.0],
        }
    }

    /// Heater range for `setpoint`, one of [`HEATER_RANGES`].
    pub fn range_for(self, setpoint: f64) -> &'static str {
        let index = self
            .breakpoints()
            .iter()
            .filter(|&&breakpoint| setpoint > breakpoint)
            .count();
        HEATER_RANGES[index]
    }
}

pub struct Triton<T: Transport, K: Clock = SystemClock> {
    transport: T,
    clock: K,
    channel: u8,
}

impl<T: Transport> Triton<T> {
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock::default())
    }
}

impl<E: embedded_io::Error + 'static> Triton<BoxedTransport<E>> {
    /// Build from a dispatch table. Unsupported modes fail here, before any I/O.
    pub fn open(table: &DispatchTable<E>, mode: &str, endpoint: &Endpoint) -> Result<Self, E> {
        table.open(mode, endpoint).map(Self::new)
    }
}

impl<T: Transport, K: Clock> Triton<T, K> {
    pub fn with_clock(transport: T, clock: K) -> Self {
        Self {
            transport,
            clock,
            channel: DEFAULT_CHANNEL,
        }
    }

    /// The channel most operations act on. Not queried from the fridge.
    pub fn temperature_channel(&self) -> u8 {
        self.channel
    }

    /// Channel the heater loop regulates on, as reported by the fridge.
    pub fn control_channel(&mut self) -> Result<u8, T::Error> {
        let sensor = oxford::read_token(&mut self.transport, HEATER_CONTROL_SENSOR)?;
        sensor
            .trim_start_matches('T')
            .parse()
            .map_err(|_| Error::InvalidResponse(sensor))
    }

    /// Make `channel` the heater loop's sensor and the channel later operations act on.
    pub fn set_control_channel(&mut self, channel: u8) -> Result<(), T::Error> {
        CHANNEL.check("temperature channel", channel.into())?;
        oxford::action(&mut self.transport, &format!("DEV:T{channel}:TEMP:LOOP:HTR:H1"))?;
        self.channel = channel;
        Ok(())
    }

    /// Switch measurement on `channel` (1 to 15) on or off.
    pub fn set_channel_enabled(&mut self, channel: u8, state: impl Into<State>) -> Result<(), T::Error> {
        CHANNEL.check("temperature channel", channel.into())?;
        let noun = format!("DEV:T{channel}:TEMP:MEAS:ENAB");
        oxford::set_value(&mut self.transport, &noun, &ON_OFF, state.into().token().into())?;
        Ok(())
    }

    fn loop_noun(&self, leaf: &str) -> String {
        format!("DEV:T{}:TEMP:LOOP:{leaf}", self.channel)
    }

    pub fn temperature_setpoint(&mut self) -> Result<f64, T::Error> {
        let noun = self.loop_noun("TSET");
        oxford::read_value(&mut self.transport, &noun, "K")
    }

    /// Set the mixing chamber target, 0 to 10 K inclusive.
    pub fn set_temperature_setpoint(&mut self, kelvin: f64) -> Result<(), T::Error> {
        let noun = self.loop_noun("TSET");
        oxford::set_value(&mut self.transport, &noun, &TEMPERATURE_SETPOINT, Value::Real(kelvin))?;
        Ok(())
    }

    /// Closed loop (`On`) or open loop (`Off`) on the current channel.
    pub fn loop_mode(&mut self) -> Result<State, T::Error> {
        let noun = self.loop_noun("MODE");
        let mode = oxford::read_token(&mut self.transport, &noun)?;
        mode.parse().map_err(|_| Error::InvalidResponse(mode))
    }

    /// Poll the loop mode until it reads `ON` or `OFF`.
    pub fn wait_for_loop_state(&mut self, budget: &PollBudget) -> Result<State, T::Error> {
        let noun = self.loop_noun("MODE");
        let transport = &mut self.transport;
        let mut state = State::Off;
        poll_until(&mut self.clock, budget, || {
            let mode = oxford::read_token(transport, &noun)?;
            match mode.parse() {
                Ok(parsed) => {
                    state = parsed;
                    Ok(PollState::Done)
                }
                Err(_) => Ok(PollState::Pending(mode)),
            }
        })?;
        Ok(state)
    }

    pub fn close_loop(&mut self) -> Result<(), T::Error> {
        self.set_loop_switch("MODE", State::On)
    }

    pub fn open_loop(&mut self) -> Result<(), T::Error> {
        self.set_loop_switch("MODE", State::Off)
    }

    /// Start a temperature sweep at the configured ramp rate.
    pub fn controlled_ramp_on(&mut self) -> Result<(), T::Error> {
        self.set_loop_switch("RAMP:ENAB", State::On)
    }

    pub fn controlled_ramp_off(&mut self) -> Result<(), T::Error> {
        self.set_loop_switch("RAMP:ENAB", State::Off)
    }

    fn set_loop_switch(&mut self, leaf: &str, state: State) -> Result<(), T::Error> {
        let noun = self.loop_noun(leaf);
        oxford::set_value(&mut self.transport, &noun, &ON_OFF, state.token().into())?;
        Ok(())
    }

    /// Temperature of any channel in kelvin.
    pub fn temperature(&mut self, channel: u8) -> Result<f64, T::Error> {
        CHANNEL.check("temperature channel", channel.into())?;
        let noun = format!("DEV:T{channel}:TEMP:SIG:TEMP");
        oxford::read_value(&mut self.transport, &noun, "K")
    }

    /// Sweep rate in kelvin per minute.
    pub fn ramp_rate(&mut self) -> Result<f64, T::Error> {
        let noun = self.loop_noun("RAMP:RATE");
        oxford::read_value(&mut self.transport, &noun, "K/min")
    }

    pub fn set_ramp_rate(&mut self, kelvin_per_minute: f64) -> Result<(), T::Error> {
        let noun = self.loop_noun("RAMP:RATE");
        oxford::set_value(&mut self.transport, &noun, &RAMP_RATE, kelvin_per_minute.into())?;
        Ok(())
    }

    /// Open, close or toggle valve `valve` (1 to 9).
    pub fn set_valve(&mut self, valve: u8, action: ValveAction) -> Result<(), T::Error> {
        VALVE.check("valve", valve.into())?;
        let noun = format!("DEV:V{valve}:VALV:SIG:STATE");
        let limits = Limits::tokens(&["OPEN", "CLOSE", "TOGGLE"]);
        let token: &'static str = action.into();
        oxford::set_value(&mut self.transport, &noun, &limits, token.into())?;
        Ok(())
    }

    pub fn turbo_on(&mut self) -> Result<(), T::Error> {
        self.set_turbo(State::On)
    }

    pub fn turbo_off(&mut self) -> Result<(), T::Error> {
        self.set_turbo(State::Off)
    }

    fn set_turbo(&mut self, state: State) -> Result<(), T::Error> {
        log::warn!("switching turbo pump {state}, keep an eye on it");
        oxford::set_value(&mut self.transport, TURBO, &ON_OFF, state.token().into())?;
        Ok(())
    }

    /// Point heater H1 at the current channel and pick its range from the setpoint.
    ///
    /// Returns the range that was set.
    pub fn update_heater(&mut self, table: HeaterTable) -> Result<&'static str, T::Error> {
        let channel = self.channel;
        oxford::action(&mut self.transport, &format!("DEV:T{channel}:TEMP:LOOP:HTR:H1"))?;
        let setpoint = self.temperature_setpoint()?;
        let range = table.range_for(setpoint);
        let noun = self.loop_noun("RANGE");
        oxford::set_value(
            &mut self.transport,
            &noun,
            &Limits::tokens(&HEATER_RANGES),
            range.into(),
        )?;
        log::debug!("heater range {range} mA for {setpoint} K");
        Ok(range)
    }

    /// Sample `channel` until the last 50 readings sit on `kelvin`. Returns the settled mean.
    pub fn wait_for_temp(&mut self, channel: u8, kelvin: f64, budget: &PollBudget) -> Result<f64, T::Error> {
        CHANNEL.check("temperature channel", channel.into())?;
        let criteria = SettleCriteria::new(kelvin, SETTLE_MEAN_TOLERANCE, SETTLE_VARIANCE_TOLERANCE);
        let noun = format!("DEV:T{channel}:TEMP:SIG:TEMP");
        let transport = &mut self.transport;
        settle::<SETTLE_WINDOW, _, _, _>(&mut self.clock, budget, &criteria, || {
            oxford::read_value(transport, &noun, "K")
        })
    }

    /// Close the socket. The next operation reconnects.
    pub fn close(&mut self) -> Result<(), T::Error> {
        self.transport.close()
    }
}
