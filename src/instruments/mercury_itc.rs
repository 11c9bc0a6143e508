//! Oxford Instruments Mercury iTC temperature controller on a Heliox insert.

use fugit::MillisDurationU64;
use strum_macros::{Display, EnumIter, IntoStaticStr};

use crate::{
    command::{Limits, Param, Value},
    dispatch::{BoxedTransport, DispatchTable},
    endpoint::Endpoint,
    error::{Error, Result},
    instruments::State,
    oxford,
    settle::{Clock, PollBudget, SettleCriteria, SystemClock, settle},
    transport::Transport,
};

const ON_OFF: Limits = Limits::tokens(&["ON", "OFF"]);
const RAMP_RATE: Limits = Limits::at_least(0.0);
const TEMPERATURE_SETPOINT: Limits = Limits::real(0.0, 300.0);

const PRESSURE_SETPOINT: Param = Param::new("DEV:DB5.P1:PRES:LOOP:PRST", "mB", Limits::at_least(0.0));
const PRESSURE: &str = "DEV:DB5.P1:PRES:SIG:PRES";
const PRESSURE_AUTO_FLOW: Param = Param::new("DEV:DB5.P1:PRES:LOOP:FAUT", "", ON_OFF);
const PRESSURE_FLOW: Param = Param::new("DEV:DB5.P1:PRES:LOOP:FSET", "", Limits::real(0.0, 100.0));

/// Readings kept by [`MercuryItc::wait_for_temp`].
pub const SETTLE_WINDOW: usize = 50;
pub const SETTLE_INTERVAL: MillisDurationU64 = MillisDurationU64::millis(200);
pub const SETTLE_MEAN_TOLERANCE: f64 = 2e-4;
pub const SETTLE_VARIANCE_TOLERANCE: f64 = 1e-5;

/// Temperature sensors on the insert, by board address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, IntoStaticStr)]
pub enum Sensor {
    #[strum(serialize = "DB8.T1")]
    ProbeLow,
    #[strum(serialize = "MB1.T1")]
    Vti,
    #[strum(serialize = "DB7.T1")]
    He3Pot,
}

impl Sensor {
    fn noun(self, leaf: &str) -> String {
        let address: &'static str = self.into();
        format!("DEV:{address}:TEMP:{leaf}")
    }
}

/// Budget for [`MercuryItc::wait_for_temp`] without a timeout.
pub fn settle_budget() -> PollBudget {
    PollBudget::new(SETTLE_INTERVAL)
}

pub struct MercuryItc<T: Transport, K: Clock = SystemClock> {
    transport: T,
    clock: K,
}

impl<T: Transport> MercuryItc<T> {
    pub fn new(transport: T) -> Self {
        Self::with_clock(transport, SystemClock::default())
    }
}

impl<E: embedded_io::Error + 'static> MercuryItc<BoxedTransport<E>> {
    /// Build from a dispatch table. Unsupported modes fail here, before any I/O.
    pub fn open(table: &DispatchTable<E>, mode: &str, endpoint: &Endpoint) -> Result<Self, E> {
        table.open(mode, endpoint).map(Self::new)
    }
}

impl<T: Transport, K: Clock> MercuryItc<T, K> {
    pub fn with_clock(transport: T, clock: K) -> Self {
        Self { transport, clock }
    }

    /// Temperature of `sensor` in kelvin.
    pub fn temperature(&mut self, sensor: Sensor) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, &sensor.noun("SIG:TEMP"), "K")
    }

    pub fn set_auto_pid(&mut self, sensor: Sensor, state: impl Into<State>) -> Result<(), T::Error> {
        self.set_switch(sensor, "LOOP:ENAB", state.into())
    }

    pub fn set_auto_flow(&mut self, sensor: Sensor, state: impl Into<State>) -> Result<(), T::Error> {
        self.set_switch(sensor, "LOOP:FAUT", state.into())
    }

    pub fn set_ramp_enabled(&mut self, sensor: Sensor, state: impl Into<State>) -> Result<(), T::Error> {
        self.set_switch(sensor, "LOOP:RENA", state.into())
    }

    fn set_switch(&mut self, sensor: Sensor, leaf: &str, state: State) -> Result<(), T::Error> {
        let noun = sensor.noun(leaf);
        oxford::set_value(&mut self.transport, &noun, &ON_OFF, state.token().into())?;
        Ok(())
    }

    /// Ramp rate of the loop on `sensor`, kelvin per minute.
    pub fn ramp_rate(&mut self, sensor: Sensor) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, &sensor.noun("LOOP:RSET"), "K/m")
    }

    pub fn set_ramp_rate(&mut self, sensor: Sensor, kelvin_per_minute: f64) -> Result<(), T::Error> {
        let noun = sensor.noun("LOOP:RSET");
        oxford::set_value(&mut self.transport, &noun, &RAMP_RATE, kelvin_per_minute.into())?;
        Ok(())
    }

    pub fn temperature_setpoint(&mut self, sensor: Sensor) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, &sensor.noun("LOOP:TSET"), "K")
    }

    /// Set the loop target on `sensor`, 0 to 300 K.
    pub fn set_temperature_setpoint(&mut self, sensor: Sensor, kelvin: f64) -> Result<(), T::Error> {
        let noun = sensor.noun("LOOP:TSET");
        oxford::set_value(
            &mut self.transport,
            &noun,
            &TEMPERATURE_SETPOINT,
            Value::Real(kelvin),
        )?;
        Ok(())
    }

    /// Pressure setpoint in millibar.
    pub fn pressure_setpoint(&mut self) -> Result<f64, T::Error> {
        oxford::read(&mut self.transport, &PRESSURE_SETPOINT)
    }

    pub fn set_pressure_setpoint(&mut self, millibar: f64) -> Result<(), T::Error> {
        oxford::set(&mut self.transport, &PRESSURE_SETPOINT, millibar)?;
        Ok(())
    }

    /// Measured pressure in millibar.
    pub fn pressure(&mut self) -> Result<f64, T::Error> {
        oxford::read_value(&mut self.transport, PRESSURE, "mB")
    }

    pub fn pressure_auto_flow(&mut self) -> Result<State, T::Error> {
        let token = oxford::read_token(&mut self.transport, PRESSURE_AUTO_FLOW.noun)?;
        token.parse().map_err(|_| Error::InvalidResponse(token))
    }

    pub fn set_pressure_auto_flow(&mut self, state: impl Into<State>) -> Result<(), T::Error> {
        oxford::set(&mut self.transport, &PRESSURE_AUTO_FLOW, state.into().token())?;
        Ok(())
    }

    /// Manual needle valve opening in percent.
    pub fn pressure_flow(&mut self) -> Result<f64, T::Error> {
        oxford::read(&mut self.transport, &PRESSURE_FLOW)
    }

    /// Open the needle valve to `percent`, switching pressure auto-flow off first if needed.
    pub fn set_pressure_flow(&mut self, percent: f64) -> Result<(), T::Error> {
        PRESSURE_FLOW.check(percent)?;
        if self.pressure_auto_flow()? != State::Off {
            self.set_pressure_auto_flow(State::Off)?;
            log::info!("pressure auto flow switched off");
        }
        oxford::set(&mut self.transport, &PRESSURE_FLOW, percent)?;
        Ok(())
    }

    /// Sample `sensor` every 200 ms until the last 50 readings sit on `kelvin`.
    ///
    /// Returns the settled mean.
    pub fn wait_for_temp(&mut self, sensor: Sensor, kelvin: f64, budget: &PollBudget) -> Result<f64, T::Error> {
        let criteria = SettleCriteria::new(kelvin, SETTLE_MEAN_TOLERANCE, SETTLE_VARIANCE_TOLERANCE);
        let noun = sensor.noun("SIG:TEMP");
        let transport = &mut self.transport;
        settle::<SETTLE_WINDOW, _, _, _>(&mut self.clock, budget, &criteria, || {
            oxford::read_value(transport, &noun, "K")
        })
    }

    pub fn close(&mut self) -> Result<(), T::Error> {
        self.transport.close()
    }
}
